//! # mp-client: The "Wire" of mergeproxy
//!
//! Talks to real backends. [`SsbClient`] implements [`mp_core::Backend`]
//! over HTTP; [`FederationConfig`] discovers which backends exist.

pub mod client;
pub mod config;

use std::sync::Arc;

use mp_core::{Backend, Credentials, MergeProxy, Result};

pub use client::SsbClient;
pub use config::{BackendConfig, FederationConfig};

/// Build one client per configured backend, log in to all of them and hand
/// back the proxy.
///
/// Under the partial failure policy, backends that refuse the login are
/// logged and stay unauthenticated; later operations exclude them.
pub async fn connect(config: &FederationConfig) -> Result<MergeProxy> {
    config.validate()?;

    let timeout = config.proxy.timeout();
    let backends = config
        .backends
        .iter()
        .map(|backend| {
            SsbClient::from_config(backend, timeout).map(|c| Arc::new(c) as Arc<dyn Backend>)
        })
        .collect::<Result<Vec<_>>>()?;
    let proxy = MergeProxy::with_settings(backends, config.proxy.clone())?;

    let credentials: Vec<Credentials> = config
        .backends
        .iter()
        .map(BackendConfig::credentials)
        .collect();
    let session = proxy.authenticate(&credentials).await?;
    for excluded in &session.excluded {
        tracing::warn!(
            backend = %excluded.backend,
            reason = %excluded.reason,
            "login failed; backend will be excluded"
        );
    }
    Ok(proxy)
}
