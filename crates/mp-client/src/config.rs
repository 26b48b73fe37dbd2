//! Federation configuration: which backends exist and how to reach them.
//!
//! ```toml
//! [proxy]
//! timeout_ms = 10000
//! failure_policy = "fail_fast"
//!
//! [[backend]]
//! host = "server1.serverhost"
//! user = "a"
//! password = "a"
//! ```
//!
//! Backends keep file order, which is the tie-break order of the merge.

use std::fmt;
use std::path::Path;

use mp_core::{Credentials, Error, ProxySettings, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "mergeproxy.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub user: String,
    pub password: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BackendConfig {
    /// Display name used in logs and errors: `host` or `host:port`.
    pub fn name(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    pub fn base_url(&self) -> Result<Url> {
        let raw = format!("{}://{}/", self.scheme, self.name());
        Url::parse(&raw).map_err(|e| {
            Error::Configuration(format!("backend '{}': invalid url {raw}: {e}", self.host))
        })
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.password.clone())
    }
}

impl FederationConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), backends = config.backends.len(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(Error::Configuration("no [[backend]] configured".into()));
        }
        for (index, backend) in self.backends.iter().enumerate() {
            if backend.host.trim().is_empty() {
                return Err(Error::Configuration(format!("backend #{index} has an empty host")));
            }
            backend.base_url()?;
        }
        self.proxy.validate()
    }

    /// Every configured backend, in file order.
    pub fn servers(&self) -> &[BackendConfig] {
        &self.backends
    }
}
