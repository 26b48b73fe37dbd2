use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mp_client::{config::DEFAULT_CONFIG_PATH, FederationConfig};
use mp_core::{Error, FailurePolicy};
use mp_hub::{auth::SessionStore, config::HubConfig, router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "mp-hub",
    version,
    about = "Serve several log-search backends as one"
)]
struct Args {
    /// Path to config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Server bind address (overrides [server] bind)
    #[arg(long)]
    bind: Option<String>,

    /// Skip failing backends instead of failing the request
    #[arg(long)]
    partial: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mp_hub=info,mp_core=info,mp_client=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(kind = %e.kind(), "{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> mp_core::Result<()> {
    let mut federation = FederationConfig::load(&args.config)?;
    if args.partial {
        federation.proxy.failure_policy = FailurePolicy::Partial;
    }
    let hub = HubConfig::load(&args.config)?;

    let bind = args.bind.unwrap_or(hub.server.bind);
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid bind address {bind}: {e}")))?;

    let proxy = mp_client::connect(&federation).await?;
    let sessions = SessionStore::with_ttl(
        &hub.users,
        std::time::Duration::from_secs(hub.server.session_ttl_secs),
    );
    let state = Arc::new(AppState::new(proxy, sessions));
    let app = router(state.clone());

    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  mergeproxy hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  API:        http://{}/api/1", addr);
    tracing::info!("  Status:     http://{}/api/status", addr);
    tracing::info!("  Backends:   {}", federation.backends.len());
    tracing::info!("  Policy:     {:?}", federation.proxy.failure_policy);
    if state.sessions.is_open() {
        tracing::warn!("  No [[user]] configured; hub login is open");
    }
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Configuration(format!("cannot bind {addr}: {e}")))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.proxy.logout_all().await;
    served.map_err(|e| Error::Configuration(format!("server error: {e}")))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
