// src/server/mod.rs
//! netbootd HTTP server
//!
//! Serves what network-booting firmware asks for:
//! - the bootstrap script that chains into the boot-script endpoint
//! - per-machine boot scripts, or retry/error scripts when that fails
//! - cached, signature-verified Flatcar kernels and initrds
//! - static iPXE boot-loader binaries
//!
//! Shutdown drains in-flight requests for a grace period, then cancels
//! every upstream fetch and rolls back whatever store transactions remain.

mod handlers;
pub mod metrics;
mod routes;

pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use routes::create_router;

use crate::boot::BootResolver;
use crate::profile::ProfileStore;
use crate::provision::Provisioner;
use crate::script::{Backoff, ScriptGenerator};
use crate::storage::FsStore;
use crate::upstream::{Fetcher, FetcherOptions, TrustedKey};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Finalized artifacts
    pub data_dir: PathBuf,
    /// Staged writes
    pub scratch_dir: PathBuf,
    /// boot_<arch>.efi files
    pub assets_dir: PathBuf,
    /// *.json boot profiles
    pub profiles_dir: PathBuf,
    /// Upstream signing public key
    pub signing_key: PathBuf,
    /// Prefix of URLs written into boot scripts, no trailing slash
    pub public_url: String,
    /// Drain window on shutdown
    pub shutdown_grace: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub fetcher: FetcherOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("/var/lib/netboot"),
            scratch_dir: PathBuf::from("/var/tmp/netboot"),
            assets_dir: PathBuf::from("assets"),
            profiles_dir: PathBuf::from("/etc/netboot/profiles"),
            signing_key: PathBuf::from("/etc/netboot/flatcar-image-signing-key.asc"),
            public_url: String::new(),
            shutdown_grace: Duration::from_secs(15),
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(600),
            fetcher: FetcherOptions::default(),
        }
    }
}

/// Shared server state
pub struct ServerState {
    pub config: ServerConfig,
    pub provisioner: Provisioner,
    pub resolver: BootResolver,
    pub scripts: ScriptGenerator,
    pub metrics: ServerMetrics,
    /// Cancelled once the shutdown grace period is over
    pub shutdown: CancellationToken,
}

impl ServerState {
    /// Build state from already-loaded key material and profiles
    pub fn new(
        config: ServerConfig,
        signing_key: Arc<TrustedKey>,
        profiles: ProfileStore,
    ) -> crate::Result<Self> {
        let store = FsStore::new(&config.data_dir, &config.scratch_dir)?;
        let fetcher = Arc::new(Fetcher::new(signing_key, config.fetcher.clone())?);
        let provisioner = Provisioner::new(fetcher, store);
        let resolver = BootResolver::new(Arc::new(profiles), provisioner.clone(), &config.public_url);
        let scripts = ScriptGenerator::new(Backoff::new(config.backoff_base, config.backoff_cap));

        Ok(Self {
            config,
            provisioner,
            resolver,
            scripts,
            metrics: ServerMetrics::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Load the signing key and profiles named in `config`
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let signing_key = TrustedKey::from_file(&config.signing_key)
            .context("Failed to load upstream signing key")?;
        let profiles = ProfileStore::load_dir(&config.profiles_dir)
            .context("Failed to load boot profiles")?;
        Ok(Self::new(config, Arc::new(signing_key), profiles)?)
    }

    pub fn store(&self) -> &FsStore {
        self.provisioner.store()
    }

    /// Token for one request: cancelled by server shutdown
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

/// Run the server until SIGINT or SIGTERM
pub async fn run_server(config: ServerConfig) -> Result<()> {
    info!("Starting netbootd on {}", config.bind_addr);
    info!("Data directory: {:?}", config.data_dir);
    info!("Scratch directory: {:?}", config.scratch_dir);
    info!("Upstream mirror: {}", config.fetcher.mirror.template());
    info!("Upstream concurrency: {}", config.fetcher.request_concurrency);

    let bind_addr = config.bind_addr;
    let state = Arc::new(ServerState::from_config(config)?);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    serve(state, listener, shutdown_signal()).await
}

/// Serve on `listener` until `signal` resolves, then shut down gracefully
pub async fn serve<S>(state: Arc<ServerState>, listener: TcpListener, signal: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state.clone());
    let draining = CancellationToken::new();

    let server = {
        let draining = draining.clone();
        axum::serve(listener, app).with_graceful_shutdown(async move {
            signal.await;
            draining.cancel();
        })
    };
    let mut serving = tokio::spawn(server.into_future());
    info!("netbootd is ready to serve");

    let finished = tokio::select! {
        result = &mut serving => Some(result),
        _ = draining.cancelled() => None,
    };

    let outcome = match finished {
        Some(result) => Some(result),
        None => {
            let grace = state.config.shutdown_grace;
            info!("Shutting down, draining requests for {:?}", grace);
            let drained = tokio::time::timeout(grace, &mut serving).await.ok();
            if drained.is_none() {
                warn!("Grace period elapsed with requests in flight, aborting them");
            }
            drained
        }
    };

    state.shutdown.cancel();
    serving.abort();

    if let Err(e) = state.store().close() {
        error!("Failed to roll back open transactions: {}", e);
    }
    info!("netbootd stopped");

    if let Some(result) = outcome {
        result
            .context("Server task failed")?
            .context("HTTP server error")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
