// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netboot::config::NetbootConfig;
use netboot::provision::Provisioned;
use netboot::server::{ServerState, run_server};
use netboot::upstream::Artifact;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "netbootd")]
#[command(author, version, about = "Network boot server for Flatcar with a verified artifact cache", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long, env = "NETBOOT_HTTP_ADDR", global = true)]
    bind: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "NETBOOT_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Directory for finalized artifacts
    #[arg(long, env = "NETBOOT_DATA_PATH", global = true)]
    data_dir: Option<PathBuf>,

    /// Directory for in-flight downloads
    #[arg(long, env = "NETBOOT_CACHE_PATH", global = true)]
    scratch_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve boot scripts and artifacts (default)
    Serve,
    /// Download and verify a release into the cache ahead of time
    Prefetch {
        /// Release channel (stable, beta, alpha)
        channel: String,
        /// Architecture (amd64, arm64 or a synonym)
        arch: String,
        /// Concrete version or "current"
        #[arg(default_value = "current")]
        version: String,
    },
}

impl Cli {
    fn load_config(&self) -> Result<NetbootConfig> {
        let mut config = match &self.config {
            Some(path) => NetbootConfig::load(path)?,
            None => NetbootConfig::default(),
        };

        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(dir) = &self.scratch_dir {
            config.storage.scratch_dir = dir.clone();
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    let server_config = config.to_server_config()?;

    match cli.command {
        None | Some(Commands::Serve) => run_server(server_config).await,
        Some(Commands::Prefetch {
            channel,
            arch,
            version,
        }) => {
            let state = ServerState::from_config(server_config)?;
            let cancel = CancellationToken::new();
            let key = state
                .provisioner
                .resolve_key(&channel, &arch, &version, &cancel)
                .await?;
            info!("Prefetching {}", key);

            for artifact in [Artifact::Kernel, Artifact::Initrd] {
                let provisioned = state.provisioner.ensure(&key, artifact, &cancel).await?;
                println!(
                    "{}: {} ({} bytes, {})",
                    key.artifact_key(artifact),
                    match provisioned {
                        Provisioned::Cached(_) => "already cached",
                        Provisioned::Fetched(_) => "fetched",
                    },
                    provisioned.size(),
                    state.store().entry_path(&key.artifact_key(artifact)).display()
                );
            }
            Ok(())
        }
    }
}
