// src/config.rs
//! Configuration file parsing for netbootd
//!
//! TOML sections:
//! - [server] - Bind address, boot-loader assets, shutdown grace, public URL
//! - [storage] - Data and scratch directories
//! - [upstream] - Mirror layout, signing key, request limits
//! - [boot] - Profile directory, retry backoff
//! - [log] - Default verbosity

use crate::server::ServerConfig;
use crate::upstream::{DEFAULT_MIRROR, FetcherOptions, Mirror};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct NetbootConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub upstream: UpstreamSection,

    #[serde(default)]
    pub boot: BootSection,

    #[serde(default)]
    pub log: LogSection,
}

/// Server configuration section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// HTTP bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory holding boot_<arch>.efi
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,

    /// How long in-flight requests may drain on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,

    /// Prefix for artifact URLs written into boot scripts (empty = relative)
    #[serde(default)]
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            assets_dir: default_assets_dir(),
            shutdown_grace: default_shutdown_grace(),
            public_url: String::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("assets")
}

fn default_shutdown_grace() -> String {
    "15s".to_string()
}

/// Storage configuration section
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// Finalized artifacts
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Staged writes; may be on a different volume
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/netboot")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/tmp/netboot")
}

/// Upstream mirror section
#[derive(Debug, Deserialize)]
pub struct UpstreamSection {
    /// URL template with {channel}, {arch} and {version}
    #[serde(default = "default_mirror")]
    pub mirror: String,

    /// Public key every upstream signature is checked against
    #[serde(default = "default_signing_key")]
    pub signing_key: PathBuf,

    /// Maximum concurrent upstream requests
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Timeout for version descriptors and signatures
    #[serde(default = "default_aux_timeout")]
    pub aux_timeout: String,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            mirror: default_mirror(),
            signing_key: default_signing_key(),
            concurrency: default_concurrency(),
            connect_timeout: default_connect_timeout(),
            aux_timeout: default_aux_timeout(),
        }
    }
}

fn default_mirror() -> String {
    DEFAULT_MIRROR.to_string()
}

fn default_signing_key() -> PathBuf {
    PathBuf::from("/etc/netboot/flatcar-image-signing-key.asc")
}

fn default_concurrency() -> usize {
    8
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_aux_timeout() -> String {
    "30s".to_string()
}

/// Boot script section
#[derive(Debug, Deserialize)]
pub struct BootSection {
    /// Directory of *.json boot profiles
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,

    /// Retry backoff for attempt 0
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    /// Upper bound of the retry backoff
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: String,
}

impl Default for BootSection {
    fn default() -> Self {
        Self {
            profiles_dir: default_profiles_dir(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("/etc/netboot/profiles")
}

fn default_backoff_base() -> String {
    "10s".to_string()
}

fn default_backoff_cap() -> String {
    "10m".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LogSection {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NetbootConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: NetbootConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;

        parse_duration(&self.server.shutdown_grace).context("Invalid server.shutdown_grace")?;
        parse_duration(&self.upstream.connect_timeout).context("Invalid upstream.connect_timeout")?;
        parse_duration(&self.upstream.aux_timeout).context("Invalid upstream.aux_timeout")?;

        Mirror::new(self.upstream.mirror.as_str())
            .map_err(|e| anyhow::anyhow!("Invalid upstream.mirror: {}", e))?;

        if self.upstream.concurrency == 0 {
            anyhow::bail!("upstream.concurrency must be greater than 0");
        }

        let base = parse_duration(&self.boot.backoff_base).context("Invalid boot.backoff_base")?;
        let cap = parse_duration(&self.boot.backoff_cap).context("Invalid boot.backoff_cap")?;
        if base.is_zero() {
            anyhow::bail!("boot.backoff_base must be greater than 0");
        }
        if base > cap {
            anyhow::bail!("boot.backoff_base must be <= boot.backoff_cap");
        }

        if !self.server.public_url.is_empty() {
            url::Url::parse(&self.server.public_url)
                .with_context(|| format!("Invalid server.public_url: {}", self.server.public_url))?;
        }

        Ok(())
    }

    /// Convert to the internal ServerConfig structure
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            bind_addr: self.server.bind.parse()?,
            data_dir: self.storage.data_dir.clone(),
            scratch_dir: self.storage.scratch_dir.clone(),
            assets_dir: self.server.assets_dir.clone(),
            profiles_dir: self.boot.profiles_dir.clone(),
            signing_key: self.upstream.signing_key.clone(),
            public_url: self.server.public_url.trim_end_matches('/').to_string(),
            shutdown_grace: parse_duration(&self.server.shutdown_grace)?,
            backoff_base: parse_duration(&self.boot.backoff_base)?,
            backoff_cap: parse_duration(&self.boot.backoff_cap)?,
            fetcher: self.fetcher_options()?,
        })
    }

    pub fn fetcher_options(&self) -> Result<FetcherOptions> {
        Ok(FetcherOptions {
            mirror: Mirror::new(self.upstream.mirror.as_str())
                .map_err(|e| anyhow::anyhow!("Invalid upstream.mirror: {}", e))?,
            request_concurrency: self.upstream.concurrency,
            connect_timeout: parse_duration(&self.upstream.connect_timeout)?,
            aux_timeout: parse_duration(&self.upstream.aux_timeout)?,
            ..FetcherOptions::default()
        })
    }
}

/// Parse a human-readable duration string (e.g., "15m", "1h", "30s", "500ms")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(ms) = s.strip_suffix("ms") {
        let num: u64 = ms
            .trim()
            .parse()
            .with_context(|| format!("Invalid duration number: {}", ms))?;
        return Ok(Duration::from_millis(num));
    }

    let (num_str, multiplier) = if s.ends_with('d') {
        (&s[..s.len() - 1], 24 * 60 * 60)
    } else if s.ends_with('h') {
        (&s[..s.len() - 1], 60 * 60)
    } else if s.ends_with('m') {
        (&s[..s.len() - 1], 60)
    } else if s.ends_with('s') {
        (&s[..s.len() - 1], 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    let secs = num
        .checked_mul(multiplier)
        .with_context(|| format!("Duration out of range: {}", s))?;
    Ok(Duration::from_secs(secs))
}
