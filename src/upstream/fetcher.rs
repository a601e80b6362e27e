// src/upstream/fetcher.rs
//! Upstream fetcher: version resolution and verified artifact downloads
//!
//! Every request to the mirror goes through one counting semaphore shared by
//! all in-flight operations, which bounds fan-out towards the mirror no
//! matter how many machines boot at once.
//!
//! Artifacts are verified in a single pass: the body is written to the
//! caller's sink and, chunk by chunk, teed into a blocking OpenPGP verifier
//! while the detached signature downloads alongside. Bytes reach the sink
//! before the verdict, so the caller must discard them (roll back its
//! transaction) when this returns an error.

use super::key::{Arch, Artifact, CURRENT_VERSION, Channel, Key, Mirror, is_valid_version_input};
use super::signing::TrustedKey;
use super::tee::{DEFAULT_TEE_DEPTH, TeeReader, TeeSender, tee_channel};
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Cap on version descriptors and signatures. Artifacts are not capped.
pub const MAX_AUX_RESPONSE_BYTES: usize = 2048;

/// Version descriptor published in every release directory
pub const VERSION_FILE: &str = "version.txt";

const VERSION_PREFIX: &str = "FLATCAR_VERSION=";

/// Permits one artifact fetch holds: the artifact stream and its signature
const ARTIFACT_PERMITS: usize = 2;

/// Construction-time settings for [`Fetcher`]
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    /// Mirror URL layout
    pub mirror: Mirror,
    /// Maximum concurrent upstream requests across all operations
    pub request_concurrency: usize,
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout for version descriptors and signatures
    pub aux_timeout: Duration,
    /// Chunks buffered between the download and the verifier
    pub tee_depth: usize,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            mirror: Mirror::default(),
            request_concurrency: 8,
            connect_timeout: Duration::from_secs(10),
            aux_timeout: Duration::from_secs(30),
            tee_depth: DEFAULT_TEE_DEPTH,
        }
    }
}

/// Downloads and verifies release files from the upstream mirror
pub struct Fetcher {
    client: reqwest::Client,
    mirror: Mirror,
    permits: Semaphore,
    capacity: usize,
    signing_key: Arc<TrustedKey>,
    aux_timeout: Duration,
    tee_depth: usize,
}

impl Fetcher {
    pub fn new(signing_key: Arc<TrustedKey>, options: FetcherOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(concat!("netboot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        let capacity = options.request_concurrency.max(1);

        Ok(Self {
            client,
            mirror: options.mirror,
            permits: Semaphore::new(capacity),
            capacity,
            signing_key,
            aux_timeout: options.aux_timeout,
            tee_depth: options.tee_depth,
        })
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Upstream request slots currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Turn user input into a concrete [`Key`].
    ///
    /// Channel, arch and version syntax are checked before any I/O. The
    /// `"current"` alias is resolved by downloading the channel's signed
    /// version descriptor; the descriptor and its signature are fetched
    /// concurrently and the first failure aborts the other.
    pub async fn resolve_key(
        &self,
        channel: &str,
        arch: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Key> {
        let channel: Channel = channel.parse()?;
        let arch: Arch = arch.parse()?;
        if !is_valid_version_input(version) {
            return Err(Error::InvalidInput(format!("invalid version '{}'", version)));
        }

        if version != CURRENT_VERSION {
            return Key::new(channel, arch, version);
        }

        let resolved = with_cancel(cancel, self.fetch_current_version(channel, arch)).await?;
        let key = Key::new(channel, arch, resolved)?;
        info!("Resolved {}/{} current to {}", channel, arch, key.version());
        Ok(key)
    }

    /// Stream the PXE kernel into `sink`, verifying it on the way
    pub async fn fetch_kernel<W>(&self, key: &Key, sink: &mut W, cancel: &CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.fetch_artifact(key, Artifact::Kernel, sink, cancel).await
    }

    /// Stream the PXE initrd into `sink`, verifying it on the way
    pub async fn fetch_initrd<W>(&self, key: &Key, sink: &mut W, cancel: &CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.fetch_artifact(key, Artifact::Initrd, sink, cancel).await
    }

    /// Stream one artifact into `sink` and verify its detached signature.
    ///
    /// Returns the number of bytes written. On error the sink may hold a
    /// prefix or all of the unverified bytes.
    pub async fn fetch_artifact<W>(
        &self,
        key: &Key,
        artifact: Artifact,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        with_cancel(cancel, self.fetch_verified(key, artifact, sink)).await
    }

    async fn fetch_current_version(&self, channel: Channel, arch: Arch) -> Result<String> {
        let version_url = self.mirror.current_url(channel, arch, VERSION_FILE);
        let signature_url = format!("{}.sig", version_url);

        let (descriptor, signature) = tokio::try_join!(
            self.fetch_small(&version_url),
            self.fetch_small(&signature_url),
        )?;

        if let Err(e) = self.signing_key.verify_detached(&descriptor, &signature) {
            error!(url = %version_url, "Version descriptor failed verification: {}", e);
            return Err(e);
        }

        parse_version(&descriptor).ok_or_else(|| {
            Error::DownloadError(format!("{} has no {} line", version_url, VERSION_PREFIX))
        })
    }

    async fn fetch_verified<W>(&self, key: &Key, artifact: Artifact, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let url = self.mirror.file_url(key, artifact.file_name());
        let signature_url = self.mirror.file_url(key, &artifact.signature_name());
        let (tee, reader) = tee_channel(self.tee_depth);

        let result = if self.capacity >= ARTIFACT_PERMITS {
            // Both legs' permits are taken together: a stalled stream holding one
            // permit while its signature waits for another would deadlock under load.
            let _permits = self.acquire(ARTIFACT_PERMITS).await?;
            tokio::try_join!(
                self.stream_to(&url, sink, tee),
                self.verify_stream(reader, self.get_small(&signature_url)),
            )
        } else {
            // A single slot: the signature first, then the body
            let signature = self.fetch_small(&signature_url).await?;
            let _permit = self.acquire(1).await?;
            tokio::try_join!(
                self.stream_to(&url, sink, tee),
                self.verify_stream(reader, async { Ok(signature) }),
            )
        };

        match result {
            Ok((written, ())) => {
                debug!(key = %key, url = %url, bytes = written, "Artifact verified");
                Ok(written)
            }
            Err(e) => {
                if e.is_integrity() {
                    error!(key = %key, url = %url, "Artifact failed verification: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Verify everything the tee yields once `signature` is available
    async fn verify_stream<F>(&self, reader: TeeReader, signature: F) -> Result<()>
    where
        F: Future<Output = Result<Vec<u8>>>,
    {
        let signature = signature.await?;
        let signing_key = Arc::clone(&self.signing_key);
        tokio::task::spawn_blocking(move || signing_key.verify_detached_reader(reader, &signature))
            .await
            .map_err(|e| Error::IoError(format!("Verifier task failed: {e}")))?
    }

    /// Copy the response body to `sink` and the tee. Not size-capped.
    async fn stream_to<W>(&self, url: &str, sink: &mut W, tee: TeeSender) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        debug!(url, "Requesting artifact");
        let mut response = self.send(self.client.get(url), url).await?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to read {}: {e}", url)))?
        {
            if chunk.is_empty() {
                continue;
            }
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if tee.send(chunk).await.is_err() {
                // The verifier only hangs up early after failing; its error wins the join.
                debug!(url, "Verifier stopped reading, abandoning download");
                return Ok(written);
            }
        }
        sink.flush().await?;
        Ok(written)
    }

    /// Size-capped download holding its own permit
    async fn fetch_small(&self, url: &str) -> Result<Vec<u8>> {
        let _permit = self.acquire(1).await?;
        self.get_small(url).await
    }

    /// Size-capped download; the caller holds the permit
    async fn get_small(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "Requesting");
        let mut response = self
            .send(self.client.get(url).timeout(self.aux_timeout), url)
            .await?;

        if let Some(len) = response.content_length()
            && len > MAX_AUX_RESPONSE_BYTES as u64
        {
            return Err(too_large(url));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to read {}: {e}", url)))?
        {
            if body.len() + chunk.len() > MAX_AUX_RESPONSE_BYTES {
                return Err(too_large(url));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::DownloadError(format!("Failed to request {}: {e}", url)))?;

        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Take `n` request slots; `n` must not exceed the capacity.
    /// Released on drop, whatever the outcome of the request.
    async fn acquire(&self, n: usize) -> Result<SemaphorePermit<'_>> {
        debug_assert!(n <= self.capacity);
        self.permits
            .acquire_many(n as u32)
            .await
            .map_err(|_| Error::DownloadError("upstream request limiter closed".to_string()))
    }
}

fn too_large(url: &str) -> Error {
    Error::DownloadError(format!(
        "{} exceeds {} bytes",
        url, MAX_AUX_RESPONSE_BYTES
    ))
}

/// Extract the version from a `version.txt` descriptor
pub fn parse_version(descriptor: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(descriptor);
    text.lines()
        .find_map(|line| line.trim().strip_prefix(VERSION_PREFIX))
        .map(|v| v.trim().to_string())
}

/// Run `fut` unless `cancel` fires first. Dropping `fut` aborts every
/// concurrent leg it owns.
async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
