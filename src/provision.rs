// src/provision.rs
//! Cache-or-fetch pipeline for upstream artifacts
//!
//! `get` hit → done. Miss → open a store transaction, stream the verified
//! artifact into it, commit. Any failure before commit rolls the transaction
//! back, so unverified bytes never become visible.

use crate::error::{Error, Result};
use crate::storage::FsStore;
use crate::upstream::{Artifact, Fetcher, Key};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How an artifact came to be available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Already in the store
    Cached(u64),
    /// Downloaded, verified and committed by this call
    Fetched(u64),
}

impl Provisioned {
    pub fn size(&self) -> u64 {
        match self {
            Provisioned::Cached(size) | Provisioned::Fetched(size) => *size,
        }
    }
}

/// Populates the store from the upstream mirror
#[derive(Clone)]
pub struct Provisioner {
    fetcher: Arc<Fetcher>,
    store: FsStore,
}

impl Provisioner {
    pub fn new(fetcher: Arc<Fetcher>, store: FsStore) -> Self {
        Self { fetcher, store }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn store(&self) -> &FsStore {
        &self.store
    }

    /// Resolve user input into a concrete key
    pub async fn resolve_key(
        &self,
        channel: &str,
        arch: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Key> {
        self.fetcher.resolve_key(channel, arch, version, cancel).await
    }

    /// Make sure `artifact` of `key` is in the store.
    ///
    /// A concurrent writer for the same artifact surfaces as
    /// [`Error::ConflictError`]; the caller decides whether to retry.
    pub async fn ensure(
        &self,
        key: &Key,
        artifact: Artifact,
        cancel: &CancellationToken,
    ) -> Result<Provisioned> {
        let id = key.artifact_key(artifact);

        match self.store.get(&id).await {
            Ok((size, _)) => return Ok(Provisioned::Cached(size)),
            Err(Error::NotFoundError(_)) => {}
            Err(e) => return Err(e),
        }

        let mut tx = self.store.add(&id).await?;
        if let Err(e) = self.fetcher.fetch_artifact(key, artifact, &mut tx, cancel).await {
            if let Err(rollback) = tx.rollback() {
                warn!(key = %id, "Rollback after failed fetch also failed: {}", rollback);
            }
            return Err(e);
        }

        let size = tx.commit().await?;
        info!(key = %id, bytes = size, "Cached artifact");
        Ok(Provisioned::Fetched(size))
    }

    /// Ensure the artifact is cached and open it for reading
    pub async fn open(
        &self,
        key: &Key,
        artifact: Artifact,
        cancel: &CancellationToken,
    ) -> Result<(Provisioned, tokio::fs::File)> {
        let provisioned = self.ensure(key, artifact, cancel).await?;
        let (_, file) = self.store.get(&key.artifact_key(artifact)).await?;
        Ok((provisioned, file))
    }
}
