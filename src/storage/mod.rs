// src/storage/mod.rs
//! Transactional filesystem cache for boot artifacts
//!
//! Layout:
//! - `data_dir/<key>`: one immutable file per finalized key
//! - `scratch_dir/<key>.<uuid>.partial`: staged writes of open transactions
//!
//! The scratch directory may live on another volume; commit falls back to a
//! copy inside the data volume followed by a rename there.
//!
//! At most one transaction per key is open at any time. Registration is an
//! atomic insert-if-absent on a concurrent map, so there is no store-wide lock.

mod transaction;

pub use transaction::Transaction;

use crate::error::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};
use transaction::Staged;

/// Key-addressed artifact store with atomic commit-or-discard writes
#[derive(Clone)]
pub struct FsStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    data_dir: PathBuf,
    scratch_dir: PathBuf,
    /// Open transactions by key
    inflight: DashMap<String, Arc<Staged>>,
    closed: AtomicBool,
}

impl FsStore {
    /// Open a store, creating both directories if needed
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(data_dir: P, scratch_dir: Q) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let scratch_dir = scratch_dir.as_ref().to_path_buf();

        for dir in [&data_dir, &scratch_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::InitError(format!("Failed to create {}: {}", dir.display(), e))
                })?;
                debug!("Created store directory: {}", dir.display());
            }
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                data_dir,
                scratch_dir,
                inflight: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.inner.scratch_dir
    }

    /// Final location of a key's data
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.inner.data_dir.join(key)
    }

    /// Open a finalized entry for reading.
    ///
    /// Returns its size and a handle positioned at the start.
    pub async fn get(&self, key: &str) -> Result<(u64, tokio::fs::File)> {
        validate_key(key)?;
        let path = self.entry_path(key);

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFoundError(format!("no cached entry for {}", key)));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Whether a finalized entry exists
    pub fn contains(&self, key: &str) -> bool {
        validate_key(key).is_ok() && self.entry_path(key).is_file()
    }

    /// Open a write transaction for `key`.
    ///
    /// Fails with [`Error::ConflictError`] when the key is already finalized
    /// or another transaction for it is open. Callers are not queued.
    pub async fn add(&self, key: &str) -> Result<Transaction> {
        validate_key(key)?;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        let staging = self
            .inner
            .scratch_dir
            .join(format!("{}.{}.partial", key, uuid::Uuid::new_v4()));
        let staged = Arc::new(Staged::new(key.to_string(), staging));

        match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::ConflictError(format!(
                    "{} is already being written",
                    key
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&staged));
            }
        }

        // Checked after registering: a concurrent commit either finished its
        // rename already or still holds the slot we just won.
        if self.entry_path(key).exists() {
            self.inner.deregister(&staged);
            return Err(Error::ConflictError(format!("{} is already cached", key)));
        }

        let file = match tokio::fs::File::create(staged.staging_path()).await {
            Ok(file) => file,
            Err(e) => {
                self.inner.deregister(&staged);
                return Err(Error::IoError(format!(
                    "Failed to create staging file {}: {}",
                    staged.staging_path().display(),
                    e
                )));
            }
        };

        debug!(key, "Opened transaction");
        Ok(Transaction::new(Arc::clone(&self.inner), staged, file))
    }

    /// Number of open transactions
    pub fn open_transactions(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Roll back every open transaction and refuse new ones.
    ///
    /// Every transaction is attempted; failures are collected into
    /// [`Error::Multiple`].
    pub fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);

        let open: Vec<Arc<Staged>> = self
            .inner
            .inflight
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if !open.is_empty() {
            info!("Rolling back {} open transaction(s)", open.len());
        }

        let mut errors = Vec::new();
        for staged in open {
            if let Err(e) = staged.discard() {
                error!(key = staged.key(), "Rollback failed: {}", e);
                errors.push(e);
            }
            self.inner.deregister(&staged);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

impl StoreInner {
    /// Remove the registry slot if it still belongs to `staged`
    pub(crate) fn deregister(&self, staged: &Arc<Staged>) {
        self.inflight
            .remove_if(staged.key(), |_, current| Arc::ptr_eq(current, staged));
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Keys become file names in both directories
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidInput(format!("invalid storage key '{}'", key)));
    }
    Ok(())
}
