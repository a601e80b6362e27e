// src/storage/transaction.rs
//! Store transactions: staged writes published by atomic rename

use super::StoreInner;
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Staging state shared between a [`Transaction`] and the store's registry,
/// so the shutdown sweep can discard it while the handle is still alive.
pub(crate) struct Staged {
    key: String,
    staging: PathBuf,
    /// Set by whichever of publish or discard runs first
    finished: Mutex<bool>,
}

impl Staged {
    pub(crate) fn new(key: String, staging: PathBuf) -> Self {
        Self {
            key,
            staging,
            finished: Mutex::new(false),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn staging_path(&self) -> &Path {
        &self.staging
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delete the staged data. Returns whether this call had any effect.
    pub(crate) fn discard(&self) -> Result<bool> {
        let mut finished = self.lock();
        if *finished {
            return Ok(false);
        }
        *finished = true;

        match fs::remove_file(&self.staging) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Error::IoError(format!(
                "Failed to remove staging file {}: {}",
                self.staging.display(),
                e
            ))),
        }
    }

    /// Move the staged file to `final_path`. Blocking.
    ///
    /// Holds the state lock for the whole rename, so a concurrent discard
    /// either runs first (and the publish is refused) or finds nothing to do.
    fn publish(&self, final_path: &Path, data_dir: &Path) -> Result<()> {
        let mut finished = self.lock();
        if *finished {
            return Err(Error::Cancelled);
        }
        *finished = true;

        let result = match fs::rename(&self.staging, final_path) {
            Ok(()) => {
                sync_published(data_dir, &self.key);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!(key = %self.key, "Staging on another volume, copying");
                copy_into(&self.staging, final_path, data_dir, &self.key)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let _ = fs::remove_file(&self.staging);
            return Err(Error::IoError(format!(
                "Failed to publish {}: {}",
                final_path.display(),
                e
            )));
        }
        Ok(())
    }
}

/// Copy `staging` into a hidden temp file next to `final_path`, sync it and
/// rename it into place, then drop the staging file.
fn copy_into(staging: &Path, final_path: &Path, data_dir: &Path, key: &str) -> io::Result<()> {
    let temp = data_dir.join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));

    let copied = fs::copy(staging, &temp)
        .and_then(|_| fs::File::open(&temp)?.sync_all())
        .and_then(|_| fs::rename(&temp, final_path));
    if copied.is_err() {
        let _ = fs::remove_file(&temp);
    }
    copied?;
    sync_published(data_dir, key);

    if let Err(e) = fs::remove_file(staging) {
        warn!("Failed to remove staging file {}: {}", staging.display(), e);
    }
    Ok(())
}

/// Persist the directory entry created by a rename
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// The entry is already visible once renamed, so a failed directory sync is
/// reported but does not fail the commit.
fn sync_published(data_dir: &Path, key: &str) {
    if let Err(e) = sync_dir(data_dir) {
        warn!(key, "Failed to sync {}: {}", data_dir.display(), e);
    }
}

/// An open write to one store key.
///
/// Data written here is invisible to [`super::FsStore::get`] until
/// [`commit`](Self::commit). Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    store: Arc<StoreInner>,
    staged: Arc<Staged>,
    file: Option<tokio::fs::File>,
    written: u64,
}

impl Transaction {
    pub(crate) fn new(store: Arc<StoreInner>, staged: Arc<Staged>, file: tokio::fs::File) -> Self {
        Self {
            store,
            staged,
            file: Some(file),
            written: 0,
        }
    }

    pub fn key(&self) -> &str {
        self.staged.key()
    }

    /// Bytes staged so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `data` to the staging file
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        AsyncWriteExt::write_all(self, data).await?;
        Ok(())
    }

    /// Durably sync the staged data and publish it under the key.
    ///
    /// Returns the committed size. The rename runs on the blocking pool and
    /// completes even if this future is dropped mid-way.
    pub async fn commit(&mut self) -> Result<u64> {
        let mut file = self.file.take().ok_or_else(|| {
            Error::ConflictError(format!("transaction for {} already finished", self.key()))
        })?;

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = synced {
            self.release();
            return Err(Error::IoError(format!(
                "Failed to sync {}: {}",
                self.staged.staging_path().display(),
                e
            )));
        }

        let staged = Arc::clone(&self.staged);
        let data_dir = self.store.data_dir().to_path_buf();
        let final_path = data_dir.join(staged.key());
        let published = tokio::task::spawn_blocking(move || staged.publish(&final_path, &data_dir))
            .await
            .map_err(|e| Error::IoError(format!("Commit task failed: {e}")))
            .and_then(|r| r);

        self.store.deregister(&self.staged);
        published?;

        debug!(key = self.key(), bytes = self.written, "Committed");
        Ok(self.written)
    }

    /// Discard staged data and release the key. Idempotent; a no-op after commit.
    pub fn rollback(&mut self) -> Result<()> {
        self.file = None;
        let discarded = self.staged.discard();
        self.store.deregister(&self.staged);

        if let Ok(true) = discarded {
            debug!(key = self.key(), "Rolled back");
        }
        discarded.map(|_| ())
    }

    fn release(&mut self) {
        if let Err(e) = self.rollback() {
            warn!(key = self.key(), "Rollback failed: {}", e);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release();
    }
}

fn finished_error() -> io::Error {
    io::Error::other("transaction already finished")
}

impl AsyncWrite for Transaction {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(finished_error()));
        };
        let polled = Pin::new(file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            this.written += n as u64;
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Err(finished_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Err(finished_error())),
        }
    }
}
