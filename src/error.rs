// src/error.rs
//! Error types shared by the fetch, storage and boot-script layers

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while resolving, fetching, caching or serving boot artifacts
#[derive(Error, Debug)]
pub enum Error {
    /// Bad channel, architecture, version or storage key. No network attempted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A boot profile is malformed or cannot be turned into a boot config
    #[error("invalid profile: {0}")]
    ProfileError(String),

    /// Non-success status or transport failure talking to the upstream mirror
    #[error("download failed: {0}")]
    DownloadError(String),

    /// Detached signature did not verify against the trusted key
    #[error("signature verification failed: {0}")]
    GpgVerificationFailed(String),

    /// Key absent from the store, or no profile for a machine
    #[error("not found: {0}")]
    NotFoundError(String),

    /// Key already finalized, or another transaction for it is open
    #[error("conflict: {0}")]
    ConflictError(String),

    /// Staging or commit filesystem failure with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Raw I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation aborted by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Startup failure (HTTP client, key material)
    #[error("initialization failed: {0}")]
    InitError(String),

    /// Several independent failures, e.g. from a shutdown rollback sweep
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether a client should retry the same request later.
    ///
    /// Upstream, network, I/O, cancellation and write-collision failures are
    /// transient. Validation, profile and integrity failures are not: retrying
    /// them would loop forever without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DownloadError(_)
                | Error::ConflictError(_)
                | Error::IoError(_)
                | Error::Io(_)
                | Error::Cancelled
        )
    }

    /// Status code reported to firmware and HTTP clients
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::NotFoundError(_) => 404,
            Error::ConflictError(_) => 409,
            Error::ProfileError(_) => 422,
            Error::DownloadError(_) | Error::GpgVerificationFailed(_) => 502,
            Error::Cancelled => 503,
            Error::IoError(_) | Error::Io(_) | Error::InitError(_) | Error::Multiple(_) => 500,
        }
    }

    /// True for integrity failures, which must never be cached
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::GpgVerificationFailed(_))
    }
}
