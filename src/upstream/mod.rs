// src/upstream/mod.rs
//! Upstream Flatcar mirror access
//!
//! Resolves release versions and streams verified PXE artifacts:
//! - `key`: release identifiers and mirror URL layout
//! - `signing`: detached OpenPGP signature checks
//! - `tee`: back-pressured hand-off between download and verifier
//! - `fetcher`: the HTTP client tying it together

mod fetcher;
mod key;
mod signing;
mod tee;

pub use fetcher::{Fetcher, FetcherOptions, MAX_AUX_RESPONSE_BYTES, VERSION_FILE, parse_version};
pub use key::{
    Arch, Artifact, CURRENT_VERSION, Channel, DEFAULT_MIRROR, Key, Mirror, is_valid_arch,
    is_valid_channel, is_valid_version, is_valid_version_input,
};
pub use signing::TrustedKey;
pub use tee::{DEFAULT_TEE_DEPTH, TeeReader, TeeSender, tee_channel};

#[cfg(test)]
pub(crate) use signing::fixtures;
