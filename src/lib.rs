// src/lib.rs

//! Netboot: network boot server for Flatcar Container Linux
//!
//! Machines PXE-boot into iPXE, fetch a bootstrap script and are chained to a
//! per-machine boot script. The kernel and initrd it references are
//! downloaded from the upstream Flatcar mirror, verified against the release
//! signing key while they stream, and cached on local disk.
//!
//! # Architecture
//!
//! - `upstream`: version resolution, verified streaming downloads
//! - `storage`: transactional filesystem cache, one writer per key
//! - `provision`: cache-or-fetch pipeline joining the two
//! - `profile` / `boot`: machine matching and boot config resolution
//! - `script`: iPXE bootstrap, boot, retry and error scripts
//! - `server`: axum HTTP surface and graceful shutdown

pub mod arch;
pub mod boot;
pub mod config;
mod error;
pub mod profile;
pub mod provision;
pub mod script;
pub mod server;
pub mod storage;
pub mod upstream;

pub use arch::normalize_arch;
pub use boot::{BootResolver, Resolution};
pub use error::{Error, Result};
pub use profile::{BootConfig, Machine, Profile, ProfileStore};
pub use provision::{Provisioned, Provisioner};
pub use script::{Backoff, ScriptGenerator};
pub use storage::{FsStore, Transaction};
pub use upstream::{Arch, Artifact, Channel, Fetcher, FetcherOptions, Key, Mirror, TrustedKey};
