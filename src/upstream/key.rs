// src/upstream/key.rs
//! Resource keys: which Flatcar build an artifact belongs to
//!
//! A [`Key`] is the `(channel, arch, version)` triple of one upstream release.
//! It can only be built from a concrete version; the `"current"` alias is
//! accepted by [`super::Fetcher::resolve_key`] as input and replaced before a
//! key exists, so no storage identifier ever contains it.

use crate::arch::normalize_arch;
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Version alias resolved through the signed `version.txt` descriptor
pub const CURRENT_VERSION: &str = "current";

/// Default upstream mirror layout
pub const DEFAULT_MIRROR: &str = "https://{channel}.release.flatcar-linux.net/{arch}-usr/{version}";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("static regex"));

/// Upstream release track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stable,
    Beta,
    Alpha,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Beta => "beta",
            Channel::Alpha => "alpha",
        }
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stable" => Ok(Channel::Stable),
            "beta" => Ok(Channel::Beta),
            "alpha" => Ok(Channel::Alpha),
            other => Err(Error::InvalidInput(format!("invalid channel '{}'", other))),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architectures Flatcar publishes PXE images for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl FromStr for Arch {
    type Err = Error;

    /// Parses after normalization, so `aarch64` and `x86_64` are accepted
    fn from_str(s: &str) -> Result<Self> {
        match normalize_arch(s) {
            "amd64" => Ok(Arch::Amd64),
            "arm64" => Ok(Arch::Arm64),
            other => Err(Error::InvalidInput(format!("invalid arch '{}'", other))),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The files published per release that this server provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Kernel,
    Initrd,
}

impl Artifact {
    /// Upstream file name
    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::Kernel => "flatcar_production_pxe.vmlinuz",
            Artifact::Initrd => "flatcar_production_pxe_image.cpio.gz",
        }
    }

    /// Upstream file name of the detached signature
    pub fn signature_name(&self) -> String {
        format!("{}.sig", self.file_name())
    }

    /// Suffix of the storage sub-key and path segment of the HTTP endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            Artifact::Kernel => "kernel",
            Artifact::Initrd => "initrd",
        }
    }
}

impl FromStr for Artifact {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kernel" => Ok(Artifact::Kernel),
            "initrd" => Ok(Artifact::Initrd),
            other => Err(Error::InvalidInput(format!("unknown artifact '{}'", other))),
        }
    }
}

pub fn is_valid_channel(channel: &str) -> bool {
    channel.parse::<Channel>().is_ok()
}

/// True for canonical architecture names only; normalize first
pub fn is_valid_arch(arch: &str) -> bool {
    matches!(arch, "amd64" | "arm64")
}

/// True for a concrete `MAJOR.MINOR.PATCH` version. `"current"` is not valid here.
pub fn is_valid_version(version: &str) -> bool {
    VERSION_RE.is_match(version)
}

/// True for anything `resolve_key` accepts: a concrete version or the alias
pub fn is_valid_version_input(version: &str) -> bool {
    version == CURRENT_VERSION || is_valid_version(version)
}

/// A resolved, immutable Flatcar release identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    channel: Channel,
    arch: Arch,
    version: String,
}

impl Key {
    /// Build a key from a concrete version
    pub fn new(channel: Channel, arch: Arch, version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        if !is_valid_version(&version) {
            return Err(Error::InvalidInput(format!("invalid version '{}'", version)));
        }
        Ok(Self { channel, arch, version })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Storage identifier of one artifact of this release
    pub fn artifact_key(&self, artifact: Artifact) -> String {
        format!("{}-{}", self, artifact.as_str())
    }

    pub fn kernel_key(&self) -> String {
        self.artifact_key(Artifact::Kernel)
    }

    pub fn initrd_key(&self) -> String {
        self.artifact_key(Artifact::Initrd)
    }

    /// Release directory on the default mirror
    pub fn base_url(&self) -> String {
        Mirror::default().base_url(self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flatcar-{}-{}-{}", self.channel, self.arch, self.version)
    }
}

/// URL layout of an upstream mirror.
///
/// The template is expanded by substituting `{channel}`, `{arch}` and
/// `{version}`; it names the release directory, artifact file names are
/// appended to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    template: String,
}

impl Mirror {
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into().trim_end_matches('/').to_string();
        if !template.contains("{version}") {
            return Err(Error::InvalidInput(format!(
                "mirror template '{}' has no {{version}} placeholder",
                template
            )));
        }
        Ok(Self { template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn base_url(&self, key: &Key) -> String {
        self.expand(key.channel, key.arch, key.version())
    }

    /// URL of a file inside a release directory
    pub fn file_url(&self, key: &Key, file: &str) -> String {
        format!("{}/{}", self.base_url(key), file)
    }

    /// URL of the `current` release directory, used for version resolution
    pub fn current_url(&self, channel: Channel, arch: Arch, file: &str) -> String {
        format!("{}/{}", self.expand(channel, arch, CURRENT_VERSION), file)
    }

    fn expand(&self, channel: Channel, arch: Arch, version: &str) -> String {
        self.template
            .replace("{channel}", channel.as_str())
            .replace("{arch}", arch.as_str())
            .replace("{version}", version)
    }
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            template: DEFAULT_MIRROR.to_string(),
        }
    }
}
