// src/profile.rs
//! Boot profiles and machine matching
//!
//! Profiles are JSON files loaded once at startup. A profile names the
//! machines it applies to through `labels` and describes what to boot:
//! either a Flatcar release served through the local cache, or an explicit
//! kernel and image list rendered as-is.
//!
//! ```json
//! {
//!   "id": "workers",
//!   "arch": "amd64",
//!   "labels": { "hostname": "worker-1" },
//!   "boot": { "flatcar": { "channel": "stable", "version": "current", "args": ["console=ttyS0"] } },
//!   "ignition": { "source": "https://config.example.com/worker.ign" }
//! }
//! ```

use crate::arch::normalize_arch;
use crate::error::{Error, Result};
use crate::upstream::{CURRENT_VERSION, is_valid_arch, is_valid_channel, is_valid_version_input};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Label names a profile may match on
pub const LABEL_NAMES: &[&str] = &["uuid", "mac", "hostname", "domain", "serial", "arch"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    /// Architecture to boot. Empty means the machine's own.
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub boot: Boot,
    #[serde(default)]
    pub ignition: Ignition,
}

/// What a profile boots. Exactly one of `flatcar` or `kernel` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Boot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flatcar: Option<FlatcarBoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<Kernel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatcarBoot {
    pub channel: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_version() -> String {
    CURRENT_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Kernel {
    pub uri: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ignition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Ignition {
    pub fn is_empty(&self) -> bool {
        self.inline.is_none() && self.source.is_none()
    }
}

/// A resolved boot sequence, ready to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub kernel: Kernel,
    pub images: Vec<Image>,
}

impl Profile {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::ProfileError(format!("{}: {}", self.id, msg)));

        if self.id.is_empty() {
            return Err(Error::ProfileError("profile without id".to_string()));
        }
        if !self.arch.is_empty() && !is_valid_arch(normalize_arch(&self.arch)) {
            return fail(format!("unsupported arch '{}'", self.arch));
        }
        if let Some(name) = self.labels.keys().find(|k| !LABEL_NAMES.contains(&k.as_str())) {
            return fail(format!("unknown label '{}'", name));
        }

        match (&self.boot.flatcar, &self.boot.kernel) {
            (Some(flatcar), None) => {
                if !self.boot.images.is_empty() {
                    return fail("flatcar boot takes no images".to_string());
                }
                if !is_valid_channel(&flatcar.channel) {
                    return fail(format!("invalid channel '{}'", flatcar.channel));
                }
                if !is_valid_version_input(&flatcar.version) {
                    return fail(format!("invalid version '{}'", flatcar.version));
                }
            }
            (None, Some(kernel)) => {
                if kernel.uri.is_empty() {
                    return fail("kernel without uri".to_string());
                }
                if self.boot.images.iter().any(|image| image.uri.is_empty()) {
                    return fail("image without uri".to_string());
                }
            }
            (Some(_), Some(_)) => return fail("both flatcar and kernel boot given".to_string()),
            (None, None) => return fail("no boot source".to_string()),
        }

        if self.ignition.inline.is_some() && self.ignition.source.is_some() {
            return fail("ignition has both inline and source".to_string());
        }
        Ok(())
    }

    /// Whether every label equals the machine's attribute
    pub fn matches(&self, machine: &Machine) -> bool {
        self.labels.iter().all(|(name, want)| match name.as_str() {
            "mac" => machine.mac.as_deref().map(normalize_mac) == Some(normalize_mac(want)),
            "arch" => machine.arch.as_deref().map(normalize_arch) == Some(normalize_arch(want)),
            other => machine.attribute(other) == Some(want.as_str()),
        })
    }
}

/// Identifying variables reported by the firmware
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Machine {
    pub uuid: Option<String>,
    pub mac: Option<String>,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub serial: Option<String>,
    pub arch: Option<String>,
}

impl Machine {
    fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "uuid" => self.uuid.as_deref(),
            "mac" => self.mac.as_deref(),
            "domain" => self.domain.as_deref(),
            "hostname" => self.hostname.as_deref(),
            "serial" => self.serial.as_deref(),
            "arch" => self.arch.as_deref(),
            _ => None,
        }
    }
}

/// iPXE's `hexhyp` form and colon form compare equal, case-insensitively
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase().replace('-', ":")
}

/// All loaded profiles, ordered by id
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: Vec<Profile>,
}

impl ProfileStore {
    /// Validate and index a set of profiles
    pub fn from_profiles(mut profiles: Vec<Profile>) -> Result<Self> {
        for profile in &profiles {
            profile.validate()?;
        }
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = profiles.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(Error::ProfileError(format!("duplicate profile id '{}'", pair[0].id)));
        }
        Ok(Self { profiles })
    }

    /// Load every `*.json` file in `dir`
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| {
            Error::ProfileError(format!("Failed to read {}: {}", dir.display(), e))
        })?;

        let mut profiles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path)?;
            let profile: Profile = serde_json::from_slice(&data).map_err(|e| {
                Error::ProfileError(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            debug!("Loaded profile {} from {}", profile.id, path.display());
            profiles.push(profile);
        }

        let store = Self::from_profiles(profiles)?;
        info!("Loaded {} boot profile(s) from {}", store.len(), dir.display());
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// The matching profile with the most labels; ties go to the lowest id
    pub fn select(&self, machine: &Machine) -> Result<&Profile> {
        self.profiles
            .iter()
            .filter(|p| p.matches(machine))
            .fold(None, |best: Option<&Profile>, p| match best {
                Some(b) if b.labels.len() >= p.labels.len() => Some(b),
                _ => Some(p),
            })
            .ok_or_else(|| Error::NotFoundError("no profile matches this machine".to_string()))
    }
}
