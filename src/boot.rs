// src/boot.rs
//! Turns a machine's profile into a concrete boot sequence
//!
//! Flatcar boots are resolved to a concrete release and both PXE artifacts
//! are brought into the cache before the script is rendered, so firmware
//! never follows a URL that would have to wait on the upstream mirror.

use crate::error::{Error, Result};
use crate::profile::{BootConfig, FlatcarBoot, Image, Kernel, Machine, Profile, ProfileStore};
use crate::provision::{Provisioned, Provisioner};
use crate::upstream::{Artifact, Key};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FLATCAR_KERNEL_ARGS: &[&str] = &[
    "initrd=flatcar_production_pxe_image.cpio.gz",
    "flatcar.first_boot=1",
];

/// Resolves machines to boot configs
pub struct BootResolver {
    profiles: Arc<ProfileStore>,
    provisioner: Provisioner,
    /// Prefix for URLs handed to firmware, without trailing slash
    public_url: String,
}

/// A resolved boot config plus what provisioning did for it
#[derive(Debug, Clone)]
pub struct Resolution {
    pub profile_id: String,
    pub config: BootConfig,
    pub provisioned: Vec<Provisioned>,
}

impl BootResolver {
    pub fn new(profiles: Arc<ProfileStore>, provisioner: Provisioner, public_url: &str) -> Self {
        Self {
            profiles,
            provisioner,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// Select the machine's profile and produce its boot config
    pub async fn resolve(&self, machine: &Machine, cancel: &CancellationToken) -> Result<Resolution> {
        let profile = self.profiles.select(machine)?;
        debug!(profile = %profile.id, "Selected boot profile");

        match (&profile.boot.flatcar, &profile.boot.kernel) {
            (Some(flatcar), _) => self.resolve_flatcar(profile, flatcar, machine, cancel).await,
            (None, Some(kernel)) => Ok(Resolution {
                profile_id: profile.id.clone(),
                config: BootConfig {
                    kernel: kernel.clone(),
                    images: profile.boot.images.clone(),
                },
                provisioned: Vec::new(),
            }),
            (None, None) => Err(Error::ProfileError(format!("{}: no boot source", profile.id))),
        }
    }

    async fn resolve_flatcar(
        &self,
        profile: &Profile,
        flatcar: &FlatcarBoot,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let arch = if profile.arch.is_empty() {
            machine.arch.as_deref().ok_or_else(|| {
                Error::ProfileError(format!("{}: no arch in profile or request", profile.id))
            })?
        } else {
            profile.arch.as_str()
        };

        let key = self
            .provisioner
            .resolve_key(&flatcar.channel, arch, &flatcar.version, cancel)
            .await?;

        let (kernel, initrd) = tokio::try_join!(
            self.provisioner.ensure(&key, Artifact::Kernel, cancel),
            self.provisioner.ensure(&key, Artifact::Initrd, cancel),
        )?;

        let mut args: Vec<String> = FLATCAR_KERNEL_ARGS.iter().map(|a| a.to_string()).collect();
        if !profile.ignition.is_empty() {
            args.push(format!("ignition.config.url={}", self.ignition_url(machine)));
        }
        args.extend(flatcar.args.iter().cloned());

        Ok(Resolution {
            profile_id: profile.id.clone(),
            config: BootConfig {
                kernel: Kernel {
                    uri: self.artifact_url(&key, Artifact::Kernel),
                    args,
                },
                images: vec![Image {
                    name: None,
                    uri: self.artifact_url(&key, Artifact::Initrd),
                }],
            },
            provisioned: vec![kernel, initrd],
        })
    }

    /// Artifact endpoint of this server for a resolved key
    pub fn artifact_url(&self, key: &Key, artifact: Artifact) -> String {
        format!(
            "{}/flatcar/{}/{}/{}/{}",
            self.public_url,
            key.channel(),
            key.arch(),
            key.version(),
            artifact.as_str()
        )
    }

    /// Ignition endpoint carrying the machine's identity
    pub fn ignition_url(&self, machine: &Machine) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in [
            ("uuid", &machine.uuid),
            ("mac", &machine.mac),
            ("domain", &machine.domain),
            ("hostname", &machine.hostname),
            ("serial", &machine.serial),
            ("arch", &machine.arch),
        ] {
            if let Some(value) = value {
                query.append_pair(name, value);
            }
        }
        format!("{}/ignition?{}", self.public_url, query.finish())
    }
}
