// src/upstream/signing.rs

//! Detached OpenPGP signature verification against the release signing key
//!
//! Flatcar signs every published file with one image signing key and ships
//! the signature next to it as `<file>.sig`. [`TrustedKey`] holds that key,
//! is loaded once at startup and is shared by reference with every fetch.
//!
//! Two entry points exist: [`TrustedKey::verify_detached`] for small buffered
//! payloads (version descriptors) and [`TrustedKey::verify_detached_reader`]
//! for artifacts that are verified while they stream past.

use crate::error::{Error, Result};
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use openpgp::{Cert, KeyHandle};
use sequoia_openpgp as openpgp;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// The public key every upstream signature must verify against
#[derive(Debug, Clone)]
pub struct TrustedKey {
    cert: Cert,
}

impl TrustedKey {
    /// Parse an armored or binary public key
    pub fn from_bytes(key_data: &[u8]) -> Result<Self> {
        let cert = Cert::from_bytes(key_data)
            .map_err(|e| Error::InitError(format!("Failed to parse signing key: {}", e)))?;

        debug!("Loaded signing key with fingerprint: {}", cert.fingerprint());
        Ok(Self { cert })
    }

    /// Load the signing key from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let key_data = fs::read(path).map_err(|e| {
            Error::InitError(format!(
                "Failed to read signing key {}: {}",
                path.display(),
                e
            ))
        })?;
        let key = Self::from_bytes(&key_data)?;
        info!(
            "Using signing key {} from {}",
            key.fingerprint(),
            path.display()
        );
        Ok(key)
    }

    pub fn fingerprint(&self) -> String {
        self.cert.fingerprint().to_string()
    }

    /// Verify a detached signature over an in-memory message
    pub fn verify_detached(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let policy = StandardPolicy::new();
        let mut verifier = self.verifier(&policy, signature)?;
        verifier
            .verify_bytes(message)
            .map_err(|e| Error::GpgVerificationFailed(e.to_string()))
    }

    /// Verify a detached signature over everything `reader` yields.
    ///
    /// Reads until EOF; blocks on the reader, so run it off the async runtime.
    pub fn verify_detached_reader<R>(&self, reader: R, signature: &[u8]) -> Result<()>
    where
        R: Read + Send + Sync,
    {
        let policy = StandardPolicy::new();
        let mut verifier = self.verifier(&policy, signature)?;
        verifier
            .verify_reader(reader)
            .map_err(|e| Error::GpgVerificationFailed(e.to_string()))
    }

    fn verifier<'a>(
        &'a self,
        policy: &'a StandardPolicy<'a>,
        signature: &'a [u8],
    ) -> Result<openpgp::parse::stream::DetachedVerifier<'a, Helper<'a>>> {
        DetachedVerifierBuilder::from_bytes(signature)
            .map_err(|e| Error::GpgVerificationFailed(format!("Failed to parse signature: {}", e)))?
            .with_policy(policy, None, Helper { cert: &self.cert })
            .map_err(|e| Error::GpgVerificationFailed(format!("Failed to set up verifier: {}", e)))
    }
}

/// Supplies the single trusted certificate and accepts a message only when
/// at least one signature in it checks out.
struct Helper<'a> {
    cert: &'a Cert,
}

impl VerificationHelper for Helper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(vec![self.cert.clone()])
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            match layer {
                MessageLayer::SignatureGroup { results } => {
                    if results.iter().any(|r| r.is_ok()) {
                        return Ok(());
                    }
                    return Err(anyhow::anyhow!("No valid signature from the trusted key"));
                }
                _ => return Err(anyhow::anyhow!("Unexpected message structure")),
            }
        }
        Err(anyhow::anyhow!("No signature found"))
    }
}
