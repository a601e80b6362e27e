// src/arch.rs
//! Architecture name normalization
//!
//! Firmware, kernels and distributions disagree on architecture names:
//! iPXE reports `x86_64`/`arm64`, uname says `aarch64`, Flatcar publishes
//! `amd64-usr`/`arm64-usr`. Everything inside the crate uses the Flatcar
//! spelling.

/// Map a raw architecture name to its canonical spelling.
///
/// Known synonyms collapse to `amd64` or `arm64`; anything else is returned
/// unchanged so callers can still reject it with a precise message.
pub fn normalize_arch(raw: &str) -> &str {
    match raw {
        "arm64" | "aarch64" => "arm64",
        "amd64" | "x86_64" | "intel64" => "amd64",
        other => other,
    }
}
