// src/script/mod.rs
//! iPXE script rendering
//!
//! Four scripts are produced:
//! - bootstrap: chains into `/ipxe` with the firmware's identifying variables
//! - boot: kernel, initrd lines and `boot` for a resolved [`BootConfig`]
//! - retry: sleeps with backoff and re-chains the same request, `attempt + 1`
//! - error: prints the failure and drops to the iPXE shell
//!
//! Rendering never does I/O.

mod backoff;

pub use backoff::{Backoff, DEFAULT_BASE_MS, DEFAULT_CAP_MS};

use crate::profile::BootConfig;

pub const BOOTSTRAP_SCRIPT: &str = "#!ipxe\n\
chain ipxe?uuid=${uuid}&mac=${mac:hexhyp}&domain=${domain}&hostname=${hostname}&serial=${serial}&arch=${buildarch:uristring}\n";

/// Query parameter counting boot-script retries
pub const ATTEMPT_PARAM: &str = "attempt";

#[derive(Debug, Clone, Default)]
pub struct ScriptGenerator {
    backoff: Backoff,
}

impl ScriptGenerator {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn bootstrap(&self) -> &'static str {
        BOOTSTRAP_SCRIPT
    }

    pub fn boot(&self, config: &BootConfig) -> String {
        let mut script = String::from("#!ipxe\n");

        script.push_str("kernel ");
        script.push_str(&config.kernel.uri);
        for arg in &config.kernel.args {
            script.push(' ');
            script.push_str(arg);
        }
        script.push('\n');

        for image in &config.images {
            script.push_str("initrd ");
            if let Some(name) = &image.name {
                script.push_str("--name ");
                script.push_str(name);
                script.push(' ');
            }
            script.push_str(&image.uri);
            script.push('\n');
        }

        script.push_str("boot\n");
        script
    }

    /// Sleep, then request `path?query` again with the attempt counter bumped.
    ///
    /// A missing or unparseable `attempt` counts as 0.
    pub fn retry(&self, path: &str, query: Option<&str>, reason: &str) -> String {
        let attempt = attempt_from_query(query);
        let secs = self.backoff.sleep_secs(attempt);

        let mut next = url::form_urlencoded::Serializer::new(String::new());
        if let Some(query) = query {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if name != ATTEMPT_PARAM {
                    next.append_pair(&name, &value);
                }
            }
        }
        next.append_pair(ATTEMPT_PARAM, &attempt.saturating_add(1).to_string());

        format!(
            "#!ipxe\necho Boot not ready ({}), retrying in {}s\nsleep {}\nchain {}?{}\n",
            sanitize(reason),
            secs,
            secs,
            path,
            next.finish()
        )
    }

    /// Report a permanent failure and stop in the shell
    pub fn error(&self, code: u16, message: &str) -> String {
        format!(
            "#!ipxe\necho Boot failed with status {}: {}\nshell\n",
            code,
            sanitize(message)
        )
    }
}

/// Retry counter of a request; 0 when absent or malformed
pub fn attempt_from_query(query: Option<&str>) -> u32 {
    query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(name, _)| name == ATTEMPT_PARAM)
                .and_then(|(_, value)| parse_attempt(&value))
        })
        .unwrap_or(0)
}

/// Decimal counter, saturating at `u32::MAX` instead of resetting
fn parse_attempt(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(value.parse().unwrap_or(u32::MAX))
}

/// Keep messages on one line and away from iPXE variable expansion
fn sanitize(message: &str) -> String {
    message
        .chars()
        .map(|c| if c.is_control() || c == '$' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Image, Kernel};

    fn chain_line(script: &str) -> &str {
        script
            .lines()
            .find_map(|line| line.strip_prefix("chain "))
            .unwrap()
    }

    fn sleep_secs(script: &str) -> u64 {
        script
            .lines()
            .find_map(|line| line.strip_prefix("sleep "))
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_bootstrap() {
        let script = ScriptGenerator::default().bootstrap();
        assert!(script.starts_with("#!ipxe\n"));
        assert!(script.contains("mac=${mac:hexhyp}"));
        assert!(script.contains("arch=${buildarch:uristring}"));
    }

    #[test]
    fn test_boot_script() {
        let config = BootConfig {
            kernel: Kernel {
                uri: "http://h/flatcar/stable/amd64/1.2.3/kernel".to_string(),
                args: vec!["flatcar.first_boot=1".to_string(), "console=ttyS0".to_string()],
            },
            images: vec![
                Image {
                    name: None,
                    uri: "http://h/flatcar/stable/amd64/1.2.3/initrd".to_string(),
                },
                Image {
                    name: Some("oem.cpio.gz".to_string()),
                    uri: "http://h/oem".to_string(),
                },
            ],
        };

        let script = ScriptGenerator::default().boot(&config);
        assert_eq!(
            script,
            "#!ipxe\n\
             kernel http://h/flatcar/stable/amd64/1.2.3/kernel flatcar.first_boot=1 console=ttyS0\n\
             initrd http://h/flatcar/stable/amd64/1.2.3/initrd\n\
             initrd --name oem.cpio.gz http://h/oem\n\
             boot\n"
        );
    }

    #[test]
    fn test_retry_without_attempt() {
        let generator = ScriptGenerator::default();
        let script = generator.retry("/ipxe", Some("mac=52-54-00-00-00-01&arch=x86_64"), "busy");

        assert_eq!(chain_line(&script), "/ipxe?mac=52-54-00-00-00-01&arch=x86_64&attempt=1");
        assert!((5..10).contains(&sleep_secs(&script)));

        let script = generator.retry("/ipxe", None, "busy");
        assert_eq!(chain_line(&script), "/ipxe?attempt=1");
    }

    #[test]
    fn test_retry_increments_attempt() {
        let script = ScriptGenerator::default().retry("/ipxe", Some("attempt=5&hostname=n1"), "busy");
        assert_eq!(chain_line(&script), "/ipxe?hostname=n1&attempt=6");
        assert!((160..320).contains(&sleep_secs(&script)));
    }

    #[test]
    fn test_attempt_parsing() {
        assert_eq!(attempt_from_query(None), 0);
        assert_eq!(attempt_from_query(Some("")), 0);
        assert_eq!(attempt_from_query(Some("attempt=abc")), 0);
        assert_eq!(attempt_from_query(Some("attempt=-1")), 0);
        assert_eq!(attempt_from_query(Some("a=1&attempt=3")), 3);
    }

    #[test]
    fn test_oversized_attempt_saturates() {
        assert_eq!(attempt_from_query(Some("attempt=4294967296")), u32::MAX);
        assert_eq!(attempt_from_query(Some("attempt=99999999999999999999999")), u32::MAX);

        let script = ScriptGenerator::default().retry("/ipxe", Some("attempt=99999999999"), "busy");
        assert_eq!(chain_line(&script), "/ipxe?attempt=4294967295");
        assert!((300..600).contains(&sleep_secs(&script)));
    }

    #[test]
    fn test_error_script() {
        let script = ScriptGenerator::default().error(422, "bad\nprofile ${x}");
        assert_eq!(script, "#!ipxe\necho Boot failed with status 422: bad profile  {x}\nshell\n");
    }
}
