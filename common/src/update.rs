//! Startup firmware update decision.
//!
//! The update source publishes a `version` file next to the firmware files.
//! When that version differs from the one recorded on the node, every file is
//! fetched, optionally checked against a SHA-256 digest, installed, and the
//! node restarts before the read loop begins.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::UpdateConfig;

pub const VERSION_FILE: &str = "version";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("update source returned an empty version")]
    EmptyVersion,
    #[error("downloaded image is empty")]
    EmptyImage,
    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    DigestMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    UpToDate,
    Install { version: String },
}

impl UpdateDecision {
    /// Any difference from the recorded version, or no recorded version at
    /// all, triggers an install. Versions are opaque strings.
    pub fn evaluate(local: Option<&str>, remote: &str) -> Result<Self, UpdateError> {
        let remote = remote.trim();
        if remote.is_empty() {
            return Err(UpdateError::EmptyVersion);
        }

        match local.map(str::trim) {
            Some(local) if local == remote => Ok(Self::UpToDate),
            _ => Ok(Self::Install {
                version: remote.to_string(),
            }),
        }
    }
}

/// Joins path segments with single slashes. The host keeps its leading
/// slash so filesystem sources can be absolute.
fn join(host: &str, segments: &[&str]) -> String {
    let mut url = host.trim_end_matches('/').to_string();
    for segment in segments.iter().map(|segment| segment.trim_matches('/')) {
        if !segment.is_empty() {
            url.push('/');
            url.push_str(segment);
        }
    }
    url
}

pub fn version_url(config: &UpdateConfig) -> String {
    join(&config.host, &[&config.project, VERSION_FILE])
}

pub fn file_url(config: &UpdateConfig, version: &str, filename: &str) -> String {
    if config.use_version_prefix {
        let prefixed = format!("{version}_{filename}");
        join(&config.host, &[&config.project, &prefixed])
    } else {
        join(&config.host, &[&config.project, filename])
    }
}

/// Streaming SHA-256 over a downloaded image.
#[derive(Default)]
pub struct ImageDigest {
    hasher: Sha256,
    bytes: u64,
}

impl ImageDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes = self.bytes.saturating_add(chunk.len() as u64);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finishes the digest and checks it against `expected` when given.
    /// Returns the lowercase hex digest.
    pub fn verify(self, expected: Option<&str>) -> Result<String, UpdateError> {
        if self.bytes == 0 {
            return Err(UpdateError::EmptyImage);
        }

        let actual = to_hex(&self.hasher.finalize());
        if let Some(expected) = expected {
            let expected = expected.trim().to_ascii_lowercase();
            if expected != actual {
                return Err(UpdateError::DigestMismatch { expected, actual });
            }
        }
        Ok(actual)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn source() -> UpdateConfig {
        UpdateConfig {
            enabled: true,
            host: "https://updates.example.net/station/".to_string(),
            project: "outside".to_string(),
            ..UpdateConfig::default()
        }
    }

    #[test]
    fn same_version_is_up_to_date() {
        assert_eq!(
            UpdateDecision::evaluate(Some("1.4\n"), " 1.4 ").unwrap(),
            UpdateDecision::UpToDate
        );
    }

    #[test]
    fn different_or_missing_version_installs() {
        let install = UpdateDecision::Install {
            version: "1.5".to_string(),
        };
        assert_eq!(UpdateDecision::evaluate(Some("1.4"), "1.5").unwrap(), install);
        assert_eq!(UpdateDecision::evaluate(None, "1.5\n").unwrap(), install);
    }

    #[test]
    fn empty_remote_version_is_an_error() {
        assert_eq!(
            UpdateDecision::evaluate(Some("1.4"), "  "),
            Err(UpdateError::EmptyVersion)
        );
    }

    #[test]
    fn urls_follow_source_layout() {
        let mut config = source();
        assert_eq!(
            version_url(&config),
            "https://updates.example.net/station/outside/version"
        );
        assert_eq!(
            file_url(&config, "7", "firmware.bin"),
            "https://updates.example.net/station/outside/firmware.bin"
        );

        config.use_version_prefix = true;
        config.project.clear();
        assert_eq!(
            file_url(&config, "7", "firmware.bin"),
            "https://updates.example.net/station/7_firmware.bin"
        );
    }

    #[test]
    fn absolute_directory_source_keeps_leading_slash() {
        let config = UpdateConfig {
            host: "/srv/station-updates/".to_string(),
            project: String::new(),
            ..UpdateConfig::default()
        };
        assert_eq!(version_url(&config), "/srv/station-updates/version");
    }

    #[test]
    fn digest_checks_expected_value() {
        let mut digest = ImageDigest::new();
        digest.update(b"a");
        digest.update(b"bc");
        assert_eq!(digest.bytes(), 3);
        assert_eq!(
            digest.verify(Some(&ABC_SHA256.to_ascii_uppercase())).unwrap(),
            ABC_SHA256
        );

        let mut digest = ImageDigest::new();
        digest.update(b"abd");
        assert!(matches!(
            digest.verify(Some(ABC_SHA256)),
            Err(UpdateError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn empty_image_is_rejected() {
        assert_eq!(ImageDigest::new().verify(None), Err(UpdateError::EmptyImage));
    }
}
