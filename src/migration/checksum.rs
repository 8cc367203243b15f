//! Checksums of migration script content

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of a script's text
///
/// Stored in the ledger when a migration is recorded, so later runs can tell
/// whether an applied script was edited afterwards.
///
/// Returns the lowercase hexadecimal digest (64 characters).
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// What `migrate` does when an applied script no longer matches its stored checksum
///
/// Applied scripts are never re-executed under any policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Do not compare
    Ignore,
    /// Log a warning per drifted script and continue
    #[default]
    Warn,
    /// Refuse to apply anything while any applied script has drifted
    Verify,
}

impl std::str::FromStr for ChecksumPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(ChecksumPolicy::Ignore),
            "warn" => Ok(ChecksumPolicy::Warn),
            "verify" => Ok(ChecksumPolicy::Verify),
            other => Err(format!("unknown checksum policy '{other}' (expected ignore, warn or verify)")),
        }
    }
}
