//! Migration script naming and identity

use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;

/// `V<version>__<label>.sql` or `U<version>__<label>.sql`; the version must start with a digit.
static SCRIPT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([VU])(\d.*?)__(.+)\.sql$").unwrap_or_else(|e| panic!("invalid script name pattern: {e}"))
});

const FORWARD_MARKER: char = 'V';
const UNDO_MARKER: char = 'U';

/// Direction of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Applies a schema change (`V` prefix)
    Forward,
    /// Reverses the forward script of the same version (`U` prefix)
    Undo,
}

/// A parsed script file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    pub kind: ScriptKind,
    pub version: u64,
    pub label: String,
    pub file_name: String,
}

impl ScriptName {
    /// Parse a script file name
    ///
    /// - `V3__add_isbn_index.sql` → forward, version 3, label `add_isbn_index`
    /// - `U3__add_isbn_index.sql` → undo, version 3
    /// - `README.md`, `Views__x.sql` → `Ok(None)`: not a migration script
    /// - `V1a__x.sql`, `V99999999999999999999__x.sql` → `InvalidVersion`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidVersion` when the name has the shape of a
    /// script but its version segment is not a non-negative integer.
    pub fn parse(file_name: &str) -> Result<Option<Self>, MigrationError> {
        let Some(caps) = SCRIPT_NAME.captures(file_name) else {
            return Ok(None);
        };

        let kind = if &caps[1] == "V" {
            ScriptKind::Forward
        } else {
            ScriptKind::Undo
        };
        let version = parse_version(&caps[2]).ok_or_else(|| MigrationError::InvalidVersion {
            name: file_name.to_string(),
        })?;

        Ok(Some(Self {
            kind,
            version,
            label: caps[3].to_string(),
            file_name: file_name.to_string(),
        }))
    }

    /// Whether this is a forward (`V`) script
    pub fn is_forward(&self) -> bool {
        self.kind == ScriptKind::Forward
    }
}

fn parse_version(segment: &str) -> Option<u64> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Name of the undo script paired with forward script `forward_name`
///
/// The leading `V` becomes `U`; version and label are kept byte for byte.
/// Returns `None` for names that are not forward scripts.
pub fn undo_name_for(forward_name: &str) -> Option<String> {
    forward_name
        .strip_prefix(FORWARD_MARKER)
        .map(|rest| format!("{UNDO_MARKER}{rest}"))
}

/// A discovered forward migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Numeric version; scripts apply in ascending order of it
    pub version: u64,

    /// Free-text label from the file name
    pub label: String,

    /// File name, also the ledger identifier
    pub name: String,

    /// File name of the paired undo script
    pub undo_name: String,

    /// Whether the undo script was present at discovery
    pub has_undo: bool,
}

impl MigrationScript {
    /// Build from a parsed forward name
    pub fn new(name: &ScriptName, has_undo: bool) -> Self {
        Self {
            version: name.version,
            label: name.label.clone(),
            name: name.file_name.clone(),
            undo_name: undo_name_for(&name.file_name).unwrap_or_default(),
            has_undo,
        }
    }

    /// Human readable description derived from the label
    pub fn description(&self) -> String {
        self.label.replace('_', " ")
    }
}
