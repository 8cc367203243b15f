//! Migration script discovery
//!
//! A [`ContentStore`] lists and reads named entries; [`MigrationSource`] turns
//! those entries into an ordered, validated set of forward migrations. Which
//! store backs a source depends on how the program ships its scripts: a
//! directory on disk ([`FsStore`]) or a bundle compiled into the binary
//! ([`EmbeddedStore`], see [`embedded_migrations!`](crate::embedded_migrations)).

use crate::migration::file::{MigrationScript, ScriptKind, ScriptName};
use crate::migration::MigrationError;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A flat namespace of named text entries
pub trait ContentStore {
    /// Where the entries come from, for messages
    fn location(&self) -> String;

    /// Names of all entries, in no particular order
    fn list_entries(&self) -> Result<Vec<String>, MigrationError>;

    /// Text of entry `name`
    ///
    /// # Errors
    ///
    /// `ScriptNotFound` if there is no such entry; other failures are `SourceUnavailable`.
    fn read_entry(&self, name: &str) -> Result<String, MigrationError>;
}

/// Entry names are single path components
fn is_plain_entry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Scripts stored as files directly inside one directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unavailable(&self, source: std::io::Error) -> MigrationError {
        MigrationError::SourceUnavailable {
            location: self.location(),
            source,
        }
    }
}

impl ContentStore for FsStore {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn list_entries(&self) -> Result<Vec<String>, MigrationError> {
        let entries = fs::read_dir(&self.root).map_err(|e| self.unavailable(e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.unavailable(e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => log::debug!("Skipping non UTF-8 file name {:?}", raw),
            }
        }

        Ok(names)
    }

    fn read_entry(&self, name: &str) -> Result<String, MigrationError> {
        if !is_plain_entry_name(name) {
            return Err(MigrationError::ScriptNotFound {
                name: name.to_string(),
            });
        }

        let path = self.root.join(name);
        if path.is_dir() {
            return Err(MigrationError::ScriptNotFound {
                name: name.to_string(),
            });
        }

        fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => MigrationError::ScriptNotFound {
                name: name.to_string(),
            },
            _ => self.unavailable(e),
        })
    }
}

/// Scripts compiled into the binary
#[derive(Debug, Clone, Default)]
pub struct EmbeddedStore {
    entries: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

impl EmbeddedStore {
    /// Bundle of `(file name, contents)` pairs, usually produced by `embedded_migrations!`
    pub fn new(entries: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(name, contents)| (Cow::Borrowed(*name), Cow::Borrowed(*contents)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for EmbeddedStore {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, contents)| (Cow::Owned(name), Cow::Owned(contents)))
                .collect(),
        }
    }
}

impl ContentStore for EmbeddedStore {
    fn location(&self) -> String {
        "<embedded>".to_string()
    }

    fn list_entries(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self.entries.iter().map(|(name, _)| name.to_string()).collect())
    }

    fn read_entry(&self, name: &str) -> Result<String, MigrationError> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, contents)| contents.to_string())
            .ok_or_else(|| MigrationError::ScriptNotFound {
                name: name.to_string(),
            })
    }
}

/// Embed migration scripts from a directory of the calling crate
///
/// Paths are relative to the calling crate's `CARGO_MANIFEST_DIR`.
///
/// ```ignore
/// let store = lockstep::embedded_migrations!("migrations" => [
///     "V1__create_authors.sql",
///     "U1__create_authors.sql",
/// ]);
/// ```
#[macro_export]
macro_rules! embedded_migrations {
    ($dir:literal => [$($name:literal),* $(,)?]) => {
        $crate::migration::EmbeddedStore::new(&[
            $((
                $name,
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/", $dir, "/", $name)),
            )),*
        ])
    };
}

/// Ordered view of the migration scripts in a content store
pub struct MigrationSource {
    store: Box<dyn ContentStore>,
}

impl MigrationSource {
    pub fn new(store: impl ContentStore + 'static) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    /// Source backed by a directory on disk
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(FsStore::new(dir))
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Discover all forward migrations, ascending by numeric version
    ///
    /// Entries that are not script names are ignored. The whole set is rejected
    /// if any script name has a malformed version or two forward scripts share a
    /// version, since no execution order could be trusted.
    ///
    /// # Errors
    ///
    /// `InvalidVersion`, `DuplicateVersion`, or `SourceUnavailable`.
    pub fn discover(&self) -> Result<Vec<MigrationScript>, MigrationError> {
        let mut forward: BTreeMap<u64, ScriptName> = BTreeMap::new();
        let mut undo: HashSet<String> = HashSet::new();

        let mut entries = self.store.list_entries()?;
        entries.sort();

        for entry in entries {
            let Some(name) = ScriptName::parse(&entry)? else {
                log::trace!("Ignoring non-migration entry {}", entry);
                continue;
            };

            match name.kind {
                ScriptKind::Undo => {
                    undo.insert(name.file_name);
                }
                ScriptKind::Forward => {
                    if let Some(existing) = forward.get(&name.version) {
                        return Err(MigrationError::DuplicateVersion {
                            version: name.version,
                            first: existing.file_name.clone(),
                            second: name.file_name,
                        });
                    }
                    forward.insert(name.version, name);
                }
            }
        }

        let scripts: Vec<MigrationScript> = forward
            .values()
            .map(|name| {
                let script = MigrationScript::new(name, false);
                let has_undo = undo.contains(&script.undo_name);
                MigrationScript { has_undo, ..script }
            })
            .collect();

        log::debug!("Found {} migration script(s) in {}", scripts.len(), self.location());
        Ok(scripts)
    }

    /// Text of script `name`
    pub fn read(&self, name: &str) -> Result<String, MigrationError> {
        self.store.read_entry(name)
    }

    /// Name and text of the undo script paired with forward script `forward_name`
    ///
    /// # Errors
    ///
    /// `MissingUndo` if the name has no undo counterpart or it is absent from the store.
    pub fn read_undo(&self, forward_name: &str) -> Result<(String, String), MigrationError> {
        let missing = |undo: String| MigrationError::MissingUndo {
            migration: forward_name.to_string(),
            undo,
        };

        let undo_name = crate::migration::file::undo_name_for(forward_name)
            .ok_or_else(|| missing(format!("U{forward_name}")))?;

        match self.store.read_entry(&undo_name) {
            Ok(sql) => Ok((undo_name, sql)),
            Err(MigrationError::ScriptNotFound { .. }) => Err(missing(undo_name)),
            Err(e) => Err(e),
        }
    }
}
