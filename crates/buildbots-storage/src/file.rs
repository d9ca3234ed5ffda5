//! Directory-backed and in-memory byte stores.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use buildbots_core::{ByteStore, StoreError};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "properties";

/// Record names are plain file stems: ASCII alphanumerics, `-`, `_`, `.`,
/// not starting with a dot.
fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_owned()))
    }
}

fn io_error(name: &str, source: io::Error) -> StoreError {
    StoreError::Io {
        name: name.to_owned(),
        source,
    }
}

/// One `<name>.properties` file per record inside a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the store directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| io_error(&root.display().to_string(), err))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the named record lives at.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(format!("{name}.{RECORD_EXTENSION}")))
    }
}

impl ByteStore for FileStore {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(name, err)),
        }
    }

    /// Write into a temporary file beside the target, fsync, then rename over
    /// it. When the rename is refused the record is overwritten in place.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(|err| io_error(name, err))?;
        tmp.write_all(bytes).map_err(|err| io_error(name, err))?;
        tmp.as_file().sync_all().map_err(|err| io_error(name, err))?;
        match tmp.persist(&path) {
            Ok(_) => {
                debug!(path = %path.display(), bytes = bytes.len(), "record replaced");
                Ok(())
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err.error, "atomic rename failed; overwriting in place");
                fs::write(&path, bytes).map_err(|err| io_error(name, err))
            }
        }
    }
}

/// Records held in process memory; for tests and embedding hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every stored record, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = records.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ByteStore for MemoryStore {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_name(name)?;
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(name).cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), bytes.to_vec());
        Ok(())
    }
}
