//! Persistent storage handed to content adapters between calls.
//!
//! Storage is an opaque string scoped by adapter unique name and anime id.
//! The adapter host only reads it before a request and writes it back when
//! the adapter returns a different value; it never interprets the contents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read storage file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write storage file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to serialize storage: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Read/write contract for per-(adapter, anime) storage.
///
/// `get` returns an empty string when nothing has been stored. Implementations
/// must be safe to call from any thread; no transactional guarantee is expected
/// across a `get` followed by a `set`.
pub trait PersistentStorage: Send + Sync {
    fn get(&self, unique_name: &str, anime_id: u32) -> StorageResult<String>;

    fn set(&self, unique_name: &str, anime_id: u32, value: &str) -> StorageResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageFile {
    #[serde(default)]
    adapters: BTreeMap<String, BTreeMap<u32, String>>,
}

/// JSON-file backed storage.
///
/// The whole file is kept in memory and rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    entries: Mutex<StorageFile>,
}

impl JsonFileStorage {
    /// Open (or lazily create) the storage file at `path`.
    ///
    /// A file that fails to parse is moved aside to `<path>.corrupt` and the
    /// store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let entries = Self::load(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> StorageResult<StorageFile> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StorageFile::default())
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        match serde_json::from_str(&contents) {
            Ok(file) => Ok(file),
            Err(err) => {
                let corrupt = corrupt_path(path);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "adapter storage is corrupt; starting empty"
                );
                if let Err(e) = fs::rename(path, &corrupt) {
                    tracing::warn!(error = %e, "failed to move corrupt storage aside");
                }
                Ok(StorageFile::default())
            }
        }
    }

    fn persist(&self, file: &StorageFile) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|source| StorageError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl PersistentStorage for JsonFileStorage {
    fn get(&self, unique_name: &str, anime_id: u32) -> StorageResult<String> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries
            .adapters
            .get(unique_name)
            .and_then(|by_anime| by_anime.get(&anime_id))
            .cloned()
            .unwrap_or_default())
    }

    fn set(&self, unique_name: &str, anime_id: u32, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        if value.is_empty() {
            if let Some(by_anime) = entries.adapters.get_mut(unique_name) {
                by_anime.remove(&anime_id);
                if by_anime.is_empty() {
                    entries.adapters.remove(unique_name);
                }
            }
        } else {
            entries
                .adapters
                .entry(unique_name.to_string())
                .or_default()
                .insert(anime_id, value.to_string());
        }
        self.persist(&entries)
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}
