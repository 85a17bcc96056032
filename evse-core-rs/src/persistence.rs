//! Key-value persistence capability
//!
//! The core stores small JSON documents (transaction slots, availability,
//! configuration) under stable keys. Backends never make a failure fatal:
//! callers go through [`load_json`] / [`save_json`], which log and fall back
//! to in-memory state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PersistenceError;

/// Storage backend keyed by stable identifiers
pub trait Persistence {
    /// Read the value stored under `key`, `None` if absent
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the value stored under `key`
    fn save(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError>;

    /// Delete `key`; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// One file per key inside a directory
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Open (and create if needed) the storage directory
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl Persistence for FilePersistence {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        // Write to temp file then rename (atomic)
        let path = self.path_for(key)?;
        let temp_path = self.dir.join(format!("{}.json.tmp", key));
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory storage for testing
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// Load and decode a JSON document, logging instead of failing
pub fn load_json<T: DeserializeOwned>(store: &dyn Persistence, key: &str) -> Option<T> {
    let data = match store.load(key) {
        Ok(Some(data)) => data,
        Ok(None) => return None,
        Err(e) => {
            warn!("Persistence: Failed to load {}: {}", key, e);
            return None;
        }
    };

    match serde_json::from_slice(&data) {
        Ok(value) => {
            debug!("Persistence: Loaded {}", key);
            Some(value)
        }
        Err(e) => {
            warn!("Persistence: Failed to parse {}: {}", key, e);
            None
        }
    }
}

/// Encode and store a JSON document; returns whether it reached the backend
pub fn save_json<T: Serialize>(store: &dyn Persistence, key: &str, value: &T) -> bool {
    let result = serde_json::to_vec(value)
        .map_err(PersistenceError::from)
        .and_then(|data| store.save(key, &data));

    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "Persistence: Failed to save {}: {} (continuing in memory)",
                key, e
            );
            false
        }
    }
}

/// Remove a key, logging on failure
pub fn remove_key(store: &dyn Persistence, key: &str) {
    if let Err(e) = store.remove(key) {
        warn!("Persistence: Failed to remove {}: {}", key, e);
    }
}
