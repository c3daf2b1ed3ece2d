//! Persistent key-value storage.
//!
//! Used to remember the visitor id issued for each website so a returning
//! visitor keeps their conversations. Two backends:
//! - [`MemoryStorage`]: process-local, for tests and ephemeral sessions.
//! - [`FileStorage`]: one JSON file per key in the platform config directory:
//!   - Linux: `~/.config/supportkit/`
//!   - macOS: `~/Library/Application Support/supportkit/`
//!   - Windows: `%APPDATA%\supportkit\`

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no config directory available")]
    NoConfigDir,
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid stored value: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Raw string storage. Values are JSON documents; see [`save`] and [`load`].
pub trait KeyValueStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Save a value to storage as JSON.
pub fn save<T: Serialize>(
    storage: &dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(value)?;
    storage.set_item(key, &json)
}

/// Load a value from storage.
///
/// Returns `Ok(None)` if the key doesn't exist.
pub fn load<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get_item(key)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn visitor_key(website_id: &str) -> String {
    format!("supportkit_visitor_{website_id}")
}

/// The cached visitor id for `website_id`. A corrupt entry reads as absent.
pub fn load_visitor_id(storage: &dyn KeyValueStorage, website_id: &str) -> Option<String> {
    match load::<String>(storage, &visitor_key(website_id)) {
        Ok(id) => id.filter(|id| !id.trim().is_empty()),
        Err(err) => {
            crate::log_warn!("Ignoring cached visitor id for {}: {}", website_id, err);
            None
        }
    }
}

pub fn store_visitor_id(
    storage: &dyn KeyValueStorage,
    website_id: &str,
    visitor_id: &str,
) -> Result<(), StorageError> {
    save(storage, &visitor_key(website_id), &visitor_id)
}

pub fn clear_visitor_id(storage: &dyn KeyValueStorage, website_id: &str) -> Result<(), StorageError> {
    storage.remove_item(&visitor_key(website_id))
}

// =========================================
// In-memory implementation
// =========================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RefCell<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.borrow().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.borrow_mut().remove(key);
        Ok(())
    }
}

// =========================================
// File implementation
// =========================================

#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store files under `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store files in the platform config directory.
    pub fn in_config_dir() -> Result<Self, StorageError> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(Self::new(config_dir.join("supportkit")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{safe_key}.json"))
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.file_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
        }
        std::fs::write(self.file_path(key), value)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.file_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
