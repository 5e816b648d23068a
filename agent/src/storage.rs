//! Persistent key-value storage for the agent.
//!
//! Each key is stored as its own JSON document (`<key>.json`) under the data
//! directory. Keeping keys in separate files lets the CLI edit `settings`
//! while a running agent owns `event_queue` and `session`.
//!
//! Writes are atomic: the document is written to `<key>.json.tmp` and renamed
//! over the previous version.
//!
//! # Example
//!
//! ```no_run
//! use tabpulse_agent::storage::Storage;
//!
//! let storage = Storage::open("/tmp/tabpulse").unwrap();
//! storage.set("greeting", &"hello").unwrap();
//! let value: Option<String> = storage.get("greeting").unwrap();
//! assert_eq!(value.as_deref(), Some("hello"));
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

/// Key holding the user settings document.
pub const SETTINGS_KEY: &str = "settings";

/// Key holding the pending event queue.
pub const QUEUE_KEY: &str = "event_queue";

/// Key holding the authenticated session.
pub const SESSION_KEY: &str = "session";

/// Errors that can occur while reading or writing storage.
#[derive(Error, Debug)]
pub enum StorageError {
    /// File system operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stored document could not be parsed.
    #[error("corrupt document for key '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Keys are restricted to `[a-z0-9_]`.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// File-backed key-value store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Opens (and creates if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.clone(),
            source,
        })?;
        debug!(root = %root.display(), "Opened storage");
        Ok(Self { root })
    }

    /// Returns the directory backing this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file path used for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for keys outside `[a-z0-9_]`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    /// Reads and deserializes the document stored under `key`.
    ///
    /// Returns `Ok(None)` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupt`] if the document does not parse as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let path = self.path_for(key)?;
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    /// Serializes `value` and atomically replaces the document under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any file operation fails.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StorageError::Io { path, source }
        };

        let mut file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        file.write_all(&bytes).map_err(io_err(&tmp_path))?;
        file.sync_all().map_err(io_err(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(io_err(&path))?;

        trace!(key = %key, bytes = bytes.len(), "Stored document");
        Ok(())
    }

    /// Deletes the document under `key`. Returns `true` if something was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file exists but cannot be removed.
    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn open_temp() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("data")).unwrap();
        (dir, storage)
    }

    #[test]
    fn open_creates_directory() {
        let (dir, storage) = open_temp();
        assert!(dir.path().join("data").is_dir());
        assert_eq!(storage.root(), dir.path().join("data"));
    }

    #[test]
    fn get_missing_key_returns_none() {
        let (_dir, storage) = open_temp();
        let value: Option<Sample> = storage.get("missing").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn set_then_get_returns_value() {
        let (_dir, storage) = open_temp();
        let sample = Sample {
            name: "queue".to_string(),
            count: 3,
        };

        storage.set("sample", &sample).unwrap();
        let loaded: Option<Sample> = storage.get("sample").unwrap();

        assert_eq!(loaded, Some(sample));
    }

    #[test]
    fn set_overwrites_and_leaves_no_temp_file() {
        let (_dir, storage) = open_temp();
        storage.set("counter", &1u32).unwrap();
        storage.set("counter", &2u32).unwrap();

        let loaded: Option<u32> = storage.get("counter").unwrap();
        assert_eq!(loaded, Some(2));

        let tmp = storage.root().join("counter.json.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn corrupt_document_is_reported() {
        let (_dir, storage) = open_temp();
        fs::write(storage.path_for("broken").unwrap(), b"{ not json").unwrap();

        let result: Result<Option<Sample>, _> = storage.get("broken");

        assert!(matches!(result, Err(StorageError::Corrupt { ref key, .. }) if key == "broken"));
    }

    #[test]
    fn remove_reports_whether_key_existed() {
        let (_dir, storage) = open_temp();
        storage.set("session", &"token").unwrap();

        assert!(storage.remove("session").unwrap());
        assert!(!storage.remove("session").unwrap());
        let value: Option<String> = storage.get("session").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn rejects_keys_that_escape_the_directory() {
        let (_dir, storage) = open_temp();

        assert!(matches!(
            storage.set("../escape", &1u32),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            storage.path_for(""),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
