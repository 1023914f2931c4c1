//! The durable metadata store.
//!
//! A small typed key/value file holding the replica's hard state. Writes
//! rewrite the whole file atomically (temp file + rename) and are durable
//! before `store` returns.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

/// Key of the replica's current term.
pub const KEY_CURRENT_TERM: &str = "currentTerm";
/// Key of the candidate voted for in the current term.
pub const KEY_VOTED_FOR: &str = "votedFor";
/// Key of the highest entry known to be committed.
pub const KEY_COMMIT_INDEX: &str = "commitIndex";

/// Typed key/value persistence for replica metadata.
pub struct MetaStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl MetaStore {
    /// Open the store at `path`, creating an empty one if the file is
    /// absent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let values = if path.exists() {
            let buf = fs::read(path)?;
            serde_json::from_slice(&buf).map_err(|err| {
                StoreError::Corrupted(format!("undecodable metadata in {}: {}", path.display(), err))
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    /// Load the value stored under `key`, if any.
    pub fn try_load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.lock();
        let raw = values.get(key)?.clone();
        match serde_json::from_value(raw) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::warn!(key, error=%err, "metadata value has unexpected type");
                None
            }
        }
    }

    /// Durably store `value` under `key`.
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut values = self.lock();
        values.insert(key.to_string(), serde_json::to_value(value)?);

        let buf = serde_json::to_vec(&*values)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.values.lock().expect("meta store mutex poisoned")
    }
}
