use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::specifier::RepositorySpecifier;

pub const STORE_FILE_NAME: &str = "checkouts-state.json";

const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode repository state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Status of a handle record.
///
/// Unknown status strings in the store file parse as `Error`, so a record
/// written by a newer version is re-fetched rather than trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum HandleStatus {
    /// The record exists but the fetch is not yet known successful.
    Pending,
    /// A working clone exists at the stored subpath and is usable.
    Available,
    /// The last fetch attempt failed; kept for diagnostics only.
    Error,
}

/// One persisted record: where under the root the mirror lives and whether it
/// can be trusted. Unknown fields from the store file are carried along and
/// written back untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRecord {
    pub subpath: PathBuf,
    pub status: HandleStatus,
    extra: BTreeMap<String, Value>,
}

impl HandleRecord {
    pub fn new(subpath: PathBuf, status: HandleStatus) -> HandleRecord {
        HandleRecord {
            subpath,
            status,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageFile {
    version: u32,
    object: StorageObject,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageObject {
    repositories: BTreeMap<String, StoredRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    subpath: String,
    status: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Persistent mapping from specifier to handle record.
///
/// All mutations go through one lock and are written with the
/// write-temp-then-rename discipline, so the store file on disk is always
/// either fully the prior version or fully the new one. A mutation that fails
/// to persist rolls the in-memory state back and surfaces the error.
pub struct HandleStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, HandleRecord>>,
}

impl HandleStore {
    /// Loads the store from `root`, or starts empty when no file exists yet.
    /// A corrupt file or an unknown schema version is reported through
    /// `warning_handler` and replaced by an empty store; it is never fatal.
    pub fn open(root: &Path, warning_handler: &dyn Fn(&str)) -> HandleStore {
        let path = root.join(STORE_FILE_NAME);
        let state = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<StorageFile>(&contents) {
                Ok(file) if file.version == SCHEMA_VERSION => file
                    .object
                    .repositories
                    .into_iter()
                    .map(|(location, record)| (location, record.into()))
                    .collect(),
                Ok(file) => {
                    warning_handler(&format!(
                        "unsupported schema version {} in {}, starting with an empty store",
                        file.version,
                        path.display()
                    ));
                    BTreeMap::new()
                }
                Err(error) => {
                    warning_handler(&format!(
                        "could not parse {}, starting with an empty store: {}",
                        path.display(),
                        error
                    ));
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        HandleStore {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn get(&self, specifier: &RepositorySpecifier) -> Option<HandleRecord> {
        let state = self.state.lock().unwrap();
        state.get(specifier.location()).cloned()
    }

    /// Upserts the record for `specifier`, persisting before returning.
    pub fn put(
        &self,
        specifier: &RepositorySpecifier,
        record: HandleRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let previous = state.insert(specifier.location().to_string(), record);
        if let Err(error) = self.persist(&state) {
            match previous {
                Some(previous) => state.insert(specifier.location().to_string(), previous),
                None => state.remove(specifier.location()),
            };
            return Err(error);
        }
        Ok(())
    }

    /// Erases the record for `specifier`. The caller is responsible for
    /// removing the on-disk directory beforehand.
    pub fn remove(&self, specifier: &RepositorySpecifier) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let previous = match state.remove(specifier.location()) {
            Some(previous) => previous,
            None => return Ok(()),
        };
        if let Err(error) = self.persist(&state) {
            state.insert(specifier.location().to_string(), previous);
            return Err(error);
        }
        Ok(())
    }

    /// Empties the mapping and persists.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let previous = std::mem::take(&mut *state);
        if let Err(error) = self.persist(&state) {
            *state = previous;
            return Err(error);
        }
        Ok(())
    }

    /// Demotes every `pending` record to `error` (a crash mid-fetch is not a
    /// success) and returns the affected subpaths so the caller can remove
    /// the directories.
    pub fn demote_pending(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<String> = state
            .iter()
            .filter(|(_, record)| record.status == HandleStatus::Pending)
            .map(|(location, _)| location.clone())
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let previous = state.clone();
        let mut subpaths = Vec::with_capacity(pending.len());
        for location in &pending {
            if let Some(record) = state.get_mut(location) {
                record.status = HandleStatus::Error;
                subpaths.push(record.subpath.clone());
            }
        }
        if let Err(error) = self.persist(&state) {
            *state = previous;
            return Err(error);
        }
        Ok(subpaths)
    }

    fn persist(&self, state: &BTreeMap<String, HandleRecord>) -> Result<(), StoreError> {
        let file = StorageFile {
            version: SCHEMA_VERSION,
            object: StorageObject {
                repositories: state
                    .iter()
                    .map(|(location, record)| (location.clone(), record.clone().into()))
                    .collect(),
            },
        };
        let rendered = serde_json::to_string_pretty(&file)?;
        let temporary = self.path.with_extension("tmp");
        fs::write(&temporary, rendered)?;
        fs::rename(&temporary, &self.path)?;
        Ok(())
    }
}

impl From<StoredRecord> for HandleRecord {
    fn from(record: StoredRecord) -> HandleRecord {
        HandleRecord {
            subpath: PathBuf::from(record.subpath),
            status: HandleStatus::from_str(&record.status).unwrap_or(HandleStatus::Error),
            extra: record.extra,
        }
    }
}

impl From<HandleRecord> for StoredRecord {
    fn from(record: HandleRecord) -> StoredRecord {
        StoredRecord {
            subpath: record.subpath.to_string_lossy().into_owned(),
            status: record.status.to_string(),
            extra: record.extra,
        }
    }
}
