//! Durable relay state.
//!
//! The processed-id set and the retry records survive restarts through an
//! append-only log. Each record is a little-endian `u32` length followed by
//! the `bcs` encoding of a [`StateEntry`]. Opening a log replays it and
//! rewrites it with only the live state.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{types::RetryRecord, Error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEntry {
    Processed(String),
    RetryUpserted(RetryRecord),
    RetryRemoved(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub processed: HashSet<String>,
    pub retries: HashMap<String, RetryRecord>,
}

impl PersistedState {
    pub fn apply(&mut self, entry: StateEntry) {
        match entry {
            StateEntry::Processed(id) => {
                self.retries.remove(&id);
                self.processed.insert(id);
            }
            StateEntry::RetryUpserted(record) => {
                self.retries.insert(record.message.id.clone(), record);
            }
            StateEntry::RetryRemoved(id) => {
                self.retries.remove(&id);
            }
        }
    }

    fn entries(&self) -> Vec<StateEntry> {
        let mut processed: Vec<_> = self.processed.iter().cloned().collect();
        processed.sort();
        let mut retries: Vec<_> = self.retries.values().cloned().collect();
        retries.sort_by(|a, b| a.message.id.cmp(&b.message.id));

        processed
            .into_iter()
            .map(StateEntry::Processed)
            .chain(retries.into_iter().map(StateEntry::RetryUpserted))
            .collect()
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, Error>;
    fn append(&self, entry: &StateEntry) -> Result<(), Error>;
}

/// Keeps nothing; state is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStateStore;

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedState, Error> {
        Ok(PersistedState::default())
    }

    fn append(&self, _entry: &StateEntry) -> Result<(), Error> {
        Ok(())
    }
}

pub struct FileStateStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(storage_err)?;
        }

        let state = read_log(&path)?;
        compact(&path, &state)?;
        info!(
            "Opened state log {:?}: {} processed, {} pending retries",
            path,
            state.processed.len(),
            state.retries.len()
        );

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(storage_err)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<PersistedState, Error> {
        read_log(&self.path)
    }

    fn append(&self, entry: &StateEntry) -> Result<(), Error> {
        let frame = encode_frame(entry)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Storage("state log lock poisoned".to_string()))?;
        file.write_all(&frame).map_err(storage_err)?;
        file.sync_data().map_err(storage_err)
    }
}

fn storage_err(e: std::io::Error) -> Error {
    Error::Storage(e.to_string())
}

fn encode_frame(entry: &StateEntry) -> Result<Vec<u8>, Error> {
    let body = bcs::to_bytes(entry).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn read_log(path: &Path) -> Result<PersistedState, Error> {
    let mut state = PersistedState::default();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(storage_err(e)),
    };

    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            warn!("Ignoring truncated length prefix at end of {:?}", path);
            break;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len) as usize;
        let start = offset + 4;
        if bytes.len() - start < len {
            warn!("Ignoring truncated record at end of {:?}", path);
            break;
        }
        let entry: StateEntry = bcs::from_bytes(&bytes[start..start + len]).map_err(|e| {
            Error::Storage(format!("corrupt record at offset {} in {:?}: {}", offset, path, e))
        })?;
        state.apply(entry);
        offset = start + len;
    }

    Ok(state)
}

fn compact(path: &Path, state: &PersistedState) -> Result<(), Error> {
    let tmp = path.with_extension("compact");
    {
        let mut file = File::create(&tmp).map_err(storage_err)?;
        for entry in state.entries() {
            file.write_all(&encode_frame(&entry)?).map_err(storage_err)?;
        }
        file.sync_all().map_err(storage_err)?;
    }
    fs::rename(&tmp, path).map_err(storage_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::message;

    fn temp_log(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bridge-core-store-{}-{}-{}",
            name,
            std::process::id(),
            crate::types::unix_now_millis()
        ));
        dir.join("state.log")
    }

    fn record(id_byte: char, attempts: u32) -> RetryRecord {
        RetryRecord {
            message: message(id_byte, 2_000_000_000),
            attempts,
            last_error: "timeout".to_string(),
            next_retry_at: 1_000 + attempts as u64,
        }
    }

    #[test]
    fn test_memory_store_keeps_nothing() {
        let store = MemoryStateStore;
        store.append(&StateEntry::Processed("0x01".into())).unwrap();
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = temp_log("reopen");
        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(&StateEntry::RetryUpserted(record('a', 0))).unwrap();
            store.append(&StateEntry::RetryUpserted(record('b', 0))).unwrap();
            store.append(&StateEntry::RetryUpserted(record('b', 1))).unwrap();
            store.append(&StateEntry::Processed(record('a', 0).message.id)).unwrap();
        }

        let store = FileStateStore::open(&path).unwrap();
        let state = store.load().unwrap();
        let a = record('a', 0).message.id;
        let b = record('b', 0).message.id;
        assert!(state.processed.contains(&a));
        assert!(!state.retries.contains_key(&a));
        assert_eq!(state.retries.get(&b).map(|r| r.attempts), Some(1));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let path = temp_log("truncated");
        {
            let store = FileStateStore::open(&path).unwrap();
            store.append(&StateEntry::Processed("0x01".into())).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let store = FileStateStore::open(&path).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.processed.len(), 1);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_compaction_drops_removed_retries() {
        let path = temp_log("compact");
        {
            let store = FileStateStore::open(&path).unwrap();
            for attempt in 0..5 {
                store.append(&StateEntry::RetryUpserted(record('c', attempt))).unwrap();
            }
            store
                .append(&StateEntry::RetryRemoved(record('c', 0).message.id))
                .unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        let store = FileStateStore::open(&path).unwrap();
        let after = fs::metadata(store.path()).unwrap().len();
        assert!(after < before);
        assert_eq!(store.load().unwrap(), PersistedState::default());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
