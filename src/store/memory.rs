use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyValueStore, KvUpdate};
use crate::error::{Result, RunTrackError};

/// In-process key-value store. Not durable across restarts of the process,
/// but shared `Arc`s survive engine re-creation, which is what tests need.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Option<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Some(HashMap::new())),
        }
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> Result<R>) -> Result<R> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| RunTrackError::storage("memory store lock poisoned"))?;
        let entries = guard
            .as_mut()
            .ok_or_else(|| RunTrackError::storage("memory store is closed"))?;
        f(entries)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_entries(|entries| Ok(entries.get(key).cloned()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
            Ok(())
        })
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<KvUpdate>,
    ) -> Result<()> {
        self.with_entries(|entries| {
            match f(entries.get(key).map(Vec::as_slice))? {
                KvUpdate::Keep => {}
                KvUpdate::Set(value) => {
                    entries.insert(key.to_string(), value);
                }
                KvUpdate::Remove => {
                    entries.remove(key);
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| RunTrackError::storage("memory store lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}
