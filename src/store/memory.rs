use super::{KeyValue, KeyValueReader};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

fn count_prefix(map: &Map, prefix: &[u8]) -> usize {
    map.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .count()
}

/// Frozen copy of a [`MemoryKeyValue`]
struct MemorySnapshot {
    map: Map,
}

impl KeyValueReader for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn count(&self, prefix: &[u8]) -> Result<usize> {
        Ok(count_prefix(&self.map, prefix))
    }
}

/// In-memory ordered key-value map
///
/// Transaction writes are buffered and applied on commit; reads always see
/// the last committed state.
#[derive(Default)]
pub struct MemoryKeyValue {
    map: RwLock<Map>,
    /// Pending writes; `None` values are erasures
    pending: Mutex<Option<Vec<(Vec<u8>, Option<Vec<u8>>)>>>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) {
        let mut pending = self.pending.lock();
        if let Some(ops) = pending.as_mut() {
            ops.push((key.to_vec(), value.map(<[u8]>::to_vec)));
            return;
        }
        drop(pending);
        let mut map = self.map.write();
        match value {
            Some(value) => {
                map.insert(key.to_vec(), value.to_vec());
            }
            None => {
                map.remove(key);
            }
        }
    }
}

impl KeyValueReader for MemoryKeyValue {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn count(&self, prefix: &[u8]) -> Result<usize> {
        Ok(count_prefix(&self.map.read(), prefix))
    }
}

impl KeyValue for MemoryKeyValue {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, Some(value));
        Ok(())
    }

    fn erase(&self, key: &[u8]) -> Result<()> {
        self.write(key, None);
        Ok(())
    }

    fn snapshot(&self) -> Arc<dyn KeyValueReader> {
        Arc::new(MemorySnapshot {
            map: self.map.read().clone(),
        })
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(Error::Backend("transaction already started".into()));
        }
        *pending = Some(Vec::new());
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let ops = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Error::Backend("no transaction to commit".into()))?;
        let mut map = self.map.write();
        for (key, value) in ops {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn abort_transaction(&self) -> Result<()> {
        self.pending
            .lock()
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::Backend("no transaction to abort".into()))
    }
}
