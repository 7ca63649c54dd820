use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{KvStore, StorageError};
use crate::Result;

/// In-memory ordered store. Nothing survives the process; used by tests and
/// embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    #[inline]
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed.into())
        } else {
            Ok(())
        }
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.check()?;
        self.map.write().insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check()?;
        Ok(self.map.write().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        Ok(self
            .map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        self.check()
    }

    fn gc(&self, _discard_ratio: f64) -> Result<usize> {
        self.check()?;
        Ok(0)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
