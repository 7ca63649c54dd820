use std::path::Path;

use crate::conf::Store;
use crate::Result;

use super::{KvStore, StorageError};

/// On-disk store backed by `sled`.
///
/// Writes are flushed before they return. `sled` compacts its segments on
/// its own; `gc` flushes and reports how much the on-disk size shrank.
#[derive(Clone)]
pub struct SledStore {
    db: ::sled::Db,
}

impl SledStore {
    pub fn open(cfg: &Store) -> Result<Self> {
        if cfg.dir.trim().is_empty() {
            return Err(anyhow::anyhow!("storage dir is empty"));
        }
        let sled_cfg = ::sled::Config::default()
            .path(cfg.dir.trim())
            .cache_capacity(cfg.cache_capacity.as_u64())
            .mode(::sled::Mode::HighThroughput);
        Self::with_config(sled_cfg)
    }

    /// A store in `dir` with default cache settings.
    pub fn open_path<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::with_config(::sled::Config::default().path(dir.as_ref()))
    }

    fn with_config(cfg: ::sled::Config) -> Result<Self> {
        let db = cfg.open().map_err(StorageError::from)?;
        log::info!("store opened, recovered: {}", db.was_recovered());
        Ok(Self { db })
    }

    #[inline]
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk().map_err(StorageError::from)?)
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key).map_err(StorageError::from)?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.db.insert(key, val).map_err(StorageError::from)?;
        self.db.flush().map_err(StorageError::from)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let removed = self.db.remove(key).map_err(StorageError::from)?.is_some();
        self.db.flush().map_err(StorageError::from)?;
        Ok(removed)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(StorageError::from)?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(StorageError::from)?;
        Ok(())
    }

    fn gc(&self, discard_ratio: f64) -> Result<usize> {
        let before = self.size_on_disk()?;
        self.db.flush().map_err(StorageError::from)?;
        let after = self.size_on_disk()?;
        let reclaimed = before.saturating_sub(after);
        if before > 0 && (reclaimed as f64 / before as f64) >= discard_ratio {
            log::info!("store gc reclaimed {} of {} bytes", reclaimed, before);
        }
        Ok(reclaimed as usize)
    }

    fn close(&self) -> Result<()> {
        self.db.flush().map_err(StorageError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tidemq-sled-{}-{}", name, uuid::Uuid::new_v4()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn survives_reopen() {
        let dir = tmp_dir("reopen");
        {
            let s = SledStore::open_path(&dir).unwrap();
            s.set(b"RET:a/b", b"21.5").unwrap();
            s.set(b"SES:c1", b"x").unwrap();
            assert!(s.delete(b"SES:c1").unwrap());
            s.close().unwrap();
        }
        let s = SledStore::open_path(&dir).unwrap();
        assert_eq!(s.get(b"RET:a/b").unwrap(), Some(b"21.5".to_vec()));
        assert!(s.scan_prefix(b"SES:").unwrap().is_empty());
        s.gc(0.5).unwrap();
        drop(s);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
