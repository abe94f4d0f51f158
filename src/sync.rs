use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DbmConfig;
use crate::error::Result;
use crate::shm::{Dbm, DbmStats, OpenMode, StoreMode, StoreOutcome};

/// A `Dbm` handle shared between threads of one process.
///
/// Clones share the handle; the in-process mutex sits in front of the
/// cross-process header lock. Threads that want independent handles should
/// open the file once each instead.
#[derive(Clone)]
pub struct SharedDbm {
    inner: Arc<Mutex<Dbm>>,
}

impl SharedDbm {
    pub fn new(dbm: Dbm) -> Self {
        SharedDbm {
            inner: Arc::new(Mutex::new(dbm)),
        }
    }

    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Dbm::open(path, mode).map(Self::new)
    }

    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, config: DbmConfig) -> Result<Self> {
        Dbm::open_with(path, mode, config).map(Self::new)
    }

    /// Run `f` with exclusive access to the handle, e.g. to iterate.
    pub fn with<T>(&self, f: impl FnOnce(&mut Dbm) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.lock().lookup(key)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().contains(key)
    }

    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<StoreOutcome> {
        self.inner.lock().store(key, value)
    }

    pub fn store_with(&self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<StoreOutcome> {
        self.inner.lock().store_with(key, value, mode)
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().delete(key)
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.inner.lock().keys()
    }

    pub fn len(&self) -> Result<u64> {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> Result<DbmStats> {
        self.inner.lock().stats()
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::region::unlink;
    use crate::shm::test_support::temp_path;

    #[test]
    fn threads_share_one_handle() {
        let path = temp_path("shared");
        let cfg = DbmConfig::default()
            .with_dir_size(2)
            .with_bucket_capacity(4)
            .with_initial_size(64 << 10);
        let db = SharedDbm::open_with(&path, OpenMode::New, cfg).unwrap();

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let key = format!("{t}-{i}");
                        db.store(key.as_bytes(), &i.to_le_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(db.len().unwrap(), 400);
        assert_eq!(db.lookup(b"3-99").unwrap(), Some(99u32.to_le_bytes().to_vec()));
        let walked = db.with(|d| d.iter().count());
        assert_eq!(walked, 400);
        unlink(&path).unwrap();
    }
}
