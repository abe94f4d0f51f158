/// Memory-mapped dbm engine.
///
/// Provides `Dbm`, an extendible-hash key-value store living in a single
/// memory-mapped file: header, directory, buckets and record payloads are all
/// carved out of the mapping by the size-classed allocator. Several processes
/// (and threads, through separate handles) may open the same file; the seqlock
/// in the header serializes them.
///
/// Read-write handles take the header lock for every operation. Read-only
/// handles cannot store to the lock word and read optimistically instead,
/// retrying whenever a writer ran concurrently.
pub mod alloc;
pub mod bucket;
pub mod directory;
pub mod iter;
pub mod layout;
pub mod lock;
pub mod region;

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use crate::config::DbmConfig;
use crate::error::{Error, Result};
use crate::hash::{hash64, HashKind};
use crate::signals::SignalBlock;
pub use bucket::StoreMode;
use bucket::InsertOutcome;
pub use iter::Iter;
use lock::CriticalSection;
use region::ShmRegion;

/// How `Dbm::open` treats the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read-only.
    Read,
    /// Existing file, read-write.
    Write,
    /// Read-write, initializing the file if it is missing or empty.
    Create,
    /// Read-write, always truncating and initializing.
    New,
}

impl OpenMode {
    /// Parse a classic dbm flag: `r`, `w`, `c` or `n`.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "r" => Some(OpenMode::Read),
            "w" => Some(OpenMode::Write),
            "c" => Some(OpenMode::Create),
            "n" => Some(OpenMode::New),
            _ => None,
        }
    }
}

/// Result of a successful store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Replaced,
    /// `StoreMode::Insert` found the key already present; nothing changed.
    Exists,
}

/// Point-in-time counters from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbmStats {
    pub records: u64,
    pub dir_size: u64,
    pub global_depth: u32,
    /// Directory slots pointing at a bucket.
    pub dir_num: u64,
    pub bucket_capacity: u32,
    /// Live buckets.
    pub seg_num: u64,
    pub free_offset: u64,
    pub map_size: u64,
    pub rest_bytes: u64,
    /// Blocks sitting on the allocator's free lists.
    pub free_blocks: u64,
}

/// A handle on one store file.
pub struct Dbm {
    region: ShmRegion,
    config: DbmConfig,
    hash_kind: HashKind,
}

impl Dbm {
    /// Open `path` with `DbmConfig::from_env()`.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with(path, mode, DbmConfig::from_env())
    }

    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, config: DbmConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut region = match mode {
            OpenMode::Read => ShmRegion::open(path, false)?,
            OpenMode::Write => ShmRegion::open(path, true)?,
            OpenMode::Create => {
                let populated = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
                if populated {
                    ShmRegion::open(path, true)?
                } else {
                    ShmRegion::create(path, &config)?
                }
            }
            OpenMode::New => ShmRegion::create(path, &config)?,
        };
        region.set_size_limit(config.max_size);

        let h = region.header();
        let hash_kind = HashKind::from_u32(h.hash_kind as u32)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown hash kind {}", h.hash_kind)))?;
        if h.replaced != 0 {
            warn!("{} is marked replaced; writes will fail", path.display());
        }
        info!(
            "opened {} ({:?}, {} records, depth {})",
            path.display(),
            mode,
            h.bucket_num,
            h.global_depth()
        );

        Ok(Dbm {
            region,
            config,
            hash_kind,
        })
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn is_writable(&self) -> bool {
        self.region.is_writable()
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    fn hash(&self, key: &[u8]) -> u64 {
        hash64(self.hash_kind, key)
    }

    /// Run `op` holding the header lock, with signals blocked.
    fn locked<T>(&mut self, op: impl FnOnce(&mut ShmRegion) -> Result<T>) -> Result<T> {
        let _signals = SignalBlock::new(self.config.block_signals);
        self.region.lock().acquire();
        let result = self.region.refresh().and_then(|()| op(&mut self.region));
        if let Err(e) = &result {
            if e.is_corruption() {
                mark_corrupt(&mut self.region, e);
            }
        }
        // The mapping may have moved; release through a fresh view.
        self.region.lock().release();
        result
    }

    /// Run a mutation. Fails on read-only handles and replaced stores.
    fn write<T>(&mut self, op: impl FnOnce(&mut ShmRegion) -> Result<T>) -> Result<T> {
        if !self.region.is_writable() {
            return Err(Error::ReadOnly);
        }
        self.locked(|region| {
            if region.header().replaced != 0 {
                return Err(Error::Replaced);
            }
            op(region)
        })
    }

    /// Run a read. `op` may be repeated, so it must not have side effects.
    pub(crate) fn read<T>(&mut self, op: impl Fn(&ShmRegion) -> Result<T>) -> Result<T> {
        if self.region.is_writable() {
            return self.locked(|region| op(region));
        }
        loop {
            let lock = self.region.lock();
            let seq = lock.read_begin();
            let result = self.region.refresh().and_then(|()| op(&self.region));
            // A refresh drops the old mapping; validate through the new one.
            if self.region.lock().read_validate(seq) {
                return result;
            }
            std::hint::spin_loop();
        }
    }

    /// Fetch the value stored under `key`.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = self.hash(key);
        self.read(|region| match directory::locate(region, hash)? {
            Some((_, b)) => bucket::find(region, b, hash, key),
            None => Ok(None),
        })
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        let hash = self.hash(key);
        self.read(|region| match directory::locate(region, hash)? {
            Some((_, b)) => Ok(bucket::position(region, b, hash, key)?.is_some()),
            None => Ok(false),
        })
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn store(&mut self, key: &[u8], value: &[u8]) -> Result<StoreOutcome> {
        self.store_with(key, value, StoreMode::Replace)
    }

    pub fn store_with(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<StoreOutcome> {
        let hash = self.hash(key);
        self.write(|region| insert_record(region, hash, key, value, mode))
    }

    /// Remove `key`. Returns false when it was not present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let hash = self.hash(key);
        self.write(|region| {
            let Some((_, b)) = directory::locate(region, hash)? else {
                return Ok(false);
            };
            let removed = bucket::remove(region, b, hash, key)?;
            if removed {
                region.header_mut()?.bucket_num -= 1;
            }
            Ok(removed)
        })
    }

    /// Lazily walk every record. Each step takes the lock once.
    pub fn iter(&mut self) -> Iter<'_> {
        Iter::new(self)
    }

    /// All keys, in iteration order.
    pub fn keys(&mut self) -> Result<Vec<Vec<u8>>> {
        self.iter().map(|r| r.map(|(k, _)| k)).collect()
    }

    pub fn len(&mut self) -> Result<u64> {
        self.read(|region| Ok(region.header().bucket_num.max(0) as u64))
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&mut self) -> Result<DbmStats> {
        self.read(|region| {
            let h = region.header();
            let (small, big) = alloc::free_counts(region)?;
            Ok(DbmStats {
                records: h.bucket_num.max(0) as u64,
                dir_size: h.dir_size as u64,
                global_depth: h.global_depth(),
                dir_num: h.dir_num.max(0) as u64,
                bucket_capacity: h.seg_size as u32,
                seg_num: h.seg_num.max(0) as u64,
                free_offset: h.free_offset as u64,
                map_size: h.map_size as u64,
                rest_bytes: rest(region),
                free_blocks: small.iter().chain(big.iter()).sum(),
            })
        })
    }

    /// Creation time recorded in the header.
    pub fn created_at(&self) -> SystemTime {
        let secs = Duration::from_secs(self.region.header().ctime.max(0) as u64);
        UNIX_EPOCH.checked_add(secs).unwrap_or(UNIX_EPOCH)
    }

    /// Whether the store has been superseded or found corrupt.
    pub fn is_replaced(&mut self) -> Result<bool> {
        self.read(|region| Ok(region.header().replaced != 0))
    }

    /// Flag the store as superseded. Every attached handle then refuses writes.
    pub fn mark_replaced(&mut self) -> Result<()> {
        if !self.region.is_writable() {
            return Err(Error::ReadOnly);
        }
        self.locked(|region| {
            region.header_mut()?.replaced = 1;
            Ok(())
        })?;
        warn!("{} marked replaced", self.path().display());
        Ok(())
    }

    /// Bytes left before the watermark forces the file to grow.
    pub fn rest_bytes(&mut self) -> Result<u64> {
        self.read(|region| Ok(rest(region)))
    }

    /// Write dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Flush and unmap. Dropping a handle unmaps without the final flush.
    pub fn close(self) -> Result<()> {
        self.region.close()
    }
}

fn rest(region: &ShmRegion) -> u64 {
    let h = region.header();
    (h.map_size - h.free_offset).max(0) as u64
}

fn mark_corrupt(region: &mut ShmRegion, e: &Error) {
    error!("{}: {e}; marking store replaced", region.path().display());
    if let Ok(h) = region.header_mut() {
        h.replaced = 1;
    }
}

/// Insert under the lock, splitting the target bucket until the record fits.
///
/// Every split raises the local depth of the bucket the hash maps to, so the
/// loop ends by the recorded depth limit at the latest. A bucket still full
/// there is a hash collision, reported as corruption.
fn insert_record(
    region: &mut ShmRegion,
    hash: u64,
    key: &[u8],
    value: &[u8],
    mode: StoreMode,
) -> Result<StoreOutcome> {
    let max_depth = region.header().max_depth.max(0) as u32;
    loop {
        let (index, b) = directory::ensure_bucket(region, hash)?;
        match bucket::insert(region, b, hash, key, value, mode)? {
            InsertOutcome::Inserted => {
                region.header_mut()?.bucket_num += 1;
                return Ok(StoreOutcome::Inserted);
            }
            InsertOutcome::Replaced => return Ok(StoreOutcome::Replaced),
            InsertOutcome::Exists => return Ok(StoreOutcome::Exists),
            InsertOutcome::Overflow => {
                if !directory::split(region, index, b, max_depth)? {
                    let depth = bucket::local_depth(region, b)?;
                    warn!(
                        "{}: bucket for hash {hash:#x} is full at depth {depth}",
                        region.path().display()
                    );
                    return Err(Error::corruption(format!(
                        "hash collision: bucket full at maximum depth {depth}"
                    )));
                }
            }
        }
    }
}
