//! Tunables for creating and attaching to a store.
//!
//! `dir_size`, `bucket_capacity`, `max_depth` and `hash_kind` are recorded in
//! the header when a file is created; opening an existing file uses the
//! recorded values and ignores those fields. The rest apply per handle.
//!
//! Environment overrides (`DbmConfig::from_env`):
//! - SHMDBM_INITIAL_SIZE      initial file size in bytes
//! - SHMDBM_DIR_SIZE          initial directory capacity (power of two)
//! - SHMDBM_BUCKET_CAPACITY   records per bucket
//! - SHMDBM_MAX_DEPTH         split/doubling depth limit
//! - SHMDBM_MAX_SIZE          largest file size this handle grows to
//! - SHMDBM_HASH              xx64 | fnv1a64
//! - SHMDBM_BLOCK_SIGNALS     0|1|true|false
//! - SHMDBM_FILE_MODE         octal permission bits for new files

use crate::error::{Error, Result};
use crate::hash::HashKind;
use crate::shm::layout::{BUCKET_HEADER_SIZE, MAX_ALLOC, SLOT_SIZE};

/// Deepest directory the allocator can hold: 2^27 offsets of 8 bytes is 1 GiB.
pub const DEPTH_CEILING: u32 = 27;

#[derive(Clone, Debug)]
pub struct DbmConfig {
    /// Size the file is truncated to on creation. Grows on demand afterwards.
    pub initial_size: u64,

    /// Initial directory capacity. Must be a power of two.
    pub dir_size: u32,

    /// Records per bucket segment.
    pub bucket_capacity: u32,

    /// Maximum global/local depth before an overflowing bucket is reported as
    /// a hash collision.
    pub max_depth: u32,

    /// Growth past this many bytes fails with `OutOfSpace`. `None` leaves
    /// only the allocation ceiling and the disk.
    pub max_size: Option<u64>,

    pub hash_kind: HashKind,

    /// Block asynchronous signals while the store lock is held.
    pub block_signals: bool,

    /// Permission bits for newly created files (unix only).
    pub file_mode: u32,
}

impl Default for DbmConfig {
    fn default() -> Self {
        Self {
            initial_size: 1 << 20,
            dir_size: 32,
            bucket_capacity: 32,
            max_depth: DEPTH_CEILING,
            max_size: None,
            hash_kind: HashKind::default(),
            block_signals: true,
            file_mode: 0o644,
        }
    }
}

impl DbmConfig {
    /// Defaults overridden by `SHMDBM_*` environment variables. Unparseable
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<u64>("SHMDBM_INITIAL_SIZE") {
            cfg.initial_size = n;
        }
        if let Some(n) = env_parse::<u32>("SHMDBM_DIR_SIZE") {
            cfg.dir_size = n;
        }
        if let Some(n) = env_parse::<u32>("SHMDBM_BUCKET_CAPACITY") {
            cfg.bucket_capacity = n;
        }
        if let Some(n) = env_parse::<u32>("SHMDBM_MAX_DEPTH") {
            cfg.max_depth = n;
        }
        if let Some(n) = env_parse::<u64>("SHMDBM_MAX_SIZE") {
            cfg.max_size = Some(n);
        }
        if let Ok(v) = std::env::var("SHMDBM_HASH") {
            if let Some(kind) = HashKind::from_name(&v) {
                cfg.hash_kind = kind;
            }
        }
        if let Ok(v) = std::env::var("SHMDBM_BLOCK_SIGNALS") {
            if let Some(b) = parse_bool(&v) {
                cfg.block_signals = b;
            }
        }
        if let Ok(v) = std::env::var("SHMDBM_FILE_MODE") {
            if let Ok(mode) = u32::from_str_radix(v.trim().trim_start_matches("0o"), 8) {
                cfg.file_mode = mode;
            }
        }

        cfg
    }

    pub fn with_initial_size(mut self, bytes: u64) -> Self {
        self.initial_size = bytes;
        self
    }

    pub fn with_dir_size(mut self, slots: u32) -> Self {
        self.dir_size = slots;
        self
    }

    pub fn with_bucket_capacity(mut self, records: u32) -> Self {
        self.bucket_capacity = records;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn with_hash_kind(mut self, kind: HashKind) -> Self {
        self.hash_kind = kind;
        self
    }

    pub fn with_block_signals(mut self, on: bool) -> Self {
        self.block_signals = on;
        self
    }

    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Check the values that shape a new file.
    pub fn validate(&self) -> Result<()> {
        if self.dir_size == 0 || !self.dir_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "dir_size must be a non-zero power of two, got {}",
                self.dir_size
            )));
        }
        if self.dir_size.trailing_zeros() > self.max_depth {
            return Err(Error::Config(format!(
                "dir_size {} exceeds max_depth {}",
                self.dir_size, self.max_depth
            )));
        }
        if self.bucket_capacity == 0 {
            return Err(Error::Config("bucket_capacity must be at least 1".into()));
        }
        let bucket_bytes =
            BUCKET_HEADER_SIZE as u64 + self.bucket_capacity as u64 * SLOT_SIZE as u64;
        if bucket_bytes > MAX_ALLOC || self.bucket_capacity > i32::MAX as u32 {
            return Err(Error::Config(format!(
                "bucket_capacity {} is too large",
                self.bucket_capacity
            )));
        }
        if self.max_depth > DEPTH_CEILING {
            return Err(Error::Config(format!(
                "max_depth {} exceeds the ceiling of {}",
                self.max_depth, DEPTH_CEILING
            )));
        }
        if let Some(max) = self.max_size {
            if max < self.initial_size {
                return Err(Error::Config(format!(
                    "max_size {max} is below initial_size {}",
                    self.initial_size
                )));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
