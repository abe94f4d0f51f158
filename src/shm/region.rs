/// The mapped store file, viewed as a bounds-checked byte arena.
///
/// This is the mapping collaborator: create/open map the file, `close`
/// unmaps it, and `extend_and_remap` grows it. Every in-mapping reference is
/// an offset checked against the current mapping length before use, so a
/// stale or corrupt offset surfaces as `Error::Corruption` instead of a fault.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::{debug, info};
use memmap2::{Mmap, MmapMut};

use super::layout::{
    self, Header, ABSENT, BIG_CLASSES, HEADER_SIZE, MAGIC, SMALL_CLASSES, VERSION,
};
use super::lock::ShmSeqLock;
use crate::config::{DbmConfig, DEPTH_CEILING};
use crate::error::{Error, Result};
use crate::hash::HashKind;

const PAGE: u64 = 4096;

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::ReadWrite(m) => &m[..],
            Mapping::ReadOnly(m) => &m[..],
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

pub struct ShmRegion {
    map: Mapping,
    file: File,
    path: PathBuf,
    /// Largest file this handle will grow to, page aligned.
    size_limit: Option<u64>,
}

impl ShmRegion {
    /// Create (or truncate) the file at `path` and initialize an empty store.
    pub fn create(path: &Path, config: &DbmConfig) -> Result<Self> {
        config.validate()?;

        let data_start = layout::initial_data_start(config.dir_size);
        let size = round_to_page(config.initial_size.max(data_start + PAGE));

        let file = open_options(true, config)
            .create(true)
            .truncate(true)
            .open(path)?;
        reserve(&file, size)?;

        // Safety: the file was just truncated; no peer has a valid view of it
        // until the magic is written.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut region = ShmRegion {
            map: Mapping::ReadWrite(mmap),
            file,
            path: path.to_path_buf(),
            size_limit: None,
        };
        region.initialize(config, size)?;

        info!(
            "created store {} ({} bytes, dir_size={}, bucket_capacity={}, hash={})",
            path.display(),
            size,
            config.dir_size,
            config.bucket_capacity,
            config.hash_kind
        );
        Ok(region)
    }

    fn initialize(&mut self, config: &DbmConfig, size: u64) -> Result<()> {
        let ctime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let dir_offset = HEADER_SIZE as i64;

        {
            let header = self.header_mut()?;
            header.version = VERSION;
            header.replaced = 0;
            header.ctime = ctime;
            header.hash_kind = config.hash_kind.to_u32() as i32;
            header.map_size = size as i64;
            header.free_offset = layout::initial_data_start(config.dir_size) as i64;
            header.dir_offset = dir_offset;
            header.dir_size = config.dir_size as i32;
            header.dir_num = 0;
            header.seg_size = config.bucket_capacity as i32;
            header.seg_num = 0;
            header.bucket_num = 0;
            header.max_depth = config.max_depth as i32;
            header.small_roots = [ABSENT; SMALL_CLASSES];
            header.big_roots = [ABSENT; BIG_CLASSES];
        }

        let dir = self.bytes_mut(dir_offset as u64, config.dir_size as u64 * 8)?;
        for entry in dir.chunks_exact_mut(8) {
            entry.copy_from_slice(&ABSENT.to_ne_bytes());
        }

        unsafe {
            let base = self.base_mut_ptr()?;
            ShmSeqLock::init(base.add(layout::lock_offset()));
        }

        // Magic last: a peer never sees a half-built header as valid.
        self.header_mut()?.magic = MAGIC;
        self.flush()
    }

    /// Open an existing store file and validate its header.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(Error::InvalidFormat(format!(
                "{}: file is {} bytes, shorter than the header",
                path.display(),
                len
            )));
        }

        let map = if writable {
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(&file)? })
        } else {
            Mapping::ReadOnly(unsafe { Mmap::map(&file)? })
        };
        let region = ShmRegion {
            map,
            file,
            path: path.to_path_buf(),
            size_limit: None,
        };
        region.validate()?;

        debug!(
            "opened store {} ({} bytes, {})",
            path.display(),
            len,
            if writable { "read-write" } else { "read-only" }
        );
        Ok(region)
    }

    fn validate(&self) -> Result<()> {
        let h = self.header();
        if h.magic != MAGIC {
            return Err(Error::InvalidFormat(format!(
                "{}: bad magic",
                self.path.display()
            )));
        }
        if h.version != VERSION {
            return Err(Error::InvalidFormat(format!(
                "{}: unsupported version {}",
                self.path.display(),
                h.version
            )));
        }
        if HashKind::from_u32(h.hash_kind as u32).is_none() {
            return Err(Error::InvalidFormat(format!(
                "{}: unknown hash kind {}",
                self.path.display(),
                h.hash_kind
            )));
        }
        if h.dir_size <= 0 || !(h.dir_size as u32).is_power_of_two() || h.seg_size <= 0 {
            return Err(Error::InvalidFormat(format!(
                "{}: bad directory geometry (dir_size={}, seg_size={})",
                self.path.display(),
                h.dir_size,
                h.seg_size
            )));
        }
        if h.max_depth < 0
            || h.max_depth as u32 > DEPTH_CEILING
            || h.global_depth() > h.max_depth as u32
        {
            return Err(Error::InvalidFormat(format!(
                "{}: depth limit {} does not cover directory of {} slots",
                self.path.display(),
                h.max_depth,
                h.dir_size
            )));
        }
        Ok(())
    }

    /// Flush dirty pages and drop the mapping and descriptor.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        debug!("closed store {}", self.path.display());
        Ok(())
    }

    /// Grow the file to `new_size` bytes and map the new length.
    ///
    /// Disk blocks are reserved up front so a full disk fails here with
    /// `OutOfSpace` rather than faulting on first touch. Callers hold the
    /// store lock and must re-derive any lock view afterwards.
    pub fn extend_and_remap(&mut self, new_size: u64) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::ReadOnly);
        }
        let new_size = round_to_page(new_size);
        if new_size <= self.len() {
            return Ok(());
        }
        if self.size_limit.is_some_and(|limit| new_size > limit) {
            debug!(
                "{}: growth to {} bytes exceeds the size limit",
                self.path.display(),
                new_size
            );
            return Err(Error::OutOfSpace {
                requested: new_size,
            });
        }
        reserve(&self.file, new_size)?;
        self.remap()?;
        debug!(
            "extended {} to {} bytes",
            self.path.display(),
            new_size
        );
        Ok(())
    }

    /// Cap how far this handle grows the file. Other handles keep their own.
    pub fn set_size_limit(&mut self, limit: Option<u64>) {
        self.size_limit = limit.map(|n| n / PAGE * PAGE);
    }

    pub fn size_limit(&self) -> Option<u64> {
        self.size_limit
    }

    fn remap(&mut self) -> Result<()> {
        self.map = match self.map {
            Mapping::ReadWrite(_) => Mapping::ReadWrite(unsafe { MmapMut::map_mut(&self.file)? }),
            Mapping::ReadOnly(_) => Mapping::ReadOnly(unsafe { Mmap::map(&self.file)? }),
        };
        Ok(())
    }

    /// True when a peer has grown the file past this handle's mapping.
    pub fn is_stale(&self) -> bool {
        self.header().map_size as u64 > self.len()
    }

    /// Remap if a peer has grown the file.
    pub fn refresh(&mut self) -> Result<()> {
        if self.is_stale() {
            let want = self.header().map_size;
            self.remap()?;
            if (self.len() as i64) < want {
                return Err(Error::corruption(format!(
                    "header map_size {} exceeds file length {}",
                    want,
                    self.len()
                )));
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        if let Mapping::ReadWrite(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Mapping::ReadWrite(_))
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn header(&self) -> &Header {
        // Mappings shorter than the header are rejected at open.
        unsafe { &*(self.map.as_slice().as_ptr() as *const Header) }
    }

    pub fn header_mut(&mut self) -> Result<&mut Header> {
        let base = self.base_mut_ptr()?;
        Ok(unsafe { &mut *(base as *mut Header) })
    }

    fn base_mut_ptr(&mut self) -> Result<*mut u8> {
        match &mut self.map {
            Mapping::ReadWrite(m) => Ok(m.as_mut_ptr()),
            Mapping::ReadOnly(_) => Err(Error::ReadOnly),
        }
    }

    /// A view of the header lock at the current base address.
    pub fn lock(&self) -> ShmSeqLock {
        unsafe { ShmSeqLock::from_existing(self.map.as_slice().as_ptr().add(layout::lock_offset())) }
    }

    pub fn bytes(&self, off: u64, len: u64) -> Result<&[u8]> {
        let range = self.checked_range(off, len)?;
        Ok(&self.map.as_slice()[range])
    }

    pub fn bytes_mut(&mut self, off: u64, len: u64) -> Result<&mut [u8]> {
        let range = self.checked_range(off, len)?;
        match &mut self.map {
            Mapping::ReadWrite(m) => Ok(&mut m[range]),
            Mapping::ReadOnly(_) => Err(Error::ReadOnly),
        }
    }

    fn checked_range(&self, off: u64, len: u64) -> Result<std::ops::Range<usize>> {
        match off.checked_add(len) {
            Some(end) if off >= HEADER_SIZE as u64 && end <= self.len() => {
                Ok(off as usize..end as usize)
            }
            _ => Err(Error::corruption(format!(
                "range {}+{} outside mapping of {} bytes",
                off,
                len,
                self.len()
            ))),
        }
    }

    pub fn read_i64(&self, off: u64) -> Result<i64> {
        let b = self.bytes(off, 8)?;
        Ok(i64::from_ne_bytes(array(b)))
    }

    pub fn write_i64(&mut self, off: u64, v: i64) -> Result<()> {
        self.bytes_mut(off, 8)?.copy_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    pub fn read_u32(&self, off: u64) -> Result<u32> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_ne_bytes(array(b)))
    }

    pub fn write_u32(&mut self, off: u64, v: u32) -> Result<()> {
        self.bytes_mut(off, 4)?.copy_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    pub fn read_u64(&self, off: u64) -> Result<u64> {
        let b = self.bytes(off, 8)?;
        Ok(u64::from_ne_bytes(array(b)))
    }
}

fn open_options(writable: bool, config: &DbmConfig) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true).write(writable);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(config.file_mode);
    }
    #[cfg(not(unix))]
    let _ = config;
    opts
}

fn array<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    out
}

/// Set the file length and reserve the backing blocks.
///
/// Filesystems without block reservation keep the sparse file.
fn reserve(file: &File, size: u64) -> Result<()> {
    file.set_len(size).map_err(|e| space_error(e, size))?;
    if let Err(e) = file.allocate(size) {
        if is_no_space(&e) {
            return Err(Error::OutOfSpace { requested: size });
        }
        debug!("block reservation unavailable: {e}");
    }
    Ok(())
}

fn space_error(e: io::Error, requested: u64) -> Error {
    if is_no_space(&e) {
        Error::OutOfSpace { requested }
    } else {
        Error::Io(e)
    }
}

#[cfg(unix)]
fn is_no_space(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOSPC) | Some(libc::EFBIG))
}

#[cfg(not(unix))]
fn is_no_space(_e: &io::Error) -> bool {
    false
}

fn round_to_page(size: u64) -> u64 {
    size.div_ceil(PAGE) * PAGE
}

/// Remove a store file. Missing files are not an error.
pub fn unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
