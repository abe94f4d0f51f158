/// `#[repr(C)]` header and fixed-size record layout of the mapped file.
///
/// All integers are host-endian. Everything past the header is addressed by
/// i64 offsets from the start of the mapping; `ABSENT` (-1) means "none".
///
/// ```text
/// 0            Header (HEADER_SIZE bytes)
/// HEADER_SIZE  initial directory: dir_size x i64
///              buckets, payload blocks, free blocks ... up to free_offset
/// ```

/// Magic bytes at the start of the header.
pub const MAGIC: [u8; 8] = *b"_ndbm_\0\0";

pub const VERSION: i32 = 1;

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 2048;

/// Bytes reserved inside the header for the process-shared lock.
pub const LOCK_SIZE: usize = 64;

/// Sentinel for unpopulated directory slots and empty free lists.
pub const ABSENT: i64 = -1;

/// Allocation granularity.
pub const ALIGN: u64 = 8;

/// Smallest block the allocator hands out; a free block stores next + size.
pub const MIN_BLOCK: u64 = 16;

/// Requests below this size use the small (exact-size) classes.
pub const SMALL_THRESHOLD: u64 = 1024;

/// One small class per `ALIGN` step below `SMALL_THRESHOLD`.
pub const SMALL_CLASSES: usize = (SMALL_THRESHOLD / ALIGN) as usize;

/// Big classes double in width: class k holds [1024 << k, 1024 << (k + 1)).
pub const BIG_CLASSES: usize = 20;

/// Hard ceiling for a single allocation.
pub const MAX_ALLOC: u64 = 1 << 30;

/// Header lives at offset 0 of the mapping.
///
/// i64 fields first, then i32 fields, so `#[repr(C)]` inserts no padding.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    pub magic: [u8; 8],                    // 0..8
    pub lock: [u8; LOCK_SIZE],             // 8..72
    pub free_offset: i64,                  // 72..80
    pub map_size: i64,                     // 80..88
    pub ctime: i64,                        // 88..96
    pub dir_offset: i64,                   // 96..104
    pub small_roots: [i64; SMALL_CLASSES], // 104..1128
    pub big_roots: [i64; BIG_CLASSES],     // 1128..1288

    pub version: i32,    // 1288..1292
    pub replaced: i32,   // 1292..1296
    pub hash_kind: i32,  // 1296..1300
    pub dir_size: i32,   // 1300..1304
    pub dir_num: i32,    // 1304..1308
    pub seg_size: i32,   // 1308..1312
    pub seg_num: i32,    // 1312..1316
    pub bucket_num: i32, // 1316..1320
    pub max_depth: i32,  // 1320..1324

    // Explicit padding to 2048 bytes: 2048 - 1324 = 724
    pub _pad: [u8; 724],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(Header, lock) % 8 == 0);

impl Header {
    /// log2(dir_size).
    pub fn global_depth(&self) -> u32 {
        (self.dir_size as u32).trailing_zeros()
    }
}

/// Offset of the lock words from the start of the mapping.
pub fn lock_offset() -> usize {
    std::mem::offset_of!(Header, lock)
}

/// Bucket prefix: `[local_depth u32][count u32]`.
pub const BUCKET_HEADER_SIZE: usize = 8;

/// One record slot inside a bucket.
///
/// ```text
/// 0..8    hash
/// 8..12   key_len
/// 12..16  value_len
/// 16..64  key || value inline, or an i64 payload offset at 16..24
/// ```
pub const SLOT_SIZE: usize = 64;

pub const SLOT_HASH: usize = 0;
pub const SLOT_KEY_LEN: usize = 8;
pub const SLOT_VALUE_LEN: usize = 12;
pub const SLOT_DATA: usize = 16;

/// Largest key + value stored inside the slot itself.
pub const INLINE_CAPACITY: usize = SLOT_SIZE - SLOT_DATA;

/// Bytes occupied by a bucket of `seg_size` slots.
pub fn bucket_size(seg_size: u32) -> u64 {
    BUCKET_HEADER_SIZE as u64 + seg_size as u64 * SLOT_SIZE as u64
}

/// Offset of slot `index` within the bucket at `bucket`.
pub fn slot_offset(bucket: u64, index: u32) -> u64 {
    bucket + BUCKET_HEADER_SIZE as u64 + index as u64 * SLOT_SIZE as u64
}

/// Round `size` up to the allocation granularity, never below `MIN_BLOCK`.
pub fn round_up(size: u64) -> u64 {
    size.max(MIN_BLOCK).div_ceil(ALIGN) * ALIGN
}

/// Watermark of a fresh file: the header plus the initial directory, sized
/// as an allocator block so the directory can be released when it grows.
pub fn initial_data_start(dir_size: u32) -> u64 {
    HEADER_SIZE as u64 + round_up(dir_size as u64 * 8)
}
