/// Fixed-capacity buckets of record slots.
///
/// A bucket is `[local_depth u32][count u32]` followed by `seg_size` slots.
/// Live slots are always `0..count`: removal shifts the tail down, so scans
/// stop at `count` and inserts append. Records whose key + value fit in the
/// slot are stored inline; larger ones live in an allocator block.
///
/// All functions require the caller to hold the store lock, except the
/// read-only ones used under an optimistic seqlock read.
use super::alloc;
use super::layout::{
    bucket_size, slot_offset, INLINE_CAPACITY, MAX_ALLOC, SLOT_DATA, SLOT_HASH, SLOT_KEY_LEN,
    SLOT_SIZE, SLOT_VALUE_LEN,
};
use super::region::ShmRegion;
use crate::error::{Error, Result};

/// How `store` treats a key that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Overwrite the existing value.
    #[default]
    Replace,
    /// Keep the existing value and report `Exists`.
    Insert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Replaced,
    Exists,
    /// No free slot; the bucket must split before the insert can succeed.
    Overflow,
}

/// One record copied out of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub hash: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

type Slot = [u8; SLOT_SIZE];

fn seg_size(region: &ShmRegion) -> u32 {
    region.header().seg_size as u32
}

/// Allocate an empty bucket with the given local depth.
pub fn create(region: &mut ShmRegion, local_depth: u32) -> Result<u64> {
    let size = bucket_size(seg_size(region));
    let off = alloc::allocate(region, size)?;
    let bytes = region.bytes_mut(off, size)?;
    bytes.fill(0);
    bytes[0..4].copy_from_slice(&local_depth.to_ne_bytes());
    Ok(off)
}

pub fn local_depth(region: &ShmRegion, bucket: u64) -> Result<u32> {
    region.read_u32(bucket)
}

pub fn set_local_depth(region: &mut ShmRegion, bucket: u64, depth: u32) -> Result<()> {
    region.write_u32(bucket, depth)
}

pub fn count(region: &ShmRegion, bucket: u64) -> Result<u32> {
    let n = region.read_u32(bucket + 4)?;
    if n > seg_size(region) {
        return Err(Error::corruption(format!(
            "bucket {bucket} holds {n} records, capacity {}",
            seg_size(region)
        )));
    }
    Ok(n)
}

fn set_count(region: &mut ShmRegion, bucket: u64, n: u32) -> Result<()> {
    region.write_u32(bucket + 4, n)
}

fn read_slot(region: &ShmRegion, bucket: u64, index: u32) -> Result<Slot> {
    let mut slot = [0u8; SLOT_SIZE];
    slot.copy_from_slice(region.bytes(slot_offset(bucket, index), SLOT_SIZE as u64)?);
    Ok(slot)
}

fn write_slot(region: &mut ShmRegion, bucket: u64, index: u32, slot: &Slot) -> Result<()> {
    region
        .bytes_mut(slot_offset(bucket, index), SLOT_SIZE as u64)?
        .copy_from_slice(slot);
    Ok(())
}

fn field_u32(slot: &Slot, at: usize) -> u32 {
    u32::from_ne_bytes([slot[at], slot[at + 1], slot[at + 2], slot[at + 3]])
}

fn field_u64(slot: &Slot, at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&slot[at..at + 8]);
    u64::from_ne_bytes(b)
}

fn slot_hash(slot: &Slot) -> u64 {
    field_u64(slot, SLOT_HASH)
}

fn slot_lens(slot: &Slot) -> (usize, usize) {
    (
        field_u32(slot, SLOT_KEY_LEN) as usize,
        field_u32(slot, SLOT_VALUE_LEN) as usize,
    )
}

fn is_inline(key_len: usize, value_len: usize) -> bool {
    key_len + value_len <= INLINE_CAPACITY
}

/// Out-of-line payload location of a slot, if it has one.
fn payload_block(slot: &Slot) -> Option<(u64, u64)> {
    let (k, v) = slot_lens(slot);
    if is_inline(k, v) {
        None
    } else {
        Some((field_u64(slot, SLOT_DATA), (k + v) as u64))
    }
}

/// `key || value` bytes of a slot, wherever they live.
fn payload<'a>(region: &'a ShmRegion, slot: &'a Slot) -> Result<&'a [u8]> {
    let (k, v) = slot_lens(slot);
    match payload_block(slot) {
        None => Ok(&slot[SLOT_DATA..SLOT_DATA + k + v]),
        Some((off, len)) => {
            if len > MAX_ALLOC {
                return Err(Error::corruption(format!("record length {len}")));
            }
            region.bytes(off, len)
        }
    }
}

/// Build a slot for a new record, allocating its payload block if needed.
fn encode(region: &mut ShmRegion, hash: u64, key: &[u8], value: &[u8]) -> Result<Slot> {
    let total = key.len() + value.len();
    if total as u64 > MAX_ALLOC {
        return Err(Error::OutOfSpace {
            requested: total as u64,
        });
    }

    let mut slot = [0u8; SLOT_SIZE];
    slot[SLOT_HASH..SLOT_HASH + 8].copy_from_slice(&hash.to_ne_bytes());
    slot[SLOT_KEY_LEN..SLOT_KEY_LEN + 4].copy_from_slice(&(key.len() as u32).to_ne_bytes());
    slot[SLOT_VALUE_LEN..SLOT_VALUE_LEN + 4].copy_from_slice(&(value.len() as u32).to_ne_bytes());

    if is_inline(key.len(), value.len()) {
        slot[SLOT_DATA..SLOT_DATA + key.len()].copy_from_slice(key);
        slot[SLOT_DATA + key.len()..SLOT_DATA + total].copy_from_slice(value);
    } else {
        let off = alloc::allocate(region, total as u64)?;
        let buf = region.bytes_mut(off, total as u64)?;
        buf[..key.len()].copy_from_slice(key);
        buf[key.len()..].copy_from_slice(value);
        slot[SLOT_DATA..SLOT_DATA + 8].copy_from_slice(&(off as i64).to_ne_bytes());
    }
    Ok(slot)
}

fn release_payload(region: &mut ShmRegion, slot: &Slot) -> Result<()> {
    match payload_block(slot) {
        Some((off, len)) => alloc::release(region, off, len),
        None => Ok(()),
    }
}

/// Index of the live slot holding `key`.
pub fn position(region: &ShmRegion, bucket: u64, hash: u64, key: &[u8]) -> Result<Option<u32>> {
    for i in 0..count(region, bucket)? {
        let slot = read_slot(region, bucket, i)?;
        if slot_hash(&slot) != hash || slot_lens(&slot).0 != key.len() {
            continue;
        }
        if &payload(region, &slot)?[..key.len()] == key {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

pub fn find(region: &ShmRegion, bucket: u64, hash: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match position(region, bucket, hash, key)? {
        Some(i) => {
            let slot = read_slot(region, bucket, i)?;
            Ok(Some(payload(region, &slot)?[key.len()..].to_vec()))
        }
        None => Ok(None),
    }
}

/// Insert or overwrite a record.
///
/// `Overflow` is decided before anything is allocated, so an overflowing
/// insert leaves the bucket and the allocator untouched.
pub fn insert(
    region: &mut ShmRegion,
    bucket: u64,
    hash: u64,
    key: &[u8],
    value: &[u8],
    mode: StoreMode,
) -> Result<InsertOutcome> {
    if let Some(i) = position(region, bucket, hash, key)? {
        if mode == StoreMode::Insert {
            return Ok(InsertOutcome::Exists);
        }
        let old = read_slot(region, bucket, i)?;
        let new = encode(region, hash, key, value)?;
        write_slot(region, bucket, i, &new)?;
        release_payload(region, &old)?;
        return Ok(InsertOutcome::Replaced);
    }

    let n = count(region, bucket)?;
    if n >= seg_size(region) {
        return Ok(InsertOutcome::Overflow);
    }
    let slot = encode(region, hash, key, value)?;
    write_slot(region, bucket, n, &slot)?;
    set_count(region, bucket, n + 1)?;
    Ok(InsertOutcome::Inserted)
}

/// Remove `key`, releasing its payload block and compacting the slots.
pub fn remove(region: &mut ShmRegion, bucket: u64, hash: u64, key: &[u8]) -> Result<bool> {
    let Some(i) = position(region, bucket, hash, key)? else {
        return Ok(false);
    };
    let n = count(region, bucket)?;
    let old = read_slot(region, bucket, i)?;
    release_payload(region, &old)?;

    let tail = region.bytes_mut(slot_offset(bucket, i), (n - i) as u64 * SLOT_SIZE as u64)?;
    tail.copy_within(SLOT_SIZE.., 0);
    let last = tail.len() - SLOT_SIZE;
    tail[last..].fill(0);
    set_count(region, bucket, n - 1)?;
    Ok(true)
}

/// Move every record whose hash has `bit` set from `old` into the empty
/// bucket `new`, keeping storage order in both.
pub fn split_into(region: &mut ShmRegion, old: u64, new: u64, bit: u64) -> Result<()> {
    if count(region, new)? != 0 {
        return Err(Error::corruption(format!("split target {new} is not empty")));
    }
    let n = count(region, old)?;
    let slots = (0..n)
        .map(|i| read_slot(region, old, i))
        .collect::<Result<Vec<_>>>()?;
    let (moved, kept): (Vec<Slot>, Vec<Slot>) =
        slots.into_iter().partition(|s| slot_hash(s) & bit != 0);

    for (i, slot) in kept.iter().enumerate() {
        write_slot(region, old, i as u32, slot)?;
    }
    for i in kept.len() as u32..n {
        write_slot(region, old, i, &[0u8; SLOT_SIZE])?;
    }
    for (i, slot) in moved.iter().enumerate() {
        write_slot(region, new, i as u32, slot)?;
    }
    set_count(region, old, kept.len() as u32)?;
    set_count(region, new, moved.len() as u32)
}

/// Copy out every live record in storage order.
pub fn records(region: &ShmRegion, bucket: u64) -> Result<Vec<Record>> {
    (0..count(region, bucket)?)
        .map(|i| {
            let slot = read_slot(region, bucket, i)?;
            let (k, _) = slot_lens(&slot);
            let data = payload(region, &slot)?;
            Ok(Record {
                hash: slot_hash(&slot),
                key: data[..k].to_vec(),
                value: data[k..].to_vec(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbmConfig;
    use crate::shm::region::unlink;
    use crate::shm::test_support::temp_path;

    fn region(name: &str, capacity: u32) -> (ShmRegion, std::path::PathBuf) {
        let path = temp_path(name);
        let cfg = DbmConfig::default()
            .with_bucket_capacity(capacity)
            .with_initial_size(64 << 10);
        (ShmRegion::create(&path, &cfg).unwrap(), path)
    }

    #[test]
    fn insert_find_replace() {
        let (mut r, path) = region("bucket-basic", 4);
        let b = create(&mut r, 0).unwrap();

        assert_eq!(
            insert(&mut r, b, 1, b"k", b"v1", StoreMode::Replace).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(find(&r, b, 1, b"k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(find(&r, b, 1, b"x").unwrap(), None);
        assert_eq!(find(&r, b, 2, b"k").unwrap(), None);

        assert_eq!(
            insert(&mut r, b, 1, b"k", b"v2", StoreMode::Insert).unwrap(),
            InsertOutcome::Exists
        );
        assert_eq!(find(&r, b, 1, b"k").unwrap(), Some(b"v1".to_vec()));

        assert_eq!(
            insert(&mut r, b, 1, b"k", b"v2", StoreMode::Replace).unwrap(),
            InsertOutcome::Replaced
        );
        assert_eq!(find(&r, b, 1, b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(count(&r, b).unwrap(), 1);
        unlink(&path).unwrap();
    }

    #[test]
    fn full_bucket_overflows_without_allocating() {
        let (mut r, path) = region("bucket-overflow", 2);
        let b = create(&mut r, 0).unwrap();
        insert(&mut r, b, 1, b"a", b"1", StoreMode::Replace).unwrap();
        insert(&mut r, b, 2, b"b", b"2", StoreMode::Replace).unwrap();

        let mark = r.header().free_offset;
        let big = vec![9u8; 500];
        assert_eq!(
            insert(&mut r, b, 3, b"c", &big, StoreMode::Replace).unwrap(),
            InsertOutcome::Overflow
        );
        assert_eq!(r.header().free_offset, mark);
        // Overwriting in a full bucket still works.
        assert_eq!(
            insert(&mut r, b, 2, b"b", b"22", StoreMode::Replace).unwrap(),
            InsertOutcome::Replaced
        );
        unlink(&path).unwrap();
    }

    #[test]
    fn large_records_live_out_of_line_and_are_released() {
        let (mut r, path) = region("bucket-outline", 4);
        let b = create(&mut r, 0).unwrap();
        let key = vec![b'k'; 40];
        let value = vec![b'v'; 3000];

        insert(&mut r, b, 7, &key, &value, StoreMode::Replace).unwrap();
        assert_eq!(find(&r, b, 7, &key).unwrap(), Some(value.clone()));
        let mark = r.header().free_offset;

        assert!(remove(&mut r, b, 7, &key).unwrap());
        assert_eq!(find(&r, b, 7, &key).unwrap(), None);

        // The released payload block is reused for the same size.
        insert(&mut r, b, 7, &key, &value, StoreMode::Replace).unwrap();
        assert_eq!(r.header().free_offset, mark);
        unlink(&path).unwrap();
    }

    #[test]
    fn remove_compacts_in_order() {
        let (mut r, path) = region("bucket-compact", 4);
        let b = create(&mut r, 0).unwrap();
        for (h, k) in [(1u64, b"a"), (2, b"b"), (3, b"c"), (4, b"d")] {
            insert(&mut r, b, h, k, k, StoreMode::Replace).unwrap();
        }
        assert!(remove(&mut r, b, 2, b"b").unwrap());
        assert!(!remove(&mut r, b, 2, b"b").unwrap());

        let keys: Vec<_> = records(&r, b).unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        // The hole is reusable.
        assert_eq!(
            insert(&mut r, b, 5, b"e", b"e", StoreMode::Replace).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(count(&r, b).unwrap(), 4);
        unlink(&path).unwrap();
    }

    #[test]
    fn split_partitions_on_bit() {
        let (mut r, path) = region("bucket-split", 4);
        let old = create(&mut r, 1).unwrap();
        let new = create(&mut r, 2).unwrap();
        for h in [0b00u64, 0b10, 0b100, 0b110] {
            let key = h.to_string();
            insert(&mut r, old, h, key.as_bytes(), b"x", StoreMode::Replace).unwrap();
        }

        split_into(&mut r, old, new, 0b10).unwrap();
        let stay: Vec<u64> = records(&r, old).unwrap().iter().map(|r| r.hash).collect();
        let went: Vec<u64> = records(&r, new).unwrap().iter().map(|r| r.hash).collect();
        assert_eq!(stay, vec![0b00, 0b100]);
        assert_eq!(went, vec![0b10, 0b110]);
        assert_eq!(local_depth(&r, new).unwrap(), 2);
        assert_eq!(find(&r, new, 0b110, b"6").unwrap(), Some(b"x".to_vec()));
        unlink(&path).unwrap();
    }

    #[test]
    fn corrupt_count_is_reported() {
        let (mut r, path) = region("bucket-corrupt", 4);
        let b = create(&mut r, 0).unwrap();
        r.write_u32(b + 4, 99).unwrap();
        assert!(find(&r, b, 1, b"a").unwrap_err().is_corruption());
        unlink(&path).unwrap();
    }
}
