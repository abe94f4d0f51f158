/// Extendible-hash directory.
///
/// An array of `dir_size` bucket offsets at `header.dir_offset`, indexed by
/// the low `global_depth` bits of the key hash. A bucket with local depth `d`
/// is shared by the `2^(global_depth - d)` slots that agree on the low `d`
/// bits ("buddy" slots). Absent slots hold `ABSENT` until a key lands there.
use log::debug;

use super::bucket;
use super::layout::ABSENT;
use super::region::ShmRegion;
use crate::config::DEPTH_CEILING;
use crate::error::{Error, Result};

fn mask(depth: u32) -> u64 {
    (1u64 << depth) - 1
}

/// Directory slot for `hash` at the current global depth.
pub fn index_of(region: &ShmRegion, hash: u64) -> u64 {
    hash & mask(region.header().global_depth())
}

fn entry_offset(region: &ShmRegion, index: u64) -> Result<u64> {
    let h = region.header();
    if index >= h.dir_size as u64 {
        return Err(Error::corruption(format!(
            "directory slot {index} beyond size {}",
            h.dir_size
        )));
    }
    Ok(h.dir_offset as u64 + index * 8)
}

/// Raw slot contents: a bucket offset or `ABSENT`.
pub fn slot(region: &ShmRegion, index: u64) -> Result<i64> {
    region.read_i64(entry_offset(region, index)?)
}

fn set_slot(region: &mut ShmRegion, index: u64, bucket: i64) -> Result<()> {
    let at = entry_offset(region, index)?;
    region.write_i64(at, bucket)
}

/// The slot for `hash` and its bucket, if one exists.
pub fn locate(region: &ShmRegion, hash: u64) -> Result<Option<(u64, u64)>> {
    let index = index_of(region, hash);
    match slot(region, index)? {
        ABSENT => Ok(None),
        b if b < 0 => Err(Error::corruption(format!(
            "directory slot {index} holds {b}"
        ))),
        b => Ok(Some((index, b as u64))),
    }
}

/// Like `locate`, creating an empty bucket for an absent slot.
pub fn ensure_bucket(region: &mut ShmRegion, hash: u64) -> Result<(u64, u64)> {
    if let Some(found) = locate(region, hash)? {
        return Ok(found);
    }
    let index = index_of(region, hash);
    let depth = region.header().global_depth();
    let b = bucket::create(region, depth)?;
    set_slot(region, index, b as i64)?;
    let h = region.header_mut()?;
    h.dir_num += 1;
    h.seg_num += 1;
    Ok((index, b))
}

/// Double the directory. Slot `i` of the old array lands at `i` and
/// `i + old_size`, so every lookup still reaches the same bucket.
pub fn grow(region: &mut ShmRegion, max_depth: u32) -> Result<()> {
    let (old_off, old_size, depth) = {
        let h = region.header();
        (h.dir_offset as u64, h.dir_size as u64, h.global_depth())
    };
    if depth >= max_depth.min(DEPTH_CEILING) {
        return Err(Error::corruption(format!(
            "directory cannot grow past depth {depth}"
        )));
    }

    let old_bytes = old_size * 8;
    let new_off = super::alloc::allocate(region, old_bytes * 2)?;
    let entries = region.bytes(old_off, old_bytes)?.to_vec();
    let dst = region.bytes_mut(new_off, old_bytes * 2)?;
    dst[..old_bytes as usize].copy_from_slice(&entries);
    dst[old_bytes as usize..].copy_from_slice(&entries);

    {
        let h = region.header_mut()?;
        h.dir_offset = new_off as i64;
        h.dir_size = (old_size * 2) as i32;
        h.dir_num *= 2;
    }
    super::alloc::release(region, old_off, old_bytes)?;

    debug!(
        "directory grown to {} slots (depth {})",
        old_size * 2,
        depth + 1
    );
    Ok(())
}

/// Split the bucket behind `index` on bit `local_depth`, growing the
/// directory first when the bucket is already at global depth.
///
/// Returns `false` without changing anything when the bucket has reached
/// `max_depth` and cannot be split.
pub fn split(region: &mut ShmRegion, index: u64, old: u64, max_depth: u32) -> Result<bool> {
    let ld = bucket::local_depth(region, old)?;
    if ld >= max_depth.min(DEPTH_CEILING) {
        return Ok(false);
    }
    if ld == region.header().global_depth() {
        grow(region, max_depth)?;
    }
    let gd = region.header().global_depth();
    if ld > gd {
        return Err(Error::corruption(format!(
            "bucket {old} has local depth {ld} above global depth {gd}"
        )));
    }

    let sibling = bucket::create(region, ld + 1)?;
    bucket::split_into(region, old, sibling, 1 << ld)?;
    bucket::set_local_depth(region, old, ld + 1)?;

    let base = index & mask(ld);
    for k in 0..(1u64 << (gd - ld)) {
        let j = base | (k << ld);
        if j & (1 << ld) != 0 {
            set_slot(region, j, sibling as i64)?;
        }
    }
    region.header_mut()?.seg_num += 1;

    debug!("split bucket {old} at depth {ld} into {sibling}");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbmConfig;
    use crate::shm::bucket::{InsertOutcome, StoreMode};
    use crate::shm::region::unlink;
    use crate::shm::test_support::temp_path;

    fn region(name: &str, dir_size: u32, capacity: u32) -> (ShmRegion, std::path::PathBuf) {
        let path = temp_path(name);
        let cfg = DbmConfig::default()
            .with_dir_size(dir_size)
            .with_bucket_capacity(capacity)
            .with_initial_size(64 << 10);
        (ShmRegion::create(&path, &cfg).unwrap(), path)
    }

    fn put(r: &mut ShmRegion, hash: u64) -> InsertOutcome {
        let (_, b) = ensure_bucket(r, hash).unwrap();
        let key = hash.to_string();
        bucket::insert(r, b, hash, key.as_bytes(), b"v", StoreMode::Replace).unwrap()
    }

    fn get(r: &ShmRegion, hash: u64) -> Option<Vec<u8>> {
        let (_, b) = locate(r, hash).unwrap()?;
        bucket::find(r, b, hash, hash.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn absent_until_first_insert() {
        let (mut r, path) = region("dir-absent", 4, 2);
        assert_eq!(locate(&r, 5).unwrap(), None);
        assert_eq!(put(&mut r, 5), InsertOutcome::Inserted);
        let (index, b) = locate(&r, 5).unwrap().unwrap();
        assert_eq!(index, 1);
        assert_eq!(bucket::local_depth(&r, b).unwrap(), 2);
        assert_eq!(r.header().dir_num, 1);
        assert_eq!(r.header().seg_num, 1);
        unlink(&path).unwrap();
    }

    #[test]
    fn grow_duplicates_slots() {
        let (mut r, path) = region("dir-grow", 2, 2);
        put(&mut r, 0);
        put(&mut r, 1);
        let old_off = r.header().dir_offset;

        grow(&mut r, 27).unwrap();
        let h = r.header();
        assert_eq!(h.dir_size, 4);
        assert_eq!(h.dir_num, 4);
        assert_ne!(h.dir_offset, old_off);
        assert_eq!(slot(&r, 0).unwrap(), slot(&r, 2).unwrap());
        assert_eq!(slot(&r, 1).unwrap(), slot(&r, 3).unwrap());
        assert_eq!(get(&r, 0), Some(b"v".to_vec()));
        assert_eq!(get(&r, 1), Some(b"v".to_vec()));
        unlink(&path).unwrap();
    }

    #[test]
    fn split_grows_and_redirects_buddies() {
        let (mut r, path) = region("dir-split", 1, 2);
        assert_eq!(put(&mut r, 0b000), InsertOutcome::Inserted);
        assert_eq!(put(&mut r, 0b001), InsertOutcome::Inserted);
        assert_eq!(put(&mut r, 0b011), InsertOutcome::Overflow);

        let (index, b) = locate(&r, 0b011).unwrap().unwrap();
        assert!(split(&mut r, index, b, 27).unwrap());
        assert_eq!(r.header().dir_size, 2);
        assert_eq!(r.header().seg_num, 2);
        assert_ne!(slot(&r, 0).unwrap(), slot(&r, 1).unwrap());

        // Bucket for odd hashes is full again; splitting it leaves slot 0 alone.
        assert_eq!(put(&mut r, 0b011), InsertOutcome::Inserted);
        assert_eq!(put(&mut r, 0b101), InsertOutcome::Overflow);
        let even = slot(&r, 0).unwrap();
        let (index, b) = locate(&r, 0b101).unwrap().unwrap();
        assert!(split(&mut r, index, b, 27).unwrap());
        assert_eq!(r.header().dir_size, 4);
        assert_eq!(slot(&r, 0).unwrap(), even);
        assert_eq!(slot(&r, 2).unwrap(), even);
        assert_ne!(slot(&r, 1).unwrap(), slot(&r, 3).unwrap());

        assert_eq!(put(&mut r, 0b101), InsertOutcome::Inserted);
        for h in [0b000, 0b001, 0b011, 0b101] {
            assert_eq!(get(&r, h), Some(b"v".to_vec()), "hash {h:b}");
        }
        unlink(&path).unwrap();
    }

    #[test]
    fn split_stops_at_max_depth() {
        let (mut r, path) = region("dir-depth", 1, 1);
        put(&mut r, 0);
        let (index, b) = locate(&r, 0).unwrap().unwrap();
        assert!(split(&mut r, index, b, 1).unwrap());
        let (index, b) = locate(&r, 0).unwrap().unwrap();
        let before = r.header().free_offset;
        assert!(!split(&mut r, index, b, 1).unwrap());
        assert_eq!(r.header().free_offset, before);
        assert!(grow(&mut r, 1).unwrap_err().is_corruption());
        unlink(&path).unwrap();
    }
}
