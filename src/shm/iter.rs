/// Lazy record iteration over the directory.
///
/// Slots are visited in index order, one bucket snapshot per lock
/// acquisition, so writers interleave freely between steps. A bucket with
/// local depth `d` reached from slot `i` holds exactly the hashes whose low
/// `d` bits equal `i mod 2^d`; once yielded, that `(d, prefix)` pair is
/// remembered and any record whose hash falls under a remembered prefix is
/// skipped. Splits, directory growth and buddy slots therefore never yield a
/// key twice.
use std::collections::VecDeque;

use ahash::RandomState;
use hashbrown::HashSet;

use super::layout::ABSENT;
use super::region::ShmRegion;
use super::{bucket, directory, Dbm};
use crate::error::{Error, Result};

type Covered = HashSet<(u32, u64), RandomState>;

/// Iterator returned by `Dbm::iter`.
///
/// Yields `(key, value)` pairs. Keys present for the whole walk appear once;
/// keys stored or deleted meanwhile may or may not appear. An error ends the
/// walk.
pub struct Iter<'a> {
    dbm: &'a mut Dbm,
    next_slot: u64,
    covered: Covered,
    /// Distinct depths in `covered`, for prefix checks.
    depths: Vec<u32>,
    pending: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

struct Snapshot {
    slot: u64,
    depth: u32,
    prefix: u64,
    records: Vec<bucket::Record>,
}

fn mask(depth: u32) -> u64 {
    (1u64 << depth) - 1
}

/// Whether a remembered prefix no deeper than `upto` matches `hash`.
fn is_covered(covered: &Covered, depths: &[u32], hash: u64, upto: u32) -> bool {
    depths
        .iter()
        .filter(|&&d| d <= upto)
        .any(|&d| covered.contains(&(d, hash & mask(d))))
}

impl<'a> Iter<'a> {
    pub(crate) fn new(dbm: &'a mut Dbm) -> Self {
        Iter {
            dbm,
            next_slot: 0,
            covered: Covered::default(),
            depths: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Start over from the first slot.
    pub fn restart(&mut self) {
        self.next_slot = 0;
        self.covered.clear();
        self.depths.clear();
        self.pending.clear();
        self.done = false;
    }

    /// Find the next bucket not already covered and copy it out.
    fn scan(
        region: &ShmRegion,
        from: u64,
        covered: &Covered,
        depths: &[u32],
    ) -> Result<Option<Snapshot>> {
        let dir_size = region.header().dir_size as u64;
        for slot in from..dir_size {
            let b = directory::slot(region, slot)?;
            if b == ABSENT {
                continue;
            }
            if b < 0 {
                return Err(Error::corruption(format!("directory slot {slot} holds {b}")));
            }
            let b = b as u64;
            let depth = bucket::local_depth(region, b)?;
            if depth > region.header().global_depth() {
                return Err(Error::corruption(format!(
                    "bucket {b} has local depth {depth}"
                )));
            }
            let prefix = slot & mask(depth);
            if is_covered(covered, depths, prefix, depth) {
                continue;
            }
            return Ok(Some(Snapshot {
                slot,
                depth,
                prefix,
                records: bucket::records(region, b)?,
            }));
        }
        Ok(None)
    }

    /// One locked step. Returns false at the end of the directory.
    fn step(&mut self) -> Result<bool> {
        let from = self.next_slot;
        let covered = &self.covered;
        let depths = &self.depths;
        let found = self
            .dbm
            .read(|region| Self::scan(region, from, covered, depths))?;

        let Some(snap) = found else {
            return Ok(false);
        };
        for r in snap.records {
            if !is_covered(&self.covered, &self.depths, r.hash, u32::MAX) {
                self.pending.push_back((r.key, r.value));
            }
        }
        self.covered.insert((snap.depth, snap.prefix));
        if !self.depths.contains(&snap.depth) {
            self.depths.push(snap.depth);
        }
        self.next_slot = snap.slot + 1;
        Ok(true)
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.pending.pop_front() {
                return Some(Ok(pair));
            }
            if self.done {
                return None;
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbmConfig, DEPTH_CEILING};
    use crate::shm::region::unlink;
    use crate::shm::test_support::temp_path;
    use crate::shm::OpenMode;

    fn open(name: &str, dir_size: u32, capacity: u32) -> (Dbm, std::path::PathBuf) {
        let path = temp_path(name);
        let cfg = DbmConfig::default()
            .with_dir_size(dir_size)
            .with_bucket_capacity(capacity)
            .with_initial_size(64 << 10);
        (Dbm::open_with(&path, OpenMode::New, cfg).unwrap(), path)
    }

    fn sorted(db: &mut Dbm) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut all: Vec<_> = db.iter().collect::<Result<_>>().unwrap();
        all.sort();
        all
    }

    #[test]
    fn yields_survivors_once() {
        let (mut db, path) = open("iter-abc", 8, 4);
        db.store(b"A", b"1").unwrap();
        db.store(b"B", b"2").unwrap();
        db.store(b"C", b"3").unwrap();
        db.delete(b"B").unwrap();

        assert_eq!(
            sorted(&mut db),
            vec![
                (b"A".to_vec(), b"1".to_vec()),
                (b"C".to_vec(), b"3".to_vec())
            ]
        );
        unlink(&path).unwrap();
    }

    #[test]
    fn buddy_slots_are_visited_once() {
        // Large directory, few buckets: most slots share a bucket.
        let (mut db, path) = open("iter-buddy", 1, 64);
        for i in 0..40u32 {
            db.store(&i.to_be_bytes(), b"v").unwrap();
        }
        db.write(|region| directory::grow(region, DEPTH_CEILING))
            .unwrap();
        db.write(|region| directory::grow(region, DEPTH_CEILING))
            .unwrap();
        assert_eq!(db.stats().unwrap().dir_size, 4);
        assert_eq!(sorted(&mut db).len(), 40);
        unlink(&path).unwrap();
    }

    #[test]
    fn no_duplicates_across_splits_between_steps() {
        let (mut db, path) = open("iter-split", 1, 4);
        for i in 0..64u32 {
            db.store(&i.to_be_bytes(), b"v").unwrap();
        }

        let mut seen = Vec::new();
        {
            let mut it = db.iter();
            let (k, _) = it.next().unwrap().unwrap();
            seen.push(k);
            // Force splits mid-walk through the same handle.
            for i in 64..256u32 {
                it.dbm.store(&i.to_be_bytes(), b"w").unwrap();
            }
            for r in it {
                seen.push(r.unwrap().0);
            }
        }

        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), seen.len());
        // Every key present for the whole walk was yielded.
        for i in 0..64u32 {
            assert!(seen.contains(&i.to_be_bytes().to_vec()), "missing {i}");
        }
        unlink(&path).unwrap();
    }

    #[test]
    fn restart_walks_again() {
        let (mut db, path) = open("iter-restart", 4, 4);
        for i in 0..10u32 {
            db.store(&i.to_be_bytes(), b"v").unwrap();
        }
        let mut it = db.iter();
        assert_eq!(it.by_ref().count(), 10);
        assert!(it.next().is_none());
        it.restart();
        assert_eq!(it.count(), 10);
        unlink(&path).unwrap();
    }

    #[test]
    fn empty_store_yields_nothing() {
        let (mut db, path) = open("iter-empty", 4, 4);
        assert_eq!(db.iter().count(), 0);
        unlink(&path).unwrap();
    }
}
