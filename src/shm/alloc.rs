/// Size-classed free-space allocator over the mapped region.
///
/// Small classes hold blocks of exactly one size each (one class per 8-byte
/// step below 1 KiB). Big classes double in width and hold blocks of varying
/// size, so their lists are scanned first-fit. Fresh space is carved from the
/// watermark (`free_offset`), growing the file when it runs out.
///
/// A free block starts with `[next i64][size i64]`. All functions require the
/// caller to hold the store lock.
use log::{debug, error};

use super::layout::{
    round_up, ABSENT, BIG_CLASSES, HEADER_SIZE, MAX_ALLOC, MIN_BLOCK, SMALL_CLASSES,
    SMALL_THRESHOLD,
};
use super::region::ShmRegion;
use crate::error::{Error, Result};

/// Growth is geometric up to this step, then linear.
const MAX_GROW_STEP: u64 = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small(usize),
    Big(usize),
}

/// Classify an already-rounded size.
pub fn class_of(size: u64) -> SizeClass {
    if size < SMALL_THRESHOLD {
        SizeClass::Small((size / 8 - 1) as usize)
    } else {
        let k = 63 - (size / SMALL_THRESHOLD).leading_zeros() as usize;
        SizeClass::Big(k.min(BIG_CLASSES - 1))
    }
}

fn root(region: &ShmRegion, class: SizeClass) -> i64 {
    let h = region.header();
    match class {
        SizeClass::Small(i) => h.small_roots[i],
        SizeClass::Big(k) => h.big_roots[k],
    }
}

fn set_root(region: &mut ShmRegion, class: SizeClass, off: i64) -> Result<()> {
    let h = region.header_mut()?;
    match class {
        SizeClass::Small(i) => h.small_roots[i] = off,
        SizeClass::Big(k) => h.big_roots[k] = off,
    }
    Ok(())
}

/// Reject offsets that cannot name a block below the watermark.
fn check_block(region: &ShmRegion, off: i64, size: u64) -> Result<u64> {
    let free_offset = region.header().free_offset;
    let in_range = off >= HEADER_SIZE as i64
        && off % 8 == 0
        && (off as u64)
            .checked_add(size)
            .is_some_and(|end| end <= free_offset as u64);
    if !in_range {
        return Err(Error::corruption(format!(
            "block {off}+{size} outside allocated space (watermark {free_offset})"
        )));
    }
    Ok(off as u64)
}

/// Upper bound on list length before a list is treated as cyclic.
fn scan_limit(region: &ShmRegion) -> u64 {
    (region.header().free_offset as u64).saturating_sub(HEADER_SIZE as u64) / MIN_BLOCK + 1
}

fn read_free(region: &ShmRegion, off: i64) -> Result<(i64, u64)> {
    let at = check_block(region, off, MIN_BLOCK)?;
    let next = region.read_i64(at)?;
    let size = region.read_i64(at + 8)?;
    if size < MIN_BLOCK as i64 {
        return Err(Error::corruption(format!(
            "free block at {off} has size {size}"
        )));
    }
    check_block(region, off, size as u64)?;
    Ok((next, size as u64))
}

/// Allocate at least `size` bytes, returning the block offset.
pub fn allocate(region: &mut ShmRegion, size: u64) -> Result<u64> {
    if size > MAX_ALLOC {
        return Err(Error::OutOfSpace { requested: size });
    }
    let want = round_up(size);

    let found = match class_of(want) {
        SizeClass::Small(i) => match pop(region, SizeClass::Small(i))? {
            Some(block) => Some(block),
            None => pop_any_big(region, 0, want)?,
        },
        SizeClass::Big(k) => match take_first_fit(region, k, want)? {
            Some(block) => Some(block),
            None => pop_any_big(region, k + 1, want)?,
        },
    };

    match found {
        Some((off, have)) => {
            if !fits(have, want) {
                return Err(Error::corruption(format!(
                    "free block at {off} holds {have} bytes, listed for {want}"
                )));
            }
            if have > want {
                release(region, off + want, have - want)?;
            }
            Ok(off)
        }
        None => carve(region, want),
    }
}

/// A block is usable when it matches exactly or leaves a remainder large
/// enough to stand on its own free list. Anything in between would hand the
/// caller bytes that `release` never gives back.
fn fits(have: u64, want: u64) -> bool {
    have == want || have >= want + MIN_BLOCK
}

/// Return a block to its size class. `size` is the size passed to `allocate`.
pub fn release(region: &mut ShmRegion, off: u64, size: u64) -> Result<()> {
    let size = round_up(size);
    let off = check_block(region, off as i64, size)?;
    let class = class_of(size);
    let head = root(region, class);
    region.write_i64(off, head)?;
    region.write_i64(off + 8, size as i64)?;
    set_root(region, class, off as i64)
}

/// Pop the head of a list. A head linking to itself or outside the
/// allocated space is reported instead of handed out twice.
fn pop(region: &mut ShmRegion, class: SizeClass) -> Result<Option<(u64, u64)>> {
    let head = root(region, class);
    if head == ABSENT {
        return Ok(None);
    }
    let (next, size) = read_free(region, head)?;
    check_link(region, class, head, next)?;
    set_root(region, class, next)?;
    Ok(Some((head as u64, size)))
}

fn check_link(region: &ShmRegion, class: SizeClass, cur: i64, next: i64) -> Result<()> {
    if next == cur {
        error!("free-list cycle in {class:?} at {cur}");
        return Err(Error::corruption(format!(
            "free-list cycle in {class:?}: block {cur} links to itself"
        )));
    }
    if next != ABSENT {
        check_block(region, next, MIN_BLOCK)?;
    }
    Ok(())
}

/// Head of the first non-empty big class at or above `from` that fits
/// `want`. Every block in class k is at least 1024 << k bytes.
fn pop_any_big(region: &mut ShmRegion, from: usize, want: u64) -> Result<Option<(u64, u64)>> {
    for k in from..BIG_CLASSES {
        let head = region.header().big_roots[k];
        if head == ABSENT || !fits(read_free(region, head)?.1, want) {
            continue;
        }
        if let Some(block) = pop(region, SizeClass::Big(k))? {
            return Ok(Some(block));
        }
    }
    Ok(None)
}

/// Unlink the first block of big class `k` holding at least `want` bytes.
fn take_first_fit(region: &mut ShmRegion, k: usize, want: u64) -> Result<Option<(u64, u64)>> {
    let limit = scan_limit(region);
    let mut prev = ABSENT;
    let mut cur = region.header().big_roots[k];
    let mut steps = 0u64;

    while cur != ABSENT {
        steps += 1;
        if steps > limit {
            error!("free-list cycle in big class {k}");
            return Err(Error::corruption(format!("free-list cycle in big class {k}")));
        }
        let (next, size) = read_free(region, cur)?;
        check_link(region, SizeClass::Big(k), cur, next)?;
        if fits(size, want) {
            if prev == ABSENT {
                set_root(region, SizeClass::Big(k), next)?;
            } else {
                region.write_i64(prev as u64, next)?;
            }
            return Ok(Some((cur as u64, size)));
        }
        prev = cur;
        cur = next;
    }
    Ok(None)
}

/// Take `want` bytes from the watermark, growing the file if needed.
fn carve(region: &mut ShmRegion, want: u64) -> Result<u64> {
    let off = region.header().free_offset as u64;
    let end = off + want;
    let map_size = region.header().map_size as u64;

    if end > map_size {
        let step = map_size.min(MAX_GROW_STEP);
        let mut target = end.max(map_size + step);
        if let Some(limit) = region.size_limit() {
            if end <= limit {
                target = target.min(limit);
            }
        }
        region.extend_and_remap(target)?;
        let len = region.len();
        region.header_mut()?.map_size = len as i64;
        debug!("watermark {off} needs {want} bytes; file grown to {len}");
    }

    region.header_mut()?.free_offset = end as i64;
    Ok(off)
}

/// Length of every free list, small classes first. For diagnostics and tests.
pub fn free_counts(region: &ShmRegion) -> Result<(Vec<u64>, Vec<u64>)> {
    let limit = scan_limit(region);
    let count = |head: i64| -> Result<u64> {
        let mut n = 0;
        let mut cur = head;
        while cur != ABSENT {
            n += 1;
            if n > limit {
                return Err(Error::corruption("free-list cycle"));
            }
            cur = read_free(region, cur)?.0;
        }
        Ok(n)
    };

    let h = region.header();
    let small = (0..SMALL_CLASSES)
        .map(|i| count(h.small_roots[i]))
        .collect::<Result<Vec<_>>>()?;
    let big = (0..BIG_CLASSES)
        .map(|k| count(h.big_roots[k]))
        .collect::<Result<Vec<_>>>()?;
    Ok((small, big))
}
