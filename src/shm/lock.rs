/// Seqlock stored in the header for cross-process use.
///
/// Layout inside `Header::lock` (64 bytes, one cache line):
///   [seq_counter: u64][write_lock: u32][padding to 64]
///
/// Writers acquire a TTAS spinlock then bump seq even→odd, and odd→even on
/// release. Read-only mappings cannot store to the lock word, so their readers
/// check seq before and after reading and retry on a mismatch.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::layout::LOCK_SIZE;

/// Mutual exclusion over the whole store.
///
/// Not re-entrant: acquiring twice from the same thread deadlocks.
pub trait CriticalSection {
    fn acquire(&self);
    fn release(&self);
}

/// A view of the seqlock words at a fixed address in the mapping.
///
/// The view borrows nothing; after the mapping is remapped a fresh view must
/// be taken from the new base address.
pub struct ShmSeqLock {
    seq_ptr: *const AtomicU64,
    write_lock_ptr: *const AtomicU32,
}

impl ShmSeqLock {
    /// Initialize a new seqlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to at least `LOCK_SIZE` writable bytes of the mapping,
    /// 8-byte aligned, not yet visible to other processes.
    pub unsafe fn init(ptr: *mut u8) -> Self {
        std::ptr::write_bytes(ptr, 0, LOCK_SIZE);

        let seq_ptr = ptr as *const AtomicU64;
        let write_lock_ptr = ptr.add(8) as *const AtomicU32;

        (*seq_ptr).store(0, Ordering::Relaxed);
        (*write_lock_ptr).store(0, Ordering::Relaxed);

        ShmSeqLock {
            seq_ptr,
            write_lock_ptr,
        }
    }

    /// Attach to an already-initialized seqlock.
    ///
    /// # Safety
    /// `ptr` must point to a previously initialized seqlock that stays mapped
    /// for as long as the returned view is used.
    pub unsafe fn from_existing(ptr: *const u8) -> Self {
        ShmSeqLock {
            seq_ptr: ptr as *const AtomicU64,
            write_lock_ptr: ptr.add(8) as *const AtomicU32,
        }
    }

    fn seq(&self) -> &AtomicU64 {
        unsafe { &*self.seq_ptr }
    }

    fn word(&self) -> &AtomicU32 {
        unsafe { &*self.write_lock_ptr }
    }

    /// Begin an optimistic read. Spins until no writer is active.
    #[inline]
    pub fn read_begin(&self) -> u64 {
        loop {
            let seq = self.seq().load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            std::hint::spin_loop();
        }
    }

    /// True if no writer ran since `read_begin()` returned `seq`.
    #[inline]
    pub fn read_validate(&self, seq: u64) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        self.seq().load(Ordering::Relaxed) == seq
    }

    /// Acquire the write lock. Spins until acquired.
    #[inline]
    pub fn write_lock(&self) {
        let lock = self.word();
        loop {
            while lock.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
            if lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        let seq = self.seq();
        let prev = seq.load(Ordering::Relaxed);
        seq.store(prev + 1, Ordering::Release);
        std::sync::atomic::fence(Ordering::Release);
    }

    /// Release the write lock.
    #[inline]
    pub fn write_unlock(&self) {
        let seq = self.seq();
        let prev = seq.load(Ordering::Relaxed);
        seq.store(prev + 1, Ordering::Release);

        self.word().store(0, Ordering::Release);
    }

    /// Whether some handle currently holds the write lock.
    pub fn is_locked(&self) -> bool {
        self.word().load(Ordering::Relaxed) != 0
    }
}

impl CriticalSection for ShmSeqLock {
    fn acquire(&self) {
        self.write_lock();
    }

    fn release(&self) {
        self.write_unlock();
    }
}
