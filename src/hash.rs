//! Stable key hashing.
//!
//! The hash decides which bucket a record lives in, so it must not change
//! between builds, processes or platforms. The kind is recorded in the header
//! as a u32 code at creation time.

use std::fmt;
use std::hash::Hasher;

use twox_hash::XxHash64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    /// 64-bit xxHash, seed 0.
    #[default]
    Xx64 = 1,
    /// 64-bit FNV-1a.
    Fnv1a64 = 2,
}

impl HashKind {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Unknown codes return `None`.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(HashKind::Xx64),
            2 => Some(HashKind::Fnv1a64),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "xx64" | "xxhash64" => Some(HashKind::Xx64),
            "fnv" | "fnv1a" | "fnv1a64" => Some(HashKind::Fnv1a64),
            _ => None,
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKind::Xx64 => write!(f, "xxhash64(seed=0)"),
            HashKind::Fnv1a64 => write!(f, "fnv1a64"),
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash raw key bytes with the given kind.
pub fn hash64(kind: HashKind, key: &[u8]) -> u64 {
    match kind {
        HashKind::Xx64 => {
            let mut h = XxHash64::with_seed(0);
            h.write(key);
            h.finish()
        }
        HashKind::Fnv1a64 => key.iter().fold(FNV_OFFSET, |acc, &b| {
            (acc ^ b as u64).wrapping_mul(FNV_PRIME)
        }),
    }
}
