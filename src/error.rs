use std::io;

/// Failure kinds surfaced by every public operation.
///
/// A missing key is not an error: lookups return `None` and deletes return
/// `false`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad magic, unsupported version or a truncated header. Fatal to `open`.
    #[error("invalid store format: {0}")]
    InvalidFormat(String),

    /// The underlying file or mapping operation failed.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The allocator could not satisfy the request (ceiling or disk full).
    #[error("out of space: cannot allocate {requested} bytes")]
    OutOfSpace { requested: u64 },

    /// An on-disk invariant does not hold.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The store was marked replaced and must be rebuilt before further writes.
    #[error("store has been marked replaced")]
    Replaced,

    /// A mutation was attempted through a read-only handle.
    #[error("store is opened read-only")]
    ReadOnly,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
