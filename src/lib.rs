//! ndbm-style persistent key-value store in a single memory-mapped file.
//!
//! ```no_run
//! use shmdbm::{Dbm, OpenMode};
//!
//! let mut db = Dbm::open("/tmp/example.db", OpenMode::Create)?;
//! db.store(b"key", b"value")?;
//! assert_eq!(db.lookup(b"key")?, Some(b"value".to_vec()));
//! for pair in db.iter() {
//!     let (key, value) = pair?;
//!     println!("{key:?} = {value:?}");
//! }
//! db.close()?;
//! # Ok::<(), shmdbm::Error>(())
//! ```
mod config;
mod error;
mod hash;
mod signals;
mod sync;

pub mod shm;

#[cfg(feature = "python")]
mod python;

pub use config::{DbmConfig, DEPTH_CEILING};
pub use error::{Error, Result};
pub use hash::{hash64, HashKind};
pub use shm::region::unlink;
pub use shm::{Dbm, DbmStats, Iter, OpenMode, StoreMode, StoreOutcome};
pub use sync::SharedDbm;
