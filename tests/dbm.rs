use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use shmdbm::{unlink, Dbm, DbmConfig, Error, HashKind, OpenMode, Result, StoreMode, StoreOutcome};

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// Unique store path for one test.
fn unique_path(prefix: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("shmdbm-it-{prefix}-{pid}-{t}-{n}.db"))
}

fn small() -> DbmConfig {
    DbmConfig::default()
        .with_dir_size(1)
        .with_bucket_capacity(4)
        .with_initial_size(64 << 10)
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    // Mix inline and out-of-line records.
    vec![(i % 251) as u8; (i as usize * 7) % 300]
}

#[test]
fn survives_repeated_doubling() -> Result<()> {
    let path = unique_path("doubling");
    let mut db = Dbm::open_with(&path, OpenMode::New, small())?;
    for i in 0..500 {
        assert_eq!(db.store(&key(i), &value(i))?, StoreOutcome::Inserted);
    }

    let stats = db.stats()?;
    assert!(stats.dir_size >= 8, "expected three doublings: {stats:?}");
    assert_eq!(stats.records, 500);
    assert!(stats.dir_num <= stats.dir_size);
    for i in 0..500 {
        assert_eq!(db.lookup(&key(i))?, Some(value(i)), "key {i}");
    }
    assert_eq!(db.iter().count(), 500);

    for i in (0..500).step_by(2) {
        assert!(db.delete(&key(i))?);
    }
    assert_eq!(db.len()?, 250);
    for i in 0..500 {
        assert_eq!(db.contains(&key(i))?, i % 2 == 1, "key {i}");
    }
    db.close()?;
    unlink(&path)
}

#[test]
fn reopen_keeps_records() -> Result<()> {
    let path = unique_path("reopen");
    let cfg = small().with_hash_kind(HashKind::Fnv1a64);
    {
        let mut db = Dbm::open_with(&path, OpenMode::New, cfg)?;
        for i in 0..100 {
            db.store(&key(i), &value(i))?;
        }
        db.close()?;
    }

    // The recorded hash kind wins over the opener's configuration.
    let mut db = Dbm::open_with(&path, OpenMode::Write, DbmConfig::default())?;
    assert_eq!(db.hash_kind(), HashKind::Fnv1a64);
    assert_eq!(db.len()?, 100);
    for i in 0..100 {
        assert_eq!(db.lookup(&key(i))?, Some(value(i)));
    }
    db.store(b"late", b"entry")?;
    db.close()?;

    let mut ro = Dbm::open(&path, OpenMode::Read)?;
    assert_eq!(ro.lookup(b"late")?, Some(b"entry".to_vec()));
    unlink(&path)
}

#[test]
fn invalid_files_are_refused() -> Result<()> {
    let path = unique_path("magic");
    fs::write(&path, vec![0x5a; 8192])?;
    assert!(matches!(
        Dbm::open(&path, OpenMode::Read),
        Err(Error::InvalidFormat(_))
    ));
    assert!(matches!(
        Dbm::open(&path, OpenMode::Create),
        Err(Error::InvalidFormat(_))
    ));

    fs::write(&path, b"tiny")?;
    assert!(matches!(
        Dbm::open(&path, OpenMode::Write),
        Err(Error::InvalidFormat(_))
    ));

    // `New` always starts over.
    let mut db = Dbm::open_with(&path, OpenMode::New, small())?;
    assert!(db.is_empty()?);
    unlink(&path)
}

#[test]
fn reader_follows_writer_growth() -> Result<()> {
    let path = unique_path("reader");
    let mut writer = Dbm::open_with(&path, OpenMode::New, small())?;
    writer.store(b"first", b"1")?;

    let mut reader = Dbm::open(&path, OpenMode::Read)?;
    assert_eq!(reader.lookup(b"first")?, Some(b"1".to_vec()));
    let before = reader.stats()?.map_size;

    let big = vec![7u8; 256 << 10];
    writer.store(b"big", &big)?;
    for i in 0..200 {
        writer.store(&key(i), &value(i))?;
    }
    assert!(writer.stats()?.map_size > before);

    assert_eq!(reader.lookup(b"big")?, Some(big));
    assert_eq!(reader.lookup(&key(199))?, Some(value(199)));
    assert_eq!(reader.len()?, 202);
    assert_eq!(reader.iter().count(), 202);

    assert!(matches!(reader.store(b"x", b"y"), Err(Error::ReadOnly)));
    assert!(matches!(reader.delete(b"first"), Err(Error::ReadOnly)));
    unlink(&path)
}

#[test]
fn two_handles_in_two_threads() -> Result<()> {
    let path = unique_path("threads");
    Dbm::open_with(&path, OpenMode::New, small())?.close()?;

    let workers: Vec<_> = (0..2u32)
        .map(|t| {
            let path = path.clone();
            std::thread::spawn(move || -> Result<()> {
                let mut db = Dbm::open_with(&path, OpenMode::Write, small())?;
                for i in 0..300 {
                    let n = t * 1000 + i;
                    db.store(&key(n), &value(n))?;
                }
                db.close()
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap()?;
    }

    let mut db = Dbm::open(&path, OpenMode::Read)?;
    assert_eq!(db.len()?, 600);
    for t in 0..2 {
        for i in 0..300 {
            let n = t * 1000 + i;
            assert_eq!(db.lookup(&key(n))?, Some(value(n)), "key {n}");
        }
    }
    unlink(&path)
}

#[test]
fn insert_mode_and_replaced_flag() -> Result<()> {
    let path = unique_path("flags");
    let mut a = Dbm::open_with(&path, OpenMode::New, small())?;
    let mut b = Dbm::open(&path, OpenMode::Write)?;

    assert_eq!(a.store_with(b"k", b"a", StoreMode::Insert)?, StoreOutcome::Inserted);
    assert_eq!(b.store_with(b"k", b"b", StoreMode::Insert)?, StoreOutcome::Exists);
    assert_eq!(b.lookup(b"k")?, Some(b"a".to_vec()));
    assert_eq!(b.store(b"k", b"b")?, StoreOutcome::Replaced);
    assert_eq!(a.lookup(b"k")?, Some(b"b".to_vec()));

    // Marking through one handle stops writes through every other.
    a.mark_replaced()?;
    assert!(b.is_replaced()?);
    assert!(matches!(b.store(b"k", b"c"), Err(Error::Replaced)));
    assert_eq!(b.lookup(b"k")?, Some(b"b".to_vec()));
    unlink(&path)
}

#[test]
fn churn_of_one_large_value_keeps_watermark_flat() -> Result<()> {
    let path = unique_path("churn");
    let mut db = Dbm::open_with(&path, OpenMode::New, small())?;
    let blob = vec![0xeeu8; 4000];

    db.store(b"blob", &blob)?;
    db.delete(b"blob")?;
    let mark = db.stats()?.free_offset;
    for _ in 0..1000 {
        db.store(b"blob", &blob)?;
        assert!(db.delete(b"blob")?);
    }
    assert_eq!(db.stats()?.free_offset, mark);
    assert!(db.is_empty()?);
    unlink(&path)
}
