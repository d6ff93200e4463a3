use std::collections::HashMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_test::traced_test;

use super::{
    error::{DbError, FormatError},
    ptr::{Ptr, Void},
    repr::{DbHeader, FORMAT_VERSION},
    store::{disk::DiskMode, DiskStore, MemStore},
    tuning, Database, DbString,
};

#[test]
#[traced_test]
fn initializing_database_doesnt_crash() {
    let db = Database::new_in_ram().expect("failed to create database");
    assert_eq!(db.used().unwrap(), DbHeader::SIZE);
    db.close().expect("failed to close database");
}

#[test]
#[traced_test]
fn malloc_never_returns_null() {
    let mut db = Database::new_in_ram().unwrap();
    for size in [1, 7, 8, 9, 100, tuning::MAX_MALLOC_SIZE] {
        let ptr = db.malloc(size).unwrap();
        assert!(!ptr.is_null());
        assert!(db.allocation_size(ptr).unwrap() >= size);
    }
}

#[test]
#[traced_test]
fn bad_sizes_are_refused() {
    let mut db = Database::new_in_ram().unwrap();
    assert!(matches!(db.malloc(0), Err(DbError::ZeroSized)));
    assert!(matches!(
        db.malloc(tuning::MAX_MALLOC_SIZE + 1),
        Err(DbError::TooLarge { .. })
    ));
}

#[test]
#[traced_test]
fn freed_chunks_are_reused_by_the_same_size_class() {
    let mut db = Database::new_in_ram().unwrap();
    let a = db.malloc(24).unwrap();
    let _b = db.malloc(24).unwrap();
    db.free(a).unwrap();
    let used = db.used().unwrap();
    // 20 rounds up to the same class as 24
    let c = db.malloc(20).unwrap();
    assert_eq!(a, c);
    assert_eq!(db.used().unwrap(), used, "reuse should not grow the used space");
    // a different class does not take it
    db.free(c).unwrap();
    let d = db.malloc(32).unwrap();
    assert_ne!(a, d);
}

#[test]
#[traced_test]
fn double_free_errors() {
    let mut db = Database::new_in_ram().unwrap();
    let ptr = db.malloc(64).unwrap();
    db.free(ptr).unwrap();
    assert!(
        matches!(db.free(ptr), Err(DbError::DoubleFree(p)) if p == ptr),
        "double-free did not error!"
    );
}

#[test]
#[traced_test]
fn bad_pointer_errors() {
    let mut db = Database::new_in_ram().unwrap();
    let ptr = db.malloc(64).unwrap();
    let _ = db.malloc(64).unwrap();
    assert!(matches!(
        db.free(ptr.offset(4)),
        Err(DbError::PointerInvalid(..))
    ));
    assert!(matches!(
        db.free(Ptr::<Void>::null()),
        Err(DbError::PointerInvalid(..))
    ));
    assert!(matches!(
        db.free(Ptr::<Void>::with(1 << 40)),
        Err(DbError::PointerInvalid(..))
    ));
}

#[test]
#[traced_test]
fn live_chunks_never_overlap() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut db = Database::new_in_ram().unwrap();
    // addr -> requested size
    let mut live = HashMap::<Ptr<Void>, u32>::new();
    for _ in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=512);
            let ptr = db.malloc(size).unwrap();
            // stamp the chunk, so that overlapping writes would show up later
            db.write_bytes(ptr, &vec![(ptr.addr % 251) as u8; size as usize])
                .unwrap();
            assert!(live.insert(ptr, size).is_none(), "{ptr:?} handed out twice");
        } else {
            let idx = rng.gen_range(0..live.len());
            let ptr = *live.keys().nth(idx).unwrap();
            let size = live.remove(&ptr).unwrap();
            let mut buf = vec![0; size as usize];
            db.read_bytes(ptr, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == (ptr.addr % 251) as u8), "chunk {ptr:?} was clobbered");
            db.free(ptr).unwrap();
        }
    }
    let mut ranges = db
        .chunks()
        .unwrap()
        .into_iter()
        .filter(|c| !c.free)
        .map(|c| (c.addr.addr, c.addr.addr + c.len as u64))
        .collect::<Vec<_>>();
    assert_eq!(ranges.len(), live.len());
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "chunks {pair:?} overlap");
    }
}

#[test]
#[traced_test]
fn primitives_round_trip_without_alignment() {
    let mut db = Database::new_in_ram().unwrap();
    let rec = db.malloc(64).unwrap();
    db.put_byte(rec.field(1), 0xAB).unwrap();
    db.put_char(rec.field(2), 0xFEED).unwrap();
    db.put_short(rec.field(5), -12345).unwrap();
    db.put_int(rec.field(7), i32::MIN + 3).unwrap();
    db.put_long(rec.field(11), -0x0123_4567_89AB_CDEF).unwrap();
    db.put_ptr(rec.field(19), rec).unwrap();
    assert_eq!(db.get_byte(rec.field(1)).unwrap(), 0xAB);
    assert_eq!(db.get_char(rec.field(2)).unwrap(), 0xFEED);
    assert_eq!(db.get_short(rec.field(5)).unwrap(), -12345);
    assert_eq!(db.get_int(rec.field(7)).unwrap(), i32::MIN + 3);
    assert_eq!(db.get_long(rec.field(11)).unwrap(), -0x0123_4567_89AB_CDEF);
    assert_eq!(db.get_ptr::<Void>(rec.field(19)).unwrap(), rec);
}

#[test]
#[traced_test]
fn reading_outside_the_store_errors() {
    let db = Database::new_in_ram().unwrap();
    let size = db.size().unwrap();
    assert!(matches!(
        db.get_long(Ptr::with(size - 4)),
        Err(DbError::OutOfBounds { .. })
    ));
}

#[test]
#[traced_test]
fn strings_round_trip() {
    let mut db = Database::new_in_ram().unwrap();
    let long = "long string with ünïcödé 🦀 ".repeat(700);
    let exact = "x".repeat(4092);
    let one_over = "y".repeat(4093);
    for text in [
        "",
        "a",
        "hello world",
        "embedded\0nul\0bytes",
        "high code points: \u{10FFFF} \u{1F980} 漢字",
        exact.as_str(),
        one_over.as_str(),
        long.as_str(),
    ] {
        let handle = db.new_string(text).unwrap();
        assert!(!handle.is_null());
        assert_eq!(db.string_len(handle).unwrap(), text.len());
        assert_eq!(db.get_string(handle).unwrap(), text);
        assert_eq!(db.compare_string_to(handle, text).unwrap(), std::cmp::Ordering::Equal);
    }
}

#[test]
#[traced_test]
fn freeing_a_long_string_releases_every_chunk() {
    let mut db = Database::new_in_ram().unwrap();
    let before = db.usage().unwrap();
    let handle = db.new_string(&"z".repeat(20_000)).unwrap();
    assert!(db.usage().unwrap().live_chunks > before.live_chunks + 1);
    db.free_string(handle).unwrap();
    assert_eq!(db.usage().unwrap().live_chunks, before.live_chunks);
}

#[test]
#[traced_test]
fn damaged_strings_error_instead_of_panicking() {
    let mut db = Database::new_in_ram().unwrap();
    let long = db.new_string(&"c".repeat(10_000)).unwrap();
    // the link from the first chunk of a long string to the rest of the chain
    db.put_ptr(long.cast::<Void>().field(8), Ptr::<Void>::with(u64::MAX - 3))
        .unwrap();
    assert!(matches!(db.get_string(long), Err(DbError::Corrupt(_))));

    let short = db.new_string("short").unwrap();
    db.write_typed(short.cast::<u32>(), &u32::MAX).unwrap();
    assert!(matches!(db.get_string(short), Err(DbError::Corrupt(_))));
}

#[test]
#[traced_test]
fn string_comparison() {
    let mut db = Database::new_in_ram().unwrap();
    let a = db.new_string("apple").unwrap();
    let b = db.new_string("banana").unwrap();
    assert_eq!(db.compare_strings(a, b).unwrap(), std::cmp::Ordering::Less);
    assert_eq!(db.compare_strings(b, a).unwrap(), std::cmp::Ordering::Greater);
    assert_eq!(db.compare_string_to(a, "apple").unwrap(), std::cmp::Ordering::Equal);
}

#[test]
#[traced_test]
fn root_table() {
    let mut db = Database::new_in_ram().unwrap();
    let rec = db.malloc(16).unwrap();
    assert!(db.root(3).unwrap().is_null());
    db.set_root(3, rec).unwrap();
    assert_eq!(db.root(3).unwrap(), rec);
    assert!(matches!(
        db.set_root(tuning::NUM_ROOTS, rec),
        Err(DbError::RootIndex(..))
    ));
}

#[test]
#[traced_test]
fn empty_store_is_initialized_on_open() {
    let db = Database::open(MemStore::new()).unwrap();
    assert_eq!(db.used().unwrap(), DbHeader::SIZE);
    let (_, rebuilt) = Database::open_or_rebuild(MemStore::new()).unwrap();
    assert!(rebuilt);
}

fn image_of(db: &Database) -> Vec<u8> {
    let mut image = vec![0; db.size().unwrap() as usize];
    db.read_bytes(Ptr::null(), &mut image).unwrap();
    image
}

#[test]
#[traced_test]
fn foreign_data_is_refused() {
    let store = MemStore::from_bytes(b"definitely not a database, just some text".repeat(200));
    assert!(matches!(
        Database::open(store.clone()),
        Err(DbError::Format(FormatError::NotADatabase))
    ));
    let (db, rebuilt) = Database::open_or_rebuild(store).unwrap();
    assert!(rebuilt);
    assert_eq!(db.used().unwrap(), DbHeader::SIZE);
}

#[test]
#[traced_test]
fn version_mismatch_is_refused() {
    let mut db = Database::new_in_ram().unwrap();
    let rec = db.malloc(8).unwrap();
    db.set_root(0, rec).unwrap();
    let mut image = image_of(&db);
    let version_at = 12;
    image[version_at..version_at + 4].copy_from_slice(&(FORMAT_VERSION + 1).to_ne_bytes());
    match Database::open(MemStore::from_bytes(image.clone())) {
        Err(DbError::Format(FormatError::Version { found, expected })) => {
            assert_eq!(found, FORMAT_VERSION + 1);
            assert_eq!(expected, FORMAT_VERSION);
        }
        other => panic!("expected a version error, got {other:?}"),
    }
    let (db, rebuilt) = Database::open_or_rebuild(MemStore::from_bytes(image)).unwrap();
    assert!(rebuilt);
    assert!(db.root(0).unwrap().is_null(), "rebuilt database kept old roots");
}

#[test]
#[traced_test]
fn truncated_store_is_refused() {
    let mut db = Database::new_in_ram().unwrap();
    let _ = db.malloc(1024).unwrap();
    let used = db.used().unwrap() as usize;
    let mut image = image_of(&db);
    image.truncate(used - 8);
    assert!(matches!(
        Database::open(MemStore::from_bytes(image)),
        Err(DbError::Format(FormatError::Truncated { .. }))
    ));
}

#[test]
#[traced_test]
fn running_out_of_space_keeps_existing_data() {
    let limit = DbHeader::SIZE + 4 * 1024;
    let mut db = Database::create(MemStore::with_limit(limit)).unwrap();
    let keep = db.new_string("survivor").unwrap();
    let err = loop {
        match db.malloc(512) {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, DbError::Io(ref e) if e.kind() == std::io::ErrorKind::OutOfMemory));
    let used = db.used().unwrap();
    assert!(used <= limit);
    assert_eq!(db.get_string(keep).unwrap(), "survivor");
    // the failed allocation did not leave a half written chunk behind
    db.chunks().unwrap();
    assert_eq!(db.used().unwrap(), used);
}

#[test]
#[traced_test]
fn disk_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");
    let (rec, text) = {
        let store = DiskStore::open(&path, DiskMode::Dynamic).unwrap();
        let (mut db, rebuilt) = Database::open_or_rebuild(store).unwrap();
        assert!(rebuilt);
        let rec = db.malloc(16).unwrap();
        let text = db.new_string("persisted across reopen").unwrap();
        db.put_ptr(rec, text).unwrap();
        db.put_long(rec.field(8), 42).unwrap();
        db.set_root(0, rec).unwrap();
        db.close().unwrap();
        (rec, text)
    };
    let store = DiskStore::open(&path, DiskMode::Dynamic).unwrap();
    let db = Database::open(store).unwrap();
    assert_eq!(db.root(0).unwrap(), rec);
    assert_eq!(db.get_ptr::<DbString>(rec).unwrap(), text);
    assert_eq!(db.get_long(rec.field(8)).unwrap(), 42);
    assert_eq!(db.get_string(text).unwrap(), "persisted across reopen");
}

#[test]
#[traced_test]
fn fixed_size_disk_store_cannot_grow() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixed.db");
    std::fs::write(&path, vec![0u8; DbHeader::SIZE as usize + 64]).unwrap();
    let store = DiskStore::open(&path, DiskMode::Fixed).unwrap();
    let mut db = Database::create(store).unwrap();
    // fits exactly
    let _ = db.malloc(48).unwrap();
    assert!(matches!(db.malloc(48), Err(DbError::Io(..))));
}
