//! End-to-end scenarios over the public API: create, read, write, commit,
//! rollback, crash recovery, encryption, and index-backed filtering.

use pretty_assertions::assert_eq;
use sharc::{
    Database, DatabaseOptions, Error, Filter, JournalMode, SqlValue, TransactionError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn opts() -> DatabaseOptions {
    DatabaseOptions::default().writable(true)
}

#[test]
fn test_create_insert_point_read() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("e1.db");

    let mut db = Database::create(&path, opts().page_size(4096))?;
    let mut txn = db.begin_transaction()?;
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")?;
    for (id, name) in [(1i64, "alice"), (2, "bob"), (3, "carol")] {
        let rowid = txn.insert("t", &[SqlValue::Int(id), SqlValue::from(name)])?;
        assert_eq!(rowid, id);
    }
    txn.commit()?;
    drop(db);

    // A fresh open sees the committed rows; point lookup by rowid.
    let db = Database::open(&path, DatabaseOptions::default())?;
    let mut reader = db.create_reader("t")?;
    let row = reader.seek(2)?.expect("rowid 2 exists");
    assert_eq!(row.row_id(), Some(2));
    assert_eq!(row.get_int64(0), Some(2));
    assert_eq!(row.get_string(1), Some("bob"));
    assert!(reader.seek(99)?.is_none());
    Ok(())
}

#[test]
fn test_overflow_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e2.db");

    let blob: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 256) as u8).collect();
    {
        let mut db = Database::create(&path, opts().page_size(4096)).unwrap();
        let mut txn = db.begin_transaction().unwrap();
        txn.execute("CREATE TABLE b (id INTEGER PRIMARY KEY, data BLOB)")
            .unwrap();
        txn.insert("b", &[SqlValue::Int(1), SqlValue::Blob(blob.clone())])
            .unwrap();
        txn.commit().unwrap();
    }

    let db = Database::open(&path, DatabaseOptions::default()).unwrap();
    let mut reader = db.create_reader("b").unwrap();
    let row = reader.seek(1).unwrap().expect("rowid 1 exists");
    assert_eq!(row.get_blob(1), Some(&blob[..]));

    // The record is 20005 bytes (header, NULL rowid alias, blob body); at
    // 4096-byte pages the inline portion is K = 3637, leaving exactly
    // ceil((20005 - 3637) / 4092) = 4 overflow pages.
    // File layout: schema root + table leaf + 4 overflow pages.
    let record_len = 20_005usize;
    let inline = sharc::btree::cell::table_leaf_inline_size(4096, record_len);
    assert_eq!(inline, 3637);
    let chain = sharc::btree::payload::chain_length(record_len, inline, 4096);
    assert_eq!(chain, 4);
    let file_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(file_len, 4096 * (2 + chain as u64));
}

#[test]
fn test_inline_threshold_does_not_spill() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threshold.db");

    // A blob of 4058 bytes makes the record exactly X = 4061 bytes: all
    // inline, no overflow page.
    let mut db = Database::create(&path, opts().page_size(4096)).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (data BLOB)").unwrap();
    txn.insert("t", &[SqlValue::Blob(vec![0xAB; 4058])]).unwrap();
    txn.commit().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096 * 2);

    // One byte more and the payload spills to a single overflow page.
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t2 (data BLOB)").unwrap();
    txn.insert("t2", &[SqlValue::Blob(vec![0xCD; 4059])]).unwrap();
    txn.commit().unwrap();
    // Pages: schema, t root, t2 root, one overflow page.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096 * 4);
}

#[test]
fn test_rollback_restores_everything() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e3.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    txn.commit().unwrap();

    let before = std::fs::read(&path).unwrap();
    let version_before = db.data_version().unwrap();

    let mut txn = db.begin_transaction().unwrap();
    for i in 0..100i64 {
        txn.insert("t", &[SqlValue::Int(i + 1), SqlValue::from("doomed")])
            .unwrap();
    }
    txn.rollback().unwrap();

    // Byte-for-byte identical file, no journal, nothing readable.
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(!sharc::journal::journal_path(&path).exists());
    assert_eq!(db.data_version().unwrap(), version_before);
    let mut reader = db.create_reader("t").unwrap();
    assert!(reader.next_row().unwrap().is_none());
}

#[test]
fn test_dropped_transaction_rolls_back() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
    txn.commit().unwrap();

    {
        let mut txn = db.begin_transaction().unwrap();
        txn.insert("t", &[SqlValue::Int(1)]).unwrap();
        // Dropped without commit.
    }
    assert!(!sharc::journal::journal_path(&path).exists());
    let mut reader = db.create_reader("t").unwrap();
    assert!(reader.next_row().unwrap().is_none());
}

#[test]
fn test_crash_recovery_replays_journal() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e4.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    txn.commit().unwrap();
    drop(db);

    let pre_image = std::fs::read(&path).unwrap();
    let pre_pages = (pre_image.len() / 4096) as u32;

    // Commit 50 rows, then forge the crash: the dirty pages hit the disk
    // but the journal "survived" the crash that was supposed to delete it.
    let mut db = Database::open(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    for i in 0..50i64 {
        txn.insert("t", &[SqlValue::Int(i + 1), SqlValue::from("aborted")])
            .unwrap();
    }
    txn.commit().unwrap();
    drop(db);

    let forge_journal = || {
        let mut journal =
            sharc::journal::Journal::create(&path, JournalMode::Delete, 4096, pre_pages).unwrap();
        for pn in 1..=pre_pages as usize {
            let start = (pn - 1) * 4096;
            journal.capture(pn, &pre_image[start..start + 4096]).unwrap();
        }
        journal.sync().unwrap();
        // Dropped without delete: the journal file stays, as after a crash.
    };

    forge_journal();
    let db = Database::open(&path, opts()).unwrap();
    drop(db);
    assert!(!sharc::journal::journal_path(&path).exists());
    assert_eq!(std::fs::read(&path).unwrap(), pre_image);

    // Replaying the same journal twice is idempotent.
    forge_journal();
    let db = Database::open(&path, opts()).unwrap();
    let mut reader = db.create_reader("t").unwrap();
    assert!(reader.next_row().unwrap().is_none());
    drop(db);
    assert_eq!(std::fs::read(&path).unwrap(), pre_image);
}

#[test]
fn test_hot_journal_rejected_read_only() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hot.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
    txn.commit().unwrap();
    drop(db);

    let image = std::fs::read(&path).unwrap();
    let mut journal =
        sharc::journal::Journal::create(&path, JournalMode::Delete, 4096, 1).unwrap();
    journal.capture(1, &image[..4096]).unwrap();
    journal.sync().unwrap();
    drop(journal);

    let err = Database::open(&path, DatabaseOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(TransactionError::HotJournal)
    ));
}

#[test]
fn test_encrypted_database_round_trip_and_tamper() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e5.db");
    let password = "correct horse battery staple";

    {
        let mut db =
            Database::create(&path, opts().page_size(4096).password(password)).unwrap();
        let mut txn = db.begin_transaction().unwrap();
        txn.execute("CREATE TABLE t1 (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        txn.execute("CREATE TABLE t2 (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        txn.insert("t1", &[SqlValue::Int(1), SqlValue::from("one")])
            .unwrap();
        txn.insert("t2", &[SqlValue::Int(1), SqlValue::from("two")])
            .unwrap();
        txn.commit().unwrap();
    }

    // Not a SQLite file on the outside, and wrong/missing passwords fail.
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..6], b"SHARC\0");
    assert!(!raw.windows(16).any(|w| w == b"SQLite format 3\0"));
    assert!(matches!(
        Database::open(&path, DatabaseOptions::default()).unwrap_err(),
        Error::Crypto(sharc::crypto::Error::BadPassword)
    ));
    assert!(matches!(
        Database::open(&path, DatabaseOptions::default().password("wrong")).unwrap_err(),
        Error::Crypto(sharc::crypto::Error::BadPassword)
    ));

    // With the password everything reads back.
    {
        let db =
            Database::open(&path, DatabaseOptions::default().password(password)).unwrap();
        let mut reader = db.create_reader("t2").unwrap();
        let row = reader.next_row().unwrap().unwrap();
        assert_eq!(row.get_string(1), Some("two"));
        // Row-level subkeys are deterministic per tag.
        assert_eq!(*db.row_key("tenant-a").unwrap(), *db.row_key("tenant-a").unwrap());
        assert_ne!(*db.row_key("tenant-a").unwrap(), *db.row_key("tenant-b").unwrap());
    }

    // Flip one ciphertext byte of page 3 (t2's root): reads of t2 fail
    // authentication, t1 stays readable.
    {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let offset = 128 + 2 * (4096 + 28) + 12 + 100;
        f.seek(SeekFrom::Start(offset)).unwrap();
        let mut b = [0u8; 1];
        f.read_exact(&mut b).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(&[b[0] ^ 0x01]).unwrap();
        f.sync_all().unwrap();
    }
    let db = Database::open(&path, DatabaseOptions::default().password(password)).unwrap();
    let mut reader = db.create_reader("t1").unwrap();
    assert_eq!(
        reader.next_row().unwrap().unwrap().get_string(1),
        Some("one")
    );
    let mut reader = db.create_reader("t2").unwrap();
    assert!(matches!(
        reader.next_row().unwrap_err(),
        sharc::reader::Error::Btree(_)
    ));
}

#[test]
fn test_index_backed_filter() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e6.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE u (id INTEGER PRIMARY KEY, age INTEGER)")
        .unwrap();
    txn.execute("CREATE INDEX i ON u(age)").unwrap();
    for i in 0..10_000i64 {
        txn.insert("u", &[SqlValue::Int(i + 1), SqlValue::Int(i % 100)])
            .unwrap();
    }
    txn.commit().unwrap();

    let filter = Filter::eq("age", 42i64);
    let mut reader = db.create_reader_with_filter("u", &filter).unwrap();
    // The plan visits the index before the table.
    assert_eq!(
        reader.explain(),
        &sharc::AccessPath::IndexSeek {
            index: "i".to_string()
        }
    );
    let mut rows = Vec::new();
    while let Some(row) = reader.next_row().unwrap() {
        assert_eq!(row.get_int64(1), Some(42));
        rows.push(row.row_id().unwrap());
    }
    assert_eq!(rows.len(), 100);
    assert!(rows.windows(2).all(|w| w[0] < w[1]));

    // Without an index the same filter scans the table.
    let filter = Filter::eq("id", 5i64);
    let reader = db.create_reader_with_filter("u", &filter).unwrap();
    assert_eq!(reader.explain(), &sharc::AccessPath::TableScan);

    db.verify_integrity().unwrap();
}

#[test]
fn test_index_reader_seek_key() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seekkey.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE u (id INTEGER PRIMARY KEY, name TEXT)")
        .unwrap();
    txn.execute("CREATE UNIQUE INDEX by_name ON u(name)").unwrap();
    for (id, name) in [(1i64, "ada"), (2, "grace"), (3, "edsger")] {
        txn.insert("u", &[SqlValue::Int(id), SqlValue::from(name)])
            .unwrap();
    }
    txn.commit().unwrap();

    let mut reader = db.create_index_reader("by_name").unwrap();
    let row = reader
        .seek_key(&[SqlValue::from("grace")])
        .unwrap()
        .expect("grace exists");
    assert_eq!(row.row_id(), Some(2));
    assert!(reader.seek_key(&[SqlValue::from("nobody")]).unwrap().is_none());
}

#[test]
fn test_unique_violation_poisons_transaction() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unique.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE u (id INTEGER PRIMARY KEY, email TEXT)")
        .unwrap();
    txn.execute("CREATE UNIQUE INDEX ue ON u(email)").unwrap();
    txn.insert("u", &[SqlValue::Null, SqlValue::from("a@x")]).unwrap();
    txn.commit().unwrap();

    let mut txn = db.begin_transaction().unwrap();
    let err = txn
        .insert("u", &[SqlValue::Null, SqlValue::from("a@x")])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Schema(sharc::schema::Error::UniqueViolation(_))
    ));
    // Rollback-only from here.
    let err = txn
        .insert("u", &[SqlValue::Null, SqlValue::from("b@x")])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(TransactionError::RollbackOnly)
    ));
    assert!(matches!(
        txn.commit().unwrap_err(),
        Error::Transaction(TransactionError::RollbackOnly)
    ));
}

#[test]
fn test_update_delete_and_index_maintenance() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upd.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE u (id INTEGER PRIMARY KEY, age INTEGER)")
        .unwrap();
    txn.execute("CREATE INDEX ia ON u(age)").unwrap();
    for i in 0..500i64 {
        txn.insert("u", &[SqlValue::Int(i + 1), SqlValue::Int(i % 50)])
            .unwrap();
    }
    // Move one row from age 7 to age 777, delete all of age 9.
    txn.update("u", 8, &[SqlValue::Int(8), SqlValue::Int(777)])
        .unwrap();
    let deleted = txn.delete_where("u", &Filter::eq("age", 9i64)).unwrap();
    assert_eq!(deleted, 10);
    txn.commit().unwrap();

    let mut reader = db
        .create_reader_with_filter("u", &Filter::eq("age", 777i64))
        .unwrap();
    let row = reader.next_row().unwrap().unwrap();
    assert_eq!(row.row_id(), Some(8));
    assert!(reader.next_row().unwrap().is_none());

    let mut reader = db
        .create_reader_with_filter("u", &Filter::eq("age", 9i64))
        .unwrap();
    assert!(reader.next_row().unwrap().is_none());

    db.verify_integrity().unwrap();
}

#[test]
fn test_column_projection() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("projection.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE u (id INTEGER PRIMARY KEY, age INTEGER, name TEXT)")
        .unwrap();
    txn.insert(
        "u",
        &[SqlValue::Int(1), SqlValue::Int(30), SqlValue::from("ada")],
    )
    .unwrap();
    txn.commit().unwrap();

    let mut reader = db
        .create_reader_with_columns("u", &["name", "id"])
        .unwrap();
    let row = reader.next_row().unwrap().unwrap();
    assert_eq!(row.len(), 2);
    assert_eq!(row.get_string(0), Some("ada"));
    assert_eq!(row.get_int64(1), Some(1));

    assert!(db.create_reader_with_columns("u", &["nope"]).is_err());
}

#[test]
fn test_upsert() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upsert.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    txn.upsert("t", 5, &[SqlValue::Int(5), SqlValue::from("first")])
        .unwrap();
    txn.upsert("t", 5, &[SqlValue::Int(5), SqlValue::from("second")])
        .unwrap();
    txn.commit().unwrap();

    let mut reader = db.create_reader("t").unwrap();
    let row = reader.seek(5).unwrap().unwrap();
    assert_eq!(row.get_string(1), Some("second"));
    assert!(reader.next_row().unwrap().is_some());
    assert!(reader.next_row().unwrap().is_none());
}

#[test]
fn test_without_rowid_table() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worowid.db");

    let mut db = Database::create(&path, opts().page_size(512)).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID")
        .unwrap();
    // Enough rows to split the keyed tree.
    for i in 0..500i64 {
        txn.insert(
            "kv",
            &[
                SqlValue::Text(format!("key-{:05}", i)),
                SqlValue::Text(format!("value {}", i)),
            ],
        )
        .unwrap();
    }
    txn.commit().unwrap();

    let mut reader = db.create_reader("kv").unwrap();
    let mut keys = Vec::new();
    while let Some(row) = reader.next_row().unwrap() {
        assert_eq!(row.row_id(), None);
        keys.push(row.get_string(0).unwrap().to_string());
    }
    assert_eq!(keys.len(), 500);
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    // Duplicate primary keys are refused; deletes rebalance back down.
    let mut txn = db.begin_transaction().unwrap();
    let err = txn
        .insert(
            "kv",
            &[SqlValue::from("key-00000"), SqlValue::from("dup")],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Schema(sharc::schema::Error::UniqueViolation(_))
    ));
    txn.rollback().unwrap();

    let mut txn = db.begin_transaction().unwrap();
    let gone = txn.delete_where("kv", &Filter::new()).unwrap();
    assert_eq!(gone, 500);
    txn.commit().unwrap();
    let mut reader = db.create_reader("kv").unwrap();
    assert!(reader.next_row().unwrap().is_none());
}

#[test]
fn test_ddl_lifecycle_and_freelist_reuse() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ddl.db");

    let mut db = Database::create(&path, opts().page_size(512)).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE big (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    for i in 0..500i64 {
        txn.insert("big", &[SqlValue::Int(i + 1), SqlValue::Text("x".repeat(40))])
            .unwrap();
    }
    txn.execute("CREATE VIEW v AS SELECT id FROM big").unwrap();
    txn.commit().unwrap();

    let len_before_drop = std::fs::metadata(&path).unwrap().len();

    // Dropping the table frees its pages into the freelist; the file does
    // not shrink, and a recreated table reuses those pages.
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("DROP TABLE big").unwrap();
    txn.commit().unwrap();
    let report = db.verify_integrity().unwrap();
    assert!(report.freelist_pages > 0);
    assert!(db.schema().table("big").is_none());
    assert!(db.schema().view("v").is_some());

    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE big2 (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    for i in 0..500i64 {
        txn.insert("big2", &[SqlValue::Int(i + 1), SqlValue::Text("y".repeat(40))])
            .unwrap();
    }
    txn.commit().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before_drop);

    // The catalog survives a reopen.
    drop(db);
    let db = Database::open(&path, DatabaseOptions::default()).unwrap();
    assert!(db.schema().table("big2").is_some());
    assert!(db.schema().view("v").is_some());
    assert_eq!(db.schema().view("v").unwrap().sql, "CREATE VIEW v AS SELECT id FROM big");
}

#[test]
fn test_memory_journal_mode() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memjournal.db");

    let mut db = Database::create(
        &path,
        opts().journal_mode(JournalMode::Memory),
    )
    .unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
    txn.insert("t", &[SqlValue::Int(1)]).unwrap();
    // No journal file even while the transaction is open.
    assert!(!sharc::journal::journal_path(&path).exists());
    txn.commit().unwrap();

    let mut reader = db.create_reader("t").unwrap();
    assert!(reader.next_row().unwrap().is_some());
}

#[test]
fn test_tiny_cache_still_correct() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache1.db");

    let mut db = Database::create(&path, opts().page_size(512).cache_size_pages(1)).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    for i in 0..300i64 {
        txn.insert("t", &[SqlValue::Int(i + 1), SqlValue::Text(format!("row {}", i))])
            .unwrap();
    }
    txn.commit().unwrap();

    let mut reader = db.create_reader("t").unwrap();
    let mut count = 0i64;
    while let Some(row) = reader.next_row().unwrap() {
        count += 1;
        assert_eq!(row.row_id(), Some(count));
    }
    assert_eq!(count, 300);
    db.verify_integrity().unwrap();
}

#[test]
fn test_writer_lock_excludes_second_writer() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
    txn.commit().unwrap();

    let mut db2 = Database::open(
        &path,
        opts().lock_timeout(std::time::Duration::from_millis(50)),
    )
    .unwrap();

    let txn = db.begin_transaction().unwrap();
    assert!(matches!(
        db2.begin_transaction().unwrap_err(),
        Error::Lock(sharc::locks::Error::Timeout)
    ));
    drop(txn);
    assert!(db2.begin_transaction().is_ok());
}

#[test]
fn test_data_version_increases_per_commit() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("version.db");

    let mut db = Database::create(&path, opts()).unwrap();
    let v0 = db.data_version().unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
    txn.commit().unwrap();
    let v1 = db.data_version().unwrap();
    assert!(v1 > v0);
    let mut txn = db.begin_transaction().unwrap();
    txn.insert("t", &[SqlValue::Int(1)]).unwrap();
    txn.commit().unwrap();
    assert!(db.data_version().unwrap() > v1);
}

#[test]
fn test_plain_file_has_sqlite_layout() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.db");

    let mut db = Database::create(&path, opts().page_size(4096)).unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.execute("CREATE TABLE t (a INT)").unwrap();
    txn.commit().unwrap();
    drop(db);

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..16], b"SQLite format 3\0");
    // Page size field and page count match the file.
    assert_eq!(u16::from_be_bytes([raw[16], raw[17]]), 4096);
    let pages = u32::from_be_bytes([raw[28], raw[29], raw[30], raw[31]]);
    assert_eq!(raw.len() as u32, pages * 4096);
    // Page 2 (the table root) is an empty table leaf.
    assert_eq!(raw[4096], 0x0d);
}
