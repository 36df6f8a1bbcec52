use btcow::{Engine, OpenOptions, PutFlags};
use tempfile::tempdir;

fn iterate_all(engine: &mut Engine) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = engine.cursor_open();
    let mut out = Vec::new();
    let mut has = cursor.first().unwrap();
    while has {
        out.push(cursor.get().unwrap());
        has = cursor.next().unwrap();
    }
    out
}

/// Scenario 1: create, insert, reopen.
#[test]
fn create_insert_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.btcow");
    {
        let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
        let mut txn = engine.begin_txn_with_tag(1).unwrap();
        txn.put(b"alpha", b"1", PutFlags::empty()).unwrap();
        txn.put(b"beta", b"2", PutFlags::empty()).unwrap();
        txn.put(b"gamma", b"3", PutFlags::empty()).unwrap();
        engine.commit(txn).unwrap();
    }

    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    let entries = iterate_all(&mut engine);
    assert_eq!(
        entries,
        vec![
            (b"alpha".to_vec(), b"1".to_vec()),
            (b"beta".to_vec(), b"2".to_vec()),
            (b"gamma".to_vec(), b"3".to_vec()),
        ]
    );
    let stat = engine.stat();
    assert_eq!(stat.entry_count, 3);
    assert_eq!(stat.tag, 1);
}

/// Scenario 2: split path. 1000 keys with 256-byte values push the tree past
/// a single leaf; every non-root page should still clear the fill floor.
#[test]
fn split_path_grows_depth() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("b.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    let mut txn = engine.begin_txn_with_tag(1).unwrap();
    let value = vec![0x42u8; 256];
    for i in 0..1000u32 {
        let key = format!("k{i:03}");
        txn.put(key.as_bytes(), &value, PutFlags::empty()).unwrap();
    }
    engine.commit(txn).unwrap();

    let stat = engine.stat();
    assert!(stat.depth >= 2, "expected depth >= 2, got {}", stat.depth);
    assert_eq!(stat.entry_count, 1000);
    let entries = iterate_all(&mut engine);
    assert_eq!(entries.len(), 1000);
}

/// Scenario 3: overflow. A 65536-byte value forces an overflow chain.
#[test]
fn overflow_value_round_trips_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("c.btcow");
    let big = vec![0xA5u8; 65_536];
    {
        let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
        engine.put(b"big", &big, PutFlags::empty()).unwrap();
    }
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    let got = engine.get(b"big").unwrap().unwrap();
    assert_eq!(got.len(), 65_536);
    assert!(got.iter().all(|&b| b == 0xA5));
    assert!(engine.stat().overflow_pages >= 1);
}

/// Scenario 4: snapshot by tag.
#[test]
fn snapshot_by_tag() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("d.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();

    let mut txn = engine.begin_txn_with_tag(10).unwrap();
    txn.put(b"x", b"v1", PutFlags::empty()).unwrap();
    engine.commit(txn).unwrap();

    let mut txn = engine.begin_txn_with_tag(11).unwrap();
    txn.put(b"x", b"v2", PutFlags::empty()).unwrap();
    engine.commit(txn).unwrap();

    let snap10 = engine.snapshot(10).unwrap();
    let snap11 = engine.snapshot(11).unwrap();
    assert_eq!(engine.get_at(&snap10, b"x").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.get_at(&snap11, b"x").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.get(b"x").unwrap(), Some(b"v2".to_vec()));
}

/// Scenario 5: NO_OVERWRITE rejects an existing key without touching it.
#[test]
fn no_overwrite_rejects_existing_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    engine.put(b"k", b"a", PutFlags::empty()).unwrap();
    let err = engine.put(b"k", b"b", PutFlags::NO_OVERWRITE).unwrap_err();
    assert!(matches!(err, btcow::Error::Exists));
    assert_eq!(engine.get(b"k").unwrap(), Some(b"a".to_vec()));
}

/// Scenario 6: rebalance to merge. Deleting every odd-indexed key out of 200
/// should leave iteration correct over the surviving 100 even keys.
#[test]
fn delete_every_other_key_leaves_the_rest_iterable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    let mut txn = engine.begin_txn_with_tag(1).unwrap();
    for i in 0..200u32 {
        let key = format!("n{i:04}");
        txn.put(key.as_bytes(), b"v", PutFlags::empty()).unwrap();
    }
    engine.commit(txn).unwrap();

    let mut txn = engine.begin_txn_with_tag(2).unwrap();
    for i in (1..200u32).step_by(2) {
        let key = format!("n{i:04}");
        assert!(txn.del(key.as_bytes()).unwrap());
    }
    engine.commit(txn).unwrap();

    let entries = iterate_all(&mut engine);
    let expected: Vec<Vec<u8>> = (0..200u32).step_by(2).map(|i| format!("n{i:04}").into_bytes()).collect();
    let got: Vec<Vec<u8>> = entries.into_iter().map(|(k, _)| k).collect();
    assert_eq!(got, expected);
    assert_eq!(engine.stat().entry_count, 100);

    if let Some(min_fill) = engine.min_non_root_fill_ratio().unwrap() {
        assert!(min_fill >= 0.25, "non-root page fell below the fill floor: {min_fill}");
    }
}
