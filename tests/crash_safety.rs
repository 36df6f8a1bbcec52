use btcow::{Engine, Error, OpenOptions, PutFlags};
use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

#[test]
fn rollback_after_two_commits_restores_the_first() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("g.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    engine.put(b"k", b"a", PutFlags::empty()).unwrap();
    engine.put(b"k", b"b", PutFlags::empty()).unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"b".to_vec()));

    engine.rollback().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"a".to_vec()));
}

#[test]
fn revert_after_two_commits_restores_the_first() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("h.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    engine.put(b"k", b"a", PutFlags::empty()).unwrap();
    engine.put(b"k", b"b", PutFlags::empty()).unwrap();

    engine.revert().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"a".to_vec()));
}

#[test]
fn compact_preserves_reads_and_shrinks_or_holds_steady() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("i.btcow");
    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    for i in 0..50u32 {
        let key = format!("k{i:03}");
        engine.put(key.as_bytes(), b"value", PutFlags::empty()).unwrap();
    }
    for i in (0..50u32).step_by(2) {
        let key = format!("k{i:03}");
        engine.del(key.as_bytes()).unwrap();
    }
    let before_tag = engine.stat().tag;
    engine.compact(&OpenOptions::new()).unwrap();
    assert_eq!(engine.stat().tag, before_tag);
    for i in (1..50u32).step_by(2) {
        let key = format!("k{i:03}");
        assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(b"value".to_vec()));
    }
    for i in (0..50u32).step_by(2) {
        let key = format!("k{i:03}");
        assert_eq!(engine.get(key.as_bytes()).unwrap(), None);
    }
}

/// Truncating the file back to a prior MARKER meta and reopening should
/// surface exactly that meta's tree, never the discarded commit beyond it.
#[test]
fn truncated_file_reopens_to_latest_surviving_meta() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("j.btcow");
    let len_after_first;
    {
        let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
        engine.put(b"k", b"a", PutFlags::empty()).unwrap();
        len_after_first = std::fs::metadata(&path).unwrap().len();
        engine.put(b"k", b"b", PutFlags::empty()).unwrap();
    }

    let file = FsOpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len_after_first).unwrap();
    drop(file);

    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"a".to_vec()));
}

/// Flipping a byte inside the leaf page's record heap on disk must surface
/// as a checksum-mismatch `Corrupt` error on the next read through `get`,
/// not silently decode whatever garbage is there.
#[test]
fn corrupted_leaf_page_is_reported_as_corrupt_not_silently_decoded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("k.btcow");
    let page_size;
    {
        let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
        engine.put(b"k", b"a", PutFlags::empty()).unwrap();
        page_size = engine.stat().page_size as u64;
    }

    // Page 0 is the head page; page 1 is the first page written by the
    // only commit so far, the leaf holding "k". Flip the last byte of its
    // record heap, which the checksum always covers.
    let leaf_offset = page_size;
    let mut file = FsOpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(leaf_offset + page_size - 1)).unwrap();
    let mut last_byte = [0u8; 1];
    std::io::Read::read_exact(&mut file, &mut last_byte).unwrap();
    file.seek(SeekFrom::Start(leaf_offset + page_size - 1)).unwrap();
    file.write_all(&[last_byte[0] ^ 0xFF]).unwrap();
    drop(file);

    let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
    let err = engine.get(b"k").unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "expected Corrupt, got {err:?}");
}
