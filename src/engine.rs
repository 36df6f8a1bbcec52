//! Top-level engine facade (§6): owns the pager, page cache, active
//! comparator, and the current committed meta, and wires them into
//! `tree`/`cursor`/`maintenance` for callers who don't want to manage a
//! [`WriteTxn`] by hand.

use std::path::Path;

use log::{debug, warn};

use crate::cache::{PageCache, PageCacheConfig};
use crate::comparator::{Comparator, ForwardComparator, ReverseComparator};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::file::Pager;
use crate::meta::{read_meta, read_meta_with_tag, Meta};
use crate::options::{EngineFlags, OpenOptions, PutFlags};
use crate::txn::WriteTxn;

/// A resolved historical meta, obtained via [`Engine::snapshot`]. Lets a
/// caller read against an older tag while the engine keeps moving forward.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    meta: Meta,
}

impl Snapshot {
    pub fn tag(&self) -> u64 {
        self.meta.tag
    }
}

/// Fill statistics read off the current meta (§6, `stat()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub depth: u32,
    pub entry_count: u64,
    pub page_size: u32,
    pub tag: u64,
    pub revision: u64,
}

pub struct Engine {
    pager: Pager,
    cache: PageCache,
    comparator: Box<dyn Comparator>,
    flags: EngineFlags,
    checksum_enabled: bool,
    meta: Meta,
}

impl Engine {
    /// Open the file at `path`, creating it with `opts` if it doesn't exist
    /// yet. Fails with [`Error::Stale`] if the newest page reachable at the
    /// tail of the file is a tombstoned meta, meaning this path was already
    /// replaced by a [`Engine::compact`]/[`Engine::clear`] from another
    /// handle.
    pub fn open(path: &Path, opts: OpenOptions) -> Result<Self> {
        let checksum_enabled = !opts.flags.contains(EngineFlags::NO_PG_CHECKSUM);
        let mut pager = if path.exists() {
            Pager::open(path, checksum_enabled, opts.flags.contains(EngineFlags::READ_ONLY))?
        } else {
            Pager::create(path, &opts)?
        };

        let meta = if pager.next_pgno() > 1 {
            let tail_pgno = pager.next_pgno() - 1;
            let tail_buf = pager.read_page(tail_pgno)?;
            if let Ok(tail_meta) = Meta::decode(&tail_buf, checksum_enabled) {
                if tail_meta.is_tombstoned() {
                    warn!("btcow: {} ends in a tombstoned meta, refusing to open", path.display());
                    return Err(Error::Stale);
                }
            }
            read_meta(tail_pgno, checksum_enabled, |pgno| pager.read_page(pgno))?
        } else {
            Meta::empty(0, pager.page_size)
        };

        let comparator: Box<dyn Comparator> = if opts.flags.contains(EngineFlags::REVERSE_KEY) {
            Box::new(ReverseComparator)
        } else {
            Box::new(ForwardComparator)
        };

        debug!("btcow: opened {} at tag {} revision {}", path.display(), meta.tag, meta.revision);

        Ok(Self {
            pager,
            cache: PageCache::new(PageCacheConfig {
                capacity_pages: opts.cache_capacity_pages,
            }),
            comparator,
            flags: opts.flags,
            checksum_enabled,
            meta,
        })
    }

    pub fn close(self) {}

    /// Force the current file contents to disk. A no-op beyond the fsync
    /// already performed by every non-`NO_SYNC` commit.
    pub fn sync(&mut self) -> Result<()> {
        self.pager.sync()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.flags.contains(EngineFlags::READ_ONLY) {
            return Err(Error::invalid_arg("engine was opened read-only"));
        }
        Ok(())
    }

    /// Begin an explicit write transaction against the current snapshot.
    /// Only one can be outstanding at a time per handle; that's enforced by
    /// the borrow checker, since the returned [`WriteTxn`] holds `&mut self`
    /// fields for its whole lifetime.
    pub fn begin_txn(&mut self) -> Result<WriteTxn<'_>> {
        self.begin_txn_with_tag(self.meta.tag)
    }

    pub fn begin_txn_with_tag(&mut self, tag: u64) -> Result<WriteTxn<'_>> {
        self.ensure_writable()?;
        let comparator = self.comparator.as_ref();
        Ok(WriteTxn::begin(
            &mut self.pager,
            &mut self.cache,
            comparator,
            self.flags,
            self.checksum_enabled,
            self.meta,
            tag,
        ))
    }

    /// Commit a transaction opened with [`Engine::begin_txn`], adopting its
    /// new meta as the engine's current snapshot.
    pub fn commit(&mut self, txn: WriteTxn<'_>) -> Result<()> {
        self.meta = txn.commit()?;
        debug!("btcow: committed revision {} (tag {})", self.meta.revision, self.meta.tag);
        Ok(())
    }

    pub fn abort(&mut self, txn: WriteTxn<'_>) {
        txn.abort();
    }

    /// Non-transactional convenience read against the current snapshot.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        crate::tree::get(&mut self.pager, &mut self.cache, self.meta.root, self.comparator.as_ref(), key)
    }

    /// Non-transactional convenience write: opens a single-operation
    /// transaction, inserts, and commits it.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        let mut txn = self.begin_txn()?;
        match crate::tree::insert(&mut txn, key, value, flags) {
            Ok(()) => {
                self.meta = txn.commit()?;
                Ok(())
            }
            Err(e) => {
                txn.mark_failed();
                txn.abort();
                Err(e)
            }
        }
    }

    /// Non-transactional convenience delete. Returns whether the key was
    /// present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let mut txn = self.begin_txn()?;
        match crate::tree::delete(&mut txn, key) {
            Ok(found) => {
                self.meta = txn.commit()?;
                Ok(found)
            }
            Err(e) => {
                txn.mark_failed();
                txn.abort();
                Err(e)
            }
        }
    }

    /// A read-only cursor positioned against the current snapshot.
    pub fn cursor_open(&mut self) -> Cursor<'_> {
        Cursor::new(&mut self.pager, &mut self.cache, self.comparator.as_ref(), self.meta.root)
    }

    /// Resolve `tag` to a historical meta by walking the `prev_meta` chain
    /// back from the current snapshot.
    pub fn snapshot(&mut self, tag: u64) -> Result<Snapshot> {
        if self.meta.tag == tag {
            return Ok(Snapshot { meta: self.meta });
        }
        let meta = read_meta_with_tag(&self.meta, tag, self.checksum_enabled, |pgno| self.pager.read_page(pgno))?;
        Ok(Snapshot { meta })
    }

    pub fn get_at(&mut self, snapshot: &Snapshot, key: &[u8]) -> Result<Option<Vec<u8>>> {
        crate::tree::get(&mut self.pager, &mut self.cache, snapshot.meta.root, self.comparator.as_ref(), key)
    }

    pub fn cursor_open_at(&mut self, snapshot: &Snapshot) -> Cursor<'_> {
        Cursor::new(&mut self.pager, &mut self.cache, self.comparator.as_ref(), snapshot.meta.root)
    }

    /// Rewrite the file with every live page renumbered and packed
    /// contiguously, dropping everything unreachable from the current
    /// snapshot (old tags, deleted keys' freed pages). Invalidates every
    /// [`Snapshot`] taken before the call.
    pub fn compact(&mut self, opts: &OpenOptions) -> Result<()> {
        self.ensure_writable()?;
        let (pager, meta) = crate::maintenance::compact(&mut self.pager, &mut self.cache, &self.meta, self.checksum_enabled, opts)?;
        self.pager = pager;
        self.meta = meta;
        self.cache = PageCache::new(PageCacheConfig {
            capacity_pages: self.cache.capacity(),
        });
        debug!("btcow: compacted, {} live leaf pages", self.meta.leaf_pages);
        Ok(())
    }

    /// Replace the file's contents with an empty tree, keeping the same
    /// path and page size.
    pub fn clear(&mut self, opts: &OpenOptions) -> Result<()> {
        self.ensure_writable()?;
        let (pager, meta) = crate::maintenance::clear(&mut self.pager, &self.meta, self.checksum_enabled, opts)?;
        self.pager = pager;
        self.meta = meta;
        self.cache = PageCache::new(PageCacheConfig {
            capacity_pages: self.cache.capacity(),
        });
        Ok(())
    }

    /// Undo the most recent commit by truncating it off the file and
    /// re-deriving the current meta with a full distrustful backward scan.
    pub fn revert(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.meta = crate::maintenance::revert(&mut self.pager, &self.meta, self.checksum_enabled)?;
        self.cache = PageCache::new(PageCacheConfig {
            capacity_pages: self.cache.capacity(),
        });
        Ok(())
    }

    /// Undo the most recent commit by truncating it off the file and
    /// decoding `prev_meta` directly, without rescanning further back.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.meta = crate::maintenance::rollback(&mut self.pager, &self.meta, self.checksum_enabled)?;
        self.cache = PageCache::new(PageCacheConfig {
            capacity_pages: self.cache.capacity(),
        });
        Ok(())
    }

    /// Swap the active comparator. Per the comparator contract, anything
    /// but the two built-ins disables prefix compression from this point
    /// on (existing pages keep whatever prefix they already have).
    pub fn set_cmp(&mut self, comparator: Box<dyn Comparator>) {
        self.comparator = comparator;
    }

    /// Resize the page cache, discarding its current contents.
    pub fn set_cache_size(&mut self, pages: usize) {
        self.cache = PageCache::new(PageCacheConfig { capacity_pages: pages });
    }

    pub fn stat(&self) -> Stat {
        Stat {
            branch_pages: self.meta.branch_pages,
            leaf_pages: self.meta.leaf_pages,
            overflow_pages: self.meta.overflow_pages,
            depth: self.meta.depth,
            entry_count: self.meta.entry_count,
            page_size: self.pager.page_size,
            tag: self.meta.tag,
            revision: self.meta.revision,
        }
    }

    /// The smallest fill ratio among the tree's non-root leaf/branch pages
    /// (§8's fill floor), or `None` for an empty tree or one with only a
    /// root page. Walks the live tree on demand; meant for tests and manual
    /// inspection, not the hot path.
    pub fn min_non_root_fill_ratio(&mut self) -> Result<Option<f32>> {
        crate::maintenance::min_non_root_fill_ratio(&mut self.pager, &mut self.cache, self.meta.root)
    }

    pub fn path(&self) -> &Path {
        self.pager.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Engine {
        Engine::open(&dir.join("db.bt"), OpenOptions::new()).unwrap()
    }

    #[test]
    fn put_get_del_roundtrip() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        engine.put(b"a", b"1", PutFlags::empty()).unwrap();
        engine.put(b"b", b"2", PutFlags::empty()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(engine.del(b"a").unwrap());
        assert_eq!(engine.get(b"a").unwrap(), None);
    }

    #[test]
    fn reopen_sees_committed_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bt");
        {
            let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
            engine.put(b"k", b"v", PutFlags::empty()).unwrap();
        }
        let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn snapshot_reads_an_older_tag_after_further_commits() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        let mut txn = engine.begin_txn_with_tag(10).unwrap();
        crate::tree::insert(&mut txn, b"k", b"v1", PutFlags::empty()).unwrap();
        engine.commit(txn).unwrap();

        let mut txn = engine.begin_txn_with_tag(20).unwrap();
        crate::tree::insert(&mut txn, b"k", b"v2", PutFlags::empty()).unwrap();
        engine.commit(txn).unwrap();

        let snap = engine.snapshot(10).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(engine.get_at(&snap, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn reopening_after_clear_on_a_stale_handle_is_visible_elsewhere() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bt");
        let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
        engine.put(b"k", b"v", PutFlags::empty()).unwrap();
        engine.clear(&OpenOptions::new()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);

        let mut reopened = Engine::open(&path, OpenOptions::new()).unwrap();
        assert_eq!(reopened.get(b"k").unwrap(), None);
    }

    #[test]
    fn read_only_engine_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bt");
        Engine::open(&path, OpenOptions::new()).unwrap();
        let mut engine = Engine::open(&path, OpenOptions::new().flags(EngineFlags::READ_ONLY)).unwrap();
        assert!(matches!(engine.put(b"k", b"v", PutFlags::empty()), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn reopening_a_tombstoned_tail_fails_stale() {
        use crate::meta::meta_flags;

        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bt");
        {
            let mut engine = Engine::open(&path, OpenOptions::new()).unwrap();
            engine.put(b"k", b"v", PutFlags::empty()).unwrap();
        }

        // Hand-append a tombstoned meta page, mirroring what compact/clear
        // leave behind on an old handle's now-superseded inode.
        let mut pager = Pager::open(&path, true, false).unwrap();
        let pgno = pager.alloc_pgno();
        let mut meta = Meta::empty(pgno, pager.page_size);
        meta.meta_flags = meta_flags::MARKER | meta_flags::TOMBSTONE;
        let mut buf = vec![0u8; pager.page_size as usize];
        meta.encode(&mut buf, true).unwrap();
        pager.append_pages(pgno, &[buf]).unwrap();
        drop(pager);

        let err = Engine::open(&path, OpenOptions::new()).unwrap_err();
        assert!(matches!(err, Error::Stale));
    }
}
