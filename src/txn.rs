//! Write-transaction state: copy-on-write page tracking and commit/abort
//! (§4.1, §5).
//!
//! A write transaction never mutates a page already on disk. Touching a
//! page for the first time allocates a fresh pgno, clones the page's
//! current bytes into it, and records the clone in `dirty`; all later
//! mutation within the transaction happens on that clone. Nothing is
//! appended to the file until `commit`, which writes every dirty page (in
//! pgno order, so the layout stays a valid forward scan) followed by one
//! new meta page whose `prev_meta` links back to the transaction's base
//! snapshot.

use crate::cache::PageCache;
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::file::Pager;
use crate::meta::{meta_flags, Meta};
use crate::options::{EngineFlags, PutFlags};
use std::collections::BTreeMap;

pub struct WriteTxn<'e> {
    pager: &'e mut Pager,
    cache: &'e mut PageCache,
    comparator: &'e dyn Comparator,
    flags: EngineFlags,
    checksum_enabled: bool,
    base_meta: Meta,
    dirty: BTreeMap<u32, Vec<u8>>,
    next_pgno: u32,
    pub root: u32,
    pub depth: u32,
    pub entry_count: u64,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    tag: u64,
    failed: bool,
}

impl<'e> WriteTxn<'e> {
    pub fn begin(
        pager: &'e mut Pager,
        cache: &'e mut PageCache,
        comparator: &'e dyn Comparator,
        flags: EngineFlags,
        checksum_enabled: bool,
        base_meta: Meta,
        tag: u64,
    ) -> Self {
        let next_pgno = pager.next_pgno();
        Self {
            pager,
            cache,
            comparator,
            flags,
            checksum_enabled,
            root: base_meta.root,
            depth: base_meta.depth,
            entry_count: base_meta.entry_count,
            branch_pages: base_meta.branch_pages,
            leaf_pages: base_meta.leaf_pages,
            overflow_pages: base_meta.overflow_pages,
            base_meta,
            dirty: BTreeMap::new(),
            next_pgno,
            tag,
            failed: false,
        }
    }

    pub fn comparator(&self) -> &dyn Comparator {
        self.comparator
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size as usize
    }

    pub fn max_key_size(&self) -> u16 {
        self.pager.max_key_size
    }

    pub fn checksum_enabled(&self) -> bool {
        self.checksum_enabled
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Read against this transaction's in-progress tree (its own writes
    /// included, even before commit).
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        crate::tree::get_in_txn(self, key)
    }

    /// Insert/overwrite `key` within this transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        crate::tree::insert(self, key, value, flags)
    }

    /// Delete `key` within this transaction. Returns whether it was present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        crate::tree::delete(self, key)
    }

    /// Allocate a brand-new page (not a copy of an existing one), e.g. for
    /// a split's new sibling.
    pub fn alloc_page(&mut self) -> (u32, &mut Vec<u8>) {
        let pgno = self.next_pgno;
        self.next_pgno += 1;
        let page = vec![0u8; self.pager.page_size as usize];
        self.dirty.insert(pgno, page);
        (pgno, self.dirty.get_mut(&pgno).expect("just inserted"))
    }

    /// Read a page's current bytes (dirty copy if touched this txn,
    /// otherwise load from cache/disk).
    pub fn read_page(&mut self, pgno: u32) -> Result<Vec<u8>> {
        if let Some(buf) = self.dirty.get(&pgno) {
            return Ok(buf.clone());
        }
        if let Some(entry) = self.cache.get(pgno) {
            return Ok(entry.payload.clone());
        }
        let buf = self.pager.read_page(pgno)?;
        self.cache.evict_if_full();
        self.cache.insert(pgno, buf.clone());
        Ok(buf)
    }

    /// Copy-on-write "touch": if `pgno` predates this transaction, allocate
    /// a fresh pgno, clone its bytes, and return that new pgno plus a
    /// mutable handle. If `pgno` was already touched this transaction, it
    /// is reused in place (no re-allocation).
    pub fn pin_page_mut(&mut self, pgno: u32) -> Result<u32> {
        if self.dirty.contains_key(&pgno) {
            return Ok(pgno);
        }
        let mut original = self.read_page(pgno)?;
        let new_pgno = self.next_pgno;
        self.next_pgno += 1;
        crate::page::header::write_pgno(&mut original, new_pgno)?;
        self.dirty.insert(new_pgno, original);
        Ok(new_pgno)
    }

    pub fn page_mut(&mut self, pgno: u32) -> Result<&mut Vec<u8>> {
        self.dirty
            .get_mut(&pgno)
            .ok_or_else(|| Error::corrupt(format!("pgno {pgno} is not dirty in this transaction")))
    }

    pub fn page_ref(&self, pgno: u32) -> Option<&Vec<u8>> {
        self.dirty.get(&pgno)
    }

    /// Append every dirty page (in pgno order) and a closing meta page.
    /// Returns the newly committed meta.
    pub fn commit(mut self) -> Result<Meta> {
        if self.failed {
            return Err(Error::corrupt("transaction is in the ERROR state, must abort"));
        }
        let pages: Vec<Vec<u8>> = self.dirty.values().cloned().collect();
        if let Some((&first_pgno, _)) = self.dirty.iter().next() {
            self.pager.append_pages(first_pgno, &pages)?;
        }

        let meta_pgno = self.pager.alloc_pgno();
        let mut new_meta = self.base_meta.next(meta_pgno);
        new_meta.root = self.root;
        new_meta.depth = self.depth;
        new_meta.entry_count = self.entry_count;
        new_meta.branch_pages = self.branch_pages;
        new_meta.leaf_pages = self.leaf_pages;
        new_meta.overflow_pages = self.overflow_pages;
        new_meta.tag = self.tag;

        let mut meta_buf = vec![0u8; self.pager.page_size as usize];
        new_meta.encode(&mut meta_buf, self.checksum_enabled)?;
        self.pager.append_pages(meta_pgno, &[meta_buf])?;

        if !self.flags.contains(EngineFlags::NO_SYNC) {
            self.pager.sync()?;
        }

        for (pgno, buf) in self.dirty {
            self.cache.evict_if_full();
            self.cache.insert(pgno, buf);
        }

        Ok(new_meta)
    }

    pub fn abort(self) {
        // Nothing was appended to the file; dropping the dirty map is enough.
    }
}
