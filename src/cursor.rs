//! Cursor: a stack of `(branch pgno, child index)` frames from root to leaf,
//! plus the current slot index within that leaf (§4.7).
//!
//! `next`/`prev` share one sibling-walk: pop frames until an ancestor has
//! room to move in the requested direction, then redescend picking the
//! leftmost or rightmost child at each level, mirroring `btree_sibling` in
//! the original C (`examples/original_source/src/3rdparty/btree/src/btree.cpp`).
//! Unlike that implementation's intrusive page-ref stack, this one just
//! carries pgnos and re-fetches through the shared cache on every step.

use crate::cache::PageCache;
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::file::Pager;
use crate::page::branch::BranchPage;
use crate::page::header::{page_flags, PageFlags};
use crate::page::leaf::LeafPage;
use crate::tree::{branch_child_index_for_key, fetch_page, read_value};

#[derive(Debug, Clone, Copy)]
struct Frame {
    branch_pgno: u32,
    child_idx: usize,
    num_children: usize,
}

/// Positioned at a leaf slot once `initialized` is set; `eof` once a
/// `next`/`prev` walks off either end.
pub struct Cursor<'e> {
    pager: &'e mut Pager,
    cache: &'e mut PageCache,
    comparator: &'e dyn Comparator,
    root: u32,
    stack: Vec<Frame>,
    leaf_pgno: u32,
    leaf_idx: usize,
    leaf_len: usize,
    initialized: bool,
    eof: bool,
}

impl<'e> Cursor<'e> {
    pub fn new(pager: &'e mut Pager, cache: &'e mut PageCache, comparator: &'e dyn Comparator, root: u32) -> Self {
        Self {
            pager,
            cache,
            comparator,
            root,
            stack: Vec::new(),
            leaf_pgno: 0,
            leaf_idx: 0,
            leaf_len: 0,
            initialized: false,
            eof: false,
        }
    }

    pub fn first(&mut self) -> Result<bool> {
        self.descend_edge(false)
    }

    pub fn last(&mut self) -> Result<bool> {
        self.descend_edge(true)
    }

    /// Position on the smallest key >= `key`. Returns `false` (eof) if no
    /// such key exists.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.descend_seek(key)?;
        if self.eof {
            return Ok(false);
        }
        let current = self.current_key()?;
        if self.comparator.cmp(&current, key) == std::cmp::Ordering::Less {
            return self.next();
        }
        Ok(true)
    }

    /// Position exactly on `key`, or fail `NotFound`.
    pub fn seek_exact(&mut self, key: &[u8]) -> Result<()> {
        self.descend_seek(key)?;
        if self.eof {
            return Err(Error::NotFound);
        }
        let current = self.current_key()?;
        if current != key {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn next(&mut self) -> Result<bool> {
        if !self.initialized || self.eof {
            return self.first();
        }
        if self.leaf_idx + 1 < self.leaf_len {
            self.leaf_idx += 1;
            return Ok(true);
        }
        self.move_to_sibling(true, false)
    }

    pub fn prev(&mut self) -> Result<bool> {
        if !self.initialized || self.eof {
            return self.last();
        }
        if self.leaf_idx > 0 {
            self.leaf_idx -= 1;
            return Ok(true);
        }
        self.move_to_sibling(false, true)
    }

    /// Read the key and value at the current position.
    pub fn get(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        if !self.initialized || self.eof {
            return Err(Error::NotFound);
        }
        let mut buf = fetch_page(self.pager, self.cache, self.leaf_pgno)?;
        let leaf = LeafPage::attach(&mut buf)?;
        let rec = leaf.record_at(self.leaf_idx);
        let mut key = leaf.common_prefix().to_vec();
        key.extend_from_slice(rec.key_suffix);
        let (dsize, overflow_pgno, data) = (rec.dsize, rec.overflow_pgno(), rec.data);
        let value = read_value(self.pager, self.cache, dsize as usize, overflow_pgno, data)?;
        Ok((key, value))
    }

    pub fn close(self) {
        // The stack holds only pgnos, not borrowed page refs; dropping it
        // is enough, there is nothing to unpin.
    }

    fn current_key(&mut self) -> Result<Vec<u8>> {
        let mut buf = fetch_page(self.pager, self.cache, self.leaf_pgno)?;
        let leaf = LeafPage::attach(&mut buf)?;
        let rec = leaf.record_at(self.leaf_idx);
        let mut key = leaf.common_prefix().to_vec();
        key.extend_from_slice(rec.key_suffix);
        Ok(key)
    }

    fn descend_edge(&mut self, rightmost: bool) -> Result<bool> {
        self.stack.clear();
        self.initialized = true;
        self.eof = false;
        if self.root == 0 {
            self.eof = true;
            return Ok(false);
        }
        let mut pgno = self.root;
        loop {
            let mut buf = fetch_page(self.pager, self.cache, pgno)?;
            match page_flags(&buf)? {
                PageFlags::Leaf => {
                    let leaf = LeafPage::attach(&mut buf)?;
                    self.leaf_pgno = pgno;
                    self.leaf_len = leaf.num_slots();
                    if self.leaf_len == 0 {
                        self.eof = true;
                        return Ok(false);
                    }
                    self.leaf_idx = if rightmost { self.leaf_len - 1 } else { 0 };
                    return Ok(true);
                }
                PageFlags::Branch => {
                    let page = BranchPage::attach(&mut buf)?;
                    let n = page.num_slots();
                    let idx = if rightmost { n - 1 } else { 0 };
                    self.stack.push(Frame {
                        branch_pgno: pgno,
                        child_idx: idx,
                        num_children: n,
                    });
                    pgno = page.child_at(idx);
                }
                other => return Err(Error::corrupt(format!("unexpected page kind in descent: {other:?}"))),
            }
        }
    }

    fn descend_seek(&mut self, key: &[u8]) -> Result<()> {
        self.stack.clear();
        self.initialized = true;
        self.eof = false;
        if self.root == 0 {
            self.eof = true;
            return Ok(());
        }
        let mut pgno = self.root;
        loop {
            let mut buf = fetch_page(self.pager, self.cache, pgno)?;
            match page_flags(&buf)? {
                PageFlags::Leaf => {
                    let leaf = LeafPage::attach(&mut buf)?;
                    self.leaf_pgno = pgno;
                    self.leaf_len = leaf.num_slots();
                    self.leaf_idx = match leaf.search(key) {
                        Ok(idx) => idx,
                        Err(idx) => idx,
                    };
                    if self.leaf_idx >= self.leaf_len {
                        // no key >= `key` on this leaf: move to the next leaf's
                        // first key, if any.
                        self.leaf_idx = self.leaf_len.saturating_sub(1);
                        if self.leaf_len == 0 || !self.move_to_sibling(true, false)? {
                            self.eof = true;
                        }
                    }
                    return Ok(());
                }
                PageFlags::Branch => {
                    let page = BranchPage::attach(&mut buf)?;
                    let n = page.num_slots();
                    let idx = branch_child_index_for_key(&page, key, self.comparator);
                    self.stack.push(Frame {
                        branch_pgno: pgno,
                        child_idx: idx,
                        num_children: n,
                    });
                    pgno = page.child_at(idx);
                }
                other => return Err(Error::corrupt(format!("unexpected page kind in descent: {other:?}"))),
            }
        }
    }

    /// Shared sibling walk for `next` (move_right=true) and `prev`
    /// (move_right=false). `rightmost` selects which edge of each
    /// redescended subtree to land on.
    fn move_to_sibling(&mut self, move_right: bool, rightmost: bool) -> Result<bool> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.eof = true;
                return Ok(false);
            };
            let can_advance = if move_right {
                frame.child_idx + 1 < frame.num_children
            } else {
                frame.child_idx > 0
            };
            if can_advance {
                if move_right {
                    frame.child_idx += 1;
                } else {
                    frame.child_idx -= 1;
                }
                break;
            }
            self.stack.pop();
        }

        let mut pgno = {
            let frame = *self.stack.last().unwrap();
            let mut buf = fetch_page(self.pager, self.cache, frame.branch_pgno)?;
            let page = BranchPage::attach(&mut buf)?;
            page.child_at(frame.child_idx)
        };

        loop {
            let mut buf = fetch_page(self.pager, self.cache, pgno)?;
            match page_flags(&buf)? {
                PageFlags::Leaf => {
                    let leaf = LeafPage::attach(&mut buf)?;
                    self.leaf_pgno = pgno;
                    self.leaf_len = leaf.num_slots();
                    self.leaf_idx = if rightmost { self.leaf_len.saturating_sub(1) } else { 0 };
                    return Ok(true);
                }
                PageFlags::Branch => {
                    let page = BranchPage::attach(&mut buf)?;
                    let n = page.num_slots();
                    let idx = if rightmost { n - 1 } else { 0 };
                    self.stack.push(Frame {
                        branch_pgno: pgno,
                        child_idx: idx,
                        num_children: n,
                    });
                    pgno = page.child_at(idx);
                }
                other => return Err(Error::corrupt(format!("unexpected page kind in descent: {other:?}"))),
            }
        }
    }
}
