//! Compact/clear/revert/rollback (§4.8): the maintenance operations that
//! mutate the file outside the normal append-only commit path.
//!
//! `compact` and `clear` both build a fresh file under a temp path and
//! atomically rename it over the original, mirroring `btree_compact` in
//! `examples/original_source/src/3rdparty/btree/src/btree.cpp`: walk the
//! live tree post-order (children renumbered and written before their
//! parent), write a closing MARKER meta that keeps the original tag, fsync,
//! rename, then stamp a TOMBSTONE meta into the orphaned original inode so
//! any reader still holding it open detects the replacement. `revert` and
//! `rollback` instead just truncate the existing file.

use crate::cache::PageCache;
use crate::error::{Error, Result};
use crate::file::Pager;
use crate::meta::{meta_flags, Meta};
use crate::options::OpenOptions;
use crate::page::branch::BranchPage;
use crate::page::header::{page_flags, PageFlags};
use crate::page::leaf::LeafPage;
use crate::page::overflow::OverflowPage;
use crate::tree::fetch_page;
use log::debug;
use std::path::{Path, PathBuf};

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".compact.tmp");
    path.with_file_name(name)
}

fn compact_overflow_chain(pager: &mut Pager, cache: &mut PageCache, pgno: u32, dest: &mut Pager, checksum_enabled: bool) -> Result<u32> {
    if pgno == 0 {
        return Ok(0);
    }
    let (next, payload) = {
        let mut buf = fetch_page(pager, cache, pgno)?;
        let page = OverflowPage::attach(&mut buf)?;
        (page.next_pgno()?, page.payload().to_vec())
    };
    let new_next = compact_overflow_chain(pager, cache, next, dest, checksum_enabled)?;
    let new_pgno = dest.alloc_pgno();
    let mut buf = vec![0u8; dest.page_size as usize];
    let mut page = OverflowPage::format(&mut buf, new_pgno, &payload, new_next)?;
    page.stamp_checksum(checksum_enabled);
    dest.append_pages(new_pgno, &[buf])?;
    Ok(new_pgno)
}

fn compact_leaf(pager: &mut Pager, cache: &mut PageCache, pgno: u32, dest: &mut Pager, checksum_enabled: bool) -> Result<u32> {
    let entries: Vec<(Vec<u8>, Vec<u8>, Option<u32>, u32)> = {
        let mut buf = fetch_page(pager, cache, pgno)?;
        let leaf = LeafPage::attach(&mut buf)?;
        (0..leaf.num_slots())
            .map(|i| {
                let rec = leaf.record_at(i);
                let mut key = leaf.common_prefix().to_vec();
                key.extend_from_slice(rec.key_suffix);
                (key, rec.data.to_vec(), rec.overflow_pgno(), rec.dsize)
            })
            .collect()
    };

    let mut remapped = Vec::with_capacity(entries.len());
    for (key, data, overflow_pgno, dsize) in entries {
        let new_overflow = match overflow_pgno {
            Some(head) => Some(compact_overflow_chain(pager, cache, head, dest, checksum_enabled)?),
            None => None,
        };
        remapped.push((key, data, new_overflow, dsize));
    }

    let new_pgno = dest.alloc_pgno();
    let mut buf = vec![0u8; dest.page_size as usize];
    {
        let mut leaf = LeafPage::format(&mut buf, new_pgno)?;
        for (key, data, overflow_pgno, dsize) in &remapped {
            let inline: &[u8] = if overflow_pgno.is_some() { &[] } else { data };
            leaf.put(key, inline, *dsize, *overflow_pgno)?;
        }
        leaf.stamp_checksum(checksum_enabled);
    }
    dest.append_pages(new_pgno, &[buf])?;
    Ok(new_pgno)
}

fn compact_branch(pager: &mut Pager, cache: &mut PageCache, pgno: u32, dest: &mut Pager, checksum_enabled: bool) -> Result<u32> {
    let (first_child, separators) = {
        let mut buf = fetch_page(pager, cache, pgno)?;
        let page = BranchPage::attach(&mut buf)?;
        let n = page.num_slots();
        let separators: Vec<(Vec<u8>, u32)> = (1..n).map(|i| (page.key_at(i), page.child_at(i))).collect();
        (page.first_child(), separators)
    };

    let new_first = compact_page(pager, cache, first_child, dest, checksum_enabled)?;
    let mut new_separators = Vec::with_capacity(separators.len());
    for (key, child) in separators {
        new_separators.push((key, compact_page(pager, cache, child, dest, checksum_enabled)?));
    }

    let new_pgno = dest.alloc_pgno();
    let mut buf = vec![0u8; dest.page_size as usize];
    {
        let mut page = BranchPage::format(&mut buf, new_pgno, new_first)?;
        for (key, child) in &new_separators {
            page.insert_separator(key, *child).map_err(Error::from)?;
        }
        page.stamp_checksum(checksum_enabled);
    }
    dest.append_pages(new_pgno, &[buf])?;
    Ok(new_pgno)
}

fn compact_page(pager: &mut Pager, cache: &mut PageCache, pgno: u32, dest: &mut Pager, checksum_enabled: bool) -> Result<u32> {
    let buf = fetch_page(pager, cache, pgno)?;
    match page_flags(&buf)? {
        PageFlags::Leaf => compact_leaf(pager, cache, pgno, dest, checksum_enabled),
        PageFlags::Branch => compact_branch(pager, cache, pgno, dest, checksum_enabled),
        other => Err(Error::corrupt(format!("unexpected page kind while compacting: {other:?}"))),
    }
}

/// Walk the live tree and fold the fill ratio of every non-root leaf/branch
/// page, used by `stat()` to surface the fill-floor invariant (§8) to
/// callers without exposing the page layer itself. Mirrors `btree.cpp`'s
/// `PAGEFILL` accounting, computed on demand rather than kept running.
fn fold_fill_ratio(pager: &mut Pager, cache: &mut PageCache, pgno: u32, is_root: bool, acc: &mut Option<f32>) -> Result<()> {
    let page_size = pager.page_size as usize;
    let mut buf = fetch_page(pager, cache, pgno)?;
    match page_flags(&buf)? {
        PageFlags::Leaf => {
            if !is_root {
                let ratio = LeafPage::attach(&mut buf)?.fill_ratio(page_size);
                *acc = Some(acc.map_or(ratio, |m: f32| m.min(ratio)));
            }
        }
        PageFlags::Branch => {
            let children: Vec<u32> = {
                let page = BranchPage::attach(&mut buf)?;
                if !is_root {
                    let ratio = page.fill_ratio(page_size);
                    *acc = Some(acc.map_or(ratio, |m: f32| m.min(ratio)));
                }
                let n = page.num_slots();
                (0..n).map(|i| page.child_at(i)).collect()
            };
            for child in children {
                fold_fill_ratio(pager, cache, child, false, acc)?;
            }
        }
        other => return Err(Error::corrupt(format!("unexpected page kind while folding fill ratio: {other:?}"))),
    }
    Ok(())
}

/// The smallest fill ratio among the tree's non-root leaf/branch pages, or
/// `None` for an empty tree or a tree with only a root page.
pub fn min_non_root_fill_ratio(pager: &mut Pager, cache: &mut PageCache, root: u32) -> Result<Option<f32>> {
    if root == 0 {
        return Ok(None);
    }
    let mut acc = None;
    fold_fill_ratio(pager, cache, root, true, &mut acc)?;
    Ok(acc)
}

fn tombstone(pager: &mut Pager, checksum_enabled: bool) -> Result<()> {
    let pgno = pager.alloc_pgno();
    let mut tomb = Meta::empty(pgno, pager.page_size);
    tomb.meta_flags = meta_flags::MARKER | meta_flags::TOMBSTONE;
    let mut buf = vec![0u8; pager.page_size as usize];
    tomb.encode(&mut buf, checksum_enabled)?;
    pager.append_pages(pgno, &[buf])?;
    pager.sync()
}

/// Append the closing meta to `dest`, fsync, rename over the original path,
/// tombstone the (now orphaned) original file, and reopen the new one.
fn finish_replace(pager: &mut Pager, template: Meta, mut dest: Pager, checksum_enabled: bool) -> Result<(Pager, Meta)> {
    let meta_pgno = dest.alloc_pgno();
    let new_meta = Meta {
        pgno: meta_pgno,
        prev_meta: 0,
        revision: 0,
        meta_flags: meta_flags::MARKER,
        ..template
    };
    let mut buf = vec![0u8; dest.page_size as usize];
    new_meta.encode(&mut buf, checksum_enabled)?;
    dest.append_pages(meta_pgno, &[buf])?;
    dest.sync()?;

    let original_path = pager.path().to_path_buf();
    let dest_path = dest.path().to_path_buf();
    drop(dest);
    std::fs::rename(&dest_path, &original_path)?;

    tombstone(pager, checksum_enabled)?;

    let reopened = Pager::open(&original_path, checksum_enabled, false)?;
    Ok((reopened, new_meta))
}

/// Recursively renumber and rewrite every live page into a fresh file, then
/// swap it in for the original (§4.8 "Compact").
pub fn compact(pager: &mut Pager, cache: &mut PageCache, meta: &Meta, checksum_enabled: bool, open_opts: &OpenOptions) -> Result<(Pager, Meta)> {
    debug!("btcow: compacting {}", pager.path().display());
    let tmp_path = tmp_path_for(pager.path());
    if tmp_path.exists() {
        std::fs::remove_file(&tmp_path)?;
    }
    let mut dest = Pager::create(&tmp_path, open_opts)?;
    let new_root = if meta.root == 0 {
        0
    } else {
        compact_page(pager, cache, meta.root, &mut dest, checksum_enabled)?
    };
    let template = Meta { root: new_root, ..*meta };
    finish_replace(pager, template, dest, checksum_enabled)
}

/// Same atomic-replace machinery as `compact`, but without copying any tree
/// pages — a factory reset (§4.8 "Clear").
pub fn clear(pager: &mut Pager, meta: &Meta, checksum_enabled: bool, open_opts: &OpenOptions) -> Result<(Pager, Meta)> {
    debug!("btcow: clearing {}", pager.path().display());
    let tmp_path = tmp_path_for(pager.path());
    if tmp_path.exists() {
        std::fs::remove_file(&tmp_path)?;
    }
    let dest = Pager::create(&tmp_path, open_opts)?;
    let template = Meta {
        root: 0,
        depth: 0,
        entry_count: 0,
        branch_pages: 0,
        leaf_pages: 0,
        overflow_pages: 0,
        tag: meta.tag,
        ..*meta
    };
    finish_replace(pager, template, dest, checksum_enabled)
}

/// Undo the last commit: truncate to the previous meta's page and re-derive
/// it via the same distrustful backward scan `open` uses, rather than
/// trusting `prev_meta` outright (§4.8 "Revert").
pub fn revert(pager: &mut Pager, current: &Meta, checksum_enabled: bool) -> Result<Meta> {
    if current.prev_meta == 0 {
        return Err(Error::NotFound);
    }
    pager.truncate_to(current.prev_meta + 1)?;
    crate::meta::read_meta(current.prev_meta, checksum_enabled, |pgno| pager.read_page(pgno))
}

/// Like `revert`, but addresses `prev_meta` directly: decode that one page
/// and fail if it isn't a valid, non-tombstoned marker meta, without
/// scanning further back (§4.8 "Rollback").
pub fn rollback(pager: &mut Pager, current: &Meta, checksum_enabled: bool) -> Result<Meta> {
    if current.prev_meta == 0 {
        return Err(Error::NotFound);
    }
    pager.truncate_to(current.prev_meta + 1)?;
    let buf = pager.read_page(current.prev_meta)?;
    let meta = Meta::decode(&buf, checksum_enabled)?;
    if !meta.is_marked() || meta.is_tombstoned() {
        return Err(Error::corrupt("rollback target page is not a valid marker meta"));
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageCacheConfig;
    use crate::comparator::ForwardComparator;
    use crate::options::PutFlags;
    use crate::txn::WriteTxn;
    use tempfile::tempdir;

    fn build_engine(dir: &Path, n: u32) -> (Pager, PageCache, Meta) {
        let path = dir.join("m.btcow");
        let mut pager = Pager::create(&path, &OpenOptions::default()).unwrap();
        let mut cache = PageCache::new(PageCacheConfig::default());
        let cmp = ForwardComparator;
        let mut meta = Meta::empty(0, pager.page_size);
        for i in 0..n {
            let key = format!("m{i:04}");
            let mut txn = WriteTxn::begin(&mut pager, &mut cache, &cmp, Default::default(), true, meta, i as u64);
            txn.root = meta.root;
            crate::tree::insert(&mut txn, key.as_bytes(), b"value", PutFlags::empty()).unwrap();
            meta.root = txn.root;
            meta.depth = txn.depth;
            meta.entry_count = txn.entry_count;
            meta.leaf_pages = txn.leaf_pages;
            meta.branch_pages = txn.branch_pages;
            meta.overflow_pages = txn.overflow_pages;
            meta = txn.commit().unwrap();
        }
        (pager, cache, meta)
    }

    #[test]
    fn compact_preserves_all_keys() {
        let dir = tempdir().unwrap();
        let (mut pager, mut cache, meta) = build_engine(dir.path(), 300);
        let cmp = ForwardComparator;
        let (mut new_pager, new_meta) = compact(&mut pager, &mut cache, &meta, true, &OpenOptions::default()).unwrap();
        assert_eq!(new_meta.entry_count, meta.entry_count);
        assert_eq!(new_meta.tag, meta.tag);
        let mut new_cache = PageCache::new(PageCacheConfig::default());
        for i in 0..300u32 {
            let key = format!("m{i:04}");
            let got = crate::tree::get(&mut new_pager, &mut new_cache, new_meta.root, &cmp, key.as_bytes()).unwrap();
            assert_eq!(got, Some(b"value".to_vec()));
        }
    }

    #[test]
    fn clear_drops_everything() {
        let dir = tempdir().unwrap();
        let (mut pager, _cache, meta) = build_engine(dir.path(), 10);
        let (_new_pager, new_meta) = clear(&mut pager, &meta, true, &OpenOptions::default()).unwrap();
        assert_eq!(new_meta.root, 0);
        assert_eq!(new_meta.entry_count, 0);
        assert_eq!(new_meta.tag, meta.tag);
    }

    #[test]
    fn revert_undoes_last_commit() {
        let dir = tempdir().unwrap();
        let (mut pager, mut cache, meta_after_b) = build_engine(dir.path(), 2);
        let cmp = ForwardComparator;
        let meta_a = revert(&mut pager, &meta_after_b, true).unwrap();
        assert_eq!(meta_a.entry_count, 1);
        let got = crate::tree::get(&mut pager, &mut cache, meta_a.root, &cmp, b"m0000").unwrap();
        assert_eq!(got, Some(b"value".to_vec()));
        let got_missing = crate::tree::get(&mut pager, &mut cache, meta_a.root, &cmp, b"m0001").unwrap();
        assert_eq!(got_missing, None);
    }

    #[test]
    fn revert_with_no_prior_commit_is_not_found() {
        let dir = tempdir().unwrap();
        let (mut pager, _cache, meta) = build_engine(dir.path(), 1);
        assert_eq!(meta.prev_meta, 0);
        assert!(matches!(revert(&mut pager, &meta, true), Err(Error::NotFound)));
    }

    #[test]
    fn min_non_root_fill_ratio_is_none_for_a_single_page_tree() {
        let dir = tempdir().unwrap();
        let (mut pager, mut cache, meta) = build_engine(dir.path(), 1);
        assert_eq!(min_non_root_fill_ratio(&mut pager, &mut cache, meta.root).unwrap(), None);
    }

    #[test]
    fn min_non_root_fill_ratio_clears_the_floor_after_many_inserts() {
        let dir = tempdir().unwrap();
        let (mut pager, mut cache, meta) = build_engine(dir.path(), 300);
        if let Some(min_fill) = min_non_root_fill_ratio(&mut pager, &mut cache, meta.root).unwrap() {
            assert!(min_fill >= 0.25, "got {min_fill}");
        }
    }
}
