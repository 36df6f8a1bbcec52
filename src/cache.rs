//! Bounded page cache with LRU eviction and pin-count ref-counting (§4.2).
//!
//! Every cached page carries its parent pgno/child-index and a copy of its
//! common prefix so the tree walker can reconstruct full keys and retrace a
//! path upward without re-reading ancestors.

use crate::error::{Error, Result};
use log::trace;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    pub capacity_pages: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            capacity_pages: crate::options::DEFAULT_CACHE_CAPACITY_PAGES,
        }
    }
}

#[derive(Debug)]
pub struct PageCacheEntry {
    pub pgno: u32,
    pub payload: Vec<u8>,
    pub dirty: bool,
    pub pin_count: u32,
    pub last_access: u64,
    pub parent: Option<u32>,
    pub parent_index: Option<usize>,
    pub common_prefix: Vec<u8>,
}

impl PageCacheEntry {
    pub fn new(pgno: u32, payload: Vec<u8>) -> Self {
        Self {
            pgno,
            payload,
            dirty: false,
            pin_count: 0,
            last_access: 0,
            parent: None,
            parent_index: None,
            common_prefix: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct PageCache {
    config: PageCacheConfig,
    pub entries: HashMap<u32, PageCacheEntry>,
    access_counter: u64,
}

impl PageCache {
    pub fn new(config: PageCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            access_counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity_pages
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn contains(&self, pgno: u32) -> bool {
        self.entries.contains_key(&pgno)
    }

    pub fn get(&self, pgno: u32) -> Option<&PageCacheEntry> {
        self.entries.get(&pgno)
    }

    pub fn get_mut(&mut self, pgno: u32) -> Option<&mut PageCacheEntry> {
        let access = self.next_access();
        let entry = self.entries.get_mut(&pgno)?;
        entry.last_access = access;
        Some(entry)
    }

    pub fn insert(&mut self, pgno: u32, payload: Vec<u8>) -> &mut PageCacheEntry {
        let mut entry = PageCacheEntry::new(pgno, payload);
        entry.last_access = self.next_access();
        self.entries.insert(pgno, entry);
        self.entries.get_mut(&pgno).expect("cache entry just inserted")
    }

    pub fn remove(&mut self, pgno: u32) -> Option<PageCacheEntry> {
        self.entries.remove(&pgno)
    }

    pub fn pin(&mut self, pgno: u32) -> Result<()> {
        let entry = self
            .get_mut(pgno)
            .ok_or_else(|| Error::corrupt(format!("page cache miss for {pgno}")))?;
        entry.pin_count = entry.pin_count.saturating_add(1);
        Ok(())
    }

    pub fn unpin(&mut self, pgno: u32) -> Result<()> {
        let entry = self
            .get_mut(pgno)
            .ok_or_else(|| Error::corrupt(format!("page cache miss for {pgno}")))?;
        if entry.pin_count == 0 {
            return Err(Error::corrupt(format!("page cache pin underflow for {pgno}")));
        }
        entry.pin_count -= 1;
        Ok(())
    }

    pub fn lru_unpinned(&self) -> Option<u32> {
        let mut candidate: Option<(u32, u64)> = None;
        for (pgno, entry) in &self.entries {
            if entry.pin_count > 0 || entry.dirty {
                continue;
            }
            match candidate {
                None => candidate = Some((*pgno, entry.last_access)),
                Some((_, best)) if entry.last_access < best => candidate = Some((*pgno, entry.last_access)),
                _ => {}
            }
        }
        candidate.map(|(pgno, _)| pgno)
    }

    /// Evict the least-recently-used clean, unpinned page. Dirty pages are
    /// never silently dropped: in this engine dirty pages belong to the
    /// in-flight write transaction and must be flushed, not evicted.
    pub fn evict_lru(&mut self) -> Option<PageCacheEntry> {
        let candidate = self.lru_unpinned()?;
        trace!("btcow: evicting page {candidate} from cache");
        self.entries.remove(&candidate)
    }

    fn next_access(&mut self) -> u64 {
        self.access_counter = self.access_counter.saturating_add(1);
        self.access_counter
    }

    pub fn evict_if_full(&mut self) {
        if !self.is_full() {
            return;
        }
        self.evict_lru();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_skips_pinned_pages() {
        let mut cache = PageCache::new(PageCacheConfig { capacity_pages: 3 });
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        cache.insert(3, vec![3]);

        cache.get_mut(2).unwrap().pin_count = 1;
        cache.get_mut(1);

        assert_eq!(cache.lru_unpinned(), Some(3));
    }

    #[test]
    fn evict_lru_skips_dirty_and_pinned() {
        let mut cache = PageCache::new(PageCacheConfig { capacity_pages: 2 });
        cache.insert(1, vec![1]).pin_count = 1;
        cache.insert(2, vec![2]).dirty = true;

        assert!(cache.evict_lru().is_none());
    }

    #[test]
    fn evict_if_full_drops_clean_lru() {
        let mut cache = PageCache::new(PageCacheConfig { capacity_pages: 2 });
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        cache.evict_if_full();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(2));
    }
}
