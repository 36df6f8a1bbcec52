//! Branch (internal) page codec (§4.2, §4.5).
//!
//! Same slotted shape as a leaf page — prefix region, slot directory,
//! record heap — but each record carries a child pgno instead of a value,
//! and slot 0's key is always empty: it stands for the implicit
//! minus-infinity separator, so `child_at(0)` is the subtree for every key
//! less than slot 1's key.
//!
//! Record layout at a slot's offset:
//!
//! ```text
//! flags:u8 (unused, reserved)  ksize:u16  child:u32  key[ksize]
//! ```

use crate::error::BranchPageError;
use crate::page::header::{self, PageFlags};
use std::cmp::Ordering;

type Result<T> = std::result::Result<T, BranchPageError>;

const PREFIX_LEN_SIZE: usize = 2;
const RECORD_HEADER_SIZE: usize = 1 + 2 + 4;
const SLOT_SIZE: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct BranchRecord<'a> {
    pub key_suffix: &'a [u8],
    pub child: u32,
}

pub struct BranchPage<'a> {
    buf: &'a mut [u8],
}

impl<'a> BranchPage<'a> {
    /// Format a brand-new branch page whose sole entry is the implicit
    /// minus-infinity separator pointing at `first_child`.
    pub fn format(buf: &'a mut [u8], pgno: u32, first_child: u32) -> Result<Self> {
        header::init_header(buf, pgno, PageFlags::Branch)
            .map_err(|e| BranchPageError::Corrupt(e.to_string()))?;
        let mut page = BranchPage { buf };
        page.set_prefix_len_raw(0);
        let lower = page.slots_start() as u16;
        header::write_lower(page.buf, lower).map_err(|e| BranchPageError::Corrupt(e.to_string()))?;
        header::write_upper(page.buf, page.buf.len() as u16)
            .map_err(|e| BranchPageError::Corrupt(e.to_string()))?;
        page.push_record(&[], first_child)?;
        Ok(page)
    }

    pub fn attach(buf: &'a mut [u8]) -> Result<Self> {
        let flags = header::page_flags(buf).map_err(|e| BranchPageError::Corrupt(e.to_string()))?;
        if flags != PageFlags::Branch {
            return Err(BranchPageError::Corrupt("not a branch page".into()));
        }
        Ok(BranchPage { buf })
    }

    fn prefix_len(&self) -> usize {
        u16::from_ne_bytes([
            self.buf[header::PAGE_HEADER_SIZE],
            self.buf[header::PAGE_HEADER_SIZE + 1],
        ]) as usize
    }

    fn set_prefix_len_raw(&mut self, len: u16) {
        let off = header::PAGE_HEADER_SIZE;
        self.buf[off..off + 2].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn common_prefix(&self) -> &[u8] {
        let start = header::PAGE_HEADER_SIZE + PREFIX_LEN_SIZE;
        &self.buf[start..start + self.prefix_len()]
    }

    fn slots_start(&self) -> usize {
        header::PAGE_HEADER_SIZE + PREFIX_LEN_SIZE + self.prefix_len()
    }

    fn lower(&self) -> usize {
        header::read_lower(self.buf).unwrap_or(self.slots_start() as u16) as usize
    }

    fn upper(&self) -> usize {
        header::read_upper(self.buf).unwrap_or(self.buf.len() as u16) as usize
    }

    fn set_lower(&mut self, v: usize) {
        let _ = header::write_lower(self.buf, v as u16);
    }

    fn set_upper(&mut self, v: usize) {
        let _ = header::write_upper(self.buf, v as u16);
    }

    pub fn num_slots(&self) -> usize {
        (self.lower() - self.slots_start()) / SLOT_SIZE
    }

    fn slot_offset(&self, idx: usize) -> usize {
        let at = self.slots_start() + idx * SLOT_SIZE;
        u16::from_ne_bytes([self.buf[at], self.buf[at + 1]]) as usize
    }

    fn write_slot_raw(&mut self, idx: usize, off: usize) {
        let at = self.slots_start() + idx * SLOT_SIZE;
        self.buf[at..at + 2].copy_from_slice(&(off as u16).to_ne_bytes());
    }

    pub fn record_at(&self, idx: usize) -> BranchRecord<'_> {
        let off = self.slot_offset(idx);
        decode_record(&self.buf[off..])
    }

    pub fn key_at(&self, idx: usize) -> Vec<u8> {
        let mut key = self.common_prefix().to_vec();
        key.extend_from_slice(self.record_at(idx).key_suffix);
        key
    }

    pub fn child_at(&self, idx: usize) -> u32 {
        self.record_at(idx).child
    }

    pub fn first_child(&self) -> u32 {
        self.child_at(0)
    }

    /// Overwrite slot 0's child pgno in place. Slot 0's key is always
    /// empty, so this never touches the key/suffix region.
    pub fn set_first_child_unchecked(&mut self, child: u32) {
        let off = self.slot_offset(0);
        self.buf[off + 3..off + 7].copy_from_slice(&child.to_ne_bytes());
    }

    fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Locate the child subtree for `key`: the last slot whose key is `<=
    /// key` (slot 0's empty key always qualifies, so this never misses).
    pub fn child_for_key(&self, key: &[u8]) -> u32 {
        let prefix = self.common_prefix();
        if !key.starts_with(prefix) && key < prefix {
            return self.first_child();
        }
        let suffix = if key.starts_with(prefix) {
            &key[prefix.len()..]
        } else {
            key
        };
        let n = self.num_slots();
        let mut lo = 1usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = self.record_at(mid);
            match rec.key_suffix.cmp(suffix) {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        self.child_at(lo - 1)
    }

    /// Binary search among separator keys (slots 1..n). Slot 0 never
    /// matches since its key is empty and stands for minus-infinity.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        let prefix = self.common_prefix();
        if !key.starts_with(prefix) {
            return Err(1);
        }
        let suffix = &key[prefix.len()..];
        let n = self.num_slots();
        let mut lo = 1usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = self.record_at(mid);
            match rec.key_suffix.cmp(suffix) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn push_record(&mut self, suffix: &[u8], child: u32) -> Result<()> {
        let rec_size = RECORD_HEADER_SIZE + suffix.len();
        if self.free_space() < rec_size + SLOT_SIZE {
            return Err(BranchPageError::PageFull);
        }
        let new_upper = self.upper() - rec_size;
        {
            let region = &mut self.buf[new_upper..new_upper + rec_size];
            region[0] = 0;
            region[1..3].copy_from_slice(&(suffix.len() as u16).to_ne_bytes());
            region[3..7].copy_from_slice(&child.to_ne_bytes());
            region[7..7 + suffix.len()].copy_from_slice(suffix);
        }
        self.set_upper(new_upper);
        let n = self.num_slots();
        self.set_lower(self.lower() + SLOT_SIZE);
        self.write_slot_raw(n, new_upper);
        Ok(())
    }

    /// Insert a new separator `key -> child` at its sorted position.
    pub fn insert_separator(&mut self, key: &[u8], child: u32) -> Result<()> {
        if !key.starts_with(self.common_prefix()) {
            return Err(BranchPageError::Corrupt(
                "separator key does not share the page's common prefix".into(),
            ));
        }
        let suffix = &key[self.common_prefix().len()..];
        let idx = match self.search(key) {
            Ok(_) => return Err(BranchPageError::Corrupt("duplicate separator key".into())),
            Err(idx) => idx,
        };
        let rec_size = RECORD_HEADER_SIZE + suffix.len();
        if self.free_space() < rec_size + SLOT_SIZE {
            return Err(BranchPageError::PageFull);
        }
        let new_upper = self.upper() - rec_size;
        {
            let region = &mut self.buf[new_upper..new_upper + rec_size];
            region[0] = 0;
            region[1..3].copy_from_slice(&(suffix.len() as u16).to_ne_bytes());
            region[3..7].copy_from_slice(&child.to_ne_bytes());
            region[7..7 + suffix.len()].copy_from_slice(suffix);
        }
        self.set_upper(new_upper);
        let n = self.num_slots();
        self.set_lower(self.lower() + SLOT_SIZE);
        for i in (idx..n).rev() {
            let off = self.slot_offset(i);
            self.write_slot_raw(i + 1, off);
        }
        self.write_slot_raw(idx, new_upper);
        Ok(())
    }

    /// Remove the separator at `idx` (must be >= 1; slot 0 can't be
    /// removed on its own — merging the page itself removes it).
    pub fn remove_separator(&mut self, idx: usize) -> Result<()> {
        if idx == 0 {
            return Err(BranchPageError::Corrupt("cannot remove the minus-infinity slot".into()));
        }
        let n = self.num_slots();
        for i in idx..n - 1 {
            let off = self.slot_offset(i + 1);
            self.write_slot_raw(i, off);
        }
        self.set_lower(self.lower() - SLOT_SIZE);
        self.repack();
        Ok(())
    }

    fn repack(&mut self) {
        let n = self.num_slots();
        let mut records: Vec<Vec<u8>> = Vec::with_capacity(n);
        for i in 0..n {
            let off = self.slot_offset(i);
            let rec = decode_record(&self.buf[off..]);
            let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + rec.key_suffix.len());
            bytes.push(0);
            bytes.extend_from_slice(&(rec.key_suffix.len() as u16).to_ne_bytes());
            bytes.extend_from_slice(&rec.child.to_ne_bytes());
            bytes.extend_from_slice(rec.key_suffix);
            records.push(bytes);
        }
        let mut cursor = self.buf.len();
        for (i, bytes) in records.iter().enumerate() {
            cursor -= bytes.len();
            self.buf[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            self.write_slot_raw(i, cursor);
        }
        self.set_upper(cursor);
    }

    pub fn is_empty(&self) -> bool {
        self.num_slots() <= 1
    }

    pub fn fill_ratio(&self, psize: usize) -> f32 {
        let used = psize - self.free_space();
        used as f32 / psize as f32
    }

    pub fn stamp_checksum(&mut self, enabled: bool) {
        let _ = header::stamp_checksum(self.buf, enabled);
    }
}

fn decode_record(buf: &[u8]) -> BranchRecord<'_> {
    let ksize = u16::from_ne_bytes([buf[1], buf[2]]) as usize;
    let child = u32::from_ne_bytes([buf[3], buf[4], buf[5], buf[6]]);
    let key_suffix = &buf[7..7 + ksize];
    BranchRecord { key_suffix, child }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_child_is_minus_infinity_slot() {
        let mut buf = vec![0u8; 256];
        let page = BranchPage::format(&mut buf, 1, 10).unwrap();
        assert_eq!(page.num_slots(), 1);
        assert_eq!(page.first_child(), 10);
        assert_eq!(page.child_for_key(b"anything"), 10);
    }

    #[test]
    fn insert_separator_routes_correctly() {
        let mut buf = vec![0u8; 256];
        let mut page = BranchPage::format(&mut buf, 1, 10).unwrap();
        page.insert_separator(b"m", 20).unwrap();
        page.insert_separator(b"t", 30).unwrap();

        assert_eq!(page.child_for_key(b"a"), 10);
        assert_eq!(page.child_for_key(b"m"), 20);
        assert_eq!(page.child_for_key(b"n"), 20);
        assert_eq!(page.child_for_key(b"t"), 30);
        assert_eq!(page.child_for_key(b"z"), 30);
    }

    #[test]
    fn remove_separator_merges_range_into_predecessor() {
        let mut buf = vec![0u8; 256];
        let mut page = BranchPage::format(&mut buf, 1, 10).unwrap();
        page.insert_separator(b"m", 20).unwrap();
        page.insert_separator(b"t", 30).unwrap();
        page.remove_separator(1).unwrap();
        assert_eq!(page.child_for_key(b"n"), 10);
        assert_eq!(page.child_for_key(b"t"), 30);
    }
}
