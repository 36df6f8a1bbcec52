//! Leaf page codec: slotted layout with key-prefix compression (§4.2-§4.4).
//!
//! Layout after the 16-byte fixed header ([`crate::page::header`]):
//!
//! ```text
//! 16            prefix_len:u16
//! 18            prefix bytes (prefix_len)
//! 18+prefix_len slot directory: nslots * u16 (offsets, ascending key order)
//! lower                         <- end of slot directory
//! ...free space...
//! upper                         <- start of record heap (records grow down)
//! psize
//! ```
//!
//! Each record, at its slot offset:
//!
//! ```text
//! flags:u8  ksize:u16  dsize:u32  key[ksize]  data
//! ```
//!
//! `key` is the stored suffix after the page's common prefix has been
//! stripped. When `F_BIGDATA` is set, `data` is a 4-byte pgno (the head of
//! an overflow chain) while `dsize` still records the full logical value
//! length.

use crate::error::LeafPageError;
use crate::page::header::{self, PageFlags};
use crate::page::record_flags::F_BIGDATA;
use std::cmp::Ordering;

type Result<T> = std::result::Result<T, LeafPageError>;

const PREFIX_LEN_SIZE: usize = 2;
const RECORD_HEADER_SIZE: usize = 1 + 2 + 4;
const SLOT_SIZE: usize = 2;

/// A decoded leaf record, borrowed from the page buffer.
#[derive(Debug, Clone, Copy)]
pub struct LeafRecord<'a> {
    pub key_suffix: &'a [u8],
    pub dsize: u32,
    pub is_overflow: bool,
    pub data: &'a [u8],
}

impl<'a> LeafRecord<'a> {
    /// 4-byte overflow head pgno, only meaningful when `is_overflow`.
    pub fn overflow_pgno(&self) -> Option<u32> {
        if !self.is_overflow {
            return None;
        }
        Some(u32::from_ne_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]))
    }
}

/// Mutable view over a leaf page buffer.
pub struct LeafPage<'a> {
    buf: &'a mut [u8],
}

impl<'a> LeafPage<'a> {
    pub fn format(buf: &'a mut [u8], pgno: u32) -> Result<Self> {
        header::init_header(buf, pgno, PageFlags::Leaf)
            .map_err(|e| LeafPageError::Corrupt(e.to_string()))?;
        let mut page = LeafPage { buf };
        page.set_prefix_len_raw(0);
        let lower = page.slots_start() as u16;
        header::write_lower(page.buf, lower).map_err(|e| LeafPageError::Corrupt(e.to_string()))?;
        header::write_upper(page.buf, page.buf.len() as u16)
            .map_err(|e| LeafPageError::Corrupt(e.to_string()))?;
        Ok(page)
    }

    pub fn attach(buf: &'a mut [u8]) -> Result<Self> {
        let flags = header::page_flags(buf).map_err(|e| LeafPageError::Corrupt(e.to_string()))?;
        if flags != PageFlags::Leaf {
            return Err(LeafPageError::Corrupt("not a leaf page".into()));
        }
        Ok(LeafPage { buf })
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

    /// Decode the record at slot `idx`.
    pub fn record_at(&self, idx: usize) -> LeafRecord<'_> {
        let off = self.slot_offset(idx);
        decode_record(&self.buf[off..])
    }

    /// Binary search for `key` (full, uncompressed) among stored suffixes.
    /// Returns `Ok(idx)` on an exact match, `Err(idx)` for the insertion
    /// point otherwise.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        let prefix = self.common_prefix();
        if !key.starts_with(prefix) {
            return match key.cmp(prefix) {
                Ordering::Less => Err(0),
                _ => Err(self.num_slots()),
            };
        }
        let suffix = &key[prefix.len()..];
        let n = self.num_slots();
        let mut lo = 0usize;
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

    pub fn get(&self, key: &[u8]) -> Option<LeafRecord<'_>> {
        self.search(key).ok().map(|idx| self.record_at(idx))
    }

    fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    fn record_size(key_suffix_len: usize, data_len: usize) -> usize {
        RECORD_HEADER_SIZE + key_suffix_len + data_len
    }

    /// Space needed to insert a brand-new slot + record for `key_suffix`.
    fn needed_space(key_suffix_len: usize, data_len: usize) -> usize {
        SLOT_SIZE + Self::record_size(key_suffix_len, data_len)
    }

    /// Insert `value` under `key` (full key; the page's common prefix is
    /// stripped internally). If `overflow_pgno` is `Some`, the record stores
    /// it instead of inline data. `dsize` is always the full logical value
    /// length, independent of whichever of `value`/overflow is used to
    /// store the bytes — this is what lets a record keep reporting its
    /// true value length after `value` has been replaced by a 4-byte
    /// overflow pgno.
    pub fn put(&mut self, key: &[u8], value: &[u8], dsize: u32, overflow_pgno: Option<u32>) -> Result<()> {
        let prefix_len = self.common_prefix().len();
        if !key.starts_with(self.common_prefix()) {
            return Err(LeafPageError::Corrupt(
                "key does not share the page's common prefix".into(),
            ));
        }
        let suffix = &key[prefix_len..];
        let data_len = if overflow_pgno.is_some() { 4 } else { value.len() };

        let idx = match self.search(key) {
            Ok(idx) => {
                let needed = Self::record_size(suffix.len(), data_len);
                if self.free_space() + SLOT_SIZE < needed + SLOT_SIZE {
                    return Err(LeafPageError::PageFull);
                }
                self.remove_slot(idx);
                idx
            }
            Err(idx) => {
                let needed = Self::needed_space(suffix.len(), data_len);
                if self.free_space() < needed {
                    return Err(LeafPageError::PageFull);
                }
                idx
            }
        };

        let rec_size = Self::record_size(suffix.len(), data_len);
        let new_upper = self.upper() - rec_size;
        {
            let flags = if overflow_pgno.is_some() { F_BIGDATA } else { 0 };
            let region = &mut self.buf[new_upper..new_upper + rec_size];
            region[0] = flags;
            region[1..3].copy_from_slice(&(suffix.len() as u16).to_ne_bytes());
            region[3..7].copy_from_slice(&dsize.to_ne_bytes());
            region[7..7 + suffix.len()].copy_from_slice(suffix);
            let data_off = 7 + suffix.len();
            if let Some(pgno) = overflow_pgno {
                region[data_off..data_off + 4].copy_from_slice(&pgno.to_ne_bytes());
            } else {
                region[data_off..data_off + value.len()].copy_from_slice(value);
            }
        }
        self.set_upper(new_upper);
        self.insert_slot(idx, new_upper);
        Ok(())
    }

    /// Insert `value` under `key` as an additional entry rather than
    /// overwriting a match: used for `ALLOW_DUPS` inserts, which keep
    /// duplicate-keyed entries contiguous immediately after the existing
    /// one instead of replacing it.
    pub fn put_duplicate(&mut self, key: &[u8], value: &[u8], dsize: u32, overflow_pgno: Option<u32>) -> Result<()> {
        let prefix_len = self.common_prefix().len();
        if !key.starts_with(self.common_prefix()) {
            return Err(LeafPageError::Corrupt(
                "key does not share the page's common prefix".into(),
            ));
        }
        let suffix = &key[prefix_len..];
        let data_len = if overflow_pgno.is_some() { 4 } else { value.len() };
        let idx = match self.search(key) {
            Ok(found) => found + 1,
            Err(idx) => idx,
        };
        let needed = Self::needed_space(suffix.len(), data_len);
        if self.free_space() < needed {
            return Err(LeafPageError::PageFull);
        }

        let rec_size = Self::record_size(suffix.len(), data_len);
        let new_upper = self.upper() - rec_size;
        {
            let flags = if overflow_pgno.is_some() { F_BIGDATA } else { 0 };
            let region = &mut self.buf[new_upper..new_upper + rec_size];
            region[0] = flags;
            region[1..3].copy_from_slice(&(suffix.len() as u16).to_ne_bytes());
            region[3..7].copy_from_slice(&dsize.to_ne_bytes());
            region[7..7 + suffix.len()].copy_from_slice(suffix);
            let data_off = 7 + suffix.len();
            if let Some(pgno) = overflow_pgno {
                region[data_off..data_off + 4].copy_from_slice(&pgno.to_ne_bytes());
            } else {
                region[data_off..data_off + value.len()].copy_from_slice(value);
            }
        }
        self.set_upper(new_upper);
        self.insert_slot(idx, new_upper);
        Ok(())
    }

    fn insert_slot(&mut self, idx: usize, record_off: usize) {
        let n = self.num_slots();
        self.set_lower(self.lower() + SLOT_SIZE);
        for i in (idx..n).rev() {
            let off = self.slot_offset_raw(i);
            self.write_slot_raw(i + 1, off);
        }
        self.write_slot_raw(idx, record_off);
    }

    fn slot_offset_raw(&self, idx: usize) -> usize {
        let at = self.slots_start() + idx * SLOT_SIZE;
        u16::from_ne_bytes([self.buf[at], self.buf[at + 1]]) as usize
    }

    fn write_slot_raw(&mut self, idx: usize, off: usize) {
        let at = self.slots_start() + idx * SLOT_SIZE;
        self.buf[at..at + 2].copy_from_slice(&(off as u16).to_ne_bytes());
    }

    fn remove_slot(&mut self, idx: usize) {
        let n = self.num_slots();
        for i in idx..n - 1 {
            let off = self.slot_offset_raw(i + 1);
            self.write_slot_raw(i, off);
        }
        self.set_lower(self.lower() - SLOT_SIZE);
    }

    /// Remove `key`, then repack the record heap so free space stays
    /// contiguous; records here are small enough relative to a page that
    /// eager repacking on every delete is cheap.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let idx = match self.search(key) {
            Ok(idx) => idx,
            Err(_) => return Ok(false),
        };
        self.remove_slot(idx);
        self.repack();
        Ok(true)
    }

    fn repack(&mut self) {
        let n = self.num_slots();
        let mut records: Vec<Vec<u8>> = Vec::with_capacity(n);
        for i in 0..n {
            let off = self.slot_offset(i);
            let rec = decode_record(&self.buf[off..]);
            let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + rec.key_suffix.len() + rec.data.len());
            bytes.push(if rec.is_overflow { F_BIGDATA } else { 0 });
            bytes.extend_from_slice(&(rec.key_suffix.len() as u16).to_ne_bytes());
            bytes.extend_from_slice(&rec.dsize.to_ne_bytes());
            bytes.extend_from_slice(rec.key_suffix);
            bytes.extend_from_slice(rec.data);
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

    /// Re-derive the common prefix across all stored keys and rewrite
    /// suffixes accordingly. `new_prefix` must be a prefix of the current
    /// common prefix (shrinking it, never extending). Returns `PageFull` if
    /// the wider suffixes no longer fit, in which case the caller should
    /// fall back to a rebalance instead (Open Question #2).
    pub fn adjust_prefix(&mut self, new_prefix: &[u8]) -> Result<()> {
        let old_prefix_len = self.prefix_len();
        let old_prefix: Vec<u8> = self.common_prefix().to_vec();
        if new_prefix == old_prefix.as_slice() {
            return Ok(());
        }
        if !old_prefix.starts_with(new_prefix) {
            return Err(LeafPageError::Corrupt(
                "adjust_prefix requires new_prefix to be a prefix of the old one".into(),
            ));
        }
        let growth_per_key = old_prefix_len as isize - new_prefix.len() as isize;
        let n = self.num_slots();
        let total_growth = growth_per_key * n as isize;
        if total_growth > self.free_space() as isize {
            return Err(LeafPageError::PageFull);
        }

        let mut decoded: Vec<(Vec<u8>, bool, u32, Vec<u8>)> = Vec::with_capacity(n);
        for i in 0..n {
            let off = self.slot_offset(i);
            let rec = decode_record(&self.buf[off..]);
            let mut full_key = old_prefix.clone();
            full_key.extend_from_slice(rec.key_suffix);
            decoded.push((full_key, rec.is_overflow, rec.dsize, rec.data.to_vec()));
        }

        let new_prefix_len = new_prefix.len();
        let prefix_region_start = header::PAGE_HEADER_SIZE + PREFIX_LEN_SIZE;
        self.buf[prefix_region_start..prefix_region_start + new_prefix_len].copy_from_slice(new_prefix);
        self.set_prefix_len_raw(new_prefix_len as u16);
        self.set_lower(self.slots_start() + n * SLOT_SIZE);

        let mut cursor = self.buf.len();
        for (i, (full_key, is_overflow, dsize, data)) in decoded.iter().enumerate() {
            let suffix = &full_key[new_prefix_len..];
            let rec_size = RECORD_HEADER_SIZE + suffix.len() + data.len();
            cursor -= rec_size;
            let region = &mut self.buf[cursor..cursor + rec_size];
            region[0] = if *is_overflow { F_BIGDATA } else { 0 };
            region[1..3].copy_from_slice(&(suffix.len() as u16).to_ne_bytes());
            region[3..7].copy_from_slice(&dsize.to_ne_bytes());
            region[7..7 + suffix.len()].copy_from_slice(suffix);
            region[7 + suffix.len()..7 + suffix.len() + data.len()].copy_from_slice(data);
            self.write_slot_raw(i, cursor);
        }
        self.set_upper(cursor);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.num_slots() == 0
    }

    pub fn fill_ratio(&self, psize: usize) -> f32 {
        let used = psize - self.free_space();
        used as f32 / psize as f32
    }

    pub fn stamp_checksum(&mut self, enabled: bool) {
        let _ = header::stamp_checksum(self.buf, enabled);
    }
}

fn decode_record(buf: &[u8]) -> LeafRecord<'_> {
    let flags = buf[0];
    let ksize = u16::from_ne_bytes([buf[1], buf[2]]) as usize;
    let dsize = u32::from_ne_bytes([buf[3], buf[4], buf[5], buf[6]]);
    let key_suffix = &buf[7..7 + ksize];
    let is_overflow = flags & F_BIGDATA != 0;
    let data_len = if is_overflow { 4 } else { dsize as usize };
    let data = &buf[7 + ksize..7 + ksize + data_len];
    LeafRecord {
        key_suffix,
        dsize,
        is_overflow,
        data,
    }
}
