//! Fixed page header shared by every page kind (§3, §6).
//!
//! Layout (host byte order — the file format is not portable across
//! endianness, per §6):
//!
//! ```text
//! 0   pgno:u32
//! 4   pad:u16           (reserved)
//! 6   flags:u16
//! 8   checksum:u32
//! 12  lower:u16 / next_pgno:u32 (union, low half)
//! 14  upper:u16         (unused when next_pgno is in use)
//! ```

use crate::error::{Error, Result};
use log::warn;

pub const PAGE_HEADER_SIZE: usize = 16;

const OFF_PGNO: usize = 0;
const OFF_PAD: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_CHECKSUM: usize = 8;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_NEXT_PGNO: usize = 12;

/// Page kind, stored in the low bits of the header's flag word. A page
/// carries exactly one of these (the set from §3: HEAD, META, BRANCH, LEAF,
/// OVERFLOW).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFlags {
    Head,
    Meta,
    Branch,
    Leaf,
    Overflow,
}

impl PageFlags {
    const HEAD: u16 = 1;
    const META: u16 = 2;
    const BRANCH: u16 = 4;
    const LEAF: u16 = 8;
    const OVERFLOW: u16 = 16;

    pub fn bits(self) -> u16 {
        match self {
            PageFlags::Head => Self::HEAD,
            PageFlags::Meta => Self::META,
            PageFlags::Branch => Self::BRANCH,
            PageFlags::Leaf => Self::LEAF,
            PageFlags::Overflow => Self::OVERFLOW,
        }
    }

    pub fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            Self::HEAD => Ok(PageFlags::Head),
            Self::META => Ok(PageFlags::Meta),
            Self::BRANCH => Ok(PageFlags::Branch),
            Self::LEAF => Ok(PageFlags::Leaf),
            Self::OVERFLOW => Ok(PageFlags::Overflow),
            other => Err(Error::corrupt(format!("unexpected page flags: {other:#x}"))),
        }
    }
}

/// A view over a page's fixed header region. Branch/leaf pages interpret
/// `lower`/`upper` as the slot-directory/record-heap split; overflow pages
/// interpret the same four bytes as `next_pgno`.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub pgno: u32,
    pub flags: PageFlags,
    pub checksum: u32,
    pub lower: u16,
    pub upper: u16,
}

pub fn read_pgno(buf: &[u8]) -> Result<u32> {
    read_u32(buf, OFF_PGNO)
}

pub fn write_pgno(buf: &mut [u8], pgno: u32) -> Result<()> {
    write_u32(buf, OFF_PGNO, pgno)
}

pub fn read_flags_bits(buf: &[u8]) -> Result<u16> {
    read_u16(buf, OFF_FLAGS)
}

pub fn page_flags(buf: &[u8]) -> Result<PageFlags> {
    PageFlags::from_bits(read_flags_bits(buf)?)
}

pub fn write_flags(buf: &mut [u8], flags: PageFlags) -> Result<()> {
    write_u16(buf, OFF_FLAGS, flags.bits())
}

pub fn read_checksum(buf: &[u8]) -> Result<u32> {
    read_u32(buf, OFF_CHECKSUM)
}

pub fn write_checksum(buf: &mut [u8], checksum: u32) -> Result<()> {
    write_u32(buf, OFF_CHECKSUM, checksum)
}

pub fn read_lower(buf: &[u8]) -> Result<u16> {
    read_u16(buf, OFF_LOWER)
}

pub fn write_lower(buf: &mut [u8], v: u16) -> Result<()> {
    write_u16(buf, OFF_LOWER, v)
}

pub fn read_upper(buf: &[u8]) -> Result<u16> {
    read_u16(buf, OFF_UPPER)
}

pub fn write_upper(buf: &mut [u8], v: u16) -> Result<()> {
    write_u16(buf, OFF_UPPER, v)
}

pub fn read_next_pgno(buf: &[u8]) -> Result<u32> {
    read_u32(buf, OFF_NEXT_PGNO)
}

pub fn write_next_pgno(buf: &mut [u8], pgno: u32) -> Result<()> {
    write_u32(buf, OFF_NEXT_PGNO, pgno)
}

pub fn init_header(buf: &mut [u8], pgno: u32, flags: PageFlags) -> Result<()> {
    if buf.len() < PAGE_HEADER_SIZE {
        return Err(Error::corrupt("page too small for header"));
    }
    buf[..PAGE_HEADER_SIZE].fill(0);
    write_pgno(buf, pgno)?;
    write_flags(buf, flags)?;
    Ok(())
}

/// CRC-32 (IEEE, polynomial 0xEDB88320, reflected) over the populated region
/// of a page, skipping the free span `[lower, upper)` for branch/leaf pages
/// (§4.3, §6). `checksum_enabled` models `NO_PG_CHECKSUM`.
pub fn page_checksum(buf: &[u8], checksum_enabled: bool) -> Result<u32> {
    if !checksum_enabled {
        return Ok(0);
    }
    let after_checksum = OFF_CHECKSUM + 4;
    let flags = page_flags(buf)?;
    let mut hasher = crc32fast::Hasher::new();
    match flags {
        PageFlags::Head | PageFlags::Meta => {
            hasher.update(&buf[after_checksum..]);
        }
        PageFlags::Overflow => {
            hasher.update(&buf[after_checksum..]);
        }
        PageFlags::Branch | PageFlags::Leaf => {
            let lower = (read_lower(buf)? as usize).max(after_checksum).min(buf.len());
            let upper = (read_upper(buf)? as usize).min(buf.len()).max(lower);
            hasher.update(&buf[after_checksum..lower]);
            hasher.update(&buf[upper..]);
        }
    }
    Ok(hasher.finalize())
}

pub fn verify_checksum(buf: &[u8], checksum_enabled: bool) -> Result<()> {
    if !checksum_enabled {
        return Ok(());
    }
    let stored = read_checksum(buf)?;
    let computed = page_checksum(buf, checksum_enabled)?;
    if stored != computed {
        let pgno = read_pgno(buf).unwrap_or(u32::MAX);
        warn!("btcow: checksum mismatch on page {pgno}: stored={stored:#x} computed={computed:#x}");
        return Err(Error::corrupt(format!(
            "checksum mismatch: stored={stored:#x} computed={computed:#x}"
        )));
    }
    Ok(())
}

pub fn stamp_checksum(buf: &mut [u8], checksum_enabled: bool) -> Result<()> {
    let checksum = page_checksum(buf, checksum_enabled)?;
    write_checksum(buf, checksum)
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    let bytes = buf
        .get(off..off + 2)
        .ok_or_else(|| Error::corrupt("read_u16 out of bounds"))?;
    Ok(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn write_u16(buf: &mut [u8], off: usize, v: u16) -> Result<()> {
    let bytes = buf
        .get_mut(off..off + 2)
        .ok_or_else(|| Error::corrupt("write_u16 out of bounds"))?;
    bytes.copy_from_slice(&v.to_ne_bytes());
    Ok(())
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    let bytes = buf
        .get(off..off + 4)
        .ok_or_else(|| Error::corrupt("read_u32 out of bounds"))?;
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_u32(buf: &mut [u8], off: usize, v: u32) -> Result<()> {
    let bytes = buf
        .get_mut(off..off + 4)
        .ok_or_else(|| Error::corrupt("write_u32 out of bounds"))?;
    bytes.copy_from_slice(&v.to_ne_bytes());
    Ok(())
}
