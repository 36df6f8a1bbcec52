//! Overflow page codec (§3, §4.6): values too large for a leaf record body
//! spill onto a singly-linked chain of overflow pages.
//!
//! Layout: the 16-byte fixed header (its `next_pgno` union slot points at
//! the following page in the chain, or 0 for the last one), then a 2-byte
//! payload length for this page, then raw payload bytes filling the rest
//! of the page.

use crate::error::Error;
use crate::page::header::{self, PageFlags};

const PAYLOAD_LEN_OFF: usize = header::PAGE_HEADER_SIZE;
const PAYLOAD_START: usize = header::PAGE_HEADER_SIZE + 2;

pub struct OverflowPage<'a> {
    buf: &'a mut [u8],
}

impl<'a> OverflowPage<'a> {
    pub fn format(buf: &'a mut [u8], pgno: u32, payload: &[u8], next_pgno: u32) -> crate::error::Result<Self> {
        header::init_header(buf, pgno, PageFlags::Overflow)?;
        let capacity = buf.len() - PAYLOAD_START;
        if payload.len() > capacity {
            return Err(Error::corrupt("overflow payload exceeds page capacity"));
        }
        header::write_next_pgno(buf, next_pgno)?;
        buf[PAYLOAD_LEN_OFF..PAYLOAD_LEN_OFF + 2].copy_from_slice(&(payload.len() as u16).to_ne_bytes());
        buf[PAYLOAD_START..PAYLOAD_START + payload.len()].copy_from_slice(payload);
        Ok(OverflowPage { buf })
    }

    pub fn attach(buf: &'a mut [u8]) -> crate::error::Result<Self> {
        let flags = header::page_flags(buf)?;
        if flags != PageFlags::Overflow {
            return Err(Error::corrupt("not an overflow page"));
        }
        Ok(OverflowPage { buf })
    }

    pub fn next_pgno(&self) -> crate::error::Result<u32> {
        header::read_next_pgno(self.buf)
    }

    pub fn payload(&self) -> &[u8] {
        let len = u16::from_ne_bytes([self.buf[PAYLOAD_LEN_OFF], self.buf[PAYLOAD_LEN_OFF + 1]]) as usize;
        &self.buf[PAYLOAD_START..PAYLOAD_START + len]
    }

    pub fn capacity(psize: usize) -> usize {
        psize - PAYLOAD_START
    }

    pub fn stamp_checksum(&mut self, enabled: bool) {
        let _ = header::stamp_checksum(self.buf, enabled);
    }
}

/// Split `value` into page-sized chunks for a fresh overflow chain. Caller
/// allocates one pgno per chunk and links them tail-to-head (last chunk's
/// `next_pgno` is 0).
pub fn chunk_value(value: &[u8], psize: usize) -> Vec<&[u8]> {
    let cap = OverflowPage::capacity(psize);
    value.chunks(cap.max(1)).collect()
}

/// Read back a full value from a chain, given a page-fetch callback.
pub fn read_chain<F>(first_pgno: u32, mut fetch: F) -> crate::error::Result<Vec<u8>>
where
    F: FnMut(u32) -> crate::error::Result<Vec<u8>>,
{
    let mut out = Vec::new();
    let mut pgno = first_pgno;
    loop {
        let mut page_buf = fetch(pgno)?;
        let page = OverflowPage::attach(&mut page_buf)?;
        out.extend_from_slice(page.payload());
        let next = page.next_pgno()?;
        if next == 0 {
            break;
        }
        pgno = next;
    }
    Ok(out)
}
