//! Append-only page file I/O (§3, §6): the head page, vectored commit
//! writes, and the exclusive single-writer file lock.
//!
//! Pages are only ever appended; the sole exceptions are the atomic
//! file-replace done by [`crate::maintenance::compact`]/`clear`, and the
//! truncation done by `revert`/`rollback`.

use crate::error::{Error, Result};
use crate::options::{OpenOptions, BT_COMMIT_PAGES};
use crate::page::header::{self, PageFlags};
use fs2::FileExt;
use log::trace;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: u32 = 0x4254_434F; // "BTCO"
pub const FORMAT_VERSION: u32 = 1;

/// Page 0: magic, version, page size, max key size. Written once at create
/// time and never rewritten.
pub struct HeadPage {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub max_key_size: u16,
}

impl HeadPage {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        header::init_header(buf, 0, PageFlags::Head)?;
        let off = header::PAGE_HEADER_SIZE;
        buf[off..off + 4].copy_from_slice(&self.magic.to_ne_bytes());
        buf[off + 4..off + 8].copy_from_slice(&self.version.to_ne_bytes());
        buf[off + 8..off + 12].copy_from_slice(&self.page_size.to_ne_bytes());
        buf[off + 12..off + 14].copy_from_slice(&self.max_key_size.to_ne_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let flags = header::page_flags(buf)?;
        if flags != PageFlags::Head {
            return Err(Error::corrupt("page 0 is not a head page"));
        }
        let off = header::PAGE_HEADER_SIZE;
        let magic = u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        if magic != MAGIC {
            return Err(Error::corrupt("bad magic, not a btcow file"));
        }
        let version = u32::from_ne_bytes([buf[off + 4], buf[off + 5], buf[off + 6], buf[off + 7]]);
        let page_size = u32::from_ne_bytes([buf[off + 8], buf[off + 9], buf[off + 10], buf[off + 11]]);
        let max_key_size = u16::from_ne_bytes([buf[off + 12], buf[off + 13]]);
        Ok(Self {
            magic,
            version,
            page_size,
            max_key_size,
        })
    }
}

pub struct Pager {
    file: File,
    path: PathBuf,
    pub page_size: u32,
    pub max_key_size: u16,
    next_pgno: u32,
    checksum_enabled: bool,
    // Held for the Pager's lifetime to keep the writer's exclusive claim on
    // the sidecar lock file alive; `None` for reader (`shared`) handles.
    _writer_lock: Option<File>,
}

/// The single-writer lock lives on a sidecar `<path>.lock` file, not on the
/// data file itself: flock's exclusive mode blocks shared locks too, so
/// locking the data file itself would also block out every reader. Taking
/// the data file with a shared lock regardless of reader/writer role lets
/// any number of readers and the one writer coexist, while still
/// serializing writers against each other (§1, §5).
fn lock_file_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".lock");
    path.with_file_name(name)
}

fn acquire_writer_lock(path: &Path) -> Result<File> {
    let lock_path = lock_file_path(path);
    let lock_file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(lock_path)?;
    lock_file.try_lock_exclusive().map_err(|_| Error::Busy)?;
    Ok(lock_file)
}

impl Pager {
    /// Create a brand-new file. Always takes the writer lock: a file being
    /// created has exactly one writer and no readers yet.
    pub fn create(path: &Path, opts: &OpenOptions) -> Result<Self> {
        let writer_lock = acquire_writer_lock(path)?;
        let mut file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.try_lock_shared().map_err(|_| Error::Busy)?;

        let checksum_enabled = !opts.flags.contains(crate::options::EngineFlags::NO_PG_CHECKSUM);
        let mut head_buf = vec![0u8; opts.page_size as usize];
        let head = HeadPage {
            magic: MAGIC,
            version: FORMAT_VERSION,
            page_size: opts.page_size,
            max_key_size: opts.max_key_size,
        };
        head.encode(&mut head_buf)?;
        header::stamp_checksum(&mut head_buf, checksum_enabled)?;
        file.write_all(&head_buf)?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: opts.page_size,
            max_key_size: opts.max_key_size,
            next_pgno: 1,
            checksum_enabled,
            _writer_lock: Some(writer_lock),
        })
    }

    /// Open an existing file. `shared` means this handle is a reader: it
    /// skips the writer lock entirely, so any number of readers can coexist
    /// with each other and with the single writer. `shared = false` takes
    /// the sidecar writer lock, so a second writer (or a writer racing a
    /// compact/clear reopen) still collides with `Busy`.
    pub fn open(path: &Path, checksum_enabled: bool, shared: bool) -> Result<Self> {
        let writer_lock = if shared {
            None
        } else {
            Some(acquire_writer_lock(path)?)
        };
        let mut file = FsOpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_shared().map_err(|_| Error::Busy)?;

        let mut head_buf = vec![0u8; header::PAGE_HEADER_SIZE + 14];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head_buf)?;
        let head = HeadPage::decode(&head_buf)?;
        if head.version != FORMAT_VERSION {
            return Err(Error::corrupt(format!("unsupported format version {}", head.version)));
        }

        let len = file.metadata()?.len();
        let next_pgno = (len / head.page_size as u64) as u32;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: head.page_size,
            max_key_size: head.max_key_size,
            next_pgno,
            checksum_enabled,
            _writer_lock: writer_lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_pgno(&self) -> u32 {
        self.next_pgno
    }

    pub fn page_count(&self) -> u32 {
        self.next_pgno
    }

    pub fn alloc_pgno(&mut self) -> u32 {
        let pgno = self.next_pgno;
        self.next_pgno += 1;
        trace!("btcow: allocated page {pgno}");
        pgno
    }

    /// Read `pgno`, verifying its checksum and that its own embedded `pgno`
    /// field matches what was asked for (§4.1, §7: checksum mismatch and
    /// pgno mismatch are both `Corrupt` conditions, not silently decoded).
    pub fn read_page(&mut self, pgno: u32) -> Result<Vec<u8>> {
        if pgno >= self.next_pgno {
            return Err(Error::corrupt(format!("pgno {pgno} out of range")));
        }
        let mut buf = vec![0u8; self.page_size as usize];
        self.file.seek(SeekFrom::Start(pgno as u64 * self.page_size as u64))?;
        self.file.read_exact(&mut buf)?;

        let on_disk_pgno = header::read_pgno(&buf)?;
        if on_disk_pgno != pgno {
            return Err(Error::corrupt(format!(
                "pgno mismatch: requested {pgno}, page header says {on_disk_pgno}"
            )));
        }
        header::verify_checksum(&buf, self.checksum_enabled)?;
        Ok(buf)
    }

    /// Append pages starting at `pgno` (which must equal the current
    /// `next_pgno`), batching writes in groups of [`BT_COMMIT_PAGES`].
    pub fn append_pages(&mut self, pgno: u32, pages: &[Vec<u8>]) -> Result<()> {
        if pgno != self.next_pgno {
            return Err(Error::corrupt("append_pages: non-contiguous pgno"));
        }
        self.file.seek(SeekFrom::Start(pgno as u64 * self.page_size as u64))?;
        for chunk in pages.chunks(BT_COMMIT_PAGES) {
            for page in chunk {
                self.file.write_all(page)?;
            }
        }
        self.next_pgno += pages.len() as u32;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn truncate_to(&mut self, pgno: u32) -> Result<()> {
        self.file.set_len(pgno as u64 * self.page_size as u64)?;
        self.next_pgno = pgno;
        Ok(())
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_reads_head_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.btcow");
        {
            let pager = Pager::create(&path, &OpenOptions::default()).unwrap();
            assert_eq!(pager.next_pgno(), 1);
        }
        let pager = Pager::open(&path, true, false).unwrap();
        assert_eq!(pager.page_size, crate::options::DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.btcow");
        let mut pager = Pager::create(&path, &OpenOptions::default()).unwrap();
        let pgno = pager.alloc_pgno();
        let mut page = vec![0u8; pager.page_size as usize];
        header::init_header(&mut page, pgno, PageFlags::Overflow).unwrap();
        page[header::PAGE_HEADER_SIZE] = 0xAB;
        header::stamp_checksum(&mut page, true).unwrap();
        pager.append_pages(pgno, &[page.clone()]).unwrap();
        let read_back = pager.read_page(pgno).unwrap();
        assert_eq!(read_back, page);
    }

    #[test]
    fn read_page_rejects_pgno_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.btcow");
        let mut pager = Pager::create(&path, &OpenOptions::default()).unwrap();
        let pgno = pager.alloc_pgno();
        let mut page = vec![0u8; pager.page_size as usize];
        header::init_header(&mut page, pgno + 1, PageFlags::Overflow).unwrap();
        header::stamp_checksum(&mut page, true).unwrap();
        pager.append_pages(pgno, &[page]).unwrap();
        assert!(matches!(pager.read_page(pgno), Err(Error::Corrupt(_))));
    }

    #[test]
    fn read_page_rejects_checksum_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.btcow");
        let mut pager = Pager::create(&path, &OpenOptions::default()).unwrap();
        let pgno = pager.alloc_pgno();
        let mut page = vec![0u8; pager.page_size as usize];
        header::init_header(&mut page, pgno, PageFlags::Overflow).unwrap();
        header::stamp_checksum(&mut page, true).unwrap();
        page[header::PAGE_HEADER_SIZE] ^= 0xFF;
        pager.append_pages(pgno, &[page]).unwrap();
        assert!(matches!(pager.read_page(pgno), Err(Error::Corrupt(_))));
    }

    #[test]
    fn second_writer_is_busy_while_first_holds_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.btcow");
        let _writer = Pager::create(&path, &OpenOptions::default()).unwrap();
        assert!(matches!(Pager::open(&path, true, false), Err(Error::Busy)));
    }

    #[test]
    fn readers_coexist_with_each_other_and_with_the_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.btcow");
        let _writer = Pager::create(&path, &OpenOptions::default()).unwrap();
        let _reader_a = Pager::open(&path, true, true).unwrap();
        let reader_b = Pager::open(&path, true, true);
        assert!(reader_b.is_ok());
    }
}
