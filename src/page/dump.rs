//! Debug-only page inspection, not part of the public API surface.

use crate::page::branch::BranchPage;
use crate::page::header::{self, PageFlags};
use crate::page::leaf::LeafPage;

/// Render a page's slot directory and key count for test assertions and
/// manual inspection. Corrupt pages render their decode error instead of
/// panicking.
pub fn dump_page(buf: &mut [u8]) -> String {
    let pgno = header::read_pgno(buf).unwrap_or(u32::MAX);
    let flags = match header::page_flags(buf) {
        Ok(flags) => flags,
        Err(e) => return format!("page {pgno}: corrupt ({e})"),
    };

    match flags {
        PageFlags::Head => format!("page {pgno}: head"),
        PageFlags::Meta => format!("page {pgno}: meta"),
        PageFlags::Overflow => {
            let next = header::read_next_pgno(buf).unwrap_or(0);
            format!("page {pgno}: overflow -> {next}")
        }
        PageFlags::Leaf => match LeafPage::attach(buf) {
            Ok(page) => {
                let n = page.num_slots();
                let mut out = format!("page {pgno}: leaf, prefix={:?}, {n} slots\n", page.common_prefix());
                for i in 0..n {
                    let rec = page.record_at(i);
                    let mut key = page.common_prefix().to_vec();
                    key.extend_from_slice(rec.key_suffix);
                    out.push_str(&format!("  [{i}] {key:?} dsize={}\n", rec.dsize));
                }
                out
            }
            Err(e) => format!("page {pgno}: corrupt leaf ({e})"),
        },
        PageFlags::Branch => match BranchPage::attach(buf) {
            Ok(page) => {
                let n = page.num_slots();
                let mut out = format!("page {pgno}: branch, {n} slots\n");
                for i in 0..n {
                    let rec = page.record_at(i);
                    out.push_str(&format!("  [{i}] key_suffix={:?} child={}\n", rec.key_suffix, rec.child));
                }
                out
            }
            Err(e) => format!("page {pgno}: corrupt branch ({e})"),
        },
    }
}
