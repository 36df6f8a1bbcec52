use std::cmp::Ordering;
use std::fmt;

/// The capability a key comparator must provide: `cmp(a, b) -> Ordering`.
///
/// The two built-in comparators (forward and reverse byte order) implement
/// this directly. A user-supplied comparator is accepted through
/// [`crate::Engine::set_cmp`]; when one is set, prefix compression is
/// disabled for the lifetime of that engine handle — a hard contract, not a
/// heuristic (design notes, §9).
pub trait Comparator: Send + Sync {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Whether this comparator permits prefix compression. Only the two
    /// built-ins return `true`.
    fn supports_prefix_compression(&self) -> bool {
        false
    }
}

/// Default: plain lexicographic byte-string order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardComparator;

impl Comparator for ForwardComparator {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn supports_prefix_compression(&self) -> bool {
        true
    }
}

/// Reverse byte-string order, selected via [`crate::options::EngineFlags::REVERSE_KEY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseComparator;

impl Comparator for ReverseComparator {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }

    fn supports_prefix_compression(&self) -> bool {
        true
    }
}

/// A user-supplied comparator function, wrapped to implement [`Comparator`].
/// Disables prefix compression unconditionally.
pub struct FnComparator<F>(pub F)
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync;

impl<F> Comparator for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.0)(a, b)
    }
}

impl<F> fmt::Debug for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnComparator").finish_non_exhaustive()
    }
}
