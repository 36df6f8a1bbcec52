//! Single-writer, multi-reader copy-on-write B+-tree storage engine,
//! persisted to a single append-only file.
//!
//! Start at [`Engine::open`].

mod cache;
mod comparator;
mod cursor;
mod engine;
mod error;
mod file;
mod maintenance;
mod meta;
mod options;
mod page;
mod tree;
mod txn;

pub use crate::comparator::{Comparator, FnComparator, ForwardComparator, ReverseComparator};
pub use crate::cursor::Cursor;
pub use crate::engine::{Engine, Snapshot, Stat};
pub use crate::error::{BranchPageError, Error, LeafPageError, Result};
pub use crate::options::{CursorOp, EngineFlags, OpenOptions, PutFlags};
pub use crate::txn::WriteTxn;
