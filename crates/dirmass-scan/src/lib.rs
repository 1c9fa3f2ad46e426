//! Filesystem scanning engine for dirmass.
//!
//! Single-threaded, fd-relative traversal feeding a sink one entry at a
//! time: into memory for browsing, into a dump writer for export, or merged
//! into an existing tree for refresh. Hardlink accounting is two-phase so
//! that shared inodes sum to one copy across everything observed.

mod exclude;
mod links;
mod merge;
mod progress;
mod scanner;
mod sink;
mod sys;

pub use exclude::{has_cachedir_tag, KernfsCache, PatternSet};
pub use links::LinkTable;
pub use merge::ScanDir;
pub use progress::{Feedback, NullMonitor, ScanMonitor, ScanProgress};
pub use scanner::{refresh_subtree, scan_root, scan_root_to};
pub use sink::{MemSink, Special, TreeSink};

// Re-export core types for convenience
pub use dirmass_core::{
    Arena, DevId, DevRegistry, Entry, EntryId, EntryKind, EntryStat, Ext, FileFlags, LinkInfo,
    PathStack, ScanError, ScanOptions, ScanStats, Tree, UiLevel,
};
