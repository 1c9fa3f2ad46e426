//! Core types for dirmass.
//!
//! This crate provides the memory-frugal tree model shared by the live
//! scanner, the dump importer and the browser UI: arena-allocated entries,
//! device interning, the traversal path buffer, scan configuration and the
//! error taxonomy.

mod config;
mod devices;
mod entry;
mod error;
mod path;
mod tree;

pub use config::{ScanOptions, ScanOptionsBuilder, UiLevel};
pub use devices::{DevId, DevRegistry};
pub use entry::{
    Arena, Children, DirInfo, Entry, EntryId, EntryKind, EntryStat, Ext, FileFlags, LinkInfo,
};
pub use error::ScanError;
pub use path::PathStack;
pub use tree::{ScanStats, Tree};
