//! JSON dump format support for dirmass.
//!
//! One document per tree: `[MAJOR, MINOR, {metadata}, [root, entries...]]`.
//! The writer streams entries as they arrive; the reader is a hand-rolled
//! recursive-descent parser that tolerates non-UTF-8 names and skips keys it
//! does not know, so dumps remain readable across versions sharing the same
//! major number.

mod reader;
mod writer;

pub use reader::{import, import_tree, open_dump_input, DumpError};
pub use writer::{export_tree, DumpWriter, FORMAT_MAJOR, FORMAT_MINOR};
