//! Two-phase hardlink accounting.
//!
//! While a scan or import runs, hardlinked entries are parked here instead of
//! being charged to their ancestors. Once everything has been observed, each
//! occurrence's proportional share (`size / nlink`) is distributed up its own
//! ancestor chain, so a fully observed inode sums to one whole copy.

use std::collections::HashMap;

use dirmass_core::{Arena, DevId, EntryId};

/// Transient `(device, inode) -> occurrences` ledger for one scan.
#[derive(Debug, Default)]
pub struct LinkTable {
    seen: HashMap<(DevId, u64), Vec<EntryId>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of a hardlinked entry.
    pub fn observe(&mut self, dev: DevId, ino: u64, entry: EntryId) {
        self.seen.entry((dev, ino)).or_default().push(entry);
    }

    /// How many occurrences of an inode this scan has seen so far.
    pub fn observed(&self, dev: DevId, ino: u64) -> usize {
        self.seen.get(&(dev, ino)).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drain the ledger, charging every occurrence's share to its ancestors.
    ///
    /// Occurrences outside the scanned root are never seen; the displayed
    /// total then stays proportional to what was observed.
    pub fn finalize(&mut self, arena: &mut Arena) {
        for (_, occurrences) in self.seen.drain() {
            for id in occurrences {
                arena.add_link_share(id);
            }
        }
    }
}
