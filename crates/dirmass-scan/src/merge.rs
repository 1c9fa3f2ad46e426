//! Per-directory reconciliation table used while refreshing.

use std::collections::HashMap;

use dirmass_core::{Arena, EntryId};

/// Name-keyed view of a directory's existing children.
///
/// While the directory is rescanned, each fresh observation takes its match
/// out of the table; whatever remains afterwards has disappeared from disk
/// and is pruned. This turns a refresh into a merge: unchanged entries are
/// kept, changed ones are diffed in place, vanished ones are removed.
#[derive(Debug)]
pub struct ScanDir {
    stale: HashMap<Box<[u8]>, EntryId>,
}

impl ScanDir {
    pub fn new(arena: &Arena, dir: EntryId) -> Self {
        let stale = arena
            .children(dir)
            .map(|id| (arena.get(id).name.clone(), id))
            .collect();
        Self { stale }
    }

    /// Claim the existing child with this name, if any.
    pub fn take(&mut self, name: &[u8]) -> Option<EntryId> {
        self.stale.remove(name)
    }

    pub fn remaining(&self) -> usize {
        self.stale.len()
    }

    /// Remove every child that was not re-observed.
    pub fn prune(self, arena: &mut Arena) {
        for (_, id) in self.stale {
            arena.remove_subtree(id);
        }
    }
}
