//! The sink seam between producers and the tree they feed.
//!
//! Three producers drive a [`TreeSink`]: the live walker, the dump importer,
//! and the refresh walker. The memory sink builds or merges the in-memory
//! tree; the dump crate provides a streaming sink that writes the dump
//! format instead.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use dirmass_core::{
    DirInfo, Entry, EntryId, EntryKind, EntryStat, Ext, FileFlags, LinkInfo, Tree,
};

use crate::links::LinkTable;
use crate::merge::ScanDir;

/// Why an entry is a placeholder rather than a real file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// Stat or open failed.
    Error,
    /// Matched an exclusion pattern or a cache-dir tag.
    Pattern,
    /// Lives on a different filesystem than its parent.
    OtherFs,
    /// Lives on a pseudo-filesystem.
    Kernfs,
}

/// Consumer of a traversal, one entry at a time.
///
/// `stat` is absent when nothing could be recorded for the entry (pattern
/// exclusions are decided before stat; failed stats have no data).
pub trait TreeSink {
    /// The scan root. Called exactly once, before anything else.
    fn root(&mut self, name: &[u8], stat: &EntryStat) -> io::Result<()>;

    /// A non-directory entry, or a special placeholder of any kind.
    fn item(&mut self, name: &[u8], stat: Option<&EntryStat>, special: Option<Special>)
        -> io::Result<()>;

    /// Descend into a directory. Balanced by [`TreeSink::leave`].
    fn enter(&mut self, name: &[u8], stat: &EntryStat) -> io::Result<()>;

    /// Ascend out of the directory most recently entered.
    fn leave(&mut self) -> io::Result<()>;

    /// The current directory failed to list further entries.
    fn read_error(&mut self) -> io::Result<()>;

    /// No more entries will arrive; settle deferred state and flush.
    fn finalize(&mut self) -> io::Result<()>;
}

fn special_flags(sp: Special, stat: Option<&EntryStat>) -> FileFlags {
    FileFlags {
        notreg: stat.is_some_and(|s| s.notreg),
        other_fs: sp == Special::OtherFs,
        kernfs: sp == Special::Kernfs,
        excluded: sp == Special::Pattern,
        err: sp == Special::Error,
    }
}

fn merge_ext(entry: &mut Entry, new: Option<Ext>) {
    entry.ext = match (entry.ext, new) {
        // Monotone clock guard: never let a refresh move mtime backwards.
        (Some(old), Some(mut fresh)) => {
            fresh.mtime = fresh.mtime.max(old.mtime);
            Some(fresh)
        }
        (_, fresh) => fresh,
    };
}

/// Sink that materializes entries into a [`Tree`].
///
/// In build mode it populates an empty tree; in refresh mode it merges fresh
/// observations into an existing subtree through per-directory [`ScanDir`]
/// tables.
pub struct MemSink<'t> {
    tree: &'t mut Tree,
    parents: Vec<EntryId>,
    frames: Vec<Option<ScanDir>>,
    links: LinkTable,
}

impl<'t> MemSink<'t> {
    /// Populate an empty tree from scratch.
    pub fn build(tree: &'t mut Tree) -> Self {
        Self {
            tree,
            parents: Vec::new(),
            frames: Vec::new(),
            links: LinkTable::new(),
        }
    }

    /// Merge into the directory at the end of `chain` (root first).
    ///
    /// The producer must not call [`TreeSink::root`] in this mode; it walks
    /// the target directory's children directly.
    pub fn refresh(tree: &'t mut Tree, chain: &[EntryId]) -> Self {
        debug_assert!(!chain.is_empty());
        let target = chain[chain.len() - 1];
        let mut frames: Vec<Option<ScanDir>> = chain[..chain.len() - 1]
            .iter()
            .map(|_| None)
            .collect();
        frames.push(Some(ScanDir::new(&tree.arena, target)));
        if let Some(d) = tree.arena.get_mut(target).dir_mut() {
            d.err = false;
            d.suberr = false;
        }
        Self {
            tree,
            parents: chain.to_vec(),
            frames,
            links: LinkTable::new(),
        }
    }

    fn cur_dir(&self) -> EntryId {
        self.parents[self.parents.len() - 1]
    }

    /// Allocate a non-directory entry and link it at the head of `parent`.
    fn create_entry(
        &mut self,
        parent: EntryId,
        name: &[u8],
        stat: Option<&EntryStat>,
        special: Option<Special>,
    ) -> EntryId {
        let zero = EntryStat::default();
        let s = stat.unwrap_or(&zero);
        let (kind, size, blocks) = match special {
            Some(sp) => {
                let sizes = if sp == Special::Error {
                    (s.size, s.blocks)
                } else {
                    (0, 0)
                };
                (EntryKind::File(special_flags(sp, stat)), sizes.0, sizes.1)
            }
            None if s.hardlink => (
                EntryKind::Link(LinkInfo {
                    ino: s.ino,
                    nlink: s.nlink.max(1),
                }),
                s.size,
                s.blocks,
            ),
            None => (
                EntryKind::File(FileFlags {
                    notreg: s.notreg,
                    ..FileFlags::default()
                }),
                s.size,
                s.blocks,
            ),
        };
        let id = self.tree.arena.alloc(Entry {
            name: name.into(),
            size,
            blocks,
            parent: None,
            next: None,
            kind,
            ext: stat.and_then(|s| s.ext),
        });
        self.tree.arena.link_child(parent, id);
        id
    }

    /// Charge a fresh entry to its ancestors and park hardlinks.
    fn register(&mut self, parent: EntryId, id: EntryId) {
        self.tree.arena.add_stats(id);
        if let Some(link) = self.tree.arena.get(id).link().copied() {
            if let Some(dev) = self.tree.arena.get(parent).dir().map(|d| d.dev) {
                self.links.observe(dev, link.ino, id);
            }
        }
    }

    /// Reconcile a fresh non-directory observation against an existing child.
    fn merge_item(
        &mut self,
        parent: EntryId,
        old: EntryId,
        name: &[u8],
        stat: Option<&EntryStat>,
        special: Option<Special>,
    ) {
        let arena = &mut self.tree.arena;
        if let Some(sp) = special {
            // Only file-kind nodes are reused for specials.
            if arena.get(old).file().is_some() {
                if sp != Special::Error {
                    let (osize, oblocks) = (arena.get(old).size, arena.get(old).blocks);
                    arena.uncharge(old, osize, oblocks, 0);
                    let e = arena.get_mut(old);
                    e.size = 0;
                    e.blocks = 0;
                }
                let e = arena.get_mut(old);
                e.kind = EntryKind::File(special_flags(sp, stat));
                merge_ext(e, stat.and_then(|s| s.ext));
                if sp == Special::Error {
                    arena.mark_child_err(parent);
                }
            } else {
                arena.remove_subtree(old);
                let id = self.create_entry(parent, name, stat, special);
                self.register(parent, id);
            }
            return;
        }

        let zero = EntryStat::default();
        let s = stat.unwrap_or(&zero);
        let same_kind = if s.hardlink {
            arena.get(old).link().is_some_and(|l| l.ino == s.ino)
        } else {
            arena.get(old).file().is_some()
        };
        if !same_kind {
            arena.remove_subtree(old);
            let id = self.create_entry(parent, name, stat, None);
            self.register(parent, id);
            return;
        }

        if s.hardlink {
            // The old proportional share is exact; retract it before the
            // fresh one is parked for this scan's finalize.
            arena.del_link_share(old);
            let e = arena.get_mut(old);
            e.size = s.size;
            e.blocks = s.blocks;
            if let Some(l) = e.link_mut() {
                l.nlink = s.nlink.max(1);
            }
            merge_ext(arena.get_mut(old), s.ext);
            if let Some(dev) = arena.get(parent).dir().map(|d| d.dev) {
                self.links.observe(dev, s.ino, old);
            }
        } else {
            let (osize, oblocks) = (arena.get(old).size, arena.get(old).blocks);
            arena.uncharge(old, osize, oblocks, 0);
            let e = arena.get_mut(old);
            e.size = s.size;
            e.blocks = s.blocks;
            e.kind = EntryKind::File(FileFlags {
                notreg: s.notreg,
                ..FileFlags::default()
            });
            merge_ext(e, s.ext);
            arena.charge(old, s.size, s.blocks, 0);
        }
    }

}

impl TreeSink for MemSink<'_> {
    fn root(&mut self, name: &[u8], stat: &EntryStat) -> io::Result<()> {
        let dev = self.tree.devices.intern(stat.dev);
        let id = self.tree.arena.alloc(Entry {
            name: name.into(),
            size: 0,
            blocks: 0,
            parent: None,
            next: None,
            kind: EntryKind::Dir(DirInfo::new(dev)),
            ext: stat.ext,
        });
        self.tree.root = id;
        self.tree.root_path = PathBuf::from(OsStr::from_bytes(name));
        self.parents.push(id);
        self.frames.push(None);
        Ok(())
    }

    fn item(
        &mut self,
        name: &[u8],
        stat: Option<&EntryStat>,
        special: Option<Special>,
    ) -> io::Result<()> {
        let parent = self.cur_dir();
        if let Some(Some(sd)) = self.frames.last_mut() {
            if let Some(old) = sd.take(name) {
                self.merge_item(parent, old, name, stat, special);
                return Ok(());
            }
        }
        let id = self.create_entry(parent, name, stat, special);
        self.register(parent, id);
        Ok(())
    }

    fn enter(&mut self, name: &[u8], stat: &EntryStat) -> io::Result<()> {
        let parent = self.cur_dir();
        let mut reuse = None;
        if let Some(Some(sd)) = self.frames.last_mut() {
            if let Some(old) = sd.take(name) {
                let same_dev = self
                    .tree
                    .arena
                    .get(old)
                    .dir()
                    .is_some_and(|d| self.tree.devices.resolve(d.dev) == stat.dev);
                if same_dev {
                    reuse = Some(old);
                } else {
                    self.tree.arena.remove_subtree(old);
                }
            }
        }
        let id = match reuse {
            Some(old) => {
                if let Some(d) = self.tree.arena.get_mut(old).dir_mut() {
                    d.err = false;
                    d.suberr = false;
                }
                merge_ext(self.tree.arena.get_mut(old), stat.ext);
                self.frames.push(Some(ScanDir::new(&self.tree.arena, old)));
                old
            }
            None => {
                let dev = self.tree.devices.intern(stat.dev);
                let id = self.tree.arena.alloc(Entry {
                    name: name.into(),
                    size: 0,
                    blocks: 0,
                    parent: None,
                    next: None,
                    kind: EntryKind::Dir(DirInfo::new(dev)),
                    ext: stat.ext,
                });
                self.tree.arena.link_child(parent, id);
                self.tree.arena.add_stats(id);
                self.frames.push(None);
                id
            }
        };
        self.parents.push(id);
        Ok(())
    }

    fn leave(&mut self) -> io::Result<()> {
        if let Some(Some(sd)) = self.frames.pop() {
            sd.prune(&mut self.tree.arena);
        }
        self.parents.pop();
        Ok(())
    }

    fn read_error(&mut self) -> io::Result<()> {
        self.tree.arena.mark_read_error(self.cur_dir());
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        while let Some(frame) = self.frames.pop() {
            if let Some(sd) = frame {
                sd.prune(&mut self.tree.arena);
            }
        }
        self.parents.clear();
        self.links.finalize(&mut self.tree.arena);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_stat(dev: u64) -> EntryStat {
        EntryStat {
            is_dir: true,
            dev,
            ..EntryStat::default()
        }
    }

    fn file_stat(size: u64, blocks: u64) -> EntryStat {
        EntryStat {
            size,
            blocks,
            nlink: 1,
            ..EntryStat::default()
        }
    }

    #[test]
    fn test_build_simple_tree() {
        let mut tree = Tree::empty();
        {
            let mut sink = MemSink::build(&mut tree);
            sink.root(b"/scan", &dir_stat(1)).unwrap();
            sink.item(b"a", Some(&file_stat(1000, 8)), None).unwrap();
            sink.enter(b"b", &dir_stat(1)).unwrap();
            sink.item(b"c", Some(&file_stat(500, 8)), None).unwrap();
            sink.leave().unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 1500);
        assert_eq!(tree.root_entry().blocks, 16);
        assert_eq!(tree.total_items(), 3);
        let b = tree.lookup_dir(&[b"b"]).unwrap();
        assert_eq!(tree.arena.get(b).size, 500);
        assert_eq!(tree.arena.get(b).blocks, 8);
    }

    #[test]
    fn test_build_hardlink_pair() {
        let mut tree = Tree::empty();
        {
            let mut sink = MemSink::build(&mut tree);
            sink.root(b"/scan", &dir_stat(1)).unwrap();
            let link = EntryStat {
                hardlink: true,
                ino: 42,
                nlink: 2,
                size: 100,
                blocks: 8,
                ..EntryStat::default()
            };
            sink.item(b"x", Some(&link), None).unwrap();
            sink.item(b"y", Some(&link), None).unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 100);
        assert_eq!(tree.root_entry().blocks, 8);
        let ids: Vec<_> = tree.arena.children(tree.root).collect();
        assert_eq!(ids.len(), 2);
        for id in ids {
            assert_eq!(tree.arena.get(id).link().unwrap().ino, 42);
        }
    }

    #[test]
    fn test_special_zeroes_contribution() {
        let mut tree = Tree::empty();
        {
            let mut sink = MemSink::build(&mut tree);
            sink.root(b"/scan", &dir_stat(1)).unwrap();
            sink.item(b"keep.txt", Some(&file_stat(10, 1)), None).unwrap();
            sink.item(b"drop.tmp", None, Some(Special::Pattern)).unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 10);
        assert_eq!(tree.total_items(), 2);
        let excluded = tree.arena.find_child(tree.root, b"drop.tmp").unwrap();
        let flags = tree.arena.get(excluded).file().unwrap();
        assert!(flags.excluded);
        assert_eq!(tree.arena.get(excluded).size, 0);
    }

    #[test]
    fn test_error_special_marks_parent() {
        let mut tree = Tree::empty();
        {
            let mut sink = MemSink::build(&mut tree);
            sink.root(b"/scan", &dir_stat(1)).unwrap();
            sink.enter(b"sub", &dir_stat(1)).unwrap();
            sink.item(b"bad", None, Some(Special::Error)).unwrap();
            sink.leave().unwrap();
            sink.finalize().unwrap();
        }
        let sub = tree.lookup_dir(&[b"sub"]).unwrap();
        assert!(tree.arena.get(sub).dir().unwrap().err);
        assert!(tree.arena.get(sub).dir().unwrap().suberr);
        assert!(tree.root_entry().dir().unwrap().suberr);
        assert!(!tree.root_entry().dir().unwrap().err);
    }

    fn build_base() -> Tree {
        let mut tree = Tree::empty();
        {
            let mut sink = MemSink::build(&mut tree);
            sink.root(b"/scan", &dir_stat(1)).unwrap();
            sink.item(b"a", Some(&file_stat(1000, 8)), None).unwrap();
            sink.enter(b"b", &dir_stat(1)).unwrap();
            sink.item(b"c", Some(&file_stat(500, 8)), None).unwrap();
            sink.leave().unwrap();
            sink.finalize().unwrap();
        }
        tree
    }

    #[test]
    fn test_refresh_prunes_and_adds() {
        let mut tree = build_base();
        let chain = vec![tree.root];
        {
            let mut sink = MemSink::refresh(&mut tree, &chain);
            // "a" disappeared; "b/c" still there; "d" is new.
            sink.enter(b"b", &dir_stat(1)).unwrap();
            sink.item(b"c", Some(&file_stat(500, 8)), None).unwrap();
            sink.leave().unwrap();
            sink.item(b"d", Some(&file_stat(77, 1)), None).unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 577);
        assert_eq!(tree.total_items(), 3);
        assert!(tree.arena.find_child(tree.root, b"a").is_none());
        assert!(tree.arena.find_child(tree.root, b"d").is_some());
    }

    #[test]
    fn test_refresh_updates_in_place() {
        let mut tree = build_base();
        let b = tree.lookup_dir(&[b"b"]).unwrap();
        let c = tree.arena.find_child(b, b"c").unwrap();
        let chain = vec![tree.root];
        {
            let mut sink = MemSink::refresh(&mut tree, &chain);
            sink.item(b"a", Some(&file_stat(1000, 8)), None).unwrap();
            sink.enter(b"b", &dir_stat(1)).unwrap();
            sink.item(b"c", Some(&file_stat(900, 9)), None).unwrap();
            sink.leave().unwrap();
            sink.finalize().unwrap();
        }
        // Same node, fresh sizes, consistent ancestors.
        assert_eq!(tree.arena.find_child(b, b"c"), Some(c));
        assert_eq!(tree.arena.get(c).size, 900);
        assert_eq!(tree.arena.get(b).size, 900);
        assert_eq!(tree.total_size(), 1900);
        assert_eq!(tree.root_entry().blocks, 17);
    }

    #[test]
    fn test_refresh_kind_change_replaces_node() {
        let mut tree = build_base();
        let chain = vec![tree.root];
        {
            let mut sink = MemSink::refresh(&mut tree, &chain);
            // "a" is now a directory with one child.
            sink.enter(b"a", &dir_stat(1)).unwrap();
            sink.item(b"inner", Some(&file_stat(5, 1)), None).unwrap();
            sink.leave().unwrap();
            sink.enter(b"b", &dir_stat(1)).unwrap();
            sink.item(b"c", Some(&file_stat(500, 8)), None).unwrap();
            sink.leave().unwrap();
            sink.finalize().unwrap();
        }
        let a = tree.lookup_dir(&[b"a"]).unwrap();
        assert!(tree.arena.get(a).is_dir());
        assert_eq!(tree.arena.get(a).size, 5);
        assert_eq!(tree.total_size(), 505);
    }

    #[test]
    fn test_refresh_idempotent() {
        let mut tree = build_base();
        let before_size = tree.total_size();
        let before_items = tree.total_items();
        let chain = vec![tree.root];
        {
            let mut sink = MemSink::refresh(&mut tree, &chain);
            sink.item(b"a", Some(&file_stat(1000, 8)), None).unwrap();
            sink.enter(b"b", &dir_stat(1)).unwrap();
            sink.item(b"c", Some(&file_stat(500, 8)), None).unwrap();
            sink.leave().unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), before_size);
        assert_eq!(tree.total_items(), before_items);
        assert_eq!(tree.root_entry().blocks, 16);
    }

    #[test]
    fn test_refresh_hardlink_share_is_retracted() {
        let mut tree = Tree::empty();
        let link = EntryStat {
            hardlink: true,
            ino: 42,
            nlink: 2,
            size: 100,
            blocks: 8,
            ..EntryStat::default()
        };
        {
            let mut sink = MemSink::build(&mut tree);
            sink.root(b"/scan", &dir_stat(1)).unwrap();
            sink.item(b"x", Some(&link), None).unwrap();
            sink.item(b"y", Some(&link), None).unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 100);

        // On refresh the pair is observed again, unchanged.
        let chain = vec![tree.root];
        {
            let mut sink = MemSink::refresh(&mut tree, &chain);
            sink.item(b"x", Some(&link), None).unwrap();
            sink.item(b"y", Some(&link), None).unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 100);
        assert_eq!(tree.root_entry().blocks, 8);

        // One of the two names disappears: half a copy remains.
        let chain = vec![tree.root];
        {
            let mut sink = MemSink::refresh(&mut tree, &chain);
            sink.item(b"x", Some(&link), None).unwrap();
            sink.finalize().unwrap();
        }
        assert_eq!(tree.total_size(), 50);
    }
}
