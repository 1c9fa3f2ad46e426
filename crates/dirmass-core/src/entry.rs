//! Entry model: the tagged tree node and the arena that owns it.

use crate::devices::DevId;

/// Index of an entry within its [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub u32);

impl EntryId {
    /// Position of this entry in the arena's backing storage.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Extended metadata, collected only when extended mode is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Seconds since the epoch.
    pub mtime: u64,
}

/// Flag bits carried by file-kind entries. Reset whenever the entry is
/// re-observed by a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    /// Not a regular file and not a directory: device, socket, fifo, symlink.
    pub notreg: bool,
    /// Resides on a different filesystem than its parent.
    pub other_fs: bool,
    /// Lives on a pseudo-filesystem (proc, sys, ...).
    pub kernfs: bool,
    /// Matched an exclusion pattern or a cache-dir tag.
    pub excluded: bool,
    /// Stat or open failed for this path.
    pub err: bool,
}

/// Directory payload.
#[derive(Debug, Clone)]
pub struct DirInfo {
    /// Head of the child list.
    pub sub: Option<EntryId>,
    /// Interned device id of the filesystem this directory lives on.
    pub dev: DevId,
    /// Total number of entries below this directory.
    pub items: u64,
    /// A direct child failed to be listed or stat'd. Sticky until refresh.
    pub err: bool,
    /// Some strict descendant has `err` set.
    pub suberr: bool,
}

impl DirInfo {
    pub fn new(dev: DevId) -> Self {
        Self {
            sub: None,
            dev,
            items: 0,
            err: false,
            suberr: false,
        }
    }
}

/// Hardlink payload: a non-directory observed with `nlink > 1`.
#[derive(Debug, Clone, Copy)]
pub struct LinkInfo {
    /// Inode number within the containing directory's device.
    pub ino: u64,
    /// Link count as reported by stat at observation time.
    pub nlink: u32,
}

/// What an entry is. Kind changes require delete-then-create.
#[derive(Debug, Clone)]
pub enum EntryKind {
    Dir(DirInfo),
    File(FileFlags),
    Link(LinkInfo),
}

/// A single node: name, sizes, sibling/child links and kind payload.
///
/// Names are raw byte strings; nothing here assumes UTF-8.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: Box<[u8]>,
    /// Apparent size in bytes.
    pub size: u64,
    /// Allocated size in 512-byte units.
    pub blocks: u64,
    pub parent: Option<EntryId>,
    /// Sibling link inside the parent's child list.
    pub next: Option<EntryId>,
    pub kind: EntryKind,
    pub ext: Option<Ext>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir(_))
    }

    pub fn dir(&self) -> Option<&DirInfo> {
        match &self.kind {
            EntryKind::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirInfo> {
        match &mut self.kind {
            EntryKind::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn file(&self) -> Option<&FileFlags> {
        match &self.kind {
            EntryKind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileFlags> {
        match &mut self.kind {
            EntryKind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<&LinkInfo> {
        match &self.kind {
            EntryKind::Link(l) => Some(l),
            _ => None,
        }
    }

    pub fn link_mut(&mut self) -> Option<&mut LinkInfo> {
        match &mut self.kind {
            EntryKind::Link(l) => Some(l),
            _ => None,
        }
    }

    /// The size and blocks this entry contributes to each of its ancestors.
    ///
    /// Hardlinked entries are discounted by their link count so that a fully
    /// observed inode sums to one whole copy across all of its occurrences.
    pub fn shared_size(&self) -> (u64, u64) {
        match &self.kind {
            EntryKind::Link(l) => {
                let n = u64::from(l.nlink.max(1));
                (self.size / n, self.blocks / n)
            }
            _ => (self.size, self.blocks),
        }
    }
}

/// Stat record handed from a producer (walker or importer) to a sink.
#[derive(Debug, Clone, Default)]
pub struct EntryStat {
    pub is_dir: bool,
    pub is_symlink: bool,
    pub notreg: bool,
    /// Classified as hardlink-class by the producer.
    pub hardlink: bool,
    pub size: u64,
    pub blocks: u64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u32,
    pub ext: Option<Ext>,
}

/// Push-only arena owning every entry of one tree.
///
/// Entries are never freed individually; a pruned subtree is unlinked from
/// its parent and its slots are reclaimed when the whole arena goes away.
#[derive(Debug, Default)]
pub struct Arena {
    entries: Vec<Entry>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn alloc(&mut self, entry: Entry) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(entry);
        id
    }

    pub fn get(&self, id: EntryId) -> &Entry {
        &self.entries[id.index()]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.index()]
    }

    /// Iterate the direct children of a directory in list order.
    pub fn children(&self, dir: EntryId) -> Children<'_> {
        Children {
            arena: self,
            cur: self.get(dir).dir().and_then(|d| d.sub),
        }
    }

    /// Find a direct child by name.
    pub fn find_child(&self, dir: EntryId, name: &[u8]) -> Option<EntryId> {
        self.children(dir).find(|&id| &*self.get(id).name == name)
    }

    /// Insert `child` at the head of `parent`'s child list.
    pub fn link_child(&mut self, parent: EntryId, child: EntryId) {
        let head = self.get(parent).dir().and_then(|d| d.sub);
        self.get_mut(child).next = head;
        self.get_mut(child).parent = Some(parent);
        if let Some(d) = self.get_mut(parent).dir_mut() {
            d.sub = Some(child);
        }
    }

    /// Remove `child` from `parent`'s child list without touching stats.
    pub fn unlink_child(&mut self, parent: EntryId, child: EntryId) {
        let next = self.get(child).next;
        let head = self.get(parent).dir().and_then(|d| d.sub);
        if head == Some(child) {
            if let Some(d) = self.get_mut(parent).dir_mut() {
                d.sub = next;
            }
        } else {
            let mut cur = head;
            while let Some(id) = cur {
                if self.get(id).next == Some(child) {
                    self.get_mut(id).next = next;
                    break;
                }
                cur = self.get(id).next;
            }
        }
        self.get_mut(child).next = None;
    }

    /// Add `size`/`blocks`/`items` to every ancestor of `child`.
    pub fn charge(&mut self, child: EntryId, size: u64, blocks: u64, items: u64) {
        let mut cur = self.get(child).parent;
        while let Some(id) = cur {
            let e = self.get_mut(id);
            e.size = e.size.saturating_add(size);
            e.blocks = e.blocks.saturating_add(blocks);
            if let Some(d) = e.dir_mut() {
                d.items += items;
            }
            cur = self.get(id).parent;
        }
    }

    /// Subtract `size`/`blocks`/`items` from every ancestor of `child`.
    pub fn uncharge(&mut self, child: EntryId, size: u64, blocks: u64, items: u64) {
        let mut cur = self.get(child).parent;
        while let Some(id) = cur {
            let e = self.get_mut(id);
            e.size = e.size.saturating_sub(size);
            e.blocks = e.blocks.saturating_sub(blocks);
            if let Some(d) = e.dir_mut() {
                d.items = d.items.saturating_sub(items);
            }
            cur = self.get(id).parent;
        }
    }

    /// Charge a freshly created entry to its ancestors.
    ///
    /// Hardlinked entries contribute their item count only; their size share
    /// is distributed later, once the whole scan has been observed.
    pub fn add_stats(&mut self, child: EntryId) {
        let e = self.get(child);
        let (size, blocks) = match e.kind {
            EntryKind::Link(_) => (0, 0),
            _ => (e.size, e.blocks),
        };
        let err = e.file().is_some_and(|f| f.err);
        self.charge(child, size, blocks, 1);
        if err {
            if let Some(parent) = self.get(child).parent {
                self.mark_child_err(parent);
            }
        }
    }

    /// A direct child of `dir` failed to be listed or stat'd: `err` on the
    /// directory, `suberr` from the directory upward (the failed entry is a
    /// descendant of every one of them).
    pub fn mark_child_err(&mut self, dir: EntryId) {
        if let Some(d) = self.get_mut(dir).dir_mut() {
            d.err = true;
        }
        let mut cur = Some(dir);
        while let Some(id) = cur {
            if let Some(d) = self.get_mut(id).dir_mut() {
                d.suberr = true;
            }
            cur = self.get(id).parent;
        }
    }

    /// `dir` itself failed to list further entries: `err` stays on the
    /// directory, only strict ancestors get `suberr`.
    pub fn mark_read_error(&mut self, dir: EntryId) {
        if let Some(d) = self.get_mut(dir).dir_mut() {
            d.err = true;
        }
        let mut cur = self.get(dir).parent;
        while let Some(id) = cur {
            if let Some(d) = self.get_mut(id).dir_mut() {
                d.suberr = true;
            }
            cur = self.get(id).parent;
        }
    }

    /// Add a hardlinked entry's proportional share to its ancestor chain.
    pub fn add_link_share(&mut self, link: EntryId) {
        let (size, blocks) = self.get(link).shared_size();
        self.charge(link, size, blocks, 0);
    }

    /// Retract a hardlinked entry's proportional share from its ancestors.
    pub fn del_link_share(&mut self, link: EntryId) {
        let (size, blocks) = self.get(link).shared_size();
        self.uncharge(link, size, blocks, 0);
    }

    /// Subtract a subtree's whole contribution from its ancestors and unlink
    /// it from its parent. The detached entries stay in the arena until the
    /// tree itself is dropped.
    pub fn remove_subtree(&mut self, id: EntryId) {
        let e = self.get(id);
        let (size, blocks) = e.shared_size();
        let items = 1 + e.dir().map_or(0, |d| d.items);
        let parent = e.parent;
        self.uncharge(id, size, blocks, items);
        if let Some(parent) = parent {
            self.unlink_child(parent, id);
        }
        self.get_mut(id).parent = None;
    }
}

/// Iterator over a directory's child list.
pub struct Children<'a> {
    arena: &'a Arena,
    cur: Option<EntryId>,
}

impl Iterator for Children<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let id = self.cur?;
        self.cur = self.arena.get(id).next;
        Some(id)
    }
}
