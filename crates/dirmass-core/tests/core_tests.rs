use dirmass_core::{
    DirInfo, Entry, EntryKind, FileFlags, LinkInfo, PathStack, ScanOptions, Tree, UiLevel,
};
use std::path::PathBuf;

fn dir(name: &[u8], tree: &mut Tree) -> Entry {
    let dev = tree.devices.intern(100);
    Entry {
        name: name.into(),
        size: 0,
        blocks: 0,
        parent: None,
        next: None,
        kind: EntryKind::Dir(DirInfo::new(dev)),
        ext: None,
    }
}

fn file(name: &[u8], size: u64, blocks: u64) -> Entry {
    Entry {
        name: name.into(),
        size,
        blocks,
        parent: None,
        next: None,
        kind: EntryKind::File(FileFlags::default()),
        ext: None,
    }
}

#[test]
fn test_aggregate_invariant_no_links() {
    // With no hardlinks and no specials, each dir's size equals the sum of
    // its children.
    let mut tree = Tree::empty();
    let root_entry = dir(b"/scan", &mut tree);
    let root = tree.arena.alloc(root_entry);
    tree.root = root;
    tree.root_path = PathBuf::from("/scan");

    let sub_entry = dir(b"b", &mut tree);
    let sub = tree.arena.alloc(sub_entry);
    tree.arena.link_child(root, sub);
    tree.arena.add_stats(sub);

    let a = tree.arena.alloc(file(b"a", 1000, 8));
    tree.arena.link_child(root, a);
    tree.arena.add_stats(a);

    let c = tree.arena.alloc(file(b"c", 500, 8));
    tree.arena.link_child(sub, c);
    tree.arena.add_stats(c);

    assert_eq!(tree.total_size(), 1500);
    assert_eq!(tree.root_entry().blocks, 16);
    assert_eq!(tree.arena.get(sub).size, 500);
    assert_eq!(tree.arena.get(sub).blocks, 8);

    let child_sum: u64 = tree
        .arena
        .children(root)
        .map(|id| tree.arena.get(id).size)
        .sum();
    assert_eq!(child_sum, tree.total_size());
}

#[test]
fn test_fully_observed_inode_sums_to_one_copy() {
    let mut tree = Tree::empty();
    let root_entry = dir(b"/scan", &mut tree);
    let root = tree.arena.alloc(root_entry);
    tree.root = root;

    let mut links = Vec::new();
    for name in [b"x".as_slice(), b"y".as_slice()] {
        let id = tree.arena.alloc(Entry {
            name: name.into(),
            size: 100,
            blocks: 8,
            parent: None,
            next: None,
            kind: EntryKind::Link(LinkInfo { ino: 42, nlink: 2 }),
            ext: None,
        });
        tree.arena.link_child(root, id);
        tree.arena.add_stats(id);
        links.push(id);
    }
    for id in links {
        tree.arena.add_link_share(id);
    }

    assert_eq!(tree.total_size(), 100);
    assert_eq!(tree.root_entry().blocks, 8);
    assert_eq!(tree.total_items(), 2);
}

#[test]
fn test_path_stack_zero_cost_pop() {
    let mut p = PathStack::from_root(b"/a");
    for _ in 0..100 {
        p.push(b"x");
    }
    for _ in 0..100 {
        p.pop();
    }
    assert_eq!(p.as_bytes(), b"/a");
}

#[test]
fn test_options_roundtrip_serde() {
    let opts = ScanOptions::builder()
        .exclude_kernfs(true)
        .scan_ui(UiLevel::Line)
        .build()
        .unwrap();
    let json = serde_json::to_string(&opts).unwrap();
    let back: ScanOptions = serde_json::from_str(&json).unwrap();
    assert!(back.exclude_kernfs);
    assert_eq!(back.scan_ui, UiLevel::Line);
}
