use std::fs;
use std::path::Path;

use tempfile::TempDir;

use dirmass_scan::{
    refresh_subtree, scan_root, EntryKind, Feedback, NullMonitor, ScanError, ScanMonitor,
    ScanOptions, ScanProgress, Tree,
};

fn scan(path: &Path, opts: &ScanOptions) -> Tree {
    scan_root(path, opts, &mut NullMonitor).unwrap()
}

/// Flatten a tree into (path, size, blocks, items) rows for comparison.
fn snapshot(tree: &Tree) -> Vec<(Vec<u8>, u64, u64, u64)> {
    let mut rows = Vec::new();
    let mut stack = vec![(tree.root, Vec::new())];
    while let Some((id, prefix)) = stack.pop() {
        let e = tree.arena.get(id);
        let mut path = prefix.clone();
        path.extend_from_slice(b"/");
        path.extend_from_slice(&e.name);
        let items = e.dir().map_or(0, |d| d.items);
        rows.push((path.clone(), e.size, e.blocks, items));
        if e.is_dir() {
            for child in tree.arena.children(id) {
                stack.push((child, path.clone()));
            }
        }
    }
    rows.sort();
    rows
}

#[test]
fn test_scan_sizes_aggregate() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a"), vec![0u8; 1000]).unwrap();
    fs::create_dir(tmp.path().join("b")).unwrap();
    fs::write(tmp.path().join("b/c"), vec![0u8; 500]).unwrap();

    let tree = scan(tmp.path(), &ScanOptions::default());
    assert_eq!(tree.total_size(), 1500);
    assert_eq!(tree.total_items(), 3);

    let a = tree.arena.find_child(tree.root, b"a").unwrap();
    let b = tree.lookup_dir(&[b"b"]).unwrap();
    let c = tree.arena.find_child(b, b"c").unwrap();
    assert_eq!(tree.arena.get(a).size, 1000);
    assert_eq!(tree.arena.get(b).size, 500);
    assert_eq!(tree.arena.get(c).size, 500);

    // Directory entries contribute none of their own blocks.
    let expected_blocks = tree.arena.get(a).blocks + tree.arena.get(c).blocks;
    assert_eq!(tree.root_entry().blocks, expected_blocks);
    assert_eq!(tree.arena.get(b).blocks, tree.arena.get(c).blocks);
}

#[test]
fn test_scan_hardlink_pair_counts_once() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("x"), vec![0u8; 100]).unwrap();
    fs::hard_link(tmp.path().join("x"), tmp.path().join("y")).unwrap();

    let tree = scan(tmp.path(), &ScanOptions::default());
    assert_eq!(tree.total_size(), 100);
    assert_eq!(tree.total_items(), 2);

    let x = tree.arena.find_child(tree.root, b"x").unwrap();
    let y = tree.arena.find_child(tree.root, b"y").unwrap();
    let lx = tree.arena.get(x).link().copied().unwrap();
    let ly = tree.arena.get(y).link().copied().unwrap();
    assert_eq!(lx.ino, ly.ino);
    assert_eq!(lx.nlink, 2);
    assert_eq!(tree.root_entry().blocks, tree.arena.get(x).blocks);
}

#[test]
fn test_scan_exclude_pattern() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("keep.txt"), vec![0u8; 64]).unwrap();
    fs::write(tmp.path().join("drop.tmp"), vec![0u8; 4096]).unwrap();

    let opts = ScanOptions::builder()
        .exclude_patterns(vec!["*.tmp".to_string()])
        .build()
        .unwrap();
    let tree = scan(tmp.path(), &opts);

    assert_eq!(tree.total_size(), 64);
    let dropped = tree.arena.find_child(tree.root, b"drop.tmp").unwrap();
    let flags = tree.arena.get(dropped).file().copied().unwrap();
    assert!(flags.excluded);
    assert_eq!(tree.arena.get(dropped).size, 0);
    assert_eq!(tree.arena.get(dropped).blocks, 0);
}

#[test]
fn test_excluded_directory_does_not_recurse() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("skipme")).unwrap();
    fs::write(tmp.path().join("skipme/huge"), vec![0u8; 8192]).unwrap();

    let opts = ScanOptions::builder()
        .exclude_patterns(vec!["skipme".to_string()])
        .build()
        .unwrap();
    let tree = scan(tmp.path(), &opts);

    assert_eq!(tree.total_size(), 0);
    assert_eq!(tree.total_items(), 1);
    let skipped = tree.arena.find_child(tree.root, b"skipme").unwrap();
    assert!(!tree.arena.get(skipped).is_dir());
    assert!(tree.arena.get(skipped).file().unwrap().excluded);
}

#[test]
fn test_symlink_is_notreg_by_default() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("t"), vec![0u8; 300]).unwrap();
    std::os::unix::fs::symlink("t", tmp.path().join("s")).unwrap();

    let tree = scan(tmp.path(), &ScanOptions::default());
    let s = tree.arena.find_child(tree.root, b"s").unwrap();
    assert!(tree.arena.get(s).file().unwrap().notreg);
}

#[test]
fn test_follow_symlinks_adopts_target() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("t"), vec![0u8; 300]).unwrap();
    std::os::unix::fs::symlink("t", tmp.path().join("s")).unwrap();

    let opts = ScanOptions::builder().follow_symlinks(true).build().unwrap();
    let tree = scan(tmp.path(), &opts);
    let s = tree.arena.find_child(tree.root, b"s").unwrap();
    assert_eq!(tree.arena.get(s).size, 300);
    assert!(!tree.arena.get(s).file().unwrap().notreg);
}

#[test]
fn test_cachedir_tag_exclusion() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("cache")).unwrap();
    fs::write(
        tmp.path().join("cache/CACHEDIR.TAG"),
        b"Signature: 8a477f597d28d172789f06886806bc55\n",
    )
    .unwrap();
    fs::write(tmp.path().join("cache/blob"), vec![0u8; 4096]).unwrap();
    fs::write(tmp.path().join("data"), vec![0u8; 10]).unwrap();

    // Without the option the tag is inert.
    let tree = scan(tmp.path(), &ScanOptions::default());
    assert!(tree.total_size() > 4096);

    let opts = ScanOptions::builder().exclude_caches(true).build().unwrap();
    let tree = scan(tmp.path(), &opts);
    assert_eq!(tree.total_size(), 10);
    let cache = tree.arena.find_child(tree.root, b"cache").unwrap();
    assert!(tree.arena.get(cache).file().unwrap().excluded);
}

#[test]
fn test_non_utf8_name_survives_scan() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let tmp = TempDir::new().unwrap();
    let name: &[u8] = &[0x80, 0xff, b'z'];
    fs::write(tmp.path().join(OsStr::from_bytes(name)), b"abc").unwrap();

    let tree = scan(tmp.path(), &ScanOptions::default());
    let id = tree.arena.find_child(tree.root, name).unwrap();
    assert_eq!(tree.arena.get(id).size, 3);
}

#[test]
fn test_scan_root_not_a_directory() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("plain"), b"x").unwrap();
    let err = scan_root(
        &tmp.path().join("plain"),
        &ScanOptions::default(),
        &mut NullMonitor,
    )
    .unwrap_err();
    assert!(matches!(err, ScanError::NotADirectory { .. }));
}

#[test]
fn test_scan_root_missing() {
    let err = scan_root(
        Path::new("/no/such/path/dirmass-test"),
        &ScanOptions::default(),
        &mut NullMonitor,
    )
    .unwrap_err();
    assert!(matches!(err, ScanError::NotFound { .. }));
}

struct StopImmediately;

impl ScanMonitor for StopImmediately {
    fn tick(&mut self, _progress: &ScanProgress<'_>) -> Feedback {
        Feedback::Stop
    }
}

#[test]
fn test_monitor_can_interrupt() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a"), b"x").unwrap();
    let err = scan_root(tmp.path(), &ScanOptions::default(), &mut StopImmediately).unwrap_err();
    assert!(matches!(err, ScanError::Interrupted));
}

#[test]
fn test_refresh_tracks_disk_changes() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("gone"), vec![0u8; 700]).unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::write(tmp.path().join("d/kept"), vec![0u8; 100]).unwrap();

    let opts = ScanOptions::default();
    let mut tree = scan(tmp.path(), &opts);
    assert_eq!(tree.total_size(), 800);
    let d = tree.lookup_dir(&[b"d"]).unwrap();
    let kept = tree.arena.find_child(d, b"kept").unwrap();

    fs::remove_file(tmp.path().join("gone")).unwrap();
    fs::write(tmp.path().join("d/fresh"), vec![0u8; 50]).unwrap();

    let chain = vec![tree.root];
    refresh_subtree(&mut tree, &chain, &opts, &mut NullMonitor).unwrap();

    assert_eq!(tree.total_size(), 150);
    assert!(tree.arena.find_child(tree.root, b"gone").is_none());
    let d = tree.lookup_dir(&[b"d"]).unwrap();
    assert!(tree.arena.find_child(d, b"fresh").is_some());
    // The unchanged entry is the same node as before.
    assert_eq!(tree.arena.find_child(d, b"kept"), Some(kept));
    assert_eq!(tree.arena.get(d).size, 150);
}

#[test]
fn test_refresh_of_subdirectory_only() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("top"), vec![0u8; 11]).unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::write(tmp.path().join("d/f"), vec![0u8; 200]).unwrap();

    let opts = ScanOptions::default();
    let mut tree = scan(tmp.path(), &opts);
    let d = tree.lookup_dir(&[b"d"]).unwrap();

    fs::write(tmp.path().join("d/f"), vec![0u8; 900]).unwrap();
    fs::write(tmp.path().join("top"), vec![0u8; 9999]).unwrap();

    let chain = vec![tree.root, d];
    refresh_subtree(&mut tree, &chain, &opts, &mut NullMonitor).unwrap();

    // Only the refreshed subtree reflects the disk; "top" keeps stale data.
    assert_eq!(tree.arena.get(d).size, 900);
    assert_eq!(tree.total_size(), 911);
}

#[test]
fn test_refresh_unchanged_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a"), vec![0u8; 123]).unwrap();
    fs::create_dir_all(tmp.path().join("b/c")).unwrap();
    fs::write(tmp.path().join("b/c/deep"), vec![0u8; 456]).unwrap();
    fs::write(tmp.path().join("b/x"), vec![0u8; 7]).unwrap();
    fs::hard_link(tmp.path().join("a"), tmp.path().join("a2")).unwrap();

    let opts = ScanOptions::default();
    let mut tree = scan(tmp.path(), &opts);
    let before = snapshot(&tree);

    let chain = vec![tree.root];
    refresh_subtree(&mut tree, &chain, &opts, &mut NullMonitor).unwrap();
    assert_eq!(snapshot(&tree), before);

    // And once more, through a subdirectory chain.
    let b = tree.lookup_dir(&[b"b"]).unwrap();
    let chain = vec![tree.root, b];
    refresh_subtree(&mut tree, &chain, &opts, &mut NullMonitor).unwrap();
    assert_eq!(snapshot(&tree), before);
}

#[test]
fn test_refresh_hardlink_removal_halves_total() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("x"), vec![0u8; 100]).unwrap();
    fs::hard_link(tmp.path().join("x"), tmp.path().join("y")).unwrap();

    let opts = ScanOptions::default();
    let mut tree = scan(tmp.path(), &opts);
    assert_eq!(tree.total_size(), 100);

    fs::remove_file(tmp.path().join("y")).unwrap();

    let chain = vec![tree.root];
    refresh_subtree(&mut tree, &chain, &opts, &mut NullMonitor).unwrap();

    // nlink dropped back to 1: the survivor is a plain file again.
    assert_eq!(tree.total_size(), 100);
    let x = tree.arena.find_child(tree.root, b"x").unwrap();
    assert!(matches!(tree.arena.get(x).kind, EntryKind::File(_)));
    assert!(tree.arena.find_child(tree.root, b"y").is_none());
}
