//! Recursive live-filesystem walker.
//!
//! Traversal is single-threaded and fd-relative: each directory level holds
//! its own descriptor so lookups stay correct while the filesystem changes
//! underneath. Per-entry failures become placeholder entries; only a failure
//! to open the scan root aborts.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use dirmass_core::{EntryId, Ext, PathStack, ScanError, ScanOptions, Tree};

use crate::exclude::{self, KernfsCache, PatternSet};
use crate::progress::{Feedback, ScanMonitor, ScanProgress};
use crate::sink::{MemSink, Special, TreeSink};
use crate::sys::{self, DirHandle, DirStream};

fn output_err(source: io::Error) -> ScanError {
    ScanError::Output { source }
}

/// Resolve the scan root to an absolute path, best effort.
fn absolute_root(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// Walk `path` into a fresh in-memory tree.
pub fn scan_root(
    path: &Path,
    opts: &ScanOptions,
    monitor: &mut dyn ScanMonitor,
) -> Result<Tree, ScanError> {
    let mut tree = Tree::empty();
    {
        let mut sink = MemSink::build(&mut tree);
        scan_into(path, opts, &mut sink, monitor)?;
    }
    Ok(tree)
}

/// Walk `path` into an arbitrary sink, e.g. a streaming dump writer.
pub fn scan_root_to(
    path: &Path,
    opts: &ScanOptions,
    sink: &mut dyn TreeSink,
    monitor: &mut dyn ScanMonitor,
) -> Result<(), ScanError> {
    scan_into(path, opts, sink, monitor)
}

fn scan_into(
    path: &Path,
    opts: &ScanOptions,
    sink: &mut dyn TreeSink,
    monitor: &mut dyn ScanMonitor,
) -> Result<(), ScanError> {
    let abs = absolute_root(path);
    let abs_bytes = abs.as_os_str().as_bytes().to_vec();
    let cpath = CString::new(abs_bytes.clone()).map_err(|_| ScanError::InvalidConfig {
        message: format!("scan root contains NUL: {}", abs.display()),
    })?;
    let root = DirHandle::open_root(&cpath).map_err(|e| ScanError::io(&abs, e))?;
    let st = root.fstat().map_err(|e| ScanError::io(&abs, e))?;
    let stat = sys::stat_to_entry(&st, opts.extended);
    if !stat.is_dir {
        return Err(ScanError::NotADirectory { path: abs });
    }
    debug!(path = %abs.display(), "scan start");

    let mut scanner = Scanner::new(opts, PathStack::from_root(&abs_bytes), monitor)?;
    sink.root(&abs_bytes, &stat).map_err(output_err)?;
    let stream = DirStream::new(root).map_err(|e| ScanError::io(&abs, e))?;
    scanner.walk(sink, stream, stat.dev)?;
    sink.finalize().map_err(output_err)?;

    debug!(items = scanner.items_seen, bytes = scanner.bytes_seen, "scan done");
    Ok(())
}

/// Rescan one directory of an existing tree, merging in place.
///
/// `chain` is the ancestor path of the directory to refresh, root first.
/// Entries that disappeared are pruned, new ones added, unchanged ones kept;
/// ancestor aggregates are adjusted by exact deltas throughout.
pub fn refresh_subtree(
    tree: &mut Tree,
    chain: &[EntryId],
    opts: &ScanOptions,
    monitor: &mut dyn ScanMonitor,
) -> Result<(), ScanError> {
    let target = match chain.last() {
        Some(&t) => t,
        None => {
            return Err(ScanError::InvalidConfig {
                message: "empty ancestor chain".into(),
            })
        }
    };
    let path = tree.path_of(target);
    if tree.arena.get(target).dir().is_none() {
        return Err(ScanError::NotADirectory { path });
    }
    let path_bytes = path.as_os_str().as_bytes().to_vec();
    let cpath = CString::new(path_bytes.clone()).map_err(|_| ScanError::InvalidConfig {
        message: format!("path contains NUL: {}", path.display()),
    })?;
    let handle = DirHandle::open_root(&cpath).map_err(|e| ScanError::io(&path, e))?;
    let st = handle.fstat().map_err(|e| ScanError::io(&path, e))?;
    let stat = sys::stat_to_entry(&st, opts.extended);
    if !stat.is_dir {
        return Err(ScanError::NotADirectory { path });
    }
    debug!(path = %path.display(), "refresh start");

    // Adopt the fresh device in case the mount changed underneath us.
    let dev = tree.devices.intern(stat.dev);
    let entry = tree.arena.get_mut(target);
    if let Some(d) = entry.dir_mut() {
        d.dev = dev;
    }
    if let Some(fresh) = stat.ext {
        entry.ext = Some(match entry.ext {
            Some(old) => Ext {
                mtime: fresh.mtime.max(old.mtime),
                ..fresh
            },
            None => fresh,
        });
    }

    let mut scanner = Scanner::new(opts, PathStack::from_root(&path_bytes), monitor)?;
    let mut sink = MemSink::refresh(tree, chain);
    let stream = DirStream::new(handle).map_err(|e| ScanError::io(&path, e))?;
    scanner.walk(&mut sink, stream, stat.dev)?;
    sink.finalize().map_err(output_err)?;

    debug!(items = scanner.items_seen, "refresh done");
    Ok(())
}

/// State threaded through one traversal.
struct Scanner<'a> {
    opts: &'a ScanOptions,
    patterns: PatternSet,
    kernfs: KernfsCache,
    path: PathStack,
    monitor: &'a mut dyn ScanMonitor,
    items_seen: u64,
    bytes_seen: u64,
    last_error: Option<PathBuf>,
}

impl<'a> Scanner<'a> {
    fn new(
        opts: &'a ScanOptions,
        path: PathStack,
        monitor: &'a mut dyn ScanMonitor,
    ) -> Result<Self, ScanError> {
        Ok(Self {
            opts,
            patterns: PatternSet::new(&opts.exclude_patterns)?,
            kernfs: KernfsCache::new(),
            path,
            monitor,
            items_seen: 0,
            bytes_seen: 0,
            last_error: None,
        })
    }

    fn tick(&mut self) -> Result<(), ScanError> {
        let progress = ScanProgress {
            items: self.items_seen,
            bytes: self.bytes_seen,
            current_path: self.path.as_path(),
            last_error: self.last_error.as_deref(),
        };
        match self.monitor.tick(&progress) {
            Feedback::Continue => Ok(()),
            Feedback::Stop => Err(ScanError::Interrupted),
        }
    }

    fn record_error(&mut self) {
        self.last_error = Some(self.path.as_path().to_path_buf());
    }

    fn walk(
        &mut self,
        sink: &mut dyn TreeSink,
        mut stream: DirStream,
        dir_dev: u64,
    ) -> Result<(), ScanError> {
        loop {
            match stream.next_name() {
                None => break,
                Some(Err(err)) => {
                    warn!(path = %self.path.as_path().display(), %err, "directory listing failed");
                    self.record_error();
                    sink.read_error().map_err(output_err)?;
                    break;
                }
                Some(Ok(name)) => {
                    self.path.push(&name);
                    let result = self.scan_item(sink, stream.fd(), &name, dir_dev);
                    self.path.pop();
                    result?;
                }
            }
        }
        Ok(())
    }

    fn scan_item(
        &mut self,
        sink: &mut dyn TreeSink,
        dirfd: RawFd,
        name: &[u8],
        dir_dev: u64,
    ) -> Result<(), ScanError> {
        self.items_seen += 1;
        self.tick()?;

        if self.patterns.matches(self.path.as_bytes()) {
            return sink
                .item(name, None, Some(Special::Pattern))
                .map_err(output_err);
        }

        let cname = match CString::new(name) {
            Ok(c) => c,
            Err(_) => {
                self.record_error();
                return sink
                    .item(name, None, Some(Special::Error))
                    .map_err(output_err);
            }
        };
        let st = match sys::stat_at(dirfd, &cname, false) {
            Ok(st) => st,
            Err(_) => {
                self.record_error();
                return sink
                    .item(name, None, Some(Special::Error))
                    .map_err(output_err);
            }
        };
        let mut stat = sys::stat_to_entry(&st, self.opts.extended);

        if self.opts.same_fs && stat.dev != dir_dev {
            return sink
                .item(name, Some(&stat), Some(Special::OtherFs))
                .map_err(output_err);
        }

        // Following a symlink to a directory would invite loops; only
        // non-directory targets are adopted.
        let mut no_link_class = false;
        if self.opts.follow_symlinks && stat.is_symlink {
            if let Ok(st2) = sys::stat_at(dirfd, &cname, true) {
                let target = sys::stat_to_entry(&st2, self.opts.extended);
                if !target.is_dir {
                    no_link_class = target.dev != dir_dev;
                    stat = target;
                }
            }
        }
        stat.hardlink = !stat.is_dir && stat.nlink > 1 && !no_link_class;

        if !stat.is_dir {
            self.bytes_seen += stat.size;
            return sink.item(name, Some(&stat), None).map_err(output_err);
        }

        let handle = match DirHandle::open_at(dirfd, &cname) {
            Ok(h) => h,
            Err(_) => {
                self.record_error();
                return sink
                    .item(name, Some(&stat), Some(Special::Error))
                    .map_err(output_err);
            }
        };
        if self.opts.exclude_kernfs && self.kernfs.check(stat.dev, handle.fd()) {
            return sink
                .item(name, Some(&stat), Some(Special::Kernfs))
                .map_err(output_err);
        }
        if self.opts.exclude_caches && exclude::has_cachedir_tag(handle.fd()) {
            return sink
                .item(name, Some(&stat), Some(Special::Pattern))
                .map_err(output_err);
        }
        let stream = match DirStream::new(handle) {
            Ok(s) => s,
            Err(_) => {
                self.record_error();
                return sink
                    .item(name, Some(&stat), Some(Special::Error))
                    .map_err(output_err);
            }
        };
        sink.enter(name, &stat).map_err(output_err)?;
        self.walk(sink, stream, stat.dev)?;
        sink.leave().map_err(output_err)
    }
}
