//! Exclusion policies: glob patterns, pseudo-filesystems, cache-dir tags.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use dirmass_core::ScanError;

use crate::sys;

/// Compiled exclusion patterns.
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: Vec<glob::Pattern>,
}

const MATCH_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl PatternSet {
    pub fn new(sources: &[String]) -> Result<Self, ScanError> {
        let patterns = sources
            .iter()
            .map(|s| {
                glob::Pattern::new(s).map_err(|e| ScanError::InvalidConfig {
                    message: format!("bad exclude pattern {s:?}: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Match the full path and each trailing suffix that starts after a `/`.
    ///
    /// Patterns are UTF-8 globs; paths are raw bytes and are matched through
    /// a lossy view, so non-UTF-8 bytes only ever match wildcard positions.
    pub fn matches(&self, path: &[u8]) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let text = String::from_utf8_lossy(path);
        let mut rest: &str = &text;
        loop {
            if self
                .patterns
                .iter()
                .any(|p| p.matches_with(rest, MATCH_OPTS))
            {
                return true;
            }
            match rest.find('/') {
                Some(i) => rest = &rest[i + 1..],
                None => return false,
            }
        }
    }
}

// Not exposed by the `libc` crate; values match Linux's statfs.h.
#[cfg(target_os = "linux")]
const BINFMTFS_MAGIC: libc::c_long = 0x42494e4d;
#[cfg(target_os = "linux")]
const PSTOREFS_MAGIC: libc::c_long = 0x6165676c;

/// Pseudo-filesystem magics excluded by `exclude_kernfs`.
#[cfg(target_os = "linux")]
const KERNFS_MAGICS: &[libc::c_long] = &[
    libc::PROC_SUPER_MAGIC,
    libc::SYSFS_MAGIC,
    libc::CGROUP_SUPER_MAGIC,
    libc::CGROUP2_SUPER_MAGIC,
    libc::DEBUGFS_MAGIC,
    libc::DEVPTS_SUPER_MAGIC,
    BINFMTFS_MAGIC,
    libc::BPF_FS_MAGIC,
    PSTOREFS_MAGIC,
    libc::SECURITYFS_MAGIC,
    libc::SELINUX_MAGIC,
    libc::TRACEFS_MAGIC,
];

/// Per-device cache of "is this a pseudo-filesystem" decisions.
#[derive(Debug, Default)]
pub struct KernfsCache {
    cache: HashMap<u64, bool>,
}

impl KernfsCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    pub fn check(&mut self, dev: u64, fd: RawFd) -> bool {
        if let Some(&known) = self.cache.get(&dev) {
            return known;
        }
        let kernfs = sys::fs_magic(fd)
            .map(|magic| KERNFS_MAGICS.contains(&magic))
            .unwrap_or(false);
        self.cache.insert(dev, kernfs);
        kernfs
    }

    #[cfg(not(target_os = "linux"))]
    pub fn check(&mut self, _dev: u64, _fd: RawFd) -> bool {
        false
    }
}

const CACHEDIR_SIG: &[u8; 43] = b"Signature: 8a477f597d28d172789f06886806bc55";

/// True when the directory carries a well-formed CACHEDIR.TAG.
///
/// A missing file, a short file or a wrong signature all count as "no tag".
pub fn has_cachedir_tag(dirfd: RawFd) -> bool {
    let mut buf = [0u8; 43];
    matches!(
        sys::read_file_at(dirfd, c"CACHEDIR.TAG", &mut buf),
        Ok(n) if n == buf.len() && buf == *CACHEDIR_SIG
    )
}
