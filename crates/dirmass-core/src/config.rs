//! Scan configuration types.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// How much feedback a scan renders while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiLevel {
    /// No feedback at all.
    None,
    /// A single updating status line.
    Line,
    /// The full interactive display.
    #[default]
    Full,
}

/// Configuration for scanning operations.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct ScanOptions {
    /// Stay on the filesystem of the scan root.
    #[builder(default = "false")]
    #[serde(default)]
    pub same_fs: bool,

    /// Follow symbolic links to non-directories.
    #[builder(default = "false")]
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Skip pseudo-filesystems (proc, sys, cgroup, ...).
    #[builder(default = "false")]
    #[serde(default)]
    pub exclude_kernfs: bool,

    /// Skip directories carrying a CACHEDIR.TAG signature.
    #[builder(default = "false")]
    #[serde(default)]
    pub exclude_caches: bool,

    /// Glob patterns to exclude, matched against the path and each of its
    /// trailing suffixes.
    #[builder(default)]
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Collect extended metadata (uid, gid, mode, mtime).
    #[builder(default = "false")]
    #[serde(default)]
    pub extended: bool,

    /// Minimum interval between feedback updates.
    #[builder(default = "default_update_delay()")]
    #[serde(default = "default_update_delay")]
    pub update_delay: Duration,

    /// Feedback mode while scanning.
    #[builder(default)]
    #[serde(default)]
    pub scan_ui: UiLevel,
}

fn default_update_delay() -> Duration {
    Duration::from_millis(100)
}

impl ScanOptions {
    /// Create a scan options builder.
    pub fn builder() -> ScanOptionsBuilder {
        ScanOptionsBuilder::default()
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            same_fs: false,
            follow_symlinks: false,
            exclude_kernfs: false,
            exclude_caches: false,
            exclude_patterns: Vec::new(),
            extended: false,
            update_delay: default_update_delay(),
            scan_ui: UiLevel::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let opts = ScanOptions::builder()
            .same_fs(true)
            .exclude_patterns(vec!["*.tmp".to_string()])
            .extended(true)
            .build()
            .unwrap();

        assert!(opts.same_fs);
        assert!(opts.extended);
        assert_eq!(opts.exclude_patterns, vec!["*.tmp".to_string()]);
        assert!(!opts.follow_symlinks);
        assert_eq!(opts.scan_ui, UiLevel::Full);
    }

    #[test]
    fn test_options_default() {
        let opts = ScanOptions::default();
        assert!(!opts.same_fs);
        assert!(!opts.exclude_caches);
        assert!(opts.exclude_patterns.is_empty());
        assert_eq!(opts.update_delay, Duration::from_millis(100));
    }
}
