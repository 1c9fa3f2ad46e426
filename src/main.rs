//! dirmass - disk usage analyzer.
//!
//! Usage:
//!   dirmass scan [PATH]           Scan and show the largest entries
//!   dirmass export [PATH]         Scan straight into a dump file
//!   dirmass import FILE           Load a dump and show the largest entries
//!   dirmass --help                Show help

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result};

use dirmass_core::{EntryId, ScanOptions, Tree, UiLevel};
use dirmass_dump::{import, import_tree, open_dump_input, DumpWriter};
use dirmass_scan::{
    refresh_subtree, scan_root, scan_root_to, Feedback, NullMonitor, ScanMonitor, ScanProgress,
};

#[derive(Parser)]
#[command(
    name = "dirmass",
    version,
    about = "Find out where your disk space went",
    long_about = "dirmass walks a directory tree and accumulates apparent and \
                  allocated sizes, with hardlinks counted once.\n\n\
                  Scans can be exported as JSON dumps and imported again later."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a directory and print a size summary
    Scan {
        /// Path to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Maximum depth to display
        #[arg(short, long, default_value = "2")]
        depth: u32,

        /// Number of entries to show per directory
        #[arg(short = 'n', long, default_value = "10")]
        top: usize,

        /// Rescan once after the first pass, to exercise a warm refresh
        #[arg(long)]
        refresh: bool,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Scan a directory straight into a dump file
    Export {
        /// Path to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Read a dump file ("-" for stdin)
    Import {
        /// Dump file to read
        file: String,

        /// Re-emit as a dump instead of browsing (dump-to-dump conversion)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum depth to display
        #[arg(short, long, default_value = "2")]
        depth: u32,

        /// Number of entries to show per directory
        #[arg(short = 'n', long, default_value = "10")]
        top: usize,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Stay on the filesystem of the scan root
    #[arg(short = 'x', long)]
    same_fs: bool,

    /// Follow symlinks to non-directories
    #[arg(short = 'L', long)]
    follow_symlinks: bool,

    /// Skip pseudo-filesystems like /proc and /sys
    #[arg(long)]
    exclude_kernfs: bool,

    /// Skip directories tagged with CACHEDIR.TAG
    #[arg(long)]
    exclude_caches: bool,

    /// Glob pattern to exclude (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude_patterns: Vec<String>,

    /// Collect uid/gid/mode/mtime per entry
    #[arg(short = 'e', long)]
    extended: bool,

    /// Progress feedback while scanning
    #[arg(long, value_enum, default_value_t = UiArg::Line)]
    ui: UiArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UiArg {
    None,
    Line,
}

impl ScanArgs {
    fn to_options(&self) -> Result<ScanOptions> {
        let ui = match self.ui {
            UiArg::None => UiLevel::None,
            UiArg::Line => UiLevel::Line,
        };
        ScanOptions::builder()
            .same_fs(self.same_fs)
            .follow_symlinks(self.follow_symlinks)
            .exclude_kernfs(self.exclude_kernfs)
            .exclude_caches(self.exclude_caches)
            .exclude_patterns(self.exclude_patterns.clone())
            .extended(self.extended)
            .scan_ui(ui)
            .build()
            .context("invalid scan options")
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Scan {
            path,
            depth,
            top,
            refresh,
            scan,
        } => run_scan(&path, depth, top, refresh, &scan.to_options()?),
        Command::Export { path, output, scan } => run_export(&path, output, &scan.to_options()?),
        Command::Import {
            file,
            output,
            depth,
            top,
        } => run_import(&file, output, depth, top),
    }
}

/// Status-line monitor paced by `update_delay`.
struct LineMonitor {
    last: Option<Instant>,
    delay: Duration,
}

impl LineMonitor {
    fn new(delay: Duration) -> Self {
        Self { last: None, delay }
    }

    fn clear() {
        eprint!("\r\x1b[2K");
    }
}

impl ScanMonitor for LineMonitor {
    fn tick(&mut self, progress: &ScanProgress<'_>) -> Feedback {
        let due = self.last.map_or(true, |t| t.elapsed() >= self.delay);
        if due {
            eprint!(
                "\r\x1b[2K{} items, {} - {}",
                progress.items,
                format_size(progress.bytes),
                progress.current_path.display()
            );
            let _ = io::stderr().flush();
            self.last = Some(Instant::now());
        }
        Feedback::Continue
    }
}

fn monitor_for(opts: &ScanOptions) -> Box<dyn ScanMonitor> {
    match opts.scan_ui {
        UiLevel::None => Box::new(NullMonitor),
        _ => Box::new(LineMonitor::new(opts.update_delay)),
    }
}

fn run_scan(
    path: &PathBuf,
    depth: u32,
    top: usize,
    refresh: bool,
    opts: &ScanOptions,
) -> Result<()> {
    let start = Instant::now();
    let mut monitor = monitor_for(opts);
    let mut tree = scan_root(path, opts, monitor.as_mut()).context("scan failed")?;
    if refresh {
        let chain = vec![tree.root];
        refresh_subtree(&mut tree, &chain, opts, monitor.as_mut()).context("refresh failed")?;
    }
    if opts.scan_ui != UiLevel::None {
        LineMonitor::clear();
    }
    print_summary(&tree, start.elapsed());
    print_tree(&tree, depth, top);
    Ok(())
}

fn run_export(path: &PathBuf, output: Option<PathBuf>, opts: &ScanOptions) -> Result<()> {
    let mut monitor = monitor_for(opts);
    match output {
        Some(ref out) => {
            let file =
                File::create(out).with_context(|| format!("cannot create {}", out.display()))?;
            let mut writer = DumpWriter::new(file);
            scan_root_to(path, opts, &mut writer, monitor.as_mut()).context("export failed")?;
            if opts.scan_ui != UiLevel::None {
                LineMonitor::clear();
            }
            eprintln!("Exported to {}", out.display());
        }
        None => {
            let stdout = io::stdout().lock();
            let mut writer = DumpWriter::new(stdout);
            scan_root_to(path, opts, &mut writer, &mut NullMonitor).context("export failed")?;
        }
    }
    Ok(())
}

fn run_import(file: &str, output: Option<PathBuf>, depth: u32, top: usize) -> Result<()> {
    let start = Instant::now();
    let input = open_dump_input(file).with_context(|| format!("cannot open {file}"))?;
    match output {
        Some(ref out) => {
            let target =
                File::create(out).with_context(|| format!("cannot create {}", out.display()))?;
            let mut writer = DumpWriter::new(target);
            import(input, &mut writer, &mut NullMonitor).context("import failed")?;
            eprintln!("Converted to {}", out.display());
        }
        None => {
            let tree = import_tree(input, &mut NullMonitor).context("import failed")?;
            print_summary(&tree, start.elapsed());
            print_tree(&tree, depth, top);
        }
    }
    Ok(())
}

fn print_summary(tree: &Tree, elapsed: Duration) {
    let stats = tree.stats();
    println!();
    println!("{}", "─".repeat(60));
    println!(
        " {} - {} apparent, {} on disk",
        tree.root_path.display(),
        format_size(tree.total_size()),
        format_size(tree.total_disk_usage())
    );
    println!(" {} items, {} directories", stats.items, stats.dirs);
    println!(" Finished in {:.2}s", elapsed.as_secs_f64());
    println!("{}", "─".repeat(60));
    println!();
}

/// Print the heaviest entries, largest first.
fn print_tree(tree: &Tree, max_depth: u32, top: usize) {
    print_children(tree, tree.root, 0, max_depth, top, tree.total_size().max(1));
}

fn print_children(
    tree: &Tree,
    dir: EntryId,
    depth: u32,
    max_depth: u32,
    top: usize,
    root_size: u64,
) {
    let mut ids: Vec<_> = tree.arena.children(dir).collect();
    ids.sort_by_key(|&id| std::cmp::Reverse(tree.arena.get(id).size));

    let remaining = ids.len().saturating_sub(top);
    for &id in ids.iter().take(top) {
        let e = tree.arena.get(id);
        let name = String::from_utf8_lossy(&e.name);
        let ratio = e.size as f64 / root_size as f64 * 100.0;
        let marker = if e.is_dir() { "▸ " } else { "  " };
        println!(
            "{}{}{:<40} {:>10} {:>5.1}%{}",
            "  ".repeat(depth as usize + 1),
            marker,
            truncate(&name, 40),
            format_size(e.size),
            ratio,
            annotate(tree, id),
        );
        if e.is_dir() && depth + 1 < max_depth {
            print_children(tree, id, depth + 1, max_depth, top, root_size);
        }
    }
    if remaining > 0 {
        println!(
            "{}  ... and {} more",
            "  ".repeat(depth as usize + 1),
            remaining
        );
    }
}

fn annotate(tree: &Tree, id: EntryId) -> &'static str {
    let e = tree.arena.get(id);
    if let Some(flags) = e.file() {
        if flags.err {
            return "  [read error]";
        }
        if flags.excluded {
            return "  [excluded]";
        }
        if flags.other_fs {
            return "  [other fs]";
        }
        if flags.kernfs {
            return "  [kernfs]";
        }
    }
    if e.link().is_some() {
        return "  [hardlink]";
    }
    if e.dir().is_some_and(|d| d.err || d.suberr) {
        return "  [errors inside]";
    }
    ""
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len - 1).collect();
        format!("{cut}…")
    }
}
