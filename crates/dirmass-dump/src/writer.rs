//! Streaming dump writer.
//!
//! Emits the versioned array format in one pass: nothing is buffered beyond
//! the writer itself, nesting is expressed by bracket depth. The same sink
//! serves live scans (entries arrive from the walker) and in-memory exports.

use std::io::{self, BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use compact_str::CompactString;

use dirmass_core::{EntryKind, EntryStat, FileFlags, Tree};
use dirmass_scan::{Special, TreeSink};

/// Dump format version emitted by this writer.
pub const FORMAT_MAJOR: u64 = 1;
pub const FORMAT_MINOR: u64 = 2;

/// Streaming sink writing the dump format.
pub struct DumpWriter<W: Write> {
    out: BufWriter<W>,
    dev_stack: Vec<u64>,
    progname: CompactString,
    progver: CompactString,
    timestamp: u64,
}

impl<W: Write> DumpWriter<W> {
    pub fn new(out: W) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            out: BufWriter::new(out),
            dev_stack: Vec::new(),
            progname: CompactString::const_new("dirmass"),
            progver: CompactString::const_new(env!("CARGO_PKG_VERSION")),
            timestamp,
        }
    }

    /// Pin the metadata timestamp, for reproducible dumps.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_program(mut self, name: &str, version: &str) -> Self {
        self.progname = CompactString::new(name);
        self.progver = CompactString::new(version);
        self
    }

    fn write_string(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(b"\"")?;
        for &b in bytes {
            match b {
                b'"' => self.out.write_all(b"\\\"")?,
                b'\\' => self.out.write_all(b"\\\\")?,
                0x08 => self.out.write_all(b"\\b")?,
                0x09 => self.out.write_all(b"\\t")?,
                0x0a => self.out.write_all(b"\\n")?,
                0x0c => self.out.write_all(b"\\f")?,
                0x0d => self.out.write_all(b"\\r")?,
                // Lax policy: anything printable goes out verbatim, UTF-8 or
                // not, so byte-exact names survive a round trip.
                b if b >= 0x20 => self.out.write_all(&[b])?,
                b => write!(self.out, "\\u{:04x}", b)?,
            }
        }
        self.out.write_all(b"\"")
    }

    fn write_entry_obj(
        &mut self,
        name: &[u8],
        stat: Option<&EntryStat>,
        special: Option<Special>,
        dev: Option<u64>,
    ) -> io::Result<()> {
        self.out.write_all(b"{\"name\":")?;
        self.write_string(name)?;
        if let Some(s) = stat {
            if !s.is_dir {
                if s.size > 0 {
                    write!(self.out, ",\"asize\":{}", s.size)?;
                }
                if s.blocks > 0 {
                    write!(self.out, ",\"dsize\":{}", s.blocks * 512)?;
                }
            }
        }
        if let Some(dev) = dev {
            write!(self.out, ",\"dev\":{dev}")?;
        }
        if let Some(s) = stat {
            if s.hardlink {
                write!(self.out, ",\"ino\":{},\"hlnkc\":true,\"nlink\":{}", s.ino, s.nlink)?;
            }
            if s.notreg && !s.is_dir {
                self.out.write_all(b",\"notreg\":true")?;
            }
        }
        match special {
            Some(Special::Error) => self.out.write_all(b",\"read_error\":true")?,
            Some(Special::Pattern) => self.out.write_all(b",\"excluded\":\"pattern\"")?,
            Some(Special::OtherFs) => self.out.write_all(b",\"excluded\":\"othfs\"")?,
            Some(Special::Kernfs) => self.out.write_all(b",\"excluded\":\"kernfs\"")?,
            None => {}
        }
        if let Some(ext) = stat.and_then(|s| s.ext) {
            write!(
                self.out,
                ",\"uid\":{},\"gid\":{},\"mode\":{},\"mtime\":{}",
                ext.uid, ext.gid, ext.mode, ext.mtime
            )?;
        }
        self.out.write_all(b"}")
    }

    /// Emit the device number only where it changes relative to the parent.
    fn dir_dev(&mut self, dev: u64) -> Option<u64> {
        let emit = self.dev_stack.last() != Some(&dev);
        self.dev_stack.push(dev);
        emit.then_some(dev)
    }
}

impl<W: Write> TreeSink for DumpWriter<W> {
    fn root(&mut self, name: &[u8], stat: &EntryStat) -> io::Result<()> {
        write!(self.out, "[{FORMAT_MAJOR},{FORMAT_MINOR},")?;
        self.out.write_all(b"{\"progname\":")?;
        let progname = self.progname.clone();
        self.write_string(progname.as_bytes())?;
        self.out.write_all(b",\"progver\":")?;
        let progver = self.progver.clone();
        self.write_string(progver.as_bytes())?;
        write!(self.out, ",\"timestamp\":{}}},\n[", self.timestamp)?;
        let dev = self.dir_dev(stat.dev);
        self.write_entry_obj(name, Some(stat), None, dev)
    }

    fn item(
        &mut self,
        name: &[u8],
        stat: Option<&EntryStat>,
        special: Option<Special>,
    ) -> io::Result<()> {
        self.out.write_all(b",\n")?;
        self.write_entry_obj(name, stat, special, None)
    }

    fn enter(&mut self, name: &[u8], stat: &EntryStat) -> io::Result<()> {
        self.out.write_all(b",\n[")?;
        let dev = self.dir_dev(stat.dev);
        self.write_entry_obj(name, Some(stat), None, dev)
    }

    fn leave(&mut self) -> io::Result<()> {
        self.dev_stack.pop();
        self.out.write_all(b"]")
    }

    fn read_error(&mut self) -> io::Result<()> {
        // The directory object is already on the wire; the listing error is
        // only representable in the in-memory model.
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.out.write_all(b"]]\n")?;
        self.out.flush()
    }
}

fn special_of(flags: &FileFlags) -> Option<Special> {
    if flags.err {
        Some(Special::Error)
    } else if flags.other_fs {
        Some(Special::OtherFs)
    } else if flags.kernfs {
        Some(Special::Kernfs)
    } else if flags.excluded {
        Some(Special::Pattern)
    } else {
        None
    }
}

/// Stream an in-memory tree through a dump writer.
pub fn export_tree<W: Write>(tree: &Tree, out: &mut DumpWriter<W>) -> io::Result<()> {
    let root = tree.root_entry();
    let stat = EntryStat {
        is_dir: true,
        dev: root
            .dir()
            .map_or(0, |d| tree.devices.resolve(d.dev)),
        ext: root.ext,
        ..EntryStat::default()
    };
    out.root(&root.name, &stat)?;
    export_children(tree, tree.root, out)?;
    out.finalize()
}

fn export_children<W: Write>(
    tree: &Tree,
    dir: dirmass_core::EntryId,
    out: &mut DumpWriter<W>,
) -> io::Result<()> {
    // Child lists grow by head insertion; reverse to recover the order the
    // entries were first observed in.
    let mut ids: Vec<_> = tree.arena.children(dir).collect();
    ids.reverse();
    for id in ids {
        let e = tree.arena.get(id);
        match &e.kind {
            EntryKind::Dir(d) => {
                let stat = EntryStat {
                    is_dir: true,
                    dev: tree.devices.resolve(d.dev),
                    ext: e.ext,
                    ..EntryStat::default()
                };
                out.enter(&e.name, &stat)?;
                export_children(tree, id, out)?;
                out.leave()?;
            }
            EntryKind::File(flags) => {
                let stat = EntryStat {
                    size: e.size,
                    blocks: e.blocks,
                    notreg: flags.notreg,
                    ext: e.ext,
                    ..EntryStat::default()
                };
                out.item(&e.name, Some(&stat), special_of(flags))?;
            }
            EntryKind::Link(l) => {
                let stat = EntryStat {
                    size: e.size,
                    blocks: e.blocks,
                    hardlink: true,
                    ino: l.ino,
                    nlink: l.nlink,
                    ext: e.ext,
                    ..EntryStat::default()
                };
                out.item(&e.name, Some(&stat), None)?;
            }
        }
    }
    Ok(())
}
