//! Hand-rolled dump reader.
//!
//! A small lexer over an 8 KiB byte buffer plus a recursive-descent layer
//! that enforces the document grammar. JSON strings are treated as byte
//! strings: anything except unescaped control codes is accepted and UTF-8 is
//! never validated, so paths survive exactly as they were scanned. Numbers
//! are read digit-by-digit with saturation. Any failure aborts the import
//! with a line:byte diagnostic.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use dirmass_core::{EntryStat, Ext, Tree};
use dirmass_scan::{Feedback, MemSink, ScanMonitor, ScanProgress, Special, TreeSink};

/// Errors aborting an import.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        line: u64,
        col: u64,
        message: String,
    },

    #[error("incompatible dump format version {major}")]
    Version { major: u64 },

    #[error("import interrupted")]
    Interrupted,
}

const BUF_SIZE: usize = 8192;
const MONITOR_BATCH: u64 = 1024;

struct ByteReader<R: Read> {
    src: R,
    buf: Vec<u8>,
    pos: usize,
    line: u64,
    col: u64,
}

impl<R: Read> ByteReader<R> {
    fn new(src: R) -> Self {
        Self {
            src,
            buf: Vec::new(),
            pos: 0,
            line: 1,
            col: 0,
        }
    }

    fn refill(&mut self) -> Result<bool, DumpError> {
        if self.pos < self.buf.len() {
            return Ok(true);
        }
        self.buf.resize(BUF_SIZE, 0);
        self.pos = 0;
        loop {
            match self.src.read(&mut self.buf) {
                Ok(0) => {
                    self.buf.clear();
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf.truncate(n);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, DumpError> {
        if self.refill()? {
            Ok(Some(self.buf[self.pos]))
        } else {
            Ok(None)
        }
    }

    fn bump(&mut self) {
        let b = self.buf[self.pos];
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
    }

    fn next(&mut self) -> Result<Option<u8>, DumpError> {
        match self.peek()? {
            Some(b) => {
                self.bump();
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }

    fn err(&self, message: impl Into<String>) -> DumpError {
        DumpError::Parse {
            line: self.line,
            col: self.col,
            message: message.into(),
        }
    }
}

/// One parsed entry object, before it is handed to the sink.
#[derive(Default)]
struct ImportItem {
    name: Option<Vec<u8>>,
    stat: EntryStat,
    read_error: bool,
    excluded: Option<Special>,
    dev: Option<u64>,
}

impl ImportItem {
    fn special(&self) -> Option<Special> {
        if self.read_error {
            Some(Special::Error)
        } else {
            self.excluded
        }
    }
}

struct Importer<'a, R: Read> {
    rd: ByteReader<R>,
    sink: &'a mut dyn TreeSink,
    monitor: &'a mut dyn ScanMonitor,
    items: u64,
}

impl<'a, R: Read> Importer<'a, R> {
    fn new(input: R, sink: &'a mut dyn TreeSink, monitor: &'a mut dyn ScanMonitor) -> Self {
        Self {
            rd: ByteReader::new(input),
            sink,
            monitor,
            items: 0,
        }
    }

    fn run(&mut self) -> Result<(), DumpError> {
        self.expect(b'[')?;
        let major = self.number()?;
        if major != 1 {
            return Err(DumpError::Version { major });
        }
        self.expect(b',')?;
        let _minor = self.number()?;
        self.expect(b',')?;
        self.skip_ws()?;
        if self.rd.peek()? != Some(b'{') {
            return Err(self.rd.err("metadata must be an object"));
        }
        self.skip_value()?;
        self.expect(b',')?;
        self.skip_ws()?;
        if self.rd.peek()? != Some(b'[') {
            return Err(self.rd.err("root entry must be a directory"));
        }
        self.parse_dir(true, 0)?;
        self.expect(b']')?;
        self.skip_ws()?;
        if self.rd.peek()?.is_some() {
            return Err(self.rd.err("trailing data after document"));
        }
        self.sink.finalize()?;
        debug!(items = self.items, "import done");
        Ok(())
    }

    fn count_item(&mut self) -> Result<(), DumpError> {
        self.items += 1;
        if self.items % MONITOR_BATCH == 0 {
            let progress = ScanProgress {
                items: self.items,
                bytes: 0,
                current_path: Path::new(""),
                last_error: None,
            };
            if self.monitor.tick(&progress) == Feedback::Stop {
                return Err(DumpError::Interrupted);
            }
        }
        Ok(())
    }

    /// A directory: `[` own-metadata-object, then child items, then `]`.
    fn parse_dir(&mut self, root: bool, parent_dev: u64) -> Result<(), DumpError> {
        self.expect(b'[')?;
        self.skip_ws()?;
        if self.rd.peek()? != Some(b'{') {
            return Err(self.rd.err("expected directory metadata object"));
        }
        let item = self.parse_entry_object()?;
        let name = match item.name {
            Some(ref n) => n.as_slice(),
            None => return Err(self.rd.err("entry without a name")),
        };
        let dev = item.dev.unwrap_or(parent_dev);
        let stat = EntryStat {
            is_dir: true,
            dev,
            ext: item.stat.ext,
            ..EntryStat::default()
        };
        if root {
            self.sink.root(name, &stat)?;
        } else {
            self.sink.enter(name, &stat)?;
        }
        if item.read_error {
            self.sink.read_error()?;
        }
        self.count_item()?;

        loop {
            self.skip_ws()?;
            match self.rd.peek()? {
                Some(b',') => {
                    self.rd.bump();
                    self.skip_ws()?;
                    match self.rd.peek()? {
                        Some(b'[') => self.parse_dir(false, dev)?,
                        Some(b'{') => {
                            let child = self.parse_entry_object()?;
                            let name = match child.name {
                                Some(ref n) => n.as_slice(),
                                None => return Err(self.rd.err("entry without a name")),
                            };
                            let mut stat = child.stat.clone();
                            stat.dev = child.dev.unwrap_or(dev);
                            self.sink.item(name, Some(&stat), child.special())?;
                            self.count_item()?;
                        }
                        _ => return Err(self.rd.err("expected an entry object or array")),
                    }
                }
                Some(b']') => {
                    self.rd.bump();
                    break;
                }
                Some(_) => return Err(self.rd.err("expected ',' or ']'")),
                None => return Err(self.rd.err("unexpected end of input")),
            }
        }
        if !root {
            self.sink.leave()?;
        }
        Ok(())
    }

    fn parse_entry_object(&mut self) -> Result<ImportItem, DumpError> {
        self.expect(b'{')?;
        let mut item = ImportItem::default();
        let mut ext = Ext::default();
        let mut ext_seen = false;
        let mut key = Vec::new();

        self.skip_ws()?;
        if self.rd.peek()? == Some(b'}') {
            self.rd.bump();
            return Err(self.rd.err("entry without a name"));
        }
        loop {
            key.clear();
            self.string_into(&mut key)?;
            self.expect(b':')?;
            match key.as_slice() {
                b"name" => {
                    if item.name.is_some() {
                        return Err(self.rd.err("duplicate name"));
                    }
                    let mut name = Vec::new();
                    self.string_into(&mut name)?;
                    item.name = Some(name);
                }
                b"asize" => item.stat.size = self.number()?,
                b"dsize" => item.stat.blocks = self.number()? / 512,
                b"dev" => item.dev = Some(self.number()?),
                b"ino" => item.stat.ino = self.number()?,
                b"nlink" => item.stat.nlink = self.number()?.min(u64::from(u32::MAX)) as u32,
                b"hlnkc" => item.stat.hardlink = self.bool_value()?,
                b"notreg" => item.stat.notreg = self.bool_value()?,
                b"read_error" => item.read_error = self.bool_value()?,
                b"excluded" => {
                    let mut value = Vec::new();
                    self.string_into(&mut value)?;
                    item.excluded = Some(match value.as_slice() {
                        b"othfs" => Special::OtherFs,
                        b"kernfs" => Special::Kernfs,
                        // "pattern", "frmlnk" and anything from the future
                        // all land on the pattern flag.
                        _ => Special::Pattern,
                    });
                }
                b"uid" => {
                    ext.uid = self.number()?.min(u64::from(u32::MAX)) as u32;
                    ext_seen = true;
                }
                b"gid" => {
                    ext.gid = self.number()?.min(u64::from(u32::MAX)) as u32;
                    ext_seen = true;
                }
                b"mode" => {
                    ext.mode = self.number()?.min(u64::from(u32::MAX)) as u32;
                    ext_seen = true;
                }
                b"mtime" => {
                    ext.mtime = self.number()?;
                    ext_seen = true;
                }
                _ => self.skip_value()?,
            }
            self.skip_ws()?;
            match self.rd.next()? {
                Some(b',') => {
                    self.skip_ws()?;
                }
                Some(b'}') => break,
                _ => return Err(self.rd.err("expected ',' or '}'")),
            }
        }
        if item.name.is_none() {
            return Err(self.rd.err("entry without a name"));
        }
        if ext_seen {
            item.stat.ext = Some(ext);
        }
        Ok(item)
    }

    fn skip_ws(&mut self) -> Result<(), DumpError> {
        while let Some(b) = self.rd.peek()? {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.rd.bump();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn expect(&mut self, want: u8) -> Result<(), DumpError> {
        self.skip_ws()?;
        match self.rd.next()? {
            Some(b) if b == want => Ok(()),
            Some(b) => Err(self
                .rd
                .err(format!("expected '{}', found '{}'", want as char, b as char))),
            None => Err(self.rd.err(format!("expected '{}'", want as char))),
        }
    }

    fn literal(&mut self, lit: &[u8]) -> Result<(), DumpError> {
        for &want in lit {
            match self.rd.next()? {
                Some(b) if b == want => {}
                _ => return Err(self.rd.err("invalid literal")),
            }
        }
        Ok(())
    }

    fn bool_value(&mut self) -> Result<bool, DumpError> {
        self.skip_ws()?;
        match self.rd.peek()? {
            Some(b't') => {
                self.literal(b"true")?;
                Ok(true)
            }
            Some(b'f') => {
                self.literal(b"false")?;
                Ok(false)
            }
            _ => Err(self.rd.err("expected a boolean")),
        }
    }

    /// Greedy unsigned integer with saturating overflow; a fractional part
    /// or exponent is consumed and dropped, negatives clamp to zero.
    fn number(&mut self) -> Result<u64, DumpError> {
        self.skip_ws()?;
        let negative = if self.rd.peek()? == Some(b'-') {
            self.rd.bump();
            true
        } else {
            false
        };
        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some(b) = self.rd.peek()? {
            if b.is_ascii_digit() {
                self.rd.bump();
                value = value
                    .saturating_mul(10)
                    .saturating_add(u64::from(b - b'0'));
                digits += 1;
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(self.rd.err("expected a number"));
        }
        if self.rd.peek()? == Some(b'.') {
            self.rd.bump();
            while matches!(self.rd.peek()?, Some(b) if b.is_ascii_digit()) {
                self.rd.bump();
            }
        }
        if matches!(self.rd.peek()?, Some(b'e') | Some(b'E')) {
            self.rd.bump();
            if matches!(self.rd.peek()?, Some(b'+') | Some(b'-')) {
                self.rd.bump();
            }
            while matches!(self.rd.peek()?, Some(b) if b.is_ascii_digit()) {
                self.rd.bump();
            }
        }
        Ok(if negative { 0 } else { value })
    }

    fn hex4(&mut self) -> Result<u32, DumpError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let b = match self.rd.next()? {
                Some(b) => b,
                None => return Err(self.rd.err("truncated \\u escape")),
            };
            let digit = match b {
                b'0'..=b'9' => u32::from(b - b'0'),
                b'a'..=b'f' => u32::from(b - b'a') + 10,
                b'A'..=b'F' => u32::from(b - b'A') + 10,
                _ => return Err(self.rd.err("invalid \\u escape")),
            };
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn push_utf8(out: &mut Vec<u8>, cp: u32) {
        match cp {
            0..=0x7f => out.push(cp as u8),
            0x80..=0x7ff => {
                out.push(0xc0 | (cp >> 6) as u8);
                out.push(0x80 | (cp & 0x3f) as u8);
            }
            0x800..=0xffff => {
                out.push(0xe0 | (cp >> 12) as u8);
                out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
                out.push(0x80 | (cp & 0x3f) as u8);
            }
            _ => {
                out.push(0xf0 | (cp >> 18) as u8);
                out.push(0x80 | ((cp >> 12) & 0x3f) as u8);
                out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
                out.push(0x80 | (cp & 0x3f) as u8);
            }
        }
    }

    /// String content as raw bytes. Escapes are decoded; everything else,
    /// including invalid UTF-8, passes through untouched.
    fn string_into(&mut self, out: &mut Vec<u8>) -> Result<(), DumpError> {
        self.expect(b'"')?;
        loop {
            let b = match self.rd.next()? {
                Some(b) => b,
                None => return Err(self.rd.err("unterminated string")),
            };
            match b {
                b'"' => return Ok(()),
                b'\\' => {
                    let esc = match self.rd.next()? {
                        Some(e) => e,
                        None => return Err(self.rd.err("unterminated string")),
                    };
                    match esc {
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'u' => {
                            let hi = self.hex4()?;
                            if (0xd800..0xdc00).contains(&hi) {
                                if self.rd.next()? != Some(b'\\') || self.rd.next()? != Some(b'u') {
                                    return Err(self.rd.err("unpaired surrogate"));
                                }
                                let lo = self.hex4()?;
                                if !(0xdc00..0xe000).contains(&lo) {
                                    return Err(self.rd.err("unpaired surrogate"));
                                }
                                let cp = 0x10000 + ((hi - 0xd800) << 10) + (lo - 0xdc00);
                                Self::push_utf8(out, cp);
                            } else if (0xdc00..0xe000).contains(&hi) {
                                Self::push_utf8(out, 0xfffd);
                            } else {
                                Self::push_utf8(out, hi);
                            }
                        }
                        _ => return Err(self.rd.err("invalid escape")),
                    }
                }
                b if b < 0x20 => return Err(self.rd.err("control character in string")),
                b => out.push(b),
            }
        }
    }

    /// Consume any JSON value, recognizing nothing.
    fn skip_value(&mut self) -> Result<(), DumpError> {
        self.skip_ws()?;
        match self.rd.peek()? {
            Some(b'"') => {
                let mut scratch = Vec::new();
                self.string_into(&mut scratch)
            }
            Some(b't') => self.literal(b"true"),
            Some(b'f') => self.literal(b"false"),
            Some(b'n') => self.literal(b"null"),
            Some(b'-') | Some(b'0'..=b'9') => {
                self.number()?;
                Ok(())
            }
            Some(b'[') => {
                self.rd.bump();
                self.skip_ws()?;
                if self.rd.peek()? == Some(b']') {
                    self.rd.bump();
                    return Ok(());
                }
                loop {
                    self.skip_value()?;
                    self.skip_ws()?;
                    match self.rd.next()? {
                        Some(b',') => {}
                        Some(b']') => return Ok(()),
                        _ => return Err(self.rd.err("expected ',' or ']'")),
                    }
                }
            }
            Some(b'{') => {
                self.rd.bump();
                self.skip_ws()?;
                if self.rd.peek()? == Some(b'}') {
                    self.rd.bump();
                    return Ok(());
                }
                loop {
                    let mut scratch = Vec::new();
                    self.string_into(&mut scratch)?;
                    self.expect(b':')?;
                    self.skip_value()?;
                    self.skip_ws()?;
                    match self.rd.next()? {
                        Some(b',') => {
                            self.skip_ws()?;
                        }
                        Some(b'}') => return Ok(()),
                        _ => return Err(self.rd.err("expected ',' or '}'")),
                    }
                }
            }
            Some(_) => Err(self.rd.err("unexpected character")),
            None => Err(self.rd.err("unexpected end of input")),
        }
    }
}

/// Parse a dump into an arbitrary sink.
///
/// With a memory sink this is the importer; with a dump writer it converts
/// dump-to-dump, normalizing the output along the way.
pub fn import<R: Read>(
    input: R,
    sink: &mut dyn TreeSink,
    monitor: &mut dyn ScanMonitor,
) -> Result<(), DumpError> {
    Importer::new(input, sink, monitor).run()
}

/// Parse a dump into a fresh in-memory tree.
pub fn import_tree<R: Read>(input: R, monitor: &mut dyn ScanMonitor) -> Result<Tree, DumpError> {
    let mut tree = Tree::empty();
    {
        let mut sink = MemSink::build(&mut tree);
        import(input, &mut sink, monitor)?;
    }
    Ok(tree)
}

/// Open a dump source: a file path, or stdin for `-`.
pub fn open_dump_input(spec: &str) -> io::Result<Box<dyn Read>> {
    if spec == "-" {
        Ok(Box::new(io::stdin()))
    } else {
        Ok(Box::new(File::open(spec)?))
    }
}
