//! Line-oriented text serialization of a content index.
//!
//! Three sections in fixed order, each introduced by a decimal count line:
//!
//! ```text
//! <N>
//! <checksum>,<size>,<mod_time>                             x N
//! <M>
//! <checksum>,<size>,<server>,<device>,<path>,<mod_time>    x M
//! <K>
//! <server>,<path>,<target>                                 x K
//! ```
//!
//! The canonical format backslash-escapes `\`, `,`, LF and CR inside fields,
//! so any string round-trips. The legacy format writes fields raw: commas are
//! tolerated only in instance paths and symlink paths, which the reader
//! recovers by splitting the fixed fields off both ends of the line.
//!
//! Files may be gzip-compressed; readers detect the gzip magic bytes.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use memchr::memchr2;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::content::content_data::ContentData;
use crate::core::errors::{MirrorError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Text dialect of an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexFormat {
    /// Backslash-escaped fields.
    #[default]
    Canonical,
    /// Older unescaped layout, kept for existing files.
    Legacy,
}

/// Compression applied when writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCompression {
    Plain,
    Gzip,
    /// Gzip iff the file name ends in `.gz`.
    ByExtension,
}

/// Options for [`ContentData::to_file_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub format: IndexFormat,
    pub compression: FileCompression,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            format: IndexFormat::Canonical,
            compression: FileCompression::ByExtension,
        }
    }
}

impl ContentData {
    /// Write canonical text, gzip when the path ends in `.gz`.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        self.to_file_with(path, WriteOptions::default())
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn to_file_with(&self, path: &Path, options: WriteOptions) -> Result<()> {
        let mut rendered = String::new();
        render(self, options.format, &mut rendered)?;

        let gzip = match options.compression {
            FileCompression::Plain => false,
            FileCompression::Gzip => true,
            FileCompression::ByExtension => path.extension().is_some_and(|ext| ext == "gz"),
        };

        let temp_path = temp_sibling(path);
        if let Some(parent) = temp_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| MirrorError::io(&temp_path, e))?;

        let mut writer = BufWriter::new(file);
        if gzip {
            let mut encoder = GzEncoder::new(&mut writer, Compression::default());
            encoder
                .write_all(rendered.as_bytes())
                .map_err(|e| MirrorError::io(&temp_path, e))?;
            encoder.finish().map_err(|e| MirrorError::io(&temp_path, e))?;
        } else {
            writer
                .write_all(rendered.as_bytes())
                .map_err(|e| MirrorError::io(&temp_path, e))?;
        }
        writer.flush().map_err(|e| MirrorError::io(&temp_path, e))?;
        drop(writer);

        fs::rename(&temp_path, path).map_err(|e| MirrorError::io(path, e))?;
        Ok(())
    }

    /// Read a canonical index file, plain or gzip.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with(path, IndexFormat::Canonical)
    }

    pub fn from_file_with(path: &Path, format: IndexFormat) -> Result<Self> {
        let file = File::open(path).map_err(|e| MirrorError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let is_gzip = reader
            .fill_buf()
            .map_err(|e| MirrorError::io(path, e))?
            .starts_with(&GZIP_MAGIC);
        if is_gzip {
            parse(BufReader::new(GzDecoder::new(reader)), format)
        } else {
            parse(reader, format)
        }
    }

    /// Render into a string in the given dialect.
    pub fn to_text(&self, format: IndexFormat) -> Result<String> {
        let mut out = String::new();
        render(self, format, &mut out)?;
        Ok(out)
    }

    /// Parse text from any reader in the given dialect.
    pub fn read_from<R: Read>(reader: R, format: IndexFormat) -> Result<Self> {
        parse(BufReader::new(reader), format)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

impl fmt::Display for ContentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        render(self, IndexFormat::Canonical, &mut out).map_err(|_| fmt::Error)?;
        f.write_str(&out)
    }
}

impl FromStr for ContentData {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s.as_bytes(), IndexFormat::Canonical)
    }
}

impl Serialize for ContentData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

fn render(index: &ContentData, format: IndexFormat, out: &mut String) -> Result<()> {
    // Writing to a String never fails.
    let _ = writeln!(out, "{}", index.contents_size());
    for content in index.contents() {
        let checksum = format_field(&content.checksum, format, false, "contents")?;
        let _ = writeln!(out, "{checksum},{},{}", content.size, content.mod_time);
    }

    let _ = writeln!(out, "{}", index.instances_size());
    for instance in index.instances() {
        let checksum = format_field(&instance.checksum, format, false, "instances")?;
        let server = format_field(&instance.server, format, false, "instances")?;
        let device = format_field(&instance.device, format, false, "instances")?;
        let path = format_field(&instance.path, format, true, "instances")?;
        let _ = writeln!(
            out,
            "{checksum},{},{server},{device},{path},{}",
            instance.size, instance.mod_time
        );
    }

    let _ = writeln!(out, "{}", index.symlinks_size());
    for symlink in index.symlinks() {
        let server = format_field(&symlink.server, format, false, "symlinks")?;
        let path = format_field(&symlink.path, format, true, "symlinks")?;
        let target = format_field(&symlink.target, format, false, "symlinks")?;
        let _ = writeln!(out, "{server},{path},{target}");
    }
    Ok(())
}

fn format_field<'a>(
    value: &'a str,
    format: IndexFormat,
    comma_ok: bool,
    section: &'static str,
) -> Result<Cow<'a, str>> {
    match format {
        IndexFormat::Canonical => Ok(escape_field(value)),
        IndexFormat::Legacy => {
            if value.contains(['\n', '\r']) || (!comma_ok && value.contains(',')) {
                return Err(MirrorError::IndexFormat {
                    line: 0,
                    section,
                    details: format!("legacy format cannot represent field {value:?}"),
                });
            }
            Ok(Cow::Borrowed(value))
        }
    }
}

/// Escape `\`, `,`, LF and CR; borrows when nothing needs escaping.
pub fn escape_field(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', ',', '\n', '\r']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            ',' => escaped.push_str("\\,"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// Split one canonical line on unescaped commas, unescaping each field.
fn split_escaped(line: &str) -> std::result::Result<Vec<String>, String> {
    let bytes = line.as_bytes();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut pos = 0;
    while let Some(offset) = memchr2(b',', b'\\', &bytes[pos..]) {
        let at = pos + offset;
        current.push_str(&line[pos..at]);
        if bytes[at] == b',' {
            fields.push(std::mem::take(&mut current));
        } else {
            match bytes.get(at + 1) {
                Some(b'\\') => current.push('\\'),
                Some(b',') => current.push(','),
                Some(b'n') => current.push('\n'),
                Some(b'r') => current.push('\r'),
                Some(_) => return Err(format!("unknown escape at byte {at}")),
                None => return Err("dangling escape at end of line".to_string()),
            }
            pos = at + 2;
            continue;
        }
        pos = at + 1;
    }
    current.push_str(&line[pos..]);
    fields.push(current);
    Ok(fields)
}

/// Split a legacy line whose variable field sits between `head` fixed
/// fields on the left and `tail` fixed fields on the right.
fn split_legacy(line: &str, head: usize, tail: usize) -> Option<Vec<String>> {
    let mut left: Vec<&str> = Vec::with_capacity(head);
    let mut rest = line;
    for _ in 0..head {
        let (field, remainder) = rest.split_once(',')?;
        left.push(field);
        rest = remainder;
    }
    let mut right: Vec<&str> = Vec::with_capacity(tail);
    for _ in 0..tail {
        let (remainder, field) = rest.rsplit_once(',')?;
        right.push(field);
        rest = remainder;
    }
    right.reverse();

    let mut fields: Vec<String> = left.into_iter().map(str::to_string).collect();
    fields.push(rest.to_string());
    fields.extend(right.into_iter().map(str::to_string));
    Some(fields)
}

struct Lines<R> {
    inner: std::io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> Lines<R> {
    fn next(&mut self, section: &'static str) -> Result<String> {
        self.line_no += 1;
        match self.inner.next() {
            Some(Ok(line)) => Ok(line),
            Some(Err(error)) => Err(self.error(section, format!("read failure: {error}"))),
            None => Err(self.error(section, "unexpected end of file".to_string())),
        }
    }

    fn count(&mut self, section: &'static str) -> Result<usize> {
        let line = self.next(section)?;
        line.trim()
            .parse::<usize>()
            .map_err(|error| self.error(section, format!("bad count {line:?}: {error}")))
    }

    fn error(&self, section: &'static str, details: String) -> MirrorError {
        MirrorError::IndexFormat {
            line: self.line_no,
            section,
            details,
        }
    }

    fn fields(&self, line: &str, format: IndexFormat, section: &'static str, expected: usize) -> Result<Vec<String>> {
        let fields = match format {
            IndexFormat::Canonical => split_escaped(line).map_err(|details| self.error(section, details))?,
            IndexFormat::Legacy => {
                let (head, tail) = match section {
                    "instances" => (4, 1),
                    "symlinks" => (1, 1),
                    _ => (expected - 1, 0),
                };
                split_legacy(line, head, tail).ok_or_else(|| {
                    self.error(section, format!("expected {expected} fields in {line:?}"))
                })?
            }
        };
        if fields.len() != expected {
            return Err(self.error(
                section,
                format!("expected {expected} fields, found {}", fields.len()),
            ));
        }
        Ok(fields)
    }

    fn number<T: FromStr>(&self, raw: &str, section: &'static str, what: &str) -> Result<T>
    where
        T::Err: fmt::Display,
    {
        raw.parse::<T>()
            .map_err(|error| self.error(section, format!("bad {what} {raw:?}: {error}")))
    }
}

fn parse<R: BufRead>(reader: R, format: IndexFormat) -> Result<ContentData> {
    let mut lines = Lines {
        inner: reader.lines(),
        line_no: 0,
    };
    let mut index = ContentData::new();

    let mut contents: BTreeMap<String, (u64, i64, usize)> = BTreeMap::new();
    let count = lines.count("contents")?;
    for _ in 0..count {
        let line = lines.next("contents")?;
        let fields = lines.fields(&line, format, "contents", 3)?;
        let size = lines.number::<u64>(&fields[1], "contents", "size")?;
        let mod_time = lines.number::<i64>(&fields[2], "contents", "mod_time")?;
        let [checksum, ..] = <[String; 3]>::try_from(fields)
            .map_err(|_| lines.error("contents", "field count".to_string()))?;
        if contents.insert(checksum.clone(), (size, mod_time, lines.line_no)).is_some() {
            return Err(lines.error("contents", format!("duplicate content {checksum:?}")));
        }
    }

    let count = lines.count("instances")?;
    for _ in 0..count {
        let line = lines.next("instances")?;
        let fields = lines.fields(&line, format, "instances", 6)?;
        let mod_time = lines.number::<i64>(&fields[5], "instances", "mod_time")?;
        lines.number::<u64>(&fields[1], "instances", "size")?;
        let [checksum, _, server, device, path, _] = <[String; 6]>::try_from(fields)
            .map_err(|_| lines.error("instances", "field count".to_string()))?;
        let Some(&(size, _, _)) = contents.get(&checksum) else {
            return Err(lines.error(
                "instances",
                format!("instance references unknown content {checksum:?}"),
            ));
        };
        index.add_instance(checksum, size, server, device, path, mod_time);
    }

    let count = lines.count("symlinks")?;
    for _ in 0..count {
        let line = lines.next("symlinks")?;
        let fields = lines.fields(&line, format, "symlinks", 3)?;
        let [server, path, target] = <[String; 3]>::try_from(fields)
            .map_err(|_| lines.error("symlinks", "field count".to_string()))?;
        index.add_symlink(server, path, target);
    }

    for (checksum, (size, mod_time, line)) in contents {
        if !index.set_content_fields(&checksum, size, mod_time) {
            return Err(MirrorError::IndexFormat {
                line,
                section: "contents",
                details: format!("content {checksum:?} has no instances"),
            });
        }
    }

    Ok(index)
}
