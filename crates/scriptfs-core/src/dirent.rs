// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory entries and the serialized `fuse_dirent` buffer layout
//!
//! A readdir handler may answer with either an array of entry records or a
//! buffer of packed dirents: `ino: u64, off: u64, namelen: u32, type: u32`,
//! the name bytes, then zero padding to the next 8-byte boundary. Integers
//! are native-endian, matching what the kernel expects.

use crate::codec::{CacheTimeouts, EntryReply};
use crate::error::CodecError;
use crate::value::Value;

const DIRENT_HEADER: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    Unknown,
    NamedPipe,
    CharDevice,
    Directory,
    BlockDevice,
    RegularFile,
    Symlink,
    Socket,
}

impl FileKind {
    /// `DT_*` value.
    pub fn dtype(self) -> u32 {
        match self {
            FileKind::Unknown => 0,
            FileKind::NamedPipe => 1,
            FileKind::CharDevice => 2,
            FileKind::Directory => 4,
            FileKind::BlockDevice => 6,
            FileKind::RegularFile => 8,
            FileKind::Symlink => 10,
            FileKind::Socket => 12,
        }
    }

    pub fn from_dtype(dtype: u32) -> FileKind {
        match dtype {
            1 => FileKind::NamedPipe,
            2 => FileKind::CharDevice,
            4 => FileKind::Directory,
            6 => FileKind::BlockDevice,
            8 => FileKind::RegularFile,
            10 => FileKind::Symlink,
            12 => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }

    /// Kind encoded in the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> FileKind {
        FileKind::from_dtype((mode >> 12) & 0xF)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirEntry {
    pub ino: u64,
    /// Offset of the entry that follows this one.
    pub offset: u64,
    pub kind: FileKind,
    pub name: String,
    /// Attributes for `readdirplus` replies.
    pub plus: Option<EntryReply>,
}

impl DirEntry {
    pub fn new(ino: u64, offset: u64, kind: FileKind, name: impl Into<String>) -> Self {
        Self {
            ino,
            offset,
            kind,
            name: name.into(),
            plus: None,
        }
    }
}

fn padded_len(namelen: usize) -> usize {
    (DIRENT_HEADER + namelen + 7) & !7
}

/// Packs entries into the kernel dirent layout.
pub fn encode(entries: &[DirEntry]) -> Vec<u8> {
    let total = entries.iter().map(|e| padded_len(e.name.len())).sum();
    let mut buf = Vec::with_capacity(total);
    for entry in entries {
        let name = entry.name.as_bytes();
        buf.extend_from_slice(&entry.ino.to_ne_bytes());
        buf.extend_from_slice(&entry.offset.to_ne_bytes());
        buf.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&entry.kind.dtype().to_ne_bytes());
        buf.extend_from_slice(name);
        let pad = padded_len(name.len()) - DIRENT_HEADER - name.len();
        buf.resize(buf.len() + pad, 0);
    }
    buf
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64, CodecError> {
    buf.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_ne_bytes)
        .ok_or(CodecError::MalformedDirent(at))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, CodecError> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .ok_or(CodecError::MalformedDirent(at))
}

/// Unpacks a dirent buffer. A trailing record without its padding is
/// accepted; a truncated header or name is not.
pub fn decode(buf: &[u8]) -> Result<Vec<DirEntry>, CodecError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let ino = read_u64(buf, pos)?;
        let offset = read_u64(buf, pos + 8)?;
        let namelen = read_u32(buf, pos + 16)? as usize;
        let dtype = read_u32(buf, pos + 20)?;
        let name_start = pos + DIRENT_HEADER;
        let name = buf
            .get(name_start..name_start + namelen)
            .ok_or(CodecError::MalformedDirent(name_start))?;
        if namelen == 0 {
            return Err(CodecError::MalformedDirent(pos));
        }
        entries.push(DirEntry {
            ino,
            offset,
            kind: FileKind::from_dtype(dtype),
            name: String::from_utf8_lossy(name).into_owned(),
            plus: None,
        });
        pos += padded_len(namelen);
    }
    Ok(entries)
}

fn entry_from_record(
    record: &Value,
    index: usize,
    start_offset: u64,
    timeouts: CacheTimeouts,
) -> Result<DirEntry, CodecError> {
    let name = record
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::MissingField("name".into()))?
        .to_string();

    let plus = match record.get("attr") {
        Some(_) => Some(EntryReply::from_value(record, timeouts)?),
        None => None,
    };

    let ino = match record.get("ino") {
        Some(v) => v.to_u64_lossless("ino")?,
        None => plus.as_ref().map(|p| p.ino).unwrap_or(0),
    };
    let offset = match record.get("offset").or_else(|| record.get("off")) {
        Some(v) => v.to_u64_lossless("offset")?,
        None => start_offset + index as u64 + 1,
    };
    let kind = if let Some(t) = record.get("type") {
        FileKind::from_dtype(t.to_u32("type")?)
    } else if let Some(m) = record.get("mode") {
        FileKind::from_mode(m.to_u32("mode")?)
    } else if let Some(p) = &plus {
        FileKind::from_mode(p.attr.mode)
    } else {
        FileKind::Unknown
    };

    Ok(DirEntry {
        ino,
        offset,
        kind,
        name,
        plus,
    })
}

/// Accepts a packed buffer or an array of `{name, ino?, offset?, type?,
/// mode?, attr?}` records. Records without an offset are numbered from
/// `start_offset`.
pub fn from_value(
    value: &Value,
    start_offset: u64,
    timeouts: CacheTimeouts,
) -> Result<Vec<DirEntry>, CodecError> {
    match value {
        Value::Buffer(buf) => decode(buf),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, record)| entry_from_record(record, i, start_offset, timeouts))
            .collect(),
        other => Err(CodecError::WrongType {
            field: "readdir".into(),
            expected: if other.is_nullish() {
                "entries"
            } else {
                "buffer or array"
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Stat;

    fn listing() -> Vec<DirEntry> {
        vec![
            DirEntry::new(1, 1, FileKind::Directory, "."),
            DirEntry::new(1, 2, FileKind::Directory, ".."),
            DirEntry::new(2, 3, FileKind::RegularFile, "hello.txt"),
        ]
    }

    #[test]
    fn packed_layout_is_eight_byte_aligned() {
        let buf = encode(&listing());
        // 24 + 1 -> 32, 24 + 2 -> 32, 24 + 9 -> 40
        assert_eq!(buf.len(), 32 + 32 + 40);
        assert_eq!(&buf[24..25], b".");
        assert_eq!(u32::from_ne_bytes(buf[20..24].try_into().unwrap()), 4);
    }

    #[test]
    fn decode_reads_back_encoded_entries() {
        assert_eq!(decode(&encode(&listing())).unwrap(), listing());
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let buf = encode(&listing());
        assert!(decode(&buf[..10]).is_err());
        assert!(decode(&buf[..70]).is_err());
    }

    #[test]
    fn records_get_sequential_offsets() {
        let value = Value::Array(vec![
            Value::object().with("name", "a").with("ino", 10u64),
            Value::object()
                .with("name", "b")
                .with("ino", 11u64)
                .with("mode", libc::S_IFDIR as u32 | 0o755),
        ]);
        let entries = from_value(&value, 5, CacheTimeouts::default()).unwrap();
        assert_eq!(entries[0].offset, 6);
        assert_eq!(entries[1].offset, 7);
        assert_eq!(entries[1].kind, FileKind::Directory);
    }

    #[test]
    fn records_with_attr_carry_plus_data() {
        let stat = Stat {
            ino: 9,
            mode: libc::S_IFREG as u32 | 0o644,
            ..Default::default()
        };
        let value = Value::Array(vec![Value::object()
            .with("name", "f")
            .with("attr", stat.to_value())]);
        let entries = from_value(&value, 0, CacheTimeouts::default()).unwrap();
        assert_eq!(entries[0].ino, 9);
        assert_eq!(entries[0].kind, FileKind::RegularFile);
        assert!(entries[0].plus.is_some());
    }

    #[test]
    fn other_values_are_rejected() {
        assert!(from_value(&Value::from("x"), 0, CacheTimeouts::default()).is_err());
    }
}
