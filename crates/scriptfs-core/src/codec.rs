// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Record codecs: timestamps, stat, fs-stats, entry and file-info records

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::CodecError;
use crate::value::Value;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Combines a `(sec, nsec)` pair into nanoseconds since the epoch.
pub fn ts_to_ns(sec: i64, nsec: i64) -> Result<u64, CodecError> {
    if sec < 0 || !(0..NANOS_PER_SEC as i64).contains(&nsec) {
        return Err(CodecError::InvalidTimestamp { sec, nsec });
    }
    (sec as u64)
        .checked_mul(NANOS_PER_SEC)
        .and_then(|n| n.checked_add(nsec as u64))
        .ok_or(CodecError::InvalidTimestamp { sec, nsec })
}

/// Splits nanoseconds since the epoch into `(sec, nsec)`.
pub fn ns_to_ts(ns: u64) -> (u64, u32) {
    (ns / NANOS_PER_SEC, (ns % NANOS_PER_SEC) as u32)
}

/// Times before the epoch clamp to zero.
pub fn system_time_to_ns(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d
            .as_secs()
            .saturating_mul(NANOS_PER_SEC)
            .saturating_add(u64::from(d.subsec_nanos())),
        Err(_) => 0,
    }
}

pub fn ns_to_system_time(ns: u64) -> SystemTime {
    let (sec, nsec) = ns_to_ts(ns);
    UNIX_EPOCH + Duration::new(sec, nsec)
}

/// Timeout in seconds: finite, non-negative and representable as a `Duration`.
pub fn parse_timeout(value: &Value, field: &str) -> Result<Duration, CodecError> {
    value
        .as_f64()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| CodecError::InvalidTimeout(field.to_string()))
}

fn field_i32(value: &Value, field: &str) -> Result<i32, CodecError> {
    let wide = value.to_i64_lossless(field)?;
    i32::try_from(wide).map_err(|_| CodecError::Lossy(field.to_string()))
}

/// File attributes as exchanged with handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_ns: u64,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
}

impl Stat {
    pub fn to_value(&self) -> Value {
        Value::object()
            .with("ino", self.ino)
            .with("mode", self.mode)
            .with("nlink", self.nlink)
            .with("uid", self.uid)
            .with("gid", self.gid)
            .with("rdev", self.rdev)
            .with("size", self.size)
            .with("blksize", self.blksize)
            .with("blocks", self.blocks)
            .with("atime_ns", self.atime_ns)
            .with("mtime_ns", self.mtime_ns)
            .with("ctime_ns", self.ctime_ns)
    }

    /// Missing fields read as zero; present fields must convert losslessly.
    pub fn from_value(value: &Value) -> Result<Stat, CodecError> {
        if !value.is_object() {
            return Err(CodecError::WrongType {
                field: "attr".into(),
                expected: "stat record",
            });
        }
        Ok(Stat {
            ino: value.field_u64("ino")?,
            mode: value.field_u32("mode")?,
            nlink: value.field_u64("nlink")?,
            uid: value.field_u32("uid")?,
            gid: value.field_u32("gid")?,
            rdev: value.field_u64("rdev")?,
            size: value.field_u64("size")?,
            blksize: value.field_u64("blksize")?,
            blocks: value.field_u64("blocks")?,
            atime_ns: value.field_u64("atime_ns")?,
            mtime_ns: value.field_u64("mtime_ns")?,
            ctime_ns: value.field_u64("ctime_ns")?,
        })
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }
}

/// Filesystem statistics (`statvfs` shape).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsStats {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl FsStats {
    pub fn to_value(&self) -> Value {
        Value::object()
            .with("bsize", self.bsize)
            .with("frsize", self.frsize)
            .with("blocks", self.blocks)
            .with("bfree", self.bfree)
            .with("bavail", self.bavail)
            .with("files", self.files)
            .with("ffree", self.ffree)
            .with("favail", self.favail)
            .with("fsid", self.fsid)
            .with("flag", self.flag)
            .with("namemax", self.namemax)
    }

    pub fn from_value(value: &Value) -> Result<FsStats, CodecError> {
        if !value.is_object() {
            return Err(CodecError::WrongType {
                field: "statfs".into(),
                expected: "fs-stats record",
            });
        }
        Ok(FsStats {
            bsize: value.field_u64("bsize")?,
            frsize: value.field_u64("frsize")?,
            blocks: value.field_u64("blocks")?,
            bfree: value.field_u64("bfree")?,
            bavail: value.field_u64("bavail")?,
            files: value.field_u64("files")?,
            ffree: value.field_u64("ffree")?,
            favail: value.field_u64("favail")?,
            fsid: value.field_u64("fsid")?,
            flag: value.field_u64("flag")?,
            namemax: value.field_u64("namemax")?,
        })
    }
}

/// Attribute/entry cache timeouts applied when a handler omits them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CacheTimeouts {
    pub attr: Duration,
    pub entry: Duration,
}

impl Default for CacheTimeouts {
    fn default() -> Self {
        Self {
            attr: Duration::from_secs(1),
            entry: Duration::from_secs(1),
        }
    }
}

/// Validated `lookup`/`mknod`/`mkdir`/`symlink`/`link`/`create` reply.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryReply {
    pub ino: u64,
    pub generation: u64,
    pub attr: Stat,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
}

impl EntryReply {
    /// Requires `attr`; `timeout` sets both timeouts, `attrTimeout` and
    /// `entryTimeout` override individually.
    pub fn from_value(value: &Value, defaults: CacheTimeouts) -> Result<EntryReply, CodecError> {
        let attr_value = value
            .get("attr")
            .ok_or_else(|| CodecError::MissingField("attr".into()))?;
        let attr = Stat::from_value(attr_value)?;

        let mut attr_timeout = defaults.attr;
        let mut entry_timeout = defaults.entry;
        if let Some(t) = value.get("timeout") {
            let both = parse_timeout(t, "timeout")?;
            attr_timeout = both;
            entry_timeout = both;
        }
        if let Some(t) = value.get("attrTimeout") {
            attr_timeout = parse_timeout(t, "attrTimeout")?;
        }
        if let Some(t) = value.get("entryTimeout") {
            entry_timeout = parse_timeout(t, "entryTimeout")?;
        }

        let generation = match value.get("generation") {
            Some(g) => g.to_u64_lossless("generation")?,
            None => 0,
        };
        let ino = if attr.ino != 0 {
            attr.ino
        } else {
            value.field_u64("ino")?
        };

        Ok(EntryReply {
            ino,
            generation,
            attr: Stat { ino, ..attr },
            attr_timeout,
            entry_timeout,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::object()
            .with("ino", self.ino)
            .with("generation", self.generation)
            .with("attr", self.attr.to_value())
            .with("attrTimeout", self.attr_timeout.as_secs_f64())
            .with("entryTimeout", self.entry_timeout.as_secs_f64())
    }
}

/// `getattr`/`setattr` reply: either `{attr, timeout?}` or a bare stat record.
#[derive(Clone, Debug, PartialEq)]
pub struct AttrReply {
    pub attr: Stat,
    pub timeout: Duration,
}

impl AttrReply {
    pub fn from_value(value: &Value, default_timeout: Duration) -> Result<AttrReply, CodecError> {
        let (attr_value, timeout) = match value.get("attr") {
            Some(attr) => {
                let timeout = match value.get("timeout").or_else(|| value.get("attrTimeout")) {
                    Some(t) => parse_timeout(t, "timeout")?,
                    None => default_timeout,
                };
                (attr, timeout)
            }
            None => (value, default_timeout),
        };
        Ok(AttrReply {
            attr: Stat::from_value(attr_value)?,
            timeout,
        })
    }
}

pub const FOPEN_DIRECT_IO: u32 = 1 << 0;
pub const FOPEN_KEEP_CACHE: u32 = 1 << 1;
pub const FOPEN_NONSEEKABLE: u32 = 1 << 2;

fn flag_field(value: &Value, names: &[&str]) -> bool {
    names
        .iter()
        .find_map(|n| value.get(n).and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Open-file information passed to and returned from handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub fh: u64,
    pub flags: i32,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
}

impl FileInfo {
    pub fn new(fh: u64, flags: i32) -> Self {
        Self {
            fh,
            flags,
            ..Default::default()
        }
    }

    /// `FOPEN_*` bits for the open reply.
    pub fn open_flags(&self) -> u32 {
        let mut bits = 0;
        if self.direct_io {
            bits |= FOPEN_DIRECT_IO;
        }
        if self.keep_cache {
            bits |= FOPEN_KEEP_CACHE;
        }
        if self.nonseekable {
            bits |= FOPEN_NONSEEKABLE;
        }
        bits
    }

    pub fn to_value(&self) -> Value {
        Value::object()
            .with("fh", self.fh)
            .with("flags", self.flags)
            .with("directIo", self.direct_io)
            .with("keepCache", self.keep_cache)
            .with("nonseekable", self.nonseekable)
    }

    /// Fields absent from `value` are taken from `base`.
    pub fn from_value(value: &Value, base: FileInfo) -> Result<FileInfo, CodecError> {
        if value.is_nullish() {
            return Ok(base);
        }
        if !value.is_object() {
            return Err(CodecError::WrongType {
                field: "fi".into(),
                expected: "file-info record",
            });
        }
        let fh = match value.get("fh") {
            Some(v) => v.to_u64_lossless("fh")?,
            None => base.fh,
        };
        let flags = match value.get("flags") {
            Some(v) => field_i32(v, "flags")?,
            None => base.flags,
        };
        Ok(FileInfo {
            fh,
            flags,
            direct_io: flag_field(value, &["directIo", "direct_io"]) || base.direct_io,
            keep_cache: flag_field(value, &["keepCache", "keep_cache"]) || base.keep_cache,
            nonseekable: flag_field(value, &["nonseekable", "nonSeekable"]) || base.nonseekable,
        })
    }
}

/// POSIX byte-range lock description.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockRecord {
    pub start: u64,
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

impl LockRecord {
    pub fn to_value(&self) -> Value {
        Value::object()
            .with("start", self.start)
            .with("end", self.end)
            .with("type", self.typ)
            .with("pid", self.pid)
    }

    pub fn from_value(value: &Value) -> Result<LockRecord, CodecError> {
        let typ = match value.get("type") {
            Some(v) => field_i32(v, "type")?,
            None => libc::F_UNLCK as i32,
        };
        Ok(LockRecord {
            start: value.field_u64("start")?,
            end: value.field_u64("end")?,
            typ,
            pid: value.field_u32("pid")?,
        })
    }
}

pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;
pub const FATTR_ATIME: u32 = 1 << 4;
pub const FATTR_MTIME: u32 = 1 << 5;
pub const FATTR_FH: u32 = 1 << 6;
pub const FATTR_ATIME_NOW: u32 = 1 << 7;
pub const FATTR_MTIME_NOW: u32 = 1 << 8;
pub const FATTR_CTIME: u32 = 1 << 10;

/// Timestamp in a `setattr` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetTime {
    Now,
    Ns(u64),
}

/// Changes requested by `setattr`; the valid mask is derived from which
/// fields are present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
    pub ctime_ns: Option<u64>,
    pub fh: Option<u64>,
}

impl SetAttrRequest {
    pub fn valid(&self) -> u32 {
        let mut valid = 0;
        if self.mode.is_some() {
            valid |= FATTR_MODE;
        }
        if self.uid.is_some() {
            valid |= FATTR_UID;
        }
        if self.gid.is_some() {
            valid |= FATTR_GID;
        }
        if self.size.is_some() {
            valid |= FATTR_SIZE;
        }
        match self.atime {
            Some(SetTime::Now) => valid |= FATTR_ATIME | FATTR_ATIME_NOW,
            Some(SetTime::Ns(_)) => valid |= FATTR_ATIME,
            None => {}
        }
        match self.mtime {
            Some(SetTime::Now) => valid |= FATTR_MTIME | FATTR_MTIME_NOW,
            Some(SetTime::Ns(_)) => valid |= FATTR_MTIME,
            None => {}
        }
        if self.ctime_ns.is_some() {
            valid |= FATTR_CTIME;
        }
        if self.fh.is_some() {
            valid |= FATTR_FH;
        }
        valid
    }

    /// Attribute record handed to the `setattr` handler. `*_NOW` times are
    /// resolved against `now_ns`.
    pub fn to_value(&self, now_ns: u64) -> Value {
        let time = |t: Option<SetTime>| -> Value {
            match t {
                Some(SetTime::Now) => Value::from(now_ns),
                Some(SetTime::Ns(ns)) => Value::from(ns),
                None => Value::Undefined,
            }
        };
        Value::object()
            .with("mode", self.mode.map(Value::from).unwrap_or_default())
            .with("uid", self.uid.map(Value::from).unwrap_or_default())
            .with("gid", self.gid.map(Value::from).unwrap_or_default())
            .with("size", self.size.map(Value::from).unwrap_or_default())
            .with("atime_ns", time(self.atime))
            .with("mtime_ns", time(self.mtime))
            .with("ctime_ns", self.ctime_ns.map(Value::from).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat {
        Stat {
            ino: u64::MAX,
            mode: libc::S_IFREG as u32 | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: (1 << 53) + 1,
            blksize: 4096,
            blocks: 8,
            atime_ns: 1_700_000_000_123_456_789,
            mtime_ns: 1_700_000_001_000_000_000,
            ctime_ns: 0,
        }
    }

    #[test]
    fn stat_round_trips_bit_exact() {
        let stat = sample_stat();
        assert_eq!(Stat::from_value(&stat.to_value()).unwrap(), stat);
    }

    #[test]
    fn fs_stats_round_trip() {
        let stats = FsStats {
            bsize: 4096,
            frsize: 4096,
            blocks: u64::MAX,
            bfree: 1,
            bavail: 2,
            files: 3,
            ffree: 4,
            favail: 5,
            fsid: 0xdead_beef_cafe_f00d,
            flag: 0,
            namemax: 255,
        };
        assert_eq!(FsStats::from_value(&stats.to_value()).unwrap(), stats);
    }

    #[test]
    fn timestamps_round_trip() {
        for ns in [0u64, 1, 999_999_999, 1_000_000_000, u64::MAX] {
            let (sec, nsec) = ns_to_ts(ns);
            assert_eq!(ts_to_ns(sec as i64, i64::from(nsec)).unwrap(), ns);
        }
    }

    #[test]
    fn invalid_timestamps_are_rejected() {
        assert!(ts_to_ns(-1, 0).is_err());
        assert!(ts_to_ns(0, -1).is_err());
        assert!(ts_to_ns(0, 1_000_000_000).is_err());
        assert!(ts_to_ns(i64::MAX, 0).is_err());
    }

    #[test]
    fn entry_requires_attr() {
        let err = EntryReply::from_value(&Value::object(), CacheTimeouts::default()).unwrap_err();
        assert_eq!(err, CodecError::MissingField("attr".into()));
    }

    #[test]
    fn entry_timeouts_resolve() {
        let stat = Stat {
            ino: 5,
            ..Default::default()
        };
        let both = Value::object()
            .with("attr", stat.to_value())
            .with("timeout", 2.5);
        let entry = EntryReply::from_value(&both, CacheTimeouts::default()).unwrap();
        assert_eq!(entry.attr_timeout, Duration::from_millis(2500));
        assert_eq!(entry.entry_timeout, Duration::from_millis(2500));
        assert_eq!(entry.ino, 5);

        let split = Value::object()
            .with("attr", stat.to_value())
            .with("attrTimeout", 0.0)
            .with("entryTimeout", 10.0);
        let entry = EntryReply::from_value(&split, CacheTimeouts::default()).unwrap();
        assert_eq!(entry.attr_timeout, Duration::ZERO);
        assert_eq!(entry.entry_timeout, Duration::from_secs(10));

        let negative = Value::object()
            .with("attr", stat.to_value())
            .with("timeout", -1.0);
        assert!(EntryReply::from_value(&negative, CacheTimeouts::default()).is_err());

        let infinite = Value::object()
            .with("attr", stat.to_value())
            .with("entryTimeout", f64::INFINITY);
        assert!(EntryReply::from_value(&infinite, CacheTimeouts::default()).is_err());
    }

    #[test]
    fn entry_generation_must_be_lossless() {
        let value = Value::object()
            .with("attr", Stat::default().to_value())
            .with("generation", 0.5);
        assert!(EntryReply::from_value(&value, CacheTimeouts::default()).is_err());
    }

    #[test]
    fn attr_reply_accepts_bare_stat() {
        let stat = sample_stat();
        let reply = AttrReply::from_value(&stat.to_value(), Duration::from_secs(1)).unwrap();
        assert_eq!(reply.attr, stat);
        let wrapped = Value::object()
            .with("attr", stat.to_value())
            .with("timeout", 3.0);
        let reply = AttrReply::from_value(&wrapped, Duration::from_secs(1)).unwrap();
        assert_eq!(reply.timeout, Duration::from_secs(3));
    }

    #[test]
    fn file_info_flags_map_to_open_bits() {
        let value = Value::object()
            .with("fh", 42u64)
            .with("directIo", true)
            .with("nonseekable", true);
        let fi = FileInfo::from_value(&value, FileInfo::new(0, libc::O_RDONLY)).unwrap();
        assert_eq!(fi.fh, 42);
        assert_eq!(fi.open_flags(), FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE);
        assert_eq!(
            FileInfo::from_value(&Value::Undefined, FileInfo::new(7, 0)).unwrap().fh,
            7
        );
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let entry = Value::object()
            .with("ino", 2u64)
            .with("attr", sample_stat().to_value())
            .with("timeout", 1e20);
        assert!(matches!(
            EntryReply::from_value(&entry, CacheTimeouts::default()),
            Err(CodecError::InvalidTimeout(_))
        ));
        assert!(matches!(
            parse_timeout(&Value::from(f64::MAX), "attrTimeout"),
            Err(CodecError::InvalidTimeout(field)) if field == "attrTimeout"
        ));
        assert_eq!(
            parse_timeout(&Value::from(0.5), "timeout").unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn out_of_range_flags_and_lock_type_are_lossy() {
        let fi = Value::object().with("flags", Value::from(4_294_967_296.0));
        assert!(matches!(
            FileInfo::from_value(&fi, FileInfo::new(0, 0)),
            Err(CodecError::Lossy(field)) if field == "flags"
        ));
        let lock = Value::object()
            .with("start", 0u64)
            .with("end", 10u64)
            .with("type", Value::from(-3_000_000_000.0));
        assert!(matches!(
            LockRecord::from_value(&lock),
            Err(CodecError::Lossy(field)) if field == "type"
        ));
        let fi = Value::object().with("flags", Value::from(f64::from(libc::O_WRONLY)));
        assert_eq!(
            FileInfo::from_value(&fi, FileInfo::new(0, 0)).unwrap().flags,
            libc::O_WRONLY
        );
    }

    #[test]
    fn setattr_valid_mask_tracks_fields() {
        let req = SetAttrRequest {
            mode: Some(0o600),
            size: Some(0),
            mtime: Some(SetTime::Now),
            ..Default::default()
        };
        assert_eq!(
            req.valid(),
            FATTR_MODE | FATTR_SIZE | FATTR_MTIME | FATTR_MTIME_NOW
        );
        let value = req.to_value(99);
        assert_eq!(value.field_u64("mtime_ns").unwrap(), 99);
        assert!(value.get("uid").is_none());
    }
}
