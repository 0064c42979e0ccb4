// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! scriptfs FUSE adapter implementation
//!
//! Maps `fuser` callbacks onto bridge requests. The adapter keeps no
//! filesystem state of its own: every callback becomes a
//! [`RequestContext`] carrying the kernel reply, and the script handler
//! decides what the reply says.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fuser::{
    FileAttr, FileType, KernelConfig, ReplyAttr, ReplyBmap, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyLock,
    ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use scriptfs_core::codec::{ns_to_system_time, system_time_to_ns, SetAttrRequest, SetTime};
use scriptfs_core::{
    Bridge, CallerContext, ConnectionInfo, DirEntry, EntryReply, FileInfo, FileKind, FsStats,
    FuseConfigRecord, LockRecord, OpTag, ReplySink, RequestArgs, RequestContext, SessionOptions,
    Stat,
};
use tracing::{debug, info, warn};

/// Kernel protocol version the `abi-7-40` build of fuser speaks.
const PROTO_MAJOR: u32 = 7;
const PROTO_MINOR: u32 = 40;

const DEFAULT_MAX_BACKGROUND: u16 = 64;
const MAX_SUPPORTED_WRITE_BYTES: u32 = 16 * 1024 * 1024;

/// Kernel reply object for one request, viewed as a [`ReplySink`].
///
/// The bridge picks the reply shape from the operation; a shape the
/// underlying fuser reply cannot express is answered with `EIO`.
pub enum FuserReply {
    Entry(ReplyEntry),
    Attr(ReplyAttr),
    Data(ReplyData),
    Write(ReplyWrite),
    Open(ReplyOpen),
    Create(ReplyCreate),
    Empty(ReplyEmpty),
    Statfs(ReplyStatfs),
    Lock(ReplyLock),
    Xattr(ReplyXattr),
    Directory(ReplyDirectory),
    DirectoryPlus(ReplyDirectoryPlus),
    Lseek(ReplyLseek),
    Bmap(ReplyBmap),
    Ioctl(ReplyIoctl),
}

impl FuserReply {
    fn fail(self, errno: c_int) {
        match self {
            FuserReply::Entry(r) => r.error(errno),
            FuserReply::Attr(r) => r.error(errno),
            FuserReply::Data(r) => r.error(errno),
            FuserReply::Write(r) => r.error(errno),
            FuserReply::Open(r) => r.error(errno),
            FuserReply::Create(r) => r.error(errno),
            FuserReply::Empty(r) => r.error(errno),
            FuserReply::Statfs(r) => r.error(errno),
            FuserReply::Lock(r) => r.error(errno),
            FuserReply::Xattr(r) => r.error(errno),
            FuserReply::Directory(r) => r.error(errno),
            FuserReply::DirectoryPlus(r) => r.error(errno),
            FuserReply::Lseek(r) => r.error(errno),
            FuserReply::Bmap(r) => r.error(errno),
            FuserReply::Ioctl(r) => r.error(errno),
        }
    }

    fn mismatch(self, shape: &'static str) {
        warn!(reply = shape, "reply shape does not fit the kernel request");
        self.fail(libc::EIO);
    }
}

impl ReplySink for FuserReply {
    fn error(self: Box<Self>, errno: i32) {
        (*self).fail(errno);
    }

    fn ok(self: Box<Self>) {
        match *self {
            FuserReply::Empty(r) => r.ok(),
            other => other.mismatch("ok"),
        }
    }

    fn entry(self: Box<Self>, entry: &EntryReply) {
        match *self {
            FuserReply::Entry(r) => {
                r.entry(&entry.entry_timeout, &file_attr(&entry.attr), entry.generation)
            }
            other => other.mismatch("entry"),
        }
    }

    fn attr(self: Box<Self>, attr: &Stat, timeout: Duration) {
        match *self {
            FuserReply::Attr(r) => r.attr(&timeout, &file_attr(attr)),
            other => other.mismatch("attr"),
        }
    }

    fn data(self: Box<Self>, data: &[u8]) {
        match *self {
            FuserReply::Data(r) => r.data(data),
            FuserReply::Xattr(r) => r.data(data),
            other => other.mismatch("data"),
        }
    }

    fn written(self: Box<Self>, size: u32) {
        match *self {
            FuserReply::Write(r) => r.written(size),
            other => other.mismatch("written"),
        }
    }

    fn opened(self: Box<Self>, fi: &FileInfo) {
        match *self {
            FuserReply::Open(r) => r.opened(fi.fh, fi.open_flags()),
            other => other.mismatch("opened"),
        }
    }

    fn created(self: Box<Self>, entry: &EntryReply, fi: &FileInfo) {
        match *self {
            FuserReply::Create(r) => r.created(
                &entry.entry_timeout,
                &file_attr(&entry.attr),
                entry.generation,
                fi.fh,
                fi.open_flags(),
            ),
            other => other.mismatch("created"),
        }
    }

    fn statfs(self: Box<Self>, stats: &FsStats) {
        match *self {
            FuserReply::Statfs(r) => r.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                clamp_u32(stats.bsize),
                clamp_u32(stats.namemax),
                clamp_u32(stats.frsize),
            ),
            other => other.mismatch("statfs"),
        }
    }

    fn lock(self: Box<Self>, lock: &LockRecord) {
        match *self {
            FuserReply::Lock(r) => r.locked(lock.start, lock.end, lock.typ, lock.pid),
            other => other.mismatch("lock"),
        }
    }

    fn xattr_size(self: Box<Self>, size: u32) {
        match *self {
            FuserReply::Xattr(r) => r.size(size),
            other => other.mismatch("xattr size"),
        }
    }

    fn directory(self: Box<Self>, entries: &[DirEntry]) {
        match *self {
            FuserReply::Directory(mut r) => {
                for entry in entries {
                    let offset = i64::try_from(entry.offset).unwrap_or(i64::MAX);
                    if r.add(entry.ino, offset, file_type(entry.kind), &entry.name) {
                        break;
                    }
                }
                r.ok();
            }
            FuserReply::DirectoryPlus(mut r) => {
                for entry in entries {
                    let offset = i64::try_from(entry.offset).unwrap_or(i64::MAX);
                    let (attr, ttl, generation) = match &entry.plus {
                        Some(plus) => (file_attr(&plus.attr), plus.entry_timeout, plus.generation),
                        None => (bare_attr(entry), Duration::ZERO, 0),
                    };
                    if r.add(entry.ino, offset, &entry.name, &ttl, &attr, generation) {
                        break;
                    }
                }
                r.ok();
            }
            other => other.mismatch("directory"),
        }
    }

    fn offset(self: Box<Self>, offset: i64) {
        match *self {
            FuserReply::Lseek(r) => r.offset(offset),
            other => other.mismatch("offset"),
        }
    }

    fn bmap(self: Box<Self>, block: u64) {
        match *self {
            FuserReply::Bmap(r) => r.bmap(block),
            other => other.mismatch("bmap"),
        }
    }

    fn ioctl(self: Box<Self>, result: i32, data: &[u8]) {
        match *self {
            FuserReply::Ioctl(r) => r.ioctl(result, data),
            other => other.mismatch("ioctl"),
        }
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::Directory => FileType::Directory,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Socket => FileType::Socket,
        FileKind::RegularFile | FileKind::Unknown => FileType::RegularFile,
    }
}

pub fn file_attr(stat: &Stat) -> FileAttr {
    FileAttr {
        ino: stat.ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: ns_to_system_time(stat.atime_ns),
        mtime: ns_to_system_time(stat.mtime_ns),
        ctime: ns_to_system_time(stat.ctime_ns),
        crtime: ns_to_system_time(stat.ctime_ns),
        kind: file_type(FileKind::from_mode(stat.mode)),
        perm: (stat.mode & 0o7777) as u16,
        nlink: clamp_u32(stat.nlink),
        uid: stat.uid,
        gid: stat.gid,
        rdev: clamp_u32(stat.rdev),
        blksize: clamp_u32(stat.blksize),
        flags: 0,
    }
}

/// Attributes for a `readdirplus` entry the handler gave no `attr` for.
fn bare_attr(entry: &DirEntry) -> FileAttr {
    file_attr(&Stat {
        ino: entry.ino,
        mode: entry.kind.dtype() << 12,
        ..Stat::default()
    })
}

fn caller(req: &Request<'_>, umask: Option<u32>) -> CallerContext {
    CallerContext {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
        umask,
    }
}

/// The kernel only sends a umask with mknod, mkdir and create.
fn caller_umask(op: OpTag, args: &RequestArgs) -> Option<u32> {
    matches!(op, OpTag::Mknod | OpTag::Mkdir | OpTag::Create).then_some(args.umask)
}

fn name_of(name: &OsStr) -> Option<String> {
    Some(name.to_string_lossy().into_owned())
}

fn open_file(fh: u64, flags: i32) -> Option<FileInfo> {
    Some(FileInfo::new(fh, flags))
}

fn set_time(time: Option<TimeOrNow>) -> Option<SetTime> {
    time.map(|t| match t {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(at) => SetTime::Ns(system_time_to_ns(at)),
    })
}

fn configure_max_write(config: &mut KernelConfig, desired: u32) -> (u32, bool) {
    let desired = desired.clamp(4096, MAX_SUPPORTED_WRITE_BYTES);
    match config.set_max_write(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_max_write(limit);
            (limit, true)
        }
    }
}

fn configure_max_background(config: &mut KernelConfig) -> (u16, bool) {
    match config.set_max_background(DEFAULT_MAX_BACKGROUND) {
        Ok(_) => (DEFAULT_MAX_BACKGROUND, false),
        Err(limit) => {
            let _ = config.set_max_background(limit);
            (limit, true)
        }
    }
}

fn congestion_threshold(max_background: u16) -> u16 {
    ((3u32 * u32::from(max_background)) / 4).max(1) as u16
}

/// `fuser::Filesystem` front end of a bridge.
pub struct ScriptFsFuse {
    bridge: Arc<Bridge>,
    options: SessionOptions,
}

impl ScriptFsFuse {
    pub fn new(bridge: Arc<Bridge>, options: SessionOptions) -> Self {
        Self { bridge, options }
    }

    fn submit(&self, op: OpTag, req: &Request<'_>, args: RequestArgs, reply: FuserReply) {
        let caller = caller(req, caller_umask(op, &args));
        let ctx = RequestContext::new(op, req.unique(), Some(caller), args, Box::new(reply));
        self.bridge.submit(ctx);
    }
}

impl fuser::Filesystem for ScriptFsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        let (max_write, clamped_write) = configure_max_write(config, self.options.max_write);
        if clamped_write {
            warn!(
                "Kernel limited max_write to {} bytes (desired {}).",
                max_write, self.options.max_write
            );
        }
        let (max_background, clamped_background) = configure_max_background(config);
        if clamped_background {
            warn!("Kernel limited max_background to {}.", max_background);
        }
        let congestion = congestion_threshold(max_background);
        if let Err(limit) = config.set_congestion_threshold(congestion) {
            let _ = config.set_congestion_threshold(limit);
        }

        let timeouts = self.bridge.cache_timeouts();
        let info = ConnectionInfo {
            proto_major: PROTO_MAJOR,
            proto_minor: PROTO_MINOR,
            max_read: self.options.max_read,
            max_write,
            max_background: u32::from(max_background),
            congestion_threshold: u32::from(congestion),
            ..ConnectionInfo::default()
        };
        let record = FuseConfigRecord {
            entry_timeout: timeouts.entry.as_secs_f64(),
            attr_timeout: timeouts.attr.as_secs_f64(),
            debug: self.options.debug,
            ..FuseConfigRecord::default()
        };
        self.bridge.init(info, record);
        info!(max_write, max_background, "scriptfs FUSE adapter initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.bridge.destroy();
        info!("scriptfs FUSE adapter destroyed");
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        let args = RequestArgs {
            ino,
            nlookup,
            ..Default::default()
        };
        self.bridge
            .submit(RequestContext::notification(OpTag::Forget, req.unique(), args));
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            ..Default::default()
        };
        self.submit(OpTag::Lookup, req, args, FuserReply::Entry(reply));
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let args = RequestArgs {
            ino,
            fi: fh.and_then(|fh| open_file(fh, 0)),
            ..Default::default()
        };
        self.submit(OpTag::Getattr, req, args, FuserReply::Attr(reply));
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: set_time(atime),
            mtime: set_time(mtime),
            ctime_ns: ctime.map(system_time_to_ns),
            fh,
        };
        let args = RequestArgs {
            ino,
            setattr: Some(changes),
            fi: fh.and_then(|fh| open_file(fh, 0)),
            ..Default::default()
        };
        self.submit(OpTag::Setattr, req, args, FuserReply::Attr(reply));
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let args = RequestArgs {
            ino,
            ..Default::default()
        };
        self.submit(OpTag::Readlink, req, args, FuserReply::Data(reply));
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            mode,
            umask,
            rdev,
            ..Default::default()
        };
        self.submit(OpTag::Mknod, req, args, FuserReply::Entry(reply));
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            mode,
            umask,
            ..Default::default()
        };
        self.submit(OpTag::Mkdir, req, args, FuserReply::Entry(reply));
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            ..Default::default()
        };
        self.submit(OpTag::Unlink, req, args, FuserReply::Empty(reply));
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            ..Default::default()
        };
        self.submit(OpTag::Rmdir, req, args, FuserReply::Empty(reply));
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let args = RequestArgs {
            parent,
            name: name_of(link_name),
            target: Some(target.to_string_lossy().into_owned()),
            ..Default::default()
        };
        self.submit(OpTag::Symlink, req, args, FuserReply::Entry(reply));
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            new_parent: newparent,
            new_name: name_of(newname),
            flags: flags as i32,
            ..Default::default()
        };
        self.submit(OpTag::Rename, req, args, FuserReply::Empty(reply));
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let args = RequestArgs {
            ino,
            new_parent: newparent,
            new_name: name_of(newname),
            ..Default::default()
        };
        self.submit(OpTag::Link, req, args, FuserReply::Entry(reply));
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let args = RequestArgs {
            ino,
            flags,
            fi: open_file(0, flags),
            ..Default::default()
        };
        self.submit(OpTag::Open, req, args, FuserReply::Open(reply));
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, flags),
            offset,
            size: u64::from(size),
            lock_owner: lock_owner.unwrap_or(0),
            ..Default::default()
        };
        self.submit(OpTag::Read, req, args, FuserReply::Data(reply));
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!(ino, fh, offset, size = data.len(), "write");
        let args = RequestArgs {
            ino,
            fi: open_file(fh, flags),
            offset,
            size: data.len() as u64,
            data: Some(Bytes::copy_from_slice(data)),
            lock_owner: lock_owner.unwrap_or(0),
            ..Default::default()
        };
        self.submit(OpTag::Write, req, args, FuserReply::Write(reply));
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            lock_owner,
            ..Default::default()
        };
        self.submit(OpTag::Flush, req, args, FuserReply::Empty(reply));
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, flags),
            lock_owner: lock_owner.unwrap_or(0),
            ..Default::default()
        };
        self.submit(OpTag::Release, req, args, FuserReply::Empty(reply));
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            datasync,
            ..Default::default()
        };
        self.submit(OpTag::Fsync, req, args, FuserReply::Empty(reply));
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let args = RequestArgs {
            ino,
            flags,
            fi: open_file(0, flags),
            ..Default::default()
        };
        self.submit(OpTag::Opendir, req, args, FuserReply::Open(reply));
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            offset,
            ..Default::default()
        };
        self.submit(OpTag::Readdir, req, args, FuserReply::Directory(reply));
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectoryPlus,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            offset,
            ..Default::default()
        };
        self.submit(OpTag::Readdirplus, req, args, FuserReply::DirectoryPlus(reply));
    }

    fn releasedir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, flags),
            ..Default::default()
        };
        self.submit(OpTag::Releasedir, req, args, FuserReply::Empty(reply));
    }

    fn fsyncdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            datasync,
            ..Default::default()
        };
        self.submit(OpTag::Fsyncdir, req, args, FuserReply::Empty(reply));
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let args = RequestArgs {
            ino,
            ..Default::default()
        };
        self.submit(OpTag::Statfs, req, args, FuserReply::Statfs(reply));
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            ino,
            name: name_of(name),
            data: Some(Bytes::copy_from_slice(value)),
            size: value.len() as u64,
            flags,
            position,
            ..Default::default()
        };
        self.submit(OpTag::Setxattr, req, args, FuserReply::Empty(reply));
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let args = RequestArgs {
            ino,
            name: name_of(name),
            size: u64::from(size),
            ..Default::default()
        };
        self.submit(OpTag::Getxattr, req, args, FuserReply::Xattr(reply));
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let args = RequestArgs {
            ino,
            size: u64::from(size),
            ..Default::default()
        };
        self.submit(OpTag::Listxattr, req, args, FuserReply::Xattr(reply));
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let args = RequestArgs {
            ino,
            name: name_of(name),
            ..Default::default()
        };
        self.submit(OpTag::Removexattr, req, args, FuserReply::Empty(reply));
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let args = RequestArgs {
            ino,
            mask,
            ..Default::default()
        };
        self.submit(OpTag::Access, req, args, FuserReply::Empty(reply));
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let args = RequestArgs {
            parent,
            name: name_of(name),
            mode,
            umask,
            flags,
            fi: open_file(0, flags),
            ..Default::default()
        };
        self.submit(OpTag::Create, req, args, FuserReply::Create(reply));
    }

    fn getlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            lock_owner,
            lock: Some(LockRecord {
                start,
                end,
                typ,
                pid,
            }),
            ..Default::default()
        };
        self.submit(OpTag::Getlk, req, args, FuserReply::Lock(reply));
    }

    fn setlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            lock_owner,
            lock: Some(LockRecord {
                start,
                end,
                typ,
                pid,
            }),
            sleep,
            ..Default::default()
        };
        self.submit(OpTag::Setlk, req, args, FuserReply::Empty(reply));
    }

    fn bmap(&mut self, req: &Request<'_>, ino: u64, blocksize: u32, idx: u64, reply: ReplyBmap) {
        let args = RequestArgs {
            ino,
            blocksize,
            idx,
            ..Default::default()
        };
        self.submit(OpTag::Bmap, req, args, FuserReply::Bmap(reply));
    }

    fn ioctl(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            flags: flags as i32,
            cmd,
            data: Some(Bytes::copy_from_slice(in_data)),
            size: in_data.len() as u64,
            out_size,
            ..Default::default()
        };
        self.submit(OpTag::Ioctl, req, args, FuserReply::Ioctl(reply));
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            offset,
            size: u64::try_from(length).unwrap_or(0),
            flags: mode,
            ..Default::default()
        };
        self.submit(OpTag::Fallocate, req, args, FuserReply::Empty(reply));
    }

    fn lseek(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let args = RequestArgs {
            ino,
            fi: open_file(fh, 0),
            offset,
            whence,
            ..Default::default()
        };
        self.submit(OpTag::Lseek, req, args, FuserReply::Lseek(reply));
    }

    fn copy_file_range(
        &mut self,
        req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        let args = RequestArgs {
            ino: ino_in,
            fi: open_file(fh_in, 0),
            offset: offset_in,
            ino_out,
            fi_out: open_file(fh_out, 0),
            offset_out,
            size: len,
            flags: flags as i32,
            ..Default::default()
        };
        self.submit(OpTag::CopyFileRange, req, args, FuserReply::Write(reply));
    }
}
