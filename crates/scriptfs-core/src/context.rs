// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-request context with a reply-once latch
//!
//! A [`RequestContext`] binds one kernel request to exactly one reply. The
//! transport supplies a [`ReplySink`]; every `reply_*` primitive first flips
//! the latch, so whichever thread gets there first wins and every later
//! attempt is dropped with a debug log. A context dropped without a reply
//! answers `EIO` from its destructor so the kernel never waits forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::codec::{EntryReply, FileInfo, FsStats, LockRecord, SetAttrRequest, Stat};
use crate::dirent::DirEntry;
use crate::op::OpTag;
use crate::value::Value;

/// Kernel-facing reply primitives. Each consumes the sink, so a sink can
/// only ever answer once. Shapes a transport does not support fall back to
/// `EIO`.
pub trait ReplySink: Send {
    /// `errno` is positive.
    fn error(self: Box<Self>, errno: i32);

    fn ok(self: Box<Self>) {
        self.error(libc::EIO)
    }

    fn entry(self: Box<Self>, _entry: &EntryReply) {
        self.error(libc::EIO)
    }

    fn attr(self: Box<Self>, _attr: &Stat, _timeout: Duration) {
        self.error(libc::EIO)
    }

    /// Read data, readlink targets and xattr values.
    fn data(self: Box<Self>, _data: &[u8]) {
        self.error(libc::EIO)
    }

    fn written(self: Box<Self>, _size: u32) {
        self.error(libc::EIO)
    }

    fn opened(self: Box<Self>, _fi: &FileInfo) {
        self.error(libc::EIO)
    }

    fn created(self: Box<Self>, _entry: &EntryReply, _fi: &FileInfo) {
        self.error(libc::EIO)
    }

    fn statfs(self: Box<Self>, _stats: &FsStats) {
        self.error(libc::EIO)
    }

    fn lock(self: Box<Self>, _lock: &LockRecord) {
        self.error(libc::EIO)
    }

    fn xattr_size(self: Box<Self>, _size: u32) {
        self.error(libc::EIO)
    }

    fn directory(self: Box<Self>, _entries: &[DirEntry]) {
        self.error(libc::EIO)
    }

    fn offset(self: Box<Self>, _offset: i64) {
        self.error(libc::EIO)
    }

    fn bmap(self: Box<Self>, _block: u64) {
        self.error(libc::EIO)
    }

    fn poll(self: Box<Self>, _revents: u32) {
        self.error(libc::EIO)
    }

    fn ioctl(self: Box<Self>, _result: i32, _data: &[u8]) {
        self.error(libc::EIO)
    }

    /// Releases a request that takes no reply (`forget`).
    fn none(self: Box<Self>) {}
}

/// Identity of the process that issued the request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: Option<u32>,
}

impl CallerContext {
    pub fn to_value(&self) -> Value {
        Value::object()
            .with("uid", self.uid)
            .with("gid", self.gid)
            .with("pid", self.pid)
            .with("umask", self.umask.map(Value::from).unwrap_or_default())
    }
}

/// Operation-typed request fields. Each operation fills the subset it uses.
#[derive(Clone, Debug, Default)]
pub struct RequestArgs {
    pub ino: u64,
    pub parent: u64,
    pub new_parent: u64,
    pub name: Option<String>,
    pub new_name: Option<String>,
    /// Symlink target.
    pub target: Option<String>,
    pub mode: u32,
    pub umask: u32,
    pub rdev: u32,
    pub setattr: Option<SetAttrRequest>,
    pub fi: Option<FileInfo>,
    pub offset: i64,
    /// Destination side of `copy_file_range`.
    pub ino_out: u64,
    pub fi_out: Option<FileInfo>,
    pub offset_out: i64,
    /// Read size, copy length, fallocate length, xattr buffer size.
    pub size: u64,
    /// Open, rename, xattr, fallocate mode and copy flags.
    pub flags: i32,
    pub datasync: bool,
    pub mask: i32,
    pub data: Option<Bytes>,
    pub lock: Option<LockRecord>,
    pub lock_owner: u64,
    pub sleep: bool,
    pub whence: i32,
    pub nlookup: u64,
    pub forgets: Vec<(u64, u64)>,
    pub cmd: u32,
    pub out_size: u32,
    pub blocksize: u32,
    pub idx: u64,
    pub position: u32,
    pub poll_handle: u64,
    pub poll_events: u32,
}

pub struct RequestContext {
    op: OpTag,
    unique: u64,
    caller: Option<CallerContext>,
    pub args: RequestArgs,
    sink: Mutex<Option<Box<dyn ReplySink>>>,
    replied: AtomicBool,
    keepalive: Mutex<Vec<Bytes>>,
}

impl RequestContext {
    pub fn new(
        op: OpTag,
        unique: u64,
        caller: Option<CallerContext>,
        args: RequestArgs,
        sink: Box<dyn ReplySink>,
    ) -> Self {
        Self {
            op,
            unique,
            caller,
            args,
            sink: Mutex::new(Some(sink)),
            replied: AtomicBool::new(false),
            keepalive: Mutex::new(Vec::new()),
        }
    }

    /// Context for a request the kernel never expects an answer to.
    pub fn notification(op: OpTag, unique: u64, args: RequestArgs) -> Self {
        Self {
            op,
            unique,
            caller: None,
            args,
            sink: Mutex::new(None),
            replied: AtomicBool::new(false),
            keepalive: Mutex::new(Vec::new()),
        }
    }

    pub fn op(&self) -> OpTag {
        self.op
    }

    pub fn unique(&self) -> u64 {
        self.unique
    }

    pub fn caller(&self) -> Option<CallerContext> {
        self.caller
    }

    /// Caller record for handlers; `null` when unknown.
    pub fn caller_value(&self) -> Value {
        self.caller
            .map(|c| c.to_value())
            .unwrap_or(Value::Null)
    }

    /// Flips the latch; true for the first caller only.
    pub fn try_mark_replied(&self) -> bool {
        self.replied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Keeps `storage` alive until the context is dropped.
    pub fn attach_keepalive(&self, storage: Bytes) {
        self.keepalive.lock().push(storage);
    }

    pub fn keepalive_len(&self) -> usize {
        self.keepalive.lock().len()
    }

    fn deliver(&self, kind: &'static str, send: impl FnOnce(Box<dyn ReplySink>)) -> bool {
        if !self.try_mark_replied() {
            debug!(
                op = %self.op,
                request_id = self.unique,
                reply = kind,
                "dropping duplicate reply"
            );
            return false;
        }
        let sink = self.sink.lock().take();
        match sink {
            Some(sink) => {
                send(sink);
                true
            }
            None => {
                debug!(op = %self.op, request_id = self.unique, reply = kind, "no reply sink");
                false
            }
        }
    }

    /// Replies with a positive errno; zero is promoted to `EIO`.
    pub fn reply_error(&self, errno: i32) -> bool {
        let errno = match errno.checked_abs() {
            Some(0) | None => libc::EIO,
            Some(e) => e,
        };
        self.deliver("error", |s| s.error(errno))
    }

    pub fn reply_ok(&self) -> bool {
        self.deliver("ok", |s| s.ok())
    }

    pub fn reply_entry(&self, entry: &EntryReply) -> bool {
        self.deliver("entry", |s| s.entry(entry))
    }

    pub fn reply_attr(&self, attr: &Stat, timeout: Duration) -> bool {
        self.deliver("attr", |s| s.attr(attr, timeout))
    }

    /// Replies with `data`, which stays attached to the context for the
    /// duration of the reply and beyond.
    pub fn reply_buf(&self, data: Bytes) -> bool {
        if self.has_replied() {
            return self.deliver("buf", |_| {});
        }
        self.attach_keepalive(data.clone());
        self.deliver("buf", |s| s.data(&data))
    }

    pub fn reply_readlink(&self, target: &str) -> bool {
        self.reply_buf(Bytes::copy_from_slice(target.as_bytes()))
    }

    pub fn reply_write(&self, written: u32) -> bool {
        self.deliver("write", |s| s.written(written))
    }

    pub fn reply_open(&self, fi: &FileInfo) -> bool {
        self.deliver("open", |s| s.opened(fi))
    }

    pub fn reply_create(&self, entry: &EntryReply, fi: &FileInfo) -> bool {
        self.deliver("create", |s| s.created(entry, fi))
    }

    pub fn reply_statfs(&self, stats: &FsStats) -> bool {
        self.deliver("statfs", |s| s.statfs(stats))
    }

    pub fn reply_getlk(&self, lock: &LockRecord) -> bool {
        self.deliver("getlk", |s| s.lock(lock))
    }

    pub fn reply_xattr_size(&self, size: u32) -> bool {
        self.deliver("xattr", |s| s.xattr_size(size))
    }

    pub fn reply_directory(&self, entries: &[DirEntry]) -> bool {
        self.deliver("directory", |s| s.directory(entries))
    }

    pub fn reply_lseek(&self, offset: i64) -> bool {
        self.deliver("lseek", |s| s.offset(offset))
    }

    pub fn reply_bmap(&self, block: u64) -> bool {
        self.deliver("bmap", |s| s.bmap(block))
    }

    pub fn reply_poll(&self, revents: u32) -> bool {
        self.deliver("poll", |s| s.poll(revents))
    }

    pub fn reply_ioctl(&self, result: i32, data: Bytes) -> bool {
        if !data.is_empty() && !self.has_replied() {
            self.attach_keepalive(data.clone());
        }
        self.deliver("ioctl", |s| s.ioctl(result, &data))
    }

    /// Releases a reply-less request without answering.
    pub fn reply_none(&self) -> bool {
        self.deliver("none", |s| s.none())
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.replied.load(Ordering::Acquire) {
            return;
        }
        if let Some(sink) = self.sink.get_mut().take() {
            error!(
                op = %self.op,
                request_id = self.unique,
                "request context dropped without a reply"
            );
            sink.error(libc::EIO);
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("op", &self.op)
            .field("unique", &self.unique)
            .field("caller", &self.caller)
            .field("replied", &self.has_replied())
            .finish()
    }
}
