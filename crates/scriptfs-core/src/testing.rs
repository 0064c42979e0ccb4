// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Utilities for driving the engine without a kernel: a reply sink that
//! records what the kernel would have received and an in-memory mounter.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::bridge::Bridge;
use crate::codec::{EntryReply, FileInfo, FsStats, LockRecord, Stat};
use crate::context::ReplySink;
use crate::dirent::DirEntry;
use crate::session::{MountedChannel, Mounter, SessionOptions, Unmounter};

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedReply {
    Error(i32),
    Ok,
    Entry(EntryReply),
    Attr(Stat, Duration),
    Data(Vec<u8>),
    Written(u32),
    Opened(FileInfo),
    Created(EntryReply, FileInfo),
    Statfs(FsStats),
    Lock(LockRecord),
    XattrSize(u32),
    Directory(Vec<DirEntry>),
    Offset(i64),
    Bmap(u64),
    Poll(u32),
    Ioctl(i32, Vec<u8>),
    None,
}

#[derive(Default)]
struct Recorded {
    replies: Mutex<Vec<RecordedReply>>,
    cond: Condvar,
}

/// Observer side of a [`RecordingReply`].
#[derive(Clone, Default)]
pub struct ReplyLog {
    inner: Arc<Recorded>,
}

impl ReplyLog {
    pub fn replies(&self) -> Vec<RecordedReply> {
        self.inner.replies.lock().clone()
    }

    /// Waits for the first reply.
    pub fn wait(&self, timeout: Duration) -> Option<RecordedReply> {
        self.wait_for(1, timeout).into_iter().next()
    }

    /// Waits until `count` replies arrived or `timeout` elapsed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<RecordedReply> {
        let deadline = Instant::now() + timeout;
        let mut replies = self.inner.replies.lock();
        while replies.len() < count {
            if self.inner.cond.wait_until(&mut replies, deadline).timed_out() {
                break;
            }
        }
        replies.clone()
    }
}

/// Reply sink that stores every reply in a shared log.
pub struct RecordingReply {
    recorded: ReplyLog,
}

impl RecordingReply {
    pub fn new() -> (Box<dyn ReplySink>, ReplyLog) {
        let recorded = ReplyLog::default();
        (Self::with_log(&recorded), recorded)
    }

    /// Additional sink feeding an existing log.
    pub fn with_log(recorded: &ReplyLog) -> Box<dyn ReplySink> {
        Box::new(RecordingReply {
            recorded: recorded.clone(),
        })
    }

    fn record(self, reply: RecordedReply) {
        let inner = &self.recorded.inner;
        inner.replies.lock().push(reply);
        inner.cond.notify_all();
    }
}

impl ReplySink for RecordingReply {
    fn error(self: Box<Self>, errno: i32) {
        self.record(RecordedReply::Error(errno))
    }

    fn ok(self: Box<Self>) {
        self.record(RecordedReply::Ok)
    }

    fn entry(self: Box<Self>, entry: &EntryReply) {
        self.record(RecordedReply::Entry(entry.clone()))
    }

    fn attr(self: Box<Self>, attr: &Stat, timeout: Duration) {
        self.record(RecordedReply::Attr(*attr, timeout))
    }

    fn data(self: Box<Self>, data: &[u8]) {
        self.record(RecordedReply::Data(data.to_vec()))
    }

    fn written(self: Box<Self>, size: u32) {
        self.record(RecordedReply::Written(size))
    }

    fn opened(self: Box<Self>, fi: &FileInfo) {
        self.record(RecordedReply::Opened(*fi))
    }

    fn created(self: Box<Self>, entry: &EntryReply, fi: &FileInfo) {
        self.record(RecordedReply::Created(entry.clone(), *fi))
    }

    fn statfs(self: Box<Self>, stats: &FsStats) {
        self.record(RecordedReply::Statfs(*stats))
    }

    fn lock(self: Box<Self>, lock: &LockRecord) {
        self.record(RecordedReply::Lock(*lock))
    }

    fn xattr_size(self: Box<Self>, size: u32) {
        self.record(RecordedReply::XattrSize(size))
    }

    fn directory(self: Box<Self>, entries: &[DirEntry]) {
        self.record(RecordedReply::Directory(entries.to_vec()))
    }

    fn offset(self: Box<Self>, offset: i64) {
        self.record(RecordedReply::Offset(offset))
    }

    fn bmap(self: Box<Self>, block: u64) {
        self.record(RecordedReply::Bmap(block))
    }

    fn poll(self: Box<Self>, revents: u32) {
        self.record(RecordedReply::Poll(revents))
    }

    fn ioctl(self: Box<Self>, result: i32, data: &[u8]) {
        self.record(RecordedReply::Ioctl(result, data.to_vec()))
    }

    fn none(self: Box<Self>) {
        self.record(RecordedReply::None)
    }
}

/// Frames fed to a [`MemoryMounter`] channel.
#[derive(Clone, Debug)]
pub enum MemoryFrame {
    Data(Vec<u8>),
    Interrupted,
    Error(i32),
    Close,
}

type ProcessHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct MemoryShared {
    sender: Mutex<Option<Sender<MemoryFrame>>>,
    processed: Mutex<Vec<Vec<u8>>>,
    hook: Mutex<Option<ProcessHook>>,
    mounts: Mutex<usize>,
}

/// Mounter whose channel reads frames pushed with [`MemoryMounter::send`].
#[derive(Default)]
pub struct MemoryMounter {
    shared: Arc<MemoryShared>,
    fail_with: Option<i32>,
}

impl MemoryMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mount attempt fails with `errno`.
    pub fn failing(errno: i32) -> Self {
        Self {
            fail_with: Some(errno),
            ..Self::default()
        }
    }

    /// Delivers a frame to the most recent mount. Frames sent while nothing
    /// is mounted are discarded.
    pub fn send(&self, frame: MemoryFrame) {
        if let Some(sender) = self.shared.sender.lock().as_ref() {
            let _ = sender.send(frame);
        }
    }

    pub fn processed(&self) -> Vec<Vec<u8>> {
        self.shared.processed.lock().clone()
    }

    pub fn mounts(&self) -> usize {
        *self.shared.mounts.lock()
    }

    /// Runs `hook` on the receive loop for every processed frame.
    pub fn on_process(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.shared.hook.lock() = Some(Arc::new(hook));
    }
}

impl Mounter for MemoryMounter {
    fn mount(
        &self,
        _mountpoint: &Path,
        _options: &SessionOptions,
        _bridge: Arc<Bridge>,
    ) -> io::Result<Box<dyn MountedChannel>> {
        if let Some(errno) = self.fail_with {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        *self.shared.sender.lock() = Some(tx.clone());
        *self.shared.mounts.lock() += 1;
        Ok(Box::new(MemoryChannel {
            rx,
            tx,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryChannel {
    rx: Receiver<MemoryFrame>,
    tx: Sender<MemoryFrame>,
    shared: Arc<MemoryShared>,
}

impl MountedChannel for MemoryChannel {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv() {
            Ok(MemoryFrame::Data(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Ok(MemoryFrame::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
            Ok(MemoryFrame::Error(errno)) => Err(io::Error::from_raw_os_error(errno)),
            Ok(MemoryFrame::Close) | Err(_) => Err(io::Error::from_raw_os_error(libc::ENODEV)),
        }
    }

    fn process(&mut self, request: &[u8]) {
        self.shared.processed.lock().push(request.to_vec());
        let hook = self.shared.hook.lock().clone();
        if let Some(hook) = hook {
            hook(request);
        }
    }

    fn unmounter(&mut self) -> Box<dyn Unmounter> {
        Box::new(MemoryUnmounter {
            tx: self.tx.clone(),
        })
    }
}

struct MemoryUnmounter {
    tx: Sender<MemoryFrame>,
}

impl Unmounter for MemoryUnmounter {
    fn unmount(&mut self) -> io::Result<()> {
        // The receive side may already be gone.
        let _ = self.tx.send(MemoryFrame::Close);
        Ok(())
    }
}
