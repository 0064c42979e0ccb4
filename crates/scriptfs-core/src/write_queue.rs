// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-descriptor write queues
//!
//! Writes to one open file are serialized through that file's queue: jobs
//! run in priority order and, within a priority, in the order they were
//! accepted. Different descriptors make progress independently.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errno;

/// Write priority; lower values run first. `Urgent` is meant for
/// flush/fsync barriers, never for data whose order matters.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum WritePriority {
    Urgent = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

/// Write data; `Owned` buffers are freed with the job.
#[derive(Clone, Debug)]
pub enum WritePayload {
    Owned(Vec<u8>),
    Shared(Bytes),
}

impl WritePayload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            WritePayload::Owned(v) => v,
            WritePayload::Shared(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn owns_buffer(&self) -> bool {
        matches!(self, WritePayload::Owned(_))
    }
}

pub type WriteCompletion = Box<dyn FnOnce(usize) + Send + 'static>;
pub type WriteFailure = Box<dyn FnOnce(i32) + Send + 'static>;

pub struct WriteJob {
    pub fd: u64,
    /// `None` writes at the descriptor's current position.
    pub offset: Option<u64>,
    pub size: usize,
    pub data: WritePayload,
    pub priority: WritePriority,
    pub enqueued_at: Instant,
    pub op_id: u64,
    rank: u8,
    seq: u64,
    on_complete: Option<WriteCompletion>,
    on_error: Option<WriteFailure>,
}

impl WriteJob {
    pub fn new(fd: u64, offset: Option<u64>, data: WritePayload) -> Self {
        Self {
            fd,
            offset,
            size: data.len(),
            data,
            priority: WritePriority::Normal,
            enqueued_at: Instant::now(),
            op_id: 0,
            rank: 0,
            seq: 0,
            on_complete: None,
            on_error: None,
        }
    }

    /// Limits the write to the first `size` bytes of the payload.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.min(self.data.len());
        self
    }

    pub fn with_priority(mut self, priority: WritePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(usize) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// `f` receives a negative errno.
    pub fn on_error(mut self, f: impl FnOnce(i32) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data.as_slice()[..self.size]
    }

    fn complete(self, written: usize) {
        if let Some(f) = self.on_complete {
            f(written);
        }
    }

    fn fail(self, err: i32) {
        if let Some(f) = self.on_error {
            f(errno::normalize(err));
        }
    }
}

impl std::fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteJob")
            .field("fd", &self.fd)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("priority", &self.priority)
            .field("op_id", &self.op_id)
            .finish()
    }
}

impl PartialEq for WriteJob {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for WriteJob {}

impl PartialOrd for WriteJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriteJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.rank, other.seq).cmp(&(self.rank, self.seq))
    }
}

/// Performs one write. Returns bytes written or an errno (either sign).
pub trait WriteExecutor: Send + Sync {
    fn execute(&self, job: &WriteJob) -> Result<usize, i32>;
}

impl<F> WriteExecutor for F
where
    F: Fn(&WriteJob) -> Result<usize, i32> + Send + Sync,
{
    fn execute(&self, job: &WriteJob) -> Result<usize, i32> {
        self(job)
    }
}

/// Writes to the job's descriptor as a raw file descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct FdExecutor;

impl WriteExecutor for FdExecutor {
    fn execute(&self, job: &WriteJob) -> Result<usize, i32> {
        let fd = libc::c_int::try_from(job.fd).map_err(|_| -libc::EBADF)?;
        let buf = job.bytes();
        let rc = match job.offset {
            Some(offset) => {
                let offset = libc::off_t::try_from(offset).map_err(|_| -libc::EINVAL)?;
                // SAFETY: `buf` is valid for `buf.len()` bytes for the call.
                unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset) }
            }
            // SAFETY: as above.
            None => unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) },
        };
        if rc < 0 {
            Err(-io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(rc as usize)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteQueueStats {
    pub fd: u64,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub bytes_written: u64,
    pub queue_size: usize,
    pub peak_queue_size: usize,
    pub avg_wait_us: f64,
}

/// Totals across every queue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteQueueSummary {
    pub queues: usize,
    pub total_queue_size: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub bytes_written: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueConfig {
    #[serde(alias = "defaultMaxQueueSize")]
    pub default_max_queue_size: usize,
    #[serde(alias = "fdMaxQueueSize")]
    pub fd_max_queue_size: HashMap<u64, usize>,
    #[serde(alias = "priorityOrdering")]
    pub priority_ordering: bool,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            default_max_queue_size: 256,
            fd_max_queue_size: HashMap::new(),
            priority_ordering: true,
        }
    }
}

impl WriteQueueConfig {
    fn cap_for(&self, fd: u64) -> usize {
        self.fd_max_queue_size
            .get(&fd)
            .copied()
            .unwrap_or(self.default_max_queue_size)
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<WriteJob>,
    processing: bool,
    next_seq: u64,
    stats: WriteQueueStats,
}

/// One descriptor's queue.
pub struct FdWriteQueue {
    fd: u64,
    state: Mutex<QueueState>,
}

impl FdWriteQueue {
    fn new(fd: u64) -> Self {
        Self {
            fd,
            state: Mutex::new(QueueState {
                stats: WriteQueueStats {
                    fd,
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    pub fn fd(&self) -> u64 {
        self.fd
    }

    fn push(&self, mut job: WriteJob, cap: usize, ordering: bool, op_id: u64) -> Result<u64, WriteJob> {
        let mut state = self.state.lock();
        if state.heap.len() >= cap {
            state.stats.rejected += 1;
            return Err(job);
        }
        job.op_id = op_id;
        job.seq = state.next_seq;
        state.next_seq += 1;
        job.rank = if ordering { job.priority as u8 } else { 0 };
        job.enqueued_at = Instant::now();
        state.heap.push(job);
        state.stats.enqueued += 1;
        let len = state.heap.len();
        state.stats.peak_queue_size = state.stats.peak_queue_size.max(len);
        Ok(op_id)
    }

    /// Claims the next job unless another processor holds this queue.
    fn begin_next(&self) -> Option<WriteJob> {
        let mut state = self.state.lock();
        if state.processing {
            return None;
        }
        let job = state.heap.pop()?;
        state.processing = true;
        Some(job)
    }

    fn finish(&self, outcome: Result<usize, i32>, waited: Duration) {
        let mut state = self.state.lock();
        state.processing = false;
        let stats = &mut state.stats;
        match outcome {
            Ok(written) => {
                stats.completed += 1;
                stats.bytes_written += written as u64;
            }
            Err(_) => stats.failed += 1,
        }
        let done = (stats.completed + stats.failed) as f64;
        let waited_us = waited.as_micros() as f64;
        stats.avg_wait_us += (waited_us - stats.avg_wait_us) / done;
    }

    fn drain(&self) -> Vec<WriteJob> {
        let mut state = self.state.lock();
        let jobs: Vec<_> = state.heap.drain().collect();
        state.stats.cancelled += jobs.len() as u64;
        jobs
    }

    /// Queued jobs plus the one being executed, if any.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.heap.len() + usize::from(state.processing)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> WriteQueueStats {
        let state = self.state.lock();
        WriteQueueStats {
            queue_size: state.heap.len(),
            ..state.stats.clone()
        }
    }

    /// Runs one job through `executor`. Continuations fire before the queue
    /// is released so a second processor cannot overtake them.
    fn run_one(&self, executor: &dyn WriteExecutor) -> bool {
        let Some(job) = self.begin_next() else {
            return false;
        };
        let waited = job.enqueued_at.elapsed();
        let executed = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&job)))
            .unwrap_or_else(|_| {
                warn!(fd = job.fd, op_id = job.op_id, "write executor panicked");
                Err(-libc::EIO)
            });
        let outcome = match executed {
            Ok(0) if job.size > 0 => Err(-libc::ENOSPC),
            Ok(written) => Ok(written.min(job.size)),
            Err(err) => Err(errno::normalize(if err == 0 { libc::EIO } else { err })),
        };
        debug!(
            target: "scriptfs::write",
            fd = job.fd,
            op_id = job.op_id,
            offset = ?job.offset,
            size = job.size,
            result = ?outcome,
            "write executed"
        );
        let settled = panic::catch_unwind(AssertUnwindSafe(move || match outcome {
            Ok(written) => job.complete(written),
            Err(err) => job.fail(err),
        }));
        if settled.is_err() {
            warn!(fd = self.fd, "write completion callback panicked");
        }
        self.finish(outcome, waited);
        true
    }
}

pub struct WriteQueueManager {
    queues: Mutex<HashMap<u64, Arc<FdWriteQueue>>>,
    config: Mutex<WriteQueueConfig>,
    executor: Mutex<Option<Arc<dyn WriteExecutor>>>,
    next_op_id: AtomicU64,
    accepting: AtomicBool,
}

impl Default for WriteQueueManager {
    fn default() -> Self {
        Self::new(WriteQueueConfig::default())
    }
}

impl WriteQueueManager {
    pub fn new(config: WriteQueueConfig) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            config: Mutex::new(config),
            executor: Mutex::new(None),
            next_op_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn queue(&self, fd: u64) -> Option<Arc<FdWriteQueue>> {
        self.queues.lock().get(&fd).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<FdWriteQueue>> {
        let mut queues: Vec<_> = self.queues.lock().values().cloned().collect();
        queues.sort_by_key(|q| q.fd);
        queues
    }

    /// Accepts `job` or hands it back when the queue is full or the
    /// manager is shut down.
    pub fn try_enqueue(&self, job: WriteJob) -> Result<u64, WriteJob> {
        if !self.is_accepting() {
            return Err(job);
        }
        let fd = job.fd;
        let (cap, ordering) = {
            let config = self.config.lock();
            (config.cap_for(fd), config.priority_ordering)
        };
        let queue = {
            let mut queues = self.queues.lock();
            Arc::clone(
                queues
                    .entry(fd)
                    .or_insert_with(|| Arc::new(FdWriteQueue::new(fd))),
            )
        };
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        queue.push(job, cap, ordering, op_id)
    }

    /// Returns the operation id, or 0 when the job was refused; a refused
    /// job's error continuation receives `-EAGAIN` (queue full) or
    /// `-ECANCELED` (shut down).
    pub fn enqueue(&self, job: WriteJob) -> u64 {
        match self.try_enqueue(job) {
            Ok(op_id) => op_id,
            Err(job) => {
                let err = if self.is_accepting() {
                    warn!(fd = job.fd, "write queue full");
                    -libc::EAGAIN
                } else {
                    -libc::ECANCELED
                };
                job.fail(err);
                0
            }
        }
    }

    /// Drains every queue round-robin, one job per queue per pass.
    /// Returns the number of jobs executed.
    pub fn process_all(&self, executor: Arc<dyn WriteExecutor>) -> usize {
        *self.executor.lock() = Some(Arc::clone(&executor));
        let mut processed = 0;
        loop {
            let mut progress = false;
            for queue in self.snapshot() {
                if queue.run_one(executor.as_ref()) {
                    processed += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        processed
    }

    /// Waits until `fd`'s queue is empty, driving it with the last executor
    /// seen by [`process_all`](Self::process_all) when there is one.
    pub fn flush(&self, fd: u64, timeout: Duration) -> bool {
        let Some(queue) = self.queue(fd) else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        let executor = self.executor.lock().clone();
        loop {
            if queue.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(fd, remaining = queue.len(), "write queue flush timed out");
                return false;
            }
            let drove = executor
                .as_ref()
                .is_some_and(|executor| queue.run_one(executor.as_ref()));
            if !drove {
                thread::sleep((deadline - now).min(Duration::from_millis(10)));
            }
        }
    }

    pub fn flush_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flushed = true;
        for queue in self.snapshot() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            flushed &= self.flush(queue.fd, remaining);
        }
        flushed
    }

    /// Fails every queued job with `err` (sign ignored). Returns how many
    /// were cancelled.
    pub fn cancel_all(&self, err: i32) -> usize {
        let err = errno::normalize(err);
        let mut cancelled = 0;
        for queue in self.snapshot() {
            let jobs = queue.drain();
            cancelled += jobs.len();
            for job in jobs {
                job.fail(err);
            }
        }
        if cancelled > 0 {
            info!(cancelled, errno = err, "write queues cancelled");
        }
        cancelled
    }

    /// Queued plus executing jobs across all descriptors.
    pub fn total_queue_size(&self) -> usize {
        self.snapshot().iter().map(|q| q.len()).sum()
    }

    pub fn queue_size(&self, fd: u64) -> usize {
        self.queue(fd).map(|q| q.len()).unwrap_or(0)
    }

    pub fn stats(&self, fd: u64) -> Option<WriteQueueStats> {
        self.queue(fd).map(|q| q.stats())
    }

    pub fn all_stats(&self) -> Vec<WriteQueueStats> {
        self.snapshot().iter().map(|q| q.stats()).collect()
    }

    pub fn summary(&self) -> WriteQueueSummary {
        let queues = self.snapshot();
        let mut summary = WriteQueueSummary {
            queues: queues.len(),
            ..Default::default()
        };
        for queue in queues {
            summary.total_queue_size += queue.len();
            let stats = queue.stats();
            summary.enqueued += stats.enqueued;
            summary.completed += stats.completed;
            summary.failed += stats.failed;
            summary.cancelled += stats.cancelled;
            summary.rejected += stats.rejected;
            summary.bytes_written += stats.bytes_written;
        }
        summary
    }

    pub fn config(&self) -> WriteQueueConfig {
        self.config.lock().clone()
    }

    /// New caps apply to later enqueues; queued jobs are kept.
    pub fn configure(&self, config: WriteQueueConfig) {
        debug!(?config, "write queue config updated");
        *self.config.lock() = config;
    }

    /// Drops `fd`'s queue, cancelling whatever it still holds.
    pub fn remove_queue(&self, fd: u64) -> bool {
        let Some(queue) = self.queues.lock().remove(&fd) else {
            return false;
        };
        for job in queue.drain() {
            job.fail(-libc::ECANCELED);
        }
        true
    }

    /// Refuses new work, flushes within `timeout`, then cancels leftovers.
    /// Returns true when nothing had to be cancelled.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::Release);
        let flushed = self.flush_all(timeout);
        let cancelled = self.cancel_all(-libc::ECANCELED);
        info!(flushed, cancelled, "write queues shut down");
        flushed && cancelled == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::io::Read;
    use std::os::unix::io::AsRawFd;

    fn recording_executor() -> (Arc<dyn WriteExecutor>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let executor: Arc<dyn WriteExecutor> = Arc::new(move |job: &WriteJob| -> Result<usize, i32> {
            sink.lock().push(job.bytes().to_vec());
            Ok(job.size)
        });
        (executor, log)
    }

    fn owned(fd: u64, offset: u64, data: &[u8]) -> WriteJob {
        WriteJob::new(fd, Some(offset), WritePayload::Owned(data.to_vec()))
    }

    #[test]
    fn same_priority_writes_complete_in_order() {
        let manager = WriteQueueManager::default();
        let (tx, rx) = unbounded();
        for (i, data) in [b"A", b"B", b"C"].iter().enumerate() {
            let tx = tx.clone();
            let id = manager.enqueue(
                owned(3, i as u64, *data).on_complete(move |n| tx.send((i, n)).unwrap()),
            );
            assert_ne!(id, 0);
        }
        let (executor, log) = recording_executor();
        assert_eq!(manager.process_all(executor), 3);
        assert_eq!(*log.lock(), vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
        let done: Vec<_> = rx.try_iter().collect();
        assert_eq!(done, vec![(0, 1), (1, 1), (2, 1)]);
        assert_eq!(manager.stats(3).unwrap().bytes_written, 3);
    }

    #[test]
    fn urgent_jobs_overtake_queued_normal_jobs() {
        let manager = WriteQueueManager::default();
        for i in 0..10u8 {
            manager.enqueue(owned(4, u64::from(i), &[b'0' + i]));
        }
        manager.enqueue(
            WriteJob::new(4, None, WritePayload::Shared(Bytes::from_static(b"F")))
                .with_priority(WritePriority::Urgent),
        );
        let (executor, log) = recording_executor();
        manager.process_all(executor);
        let log = log.lock();
        assert_eq!(log[0], b"F".to_vec());
        assert_eq!(log[1], b"0".to_vec());
        assert_eq!(log.len(), 11);
    }

    #[test]
    fn ordering_toggle_gives_fifo() {
        let manager = WriteQueueManager::new(WriteQueueConfig {
            priority_ordering: false,
            ..Default::default()
        });
        manager.enqueue(owned(1, 0, b"a").with_priority(WritePriority::Low));
        manager.enqueue(owned(1, 1, b"b").with_priority(WritePriority::Urgent));
        let (executor, log) = recording_executor();
        manager.process_all(executor);
        assert_eq!(*log.lock(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn round_robin_across_descriptors() {
        let manager = WriteQueueManager::default();
        manager.enqueue(owned(1, 0, b"1a"));
        manager.enqueue(owned(1, 2, b"1b"));
        manager.enqueue(owned(2, 0, b"2a"));
        manager.enqueue(owned(2, 2, b"2b"));
        let (executor, log) = recording_executor();
        manager.process_all(executor);
        assert_eq!(
            *log.lock(),
            vec![b"1a".to_vec(), b"2a".to_vec(), b"1b".to_vec(), b"2b".to_vec()]
        );
    }

    #[test]
    fn full_queue_refuses_with_eagain() {
        let mut config = WriteQueueConfig::default();
        config.fd_max_queue_size.insert(9, 2);
        let manager = WriteQueueManager::new(config);
        assert_ne!(manager.enqueue(owned(9, 0, b"x")), 0);
        assert_ne!(manager.enqueue(owned(9, 1, b"y")), 0);
        let (tx, rx) = unbounded();
        assert_eq!(
            manager.enqueue(owned(9, 2, b"z").on_error(move |e| tx.send(e).unwrap())),
            0
        );
        assert_eq!(rx.try_recv().unwrap(), -libc::EAGAIN);
        assert_eq!(manager.queue_size(9), 2);
        assert_eq!(manager.stats(9).unwrap().rejected, 1);
        // Other descriptors use the default cap
        assert_ne!(manager.enqueue(owned(10, 0, b"x")), 0);
    }

    #[test]
    fn zero_byte_result_reports_enospc() {
        let manager = WriteQueueManager::default();
        let (tx, rx) = unbounded();
        manager.enqueue(owned(5, 0, b"data").on_error(move |e| tx.send(e).unwrap()));
        manager.process_all(Arc::new(|_: &WriteJob| -> Result<usize, i32> { Ok(0) }));
        assert_eq!(rx.try_recv().unwrap(), -libc::ENOSPC);
        assert_eq!(manager.stats(5).unwrap().failed, 1);
    }

    #[test]
    fn executor_errors_are_negative() {
        let manager = WriteQueueManager::default();
        let (tx, rx) = unbounded();
        manager.enqueue(owned(5, 0, b"data").on_error(move |e| tx.send(e).unwrap()));
        manager.process_all(Arc::new(|_: &WriteJob| -> Result<usize, i32> {
            Err(libc::EBADF)
        }));
        assert_eq!(rx.try_recv().unwrap(), -libc::EBADF);
    }

    #[test]
    fn cancel_all_fails_every_queued_job_once() {
        let manager = WriteQueueManager::default();
        let (tx, rx) = unbounded();
        for fd in 0..3 {
            for i in 0..4 {
                let tx = tx.clone();
                manager.enqueue(owned(fd, i, b"x").on_error(move |e| tx.send(e).unwrap()));
            }
        }
        assert_eq!(manager.cancel_all(libc::ECANCELED), 12);
        let codes: Vec<_> = rx.try_iter().collect();
        assert_eq!(codes, vec![-libc::ECANCELED; 12]);
        assert_eq!(manager.total_queue_size(), 0);
        assert_eq!(manager.summary().cancelled, 12);
    }

    #[test]
    fn flush_drives_queue_with_remembered_executor() {
        let manager = WriteQueueManager::default();
        let (executor, log) = recording_executor();
        manager.process_all(Arc::clone(&executor));
        manager.enqueue(owned(7, 0, b"late"));
        assert!(manager.flush(7, Duration::from_millis(500)));
        assert_eq!(*log.lock(), vec![b"late".to_vec()]);
    }

    #[test]
    fn flush_without_executor_times_out() {
        let manager = WriteQueueManager::default();
        manager.enqueue(owned(8, 0, b"stuck"));
        let started = Instant::now();
        assert!(!manager.flush(8, Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(manager.flush(99, Duration::ZERO));
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let manager = WriteQueueManager::default();
        manager.enqueue(owned(1, 0, b"x"));
        assert!(!manager.shutdown(Duration::from_millis(20)));
        let (tx, rx) = unbounded();
        assert_eq!(
            manager.enqueue(owned(1, 1, b"y").on_error(move |e| tx.send(e).unwrap())),
            0
        );
        assert_eq!(rx.try_recv().unwrap(), -libc::ECANCELED);
    }

    #[test]
    fn concurrent_processors_preserve_per_fd_order() {
        let manager = Arc::new(WriteQueueManager::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..200u64 {
            let order = Arc::clone(&order);
            manager.enqueue(
                owned(1, i, b"x").on_complete(move |_| order.lock().push(i)),
            );
        }
        let (executor, _log) = recording_executor();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let executor = Arc::clone(&executor);
                thread::spawn(move || manager.process_all(executor))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(manager.flush(1, Duration::from_secs(2)));
        let order = order.lock();
        assert_eq!(*order, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn fd_executor_writes_at_offset() {
        let mut file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd() as u64;
        let manager = WriteQueueManager::default();
        manager.enqueue(WriteJob::new(fd, Some(0), WritePayload::Owned(b"hello".to_vec())));
        manager.enqueue(WriteJob::new(fd, Some(5), WritePayload::Shared(Bytes::from_static(b" world"))));
        assert_eq!(manager.process_all(Arc::new(FdExecutor)), 2);
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn panicking_executor_fails_job_and_queue_keeps_draining() {
        let manager = WriteQueueManager::default();
        let (tx, rx) = unbounded();
        manager.enqueue(owned(6, 0, b"boom").on_error(move |e| tx.send(e).unwrap()));
        manager.enqueue(owned(6, 4, b"next"));
        let panicking: Arc<dyn WriteExecutor> =
            Arc::new(|_: &WriteJob| -> Result<usize, i32> { panic!("executor failure") });
        assert_eq!(manager.process_all(panicking), 2);
        assert_eq!(rx.try_recv().unwrap(), -libc::EIO);
        assert_eq!(manager.total_queue_size(), 0);

        manager.enqueue(owned(6, 8, b"later"));
        let (executor, log) = recording_executor();
        assert_eq!(manager.process_all(executor), 1);
        assert!(manager.flush(6, Duration::from_millis(100)));
        assert_eq!(*log.lock(), vec![b"later".to_vec()]);
        let summary = manager.summary();
        assert_eq!(summary.total_queue_size, 0);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.completed, 1);
    }

    #[test]
    fn panicking_completion_does_not_wedge_queue() {
        let manager = WriteQueueManager::default();
        manager.enqueue(owned(2, 0, b"x").on_complete(|_| panic!("callback failure")));
        manager.enqueue(owned(2, 1, b"y"));
        let (executor, log) = recording_executor();
        assert_eq!(manager.process_all(executor), 2);
        assert_eq!(log.lock().len(), 2);
        assert_eq!(manager.queue_size(2), 0);
    }

    #[test]
    fn overreported_write_count_is_clamped_to_job_size() {
        let manager = WriteQueueManager::default();
        let (tx, rx) = unbounded();
        manager.enqueue(owned(11, 0, b"abc").on_complete(move |n| tx.send(n).unwrap()));
        manager.process_all(Arc::new(|_: &WriteJob| -> Result<usize, i32> { Ok(1 << 20) }));
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert_eq!(manager.stats(11).unwrap().bytes_written, 3);
        assert_eq!(manager.summary().bytes_written, 3);
    }

    #[test]
    fn with_size_limits_payload() {
        let job = owned(1, 0, b"abcdef").with_size(3);
        assert_eq!(job.bytes(), b"abc");
        assert!(job.data.owns_buffer());
        assert_eq!(owned(1, 0, b"ab").with_size(10).size, 2);
    }
}
