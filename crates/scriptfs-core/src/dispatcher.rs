// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-thread dispatcher
//!
//! Producers (FUSE workers, timers, the shutdown driver) enqueue jobs into a
//! bounded priority queue; worker threads pop them and hand each one to the
//! script thread with a blocking submission. Every accepted job either runs
//! or has its error continuation invoked exactly once.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errno;
use crate::op::OpTag;
use crate::registry::{HandlerRef, HandlerRegistry};
use crate::script::{HandlerResult, ScriptEnv, ScriptHandle};
use crate::value::Value;

/// Job priority; lower values run first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Unmount and error paths only.
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    #[serde(alias = "maxQueueSize")]
    pub max_queue_size: usize,
    #[serde(alias = "workerThreads")]
    pub worker_threads: usize,
    #[serde(alias = "priorityOrdering")]
    pub priority_ordering: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            worker_threads: 1,
            priority_ordering: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
    pub cancelled: u64,
    pub queue_size: usize,
    pub pending: usize,
    pub peak_queue_size: usize,
    pub avg_latency_us: f64,
    pub max_latency_us: u64,
}

/// Closure executed on the script thread with the handler captured at
/// dispatch time (if any).
pub type ScriptThunk = Box<dyn FnOnce(&mut ScriptEnv, Option<HandlerRef>) + Send + 'static>;
/// Receives a negative errno when the job cannot run.
pub type ErrorContinuation = Box<dyn FnOnce(i32) + Send + 'static>;
pub type CompletionContinuation = Box<dyn FnOnce(&mut ScriptEnv, HandlerResult) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DispatcherState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Shutdown = 3,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DispatcherState::Created,
            1 => DispatcherState::Running,
            2 => DispatcherState::ShuttingDown,
            _ => DispatcherState::Shutdown,
        }
    }
}

struct Job {
    id: u64,
    op: OpTag,
    op_name: String,
    priority: Priority,
    rank: u8,
    seq: u64,
    enqueued_at: Instant,
    handler: Option<HandlerRef>,
    thunk: ScriptThunk,
    on_error: Option<ErrorContinuation>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // BinaryHeap is a max-heap: the smallest (rank, seq) must compare greatest
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.rank, other.seq).cmp(&(self.rank, self.seq))
    }
}

struct PendingEntry {
    op: OpTag,
    enqueued_at: Instant,
}

pub struct Dispatcher {
    script: ScriptHandle,
    registry: RwLock<Option<Arc<HandlerRegistry>>>,
    config: Mutex<DispatcherConfig>,
    state: AtomicU8,
    queue: Mutex<BinaryHeap<Job>>,
    available: Condvar,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    stats: Mutex<DispatcherStats>,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        script: ScriptHandle,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            script,
            registry: RwLock::new(Some(registry)),
            config: Mutex::new(config),
            state: AtomicU8::new(DispatcherState::Created as u8),
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(DispatcherStats::default()),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Spawns the worker threads. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        if self
            .state
            .compare_exchange(
                DispatcherState::Created as u8,
                DispatcherState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        let count = self.config.lock().worker_threads.max(1);
        let mut spawned = Vec::with_capacity(count);
        for index in 0..count {
            let dispatcher = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("scriptfs-dispatch-{index}"))
                .spawn(move || dispatcher.worker_loop(index))?;
            spawned.push(handle);
        }
        self.workers.lock().extend(spawned);
        info!(workers = count, "dispatcher started");
        Ok(())
    }

    /// Enqueues `thunk` for the script thread. Returns the request id, or 0
    /// when the dispatcher is not running or the queue is full; `on_error`
    /// is not invoked in that case.
    pub fn dispatch_custom(
        &self,
        op_name: &str,
        thunk: ScriptThunk,
        priority: Priority,
        on_error: Option<ErrorContinuation>,
    ) -> u64 {
        if !self.is_accepting() {
            debug!(op = op_name, "dispatch refused: dispatcher not running");
            return 0;
        }

        let op = OpTag::parse(op_name);
        let registry = self.registry.read().clone();
        let handler = registry.and_then(|registry| registry.lookup(op));
        let (max_queue_size, priority_ordering) = {
            let config = self.config.lock();
            (config.max_queue_size, config.priority_ordering)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let enqueued_at = Instant::now();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= max_queue_size {
                drop(pending);
                self.stats.lock().dropped += 1;
                warn!(op = op_name, max_queue_size, "dispatcher queue full");
                return 0;
            }
            pending.insert(id, PendingEntry { op, enqueued_at });
        }

        let job = Job {
            id,
            op,
            op_name: op_name.to_string(),
            priority,
            rank: if priority_ordering { priority as u8 } else { 0 },
            seq: id,
            enqueued_at,
            handler,
            thunk,
            on_error,
        };
        let queue_size = {
            let mut queue = self.queue.lock();
            queue.push(job);
            let len = queue.len();
            self.available.notify_one();
            len
        };
        {
            let mut stats = self.stats.lock();
            stats.dispatched += 1;
            stats.peak_queue_size = stats.peak_queue_size.max(queue_size);
        }
        debug!(op = op_name, request_id = id, ?priority, queue_size, "job dispatched");

        // Shutdown may have drained the queue between the state check and
        // the push; cancel anything it missed.
        if !self.is_accepting() {
            self.cancel_queued();
        }
        id
    }

    /// Looks up the handler for `op_name` and calls it with `args` on the
    /// script thread. `on_complete` receives the handler's result; without
    /// a handler it receives an `ENOSYS` rejection.
    pub fn dispatch(
        &self,
        op_name: &str,
        args: Vec<Value>,
        priority: Priority,
        on_complete: Option<CompletionContinuation>,
    ) -> u64 {
        let thunk: ScriptThunk = Box::new(move |env, handler| {
            let result = match handler {
                Some(handler) => handler.call(env, args),
                None => Err(errno::error_record(libc::ENOSYS)),
            };
            if let Some(done) = on_complete {
                done(env, result);
            }
        });
        self.dispatch_custom(op_name, thunk, priority, None)
    }

    fn worker_loop(self: Arc<Self>, index: usize) {
        debug!(worker = index, "dispatcher worker running");
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if self.state() >= DispatcherState::ShuttingDown {
                        debug!(worker = index, "dispatcher worker exiting");
                        return;
                    }
                    if let Some(job) = queue.pop() {
                        break job;
                    }
                    self.available.wait(&mut queue);
                }
            };
            self.run_job(job);
        }
    }

    fn run_job(&self, job: Job) {
        let Job {
            id,
            op,
            op_name,
            priority,
            enqueued_at,
            handler,
            thunk,
            on_error,
            ..
        } = job;
        let registry = self.registry.read().clone();
        let started = Instant::now();

        let result = self.script.call_blocking(move |env| {
            // A handler removed or replaced after dispatch must not be invoked
            let handler = handler
                .filter(|h| registry.as_ref().is_some_and(|r| r.is_current(op, h)));
            thunk(env, handler);
        });

        let finished = Instant::now();
        self.pending.lock().remove(&id);
        match result {
            Ok(()) => {
                let latency_us = finished.duration_since(started).as_micros() as u64;
                let mut stats = self.stats.lock();
                stats.processed += 1;
                stats.avg_latency_us = if stats.processed == 1 {
                    latency_us as f64
                } else {
                    stats.avg_latency_us * 0.9 + latency_us as f64 * 0.1
                };
                stats.max_latency_us = stats.max_latency_us.max(latency_us);
                drop(stats);
                debug!(
                    op = %op_name,
                    request_id = id,
                    ?priority,
                    latency_us,
                    waited_us = started.duration_since(enqueued_at).as_micros() as u64,
                    "job completed"
                );
            }
            Err(err) => {
                self.stats.lock().errors += 1;
                error!(op = %op_name, request_id = id, error = %err, "script thread call failed");
                if let Some(on_error) = on_error {
                    on_error(-libc::EIO);
                }
            }
        }
    }

    /// Pops every queued job and cancels it with `-ECANCELED`.
    fn cancel_queued(&self) -> usize {
        let drained: Vec<Job> = {
            let mut queue = self.queue.lock();
            queue.drain().collect()
        };
        if drained.is_empty() {
            return 0;
        }
        {
            let mut pending = self.pending.lock();
            for job in &drained {
                pending.remove(&job.id);
            }
        }
        let count = drained.len();
        self.stats.lock().cancelled += count as u64;
        for job in drained {
            debug!(op = %job.op_name, request_id = job.id, "job cancelled");
            if let Some(on_error) = job.on_error {
                on_error(-libc::ECANCELED);
            }
        }
        count
    }

    /// Stops accepting work, cancels queued jobs with `-ECANCELED`, joins
    /// the workers within `timeout` and releases the registry. Returns
    /// false when a worker did not finish in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let previous = self
            .state
            .fetch_max(DispatcherState::ShuttingDown as u8, Ordering::AcqRel);
        if DispatcherState::from_u8(previous) == DispatcherState::Shutdown {
            return true;
        }
        info!(timeout_ms = timeout.as_millis() as u64, "dispatcher shutting down");
        {
            let _queue = self.queue.lock();
            self.available.notify_all();
        }
        let mut cancelled = self.cancel_queued();

        let deadline = Instant::now() + timeout;
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let mut all_joined = true;
        for worker in workers {
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    error!("dispatcher worker panicked");
                }
            } else {
                warn!("dispatcher worker did not stop in time; detaching");
                all_joined = false;
            }
        }

        cancelled += self.cancel_queued();
        *self.registry.write() = None;
        self.state
            .store(DispatcherState::Shutdown as u8, Ordering::Release);
        info!(cancelled, all_joined, "dispatcher shut down");
        all_joined
    }

    pub fn stats(&self) -> DispatcherStats {
        let queue_size = self.queue.lock().len();
        let pending = self.pending.lock().len();
        let mut stats = self.stats.lock().clone();
        stats.queue_size = queue_size;
        stats.pending = pending;
        stats
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = DispatcherStats::default();
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config.lock().clone()
    }

    /// Applies a new queue cap and ordering toggle. Worker count only takes
    /// effect at start.
    pub fn set_config(&self, config: DispatcherConfig) {
        debug!(?config, "dispatcher config updated");
        *self.config.lock() = config;
    }

    /// Jobs queued or in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Oldest pending job, for diagnostics.
    pub fn oldest_pending(&self) -> Option<(OpTag, Duration)> {
        self.pending
            .lock()
            .values()
            .min_by_key(|entry| entry.enqueued_at)
            .map(|entry| (entry.op, entry.enqueued_at.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Completion, ScriptThread};
    use crossbeam_channel::{bounded, unbounded};

    fn setup(config: DispatcherConfig) -> (ScriptThread, Arc<HandlerRegistry>, Arc<Dispatcher>) {
        let script = ScriptThread::spawn("dispatch-test").unwrap();
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), script.handle(), config);
        (script, registry, dispatcher)
    }

    /// Occupies the script thread until the returned sender fires.
    fn block_script(dispatcher: &Dispatcher) -> crossbeam_channel::Sender<()> {
        let (release_tx, release_rx) = bounded::<()>(1);
        let (entered_tx, entered_rx) = bounded::<()>(1);
        let id = dispatcher.dispatch_custom(
            "gate",
            Box::new(move |_, _| {
                entered_tx.send(()).unwrap();
                let _ = release_rx.recv();
            }),
            Priority::Normal,
            None,
        );
        assert_ne!(id, 0);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        release_tx
    }

    #[test]
    fn dispatch_before_start_is_refused() {
        let (_script, _registry, dispatcher) = setup(DispatcherConfig::default());
        assert_eq!(
            dispatcher.dispatch_custom("read", Box::new(|_, _| {}), Priority::Normal, None),
            0
        );
    }

    #[test]
    fn jobs_run_in_priority_then_arrival_order() {
        let (_script, _registry, dispatcher) = setup(DispatcherConfig::default());
        dispatcher.start().unwrap();
        let release = block_script(&dispatcher);

        let (tx, rx) = unbounded();
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high", Priority::High),
            ("normal-2", Priority::Normal),
        ] {
            let tx = tx.clone();
            dispatcher.dispatch_custom(
                "custom",
                Box::new(move |_, _| tx.send(label).unwrap()),
                priority,
                None,
            );
        }
        release.send(()).unwrap();
        let order: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn fifo_when_priority_ordering_is_off() {
        let (_script, _registry, dispatcher) = setup(DispatcherConfig {
            priority_ordering: false,
            ..Default::default()
        });
        dispatcher.start().unwrap();
        let release = block_script(&dispatcher);
        let (tx, rx) = unbounded();
        for (label, priority) in [("a", Priority::Low), ("b", Priority::High)] {
            let tx = tx.clone();
            dispatcher.dispatch_custom(
                "custom",
                Box::new(move |_, _| tx.send(label).unwrap()),
                priority,
                None,
            );
        }
        release.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "a");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "b");
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn full_queue_returns_zero_without_dropping_accepted_jobs() {
        let (_script, _registry, dispatcher) = setup(DispatcherConfig {
            max_queue_size: 4,
            ..Default::default()
        });
        dispatcher.start().unwrap();
        let (tx, rx) = unbounded();
        // The gate job is the first of the four pending slots
        let release = block_script(&dispatcher);
        let mut ids = Vec::new();
        for i in 0..3 {
            let tx = tx.clone();
            ids.push(dispatcher.dispatch_custom(
                "custom",
                Box::new(move |_, _| tx.send(i).unwrap()),
                Priority::Normal,
                None,
            ));
        }
        assert!(ids.iter().all(|id| *id != 0));
        assert_eq!(
            dispatcher.dispatch_custom("custom", Box::new(|_, _| {}), Priority::Normal, None),
            0
        );
        assert_eq!(dispatcher.stats().dropped, 1);

        release.send(()).unwrap();
        let ran: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(ran, vec![0, 1, 2]);
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn dispatch_calls_registered_handler() {
        let (_script, registry, dispatcher) = setup(DispatcherConfig::default());
        registry.register(
            OpTag::Getattr,
            Arc::new(|_: &mut ScriptEnv, args: Vec<Value>| -> HandlerResult {
                Ok(Completion::Value(args.into_iter().next().unwrap_or_default()))
            }),
        );
        dispatcher.start().unwrap();
        let (tx, rx) = bounded(1);
        dispatcher.dispatch(
            "getattr",
            vec![Value::from(5u64)],
            Priority::Normal,
            Some(Box::new(move |_, result| {
                let value = match result {
                    Ok(Completion::Value(v)) => v,
                    _ => Value::Null,
                };
                tx.send(value).unwrap();
            })),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Value::from(5u64)
        );
        dispatcher.shutdown(Duration::from_secs(1));
        assert_eq!(dispatcher.stats().processed, 1);
    }

    #[test]
    fn handler_removed_before_delivery_is_not_invoked() {
        let (_script, registry, dispatcher) = setup(DispatcherConfig::default());
        registry.register(
            OpTag::Read,
            Arc::new(|_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
                Ok(Completion::Value(Value::Null))
            }),
        );
        dispatcher.start().unwrap();
        let release = block_script(&dispatcher);
        let (tx, rx) = bounded(1);
        dispatcher.dispatch_custom(
            "read",
            Box::new(move |_, handler| tx.send(handler.is_some()).unwrap()),
            Priority::Normal,
            None,
        );
        registry.remove(OpTag::Read);
        release.send(()).unwrap();
        assert!(!rx.recv_timeout(Duration::from_secs(2)).unwrap());
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn handler_replaced_before_delivery_is_not_invoked() {
        let (_script, registry, dispatcher) = setup(DispatcherConfig::default());
        let (calls_tx, calls_rx) = unbounded();
        let old_calls = calls_tx.clone();
        registry.register(
            OpTag::Write,
            Arc::new(move |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
                old_calls.send("old").unwrap();
                Ok(Completion::Value(Value::Null))
            }),
        );
        dispatcher.start().unwrap();
        let release = block_script(&dispatcher);
        let (tx, rx) = bounded(1);
        dispatcher.dispatch(
            "write",
            Vec::new(),
            Priority::Normal,
            Some(Box::new(move |_, result| {
                let code = result.err().map(|reason| errno::extract(&reason));
                tx.send(code).unwrap();
            })),
        );
        registry.remove(OpTag::Write);
        registry.register(
            OpTag::Write,
            Arc::new(move |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
                calls_tx.send("new").unwrap();
                Ok(Completion::Value(Value::Null))
            }),
        );
        release.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Some(libc::ENOSYS));
        assert!(calls_rx.try_recv().is_err());
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn dispatch_races_registry_churn_and_shutdown() {
        let (_script, registry, dispatcher) = setup(DispatcherConfig {
            max_queue_size: 100_000,
            ..Default::default()
        });
        dispatcher.start().unwrap();
        let churn = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..500 {
                    registry.register(
                        OpTag::Read,
                        Arc::new(|_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
                            Ok(Completion::Value(Value::Null))
                        }),
                    );
                    registry.remove(OpTag::Read);
                }
            })
        };
        let senders: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    (0..200)
                        .filter(|_| {
                            dispatcher.dispatch("read", Vec::new(), Priority::Normal, None) != 0
                        })
                        .count()
                })
            })
            .collect();
        churn.join().unwrap();
        let accepted: usize = senders.into_iter().map(|t| t.join().unwrap()).sum();
        assert!(dispatcher.shutdown(Duration::from_secs(5)));
        let stats = dispatcher.stats();
        assert_eq!(stats.dispatched as usize, accepted);
        assert_eq!(stats.processed + stats.cancelled, stats.dispatched);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn shutdown_cancels_queued_jobs_exactly_once() {
        let (_script, _registry, dispatcher) = setup(DispatcherConfig::default());
        dispatcher.start().unwrap();
        let release = block_script(&dispatcher);
        let (tx, rx) = unbounded();
        for _ in 0..5 {
            let tx = tx.clone();
            dispatcher.dispatch_custom(
                "custom",
                Box::new(|_, _| {}),
                Priority::Normal,
                Some(Box::new(move |code| tx.send(code).unwrap())),
            );
        }
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release.send(()).unwrap();
        });
        assert!(dispatcher.shutdown(Duration::from_secs(2)));
        releaser.join().unwrap();
        let codes: Vec<_> = rx.try_iter().collect();
        assert_eq!(codes, vec![-libc::ECANCELED; 5]);
        assert_eq!(dispatcher.state(), DispatcherState::Shutdown);
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(
            dispatcher.dispatch_custom("custom", Box::new(|_, _| {}), Priority::Normal, None),
            0
        );
    }

    #[test]
    fn failed_delivery_reports_eio() {
        let (mut script, _registry, dispatcher) = setup(DispatcherConfig::default());
        script.stop();
        dispatcher.start().unwrap();
        let (tx, rx) = bounded(1);
        dispatcher.dispatch_custom(
            "custom",
            Box::new(|_, _| {}),
            Priority::Normal,
            Some(Box::new(move |code| tx.send(code).unwrap())),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), -libc::EIO);
        dispatcher.shutdown(Duration::from_secs(1));
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[test]
    fn reset_stats_clears_counters() {
        let (_script, _registry, dispatcher) = setup(DispatcherConfig::default());
        dispatcher.start().unwrap();
        let (tx, rx) = bounded(1);
        dispatcher.dispatch_custom(
            "custom",
            Box::new(move |_, _| tx.send(()).unwrap()),
            Priority::Normal,
            None,
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(dispatcher.stats().dispatched, 1);
        dispatcher.reset_stats();
        assert_eq!(dispatcher.stats().dispatched, 0);
        dispatcher.shutdown(Duration::from_secs(1));
    }
}
