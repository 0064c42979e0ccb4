// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered shutdown: RUNNING → DRAINING → UNMOUNTING → CLOSED
//!
//! Transitions are one-way. A graceful shutdown lets accepted dispatcher
//! work finish, drains the write queues, then signals every session, stops the dispatcher and the write queues,
//! and waits for the sessions' receive loops to exit. A forced shutdown
//! cancels everything and jumps straight to CLOSED.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::dispatcher::Dispatcher;
use crate::write_queue::WriteQueueManager;

/// Upper bound for a single poll sleep.
const POLL_SLICE: Duration = Duration::from_millis(100);
const DISPATCHER_BUDGET: Duration = Duration::from_secs(5);
const WRITE_QUEUE_BUDGET: Duration = Duration::from_secs(3);
const FORCE_DISPATCHER_BUDGET: Duration = Duration::from_millis(100);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    Unmounting = 2,
    Closed = 3,
}

impl ShutdownState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            2 => ShutdownState::Unmounting,
            _ => ShutdownState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownState::Running => "RUNNING",
            ShutdownState::Draining => "DRAINING",
            ShutdownState::Unmounting => "UNMOUNTING",
            ShutdownState::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mounted session as seen by the shutdown sequence.
#[cfg_attr(test, mockall::automock)]
pub trait ManagedSession: Send + Sync {
    fn session_id(&self) -> u64;

    /// Asks the session's receive loop to stop; must not block on it.
    fn signal_exit(&self);

    fn has_exited(&self) -> bool;
}

#[cfg_attr(test, mockall::automock)]
pub trait ShutdownObserver: Send + Sync {
    fn on_begin(&self, _reason: &str) {}
    fn on_phase(&self, _phase: ShutdownState) {}
    fn on_complete(&self, _stats: &ShutdownStats) {}
    fn on_failed(&self, _state: ShutdownState, _reason: &str) {}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownTimeouts {
    #[serde(alias = "draining")]
    pub draining_ms: u64,
    #[serde(alias = "unmounting")]
    pub unmounting_ms: u64,
    /// Total budget used by the SIGINT/SIGTERM handler.
    pub signal_timeout_ms: u64,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            draining_ms: 5_000,
            unmounting_ms: 8_000,
            signal_timeout_ms: 15_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub phase: ShutdownState,
    pub duration_ms: u64,
    /// The phase's completion check held before its timeout.
    pub completed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownStats {
    pub reason: String,
    /// Every state the machine passed through, in order.
    pub states: Vec<ShutdownState>,
    pub phases: Vec<PhaseStats>,
    pub total_duration_ms: u64,
    pub final_state: ShutdownState,
    pub graceful: bool,
    pub failure_reason: Option<String>,
    pub forced: bool,
}

impl ShutdownStats {
    fn begin(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            states: vec![ShutdownState::Running],
            phases: Vec::new(),
            total_duration_ms: 0,
            final_state: ShutdownState::Running,
            graceful: true,
            failure_reason: None,
            forced: false,
        }
    }

    fn fail(&mut self, reason: String) {
        self.graceful = false;
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason);
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("shutdown already in progress ({0})")]
    InProgress(ShutdownState),
    #[error("signal handlers already installed")]
    SignalHandlersInstalled,
    #[error("failed to install signal handler: {0}")]
    SignalHandler(String),
}

type PhaseHook = Arc<dyn Fn() + Send + Sync>;

pub struct ShutdownManager {
    state: AtomicU8,
    timeouts: Mutex<ShutdownTimeouts>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    write_queues: Mutex<Option<Arc<WriteQueueManager>>>,
    bridge: Mutex<Option<Arc<Bridge>>>,
    sessions: Mutex<Vec<Weak<dyn ManagedSession>>>,
    observers: Mutex<Vec<Weak<dyn ShutdownObserver>>>,
    hooks: Mutex<HashMap<ShutdownState, Vec<PhaseHook>>>,
    stats: Mutex<Option<ShutdownStats>>,
    closed: Mutex<bool>,
    closed_cond: Condvar,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(ShutdownTimeouts::default())
    }
}

impl ShutdownManager {
    pub fn new(timeouts: ShutdownTimeouts) -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            timeouts: Mutex::new(timeouts),
            dispatcher: Mutex::new(None),
            write_queues: Mutex::new(None),
            bridge: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            hooks: Mutex::new(HashMap::new()),
            stats: Mutex::new(None),
            closed: Mutex::new(false),
            closed_cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> Option<ShutdownStats> {
        self.stats.lock().clone()
    }

    pub fn timeouts(&self) -> ShutdownTimeouts {
        self.timeouts.lock().clone()
    }

    pub fn configure_timeouts(&self, timeouts: ShutdownTimeouts) {
        *self.timeouts.lock() = timeouts;
    }

    pub fn set_dispatcher(&self, dispatcher: Option<Arc<Dispatcher>>) {
        *self.dispatcher.lock() = dispatcher;
    }

    pub fn set_write_queues(&self, write_queues: Option<Arc<WriteQueueManager>>) {
        *self.write_queues.lock() = write_queues;
    }

    pub fn set_bridge(&self, bridge: Option<Arc<Bridge>>) {
        *self.bridge.lock() = bridge;
    }

    pub fn register_session(&self, session: &Arc<dyn ManagedSession>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }

    pub fn unregister_session(&self, id: u64) {
        self.sessions
            .lock()
            .retain(|s| s.upgrade().is_some_and(|s| s.session_id() != id));
    }

    pub fn add_observer(&self, observer: &Arc<dyn ShutdownObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    /// Runs `hook` when `phase` begins, after the built-in cleanup.
    pub fn add_phase_hook(&self, phase: ShutdownState, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().entry(phase).or_default().push(Arc::new(hook));
    }

    fn live_sessions(&self) -> Vec<Arc<dyn ManagedSession>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    fn live_observers(&self) -> Vec<Arc<dyn ShutdownObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn run_hooks(&self, phase: ShutdownState) {
        let hooks = self.hooks.lock().get(&phase).cloned().unwrap_or_default();
        for hook in hooks {
            hook();
        }
    }

    /// Moves forward to `next`; never moves backwards.
    fn advance(&self, next: ShutdownState, stats: &mut ShutdownStats) -> bool {
        let previous = self.state.fetch_max(next as u8, Ordering::AcqRel);
        if previous >= next as u8 {
            return false;
        }
        stats.states.push(next);
        debug!(state = %next, "shutdown state changed");
        for observer in self.live_observers() {
            observer.on_phase(next);
        }
        true
    }

    /// Sleeps in short slices until `done` holds or `deadline` passes.
    fn poll_until(&self, deadline: Instant, done: impl Fn() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            if self.state() == ShutdownState::Closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return done();
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    /// Records `stats` unless another path already finished; the first
    /// record wins and is what every caller gets back.
    fn finish(&self, mut stats: ShutdownStats, started: Instant) -> ShutdownStats {
        stats.total_duration_ms = started.elapsed().as_millis() as u64;
        stats.final_state = self.state();
        {
            let mut recorded = self.stats.lock();
            if let Some(first) = recorded.as_ref() {
                debug!(reason = %stats.reason, "shutdown already finished");
                return first.clone();
            }
            *recorded = Some(stats.clone());
        }
        {
            let mut closed = self.closed.lock();
            *closed = true;
            self.closed_cond.notify_all();
        }
        let failed_in = stats.phases.last().map(|p| p.phase).unwrap_or(stats.final_state);
        for observer in self.live_observers() {
            if let Some(reason) = stats.failure_reason.as_deref() {
                observer.on_failed(failed_in, reason);
            }
            observer.on_complete(&stats);
        }
        stats
    }

    /// Runs the graceful sequence within `total_timeout`.
    ///
    /// Phase timeouts are capped by what is left of the total. A phase
    /// whose completion check times out still advances; the result is then marked
    /// non-graceful.
    pub fn initiate(
        &self,
        reason: &str,
        total_timeout: Duration,
    ) -> Result<ShutdownStats, ShutdownError> {
        if let Err(current) = self.state.compare_exchange(
            ShutdownState::Running as u8,
            ShutdownState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(ShutdownError::InProgress(ShutdownState::from_u8(current)));
        }

        let started = Instant::now();
        let deadline = started + total_timeout;
        let timeouts = self.timeouts();
        let mut stats = ShutdownStats::begin(reason);
        info!(reason, timeout_ms = total_timeout.as_millis() as u64, "graceful shutdown started");

        for observer in self.live_observers() {
            observer.on_begin(reason);
        }
        stats.states.push(ShutdownState::Draining);
        for observer in self.live_observers() {
            observer.on_phase(ShutdownState::Draining);
        }

        // DRAINING
        let phase_start = Instant::now();
        let phase_deadline = deadline.min(phase_start + Duration::from_millis(timeouts.draining_ms));
        // Accepted dispatcher work gets up to half the phase; whatever is
        // still queued afterwards is cancelled while unmounting.
        let dispatcher = self.dispatcher.lock().clone();
        if let Some(dispatcher) = dispatcher {
            let settle_deadline =
                phase_start + phase_deadline.saturating_duration_since(phase_start) / 2;
            if !self.poll_until(settle_deadline, || dispatcher.pending_count() == 0) {
                info!(
                    pending = dispatcher.pending_count(),
                    "dispatcher work left for cancellation"
                );
            }
        }
        let write_queues = self.write_queues.lock().clone();
        if let Some(queues) = &write_queues {
            queues.flush_all(phase_deadline.saturating_duration_since(Instant::now()));
        }
        self.run_hooks(ShutdownState::Draining);
        let drained = self.poll_until(phase_deadline, || {
            write_queues
                .as_ref()
                .map_or(true, |q| q.total_queue_size() == 0)
        });
        stats.phases.push(PhaseStats {
            phase: ShutdownState::Draining,
            duration_ms: phase_start.elapsed().as_millis() as u64,
            completed: drained,
        });
        if !drained {
            warn!("write queues did not drain in time");
            stats.fail("draining timed out".to_string());
        }

        // UNMOUNTING
        if !self.advance(ShutdownState::Unmounting, &mut stats) {
            stats.fail("shutdown was forced".to_string());
            return Ok(self.finish(stats, started));
        }
        let phase_start = Instant::now();
        let phase_deadline =
            deadline.min(phase_start + Duration::from_millis(timeouts.unmounting_ms));
        let bridge = self.bridge.lock().clone();
        if let Some(bridge) = bridge {
            bridge.stop_accepting();
        }
        let sessions = self.live_sessions();
        for session in &sessions {
            debug!(session = session.session_id(), "signalling session exit");
            session.signal_exit();
        }
        let dispatcher = self.dispatcher.lock().clone();
        if let Some(dispatcher) = dispatcher {
            let budget = DISPATCHER_BUDGET.min(phase_deadline.saturating_duration_since(Instant::now()));
            if !dispatcher.shutdown(budget) {
                stats.fail("dispatcher did not stop in time".to_string());
            }
        }
        if let Some(queues) = &write_queues {
            let budget = WRITE_QUEUE_BUDGET.min(phase_deadline.saturating_duration_since(Instant::now()));
            if !queues.shutdown(budget) {
                stats.fail("write queues did not stop in time".to_string());
            }
        }
        self.run_hooks(ShutdownState::Unmounting);
        let exited = self.poll_until(phase_deadline, || sessions.iter().all(|s| s.has_exited()));
        stats.phases.push(PhaseStats {
            phase: ShutdownState::Unmounting,
            duration_ms: phase_start.elapsed().as_millis() as u64,
            completed: exited,
        });
        if !exited {
            warn!("sessions did not exit in time");
            stats.fail("unmounting timed out".to_string());
        }

        // CLOSED
        if !self.advance(ShutdownState::Closed, &mut stats) {
            stats.fail("shutdown was forced".to_string());
        }
        self.run_hooks(ShutdownState::Closed);
        let stats = self.finish(stats, started);
        info!(
            graceful = stats.graceful,
            total_ms = stats.total_duration_ms,
            "shutdown complete"
        );
        Ok(stats)
    }

    /// Cancels all outstanding work and closes immediately.
    pub fn force(&self, reason: &str) -> ShutdownStats {
        let started = Instant::now();
        let previous = ShutdownState::from_u8(
            self.state.swap(ShutdownState::Closed as u8, Ordering::AcqRel),
        );
        if previous == ShutdownState::Closed {
            if let Some(stats) = self.stats() {
                return stats;
            }
        }
        warn!(reason, from = %previous, "forced shutdown");

        let mut stats = ShutdownStats::begin(reason);
        stats.states = vec![previous];
        stats.forced = true;
        stats.fail(format!("forced: {reason}"));
        for observer in self.live_observers() {
            observer.on_begin(reason);
        }


        let bridge = self.bridge.lock().clone();
        if let Some(bridge) = bridge {
            bridge.stop_accepting();
        }
        for session in self.live_sessions() {
            session.signal_exit();
        }
        let queues = self.write_queues.lock().clone();
        if let Some(queues) = queues {
            let cancelled = queues.cancel_all(-libc::ECANCELED);
            debug!(cancelled, "write jobs cancelled");
        }
        let dispatcher = self.dispatcher.lock().clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown(FORCE_DISPATCHER_BUDGET);
        }

        stats.states.push(ShutdownState::Closed);
        for observer in self.live_observers() {
            observer.on_phase(ShutdownState::Closed);
        }
        self.run_hooks(ShutdownState::Closed);
        self.finish(stats, started)
    }

    /// Blocks until the machine reached CLOSED or `timeout` elapsed.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut closed = self.closed.lock();
        while !*closed {
            if self.closed_cond.wait_until(&mut closed, deadline).timed_out() {
                return *closed;
            }
        }
        true
    }
}

static SIGNAL_TARGET: Lazy<Mutex<Option<Weak<ShutdownManager>>>> = Lazy::new(|| Mutex::new(None));

/// Routes SIGINT and SIGTERM to `manager.initiate("signal", ...)`.
///
/// The process-wide handler is installed once; later calls only retarget
/// it to a new manager.
pub fn install_signal_handlers(manager: &Arc<ShutdownManager>) -> Result<(), ShutdownError> {
    let mut target = SIGNAL_TARGET.lock();
    let first = target.is_none();
    *target = Some(Arc::downgrade(manager));
    drop(target);
    if !first {
        return Ok(());
    }
    ctrlc::set_handler(|| {
        let manager = SIGNAL_TARGET.lock().as_ref().and_then(Weak::upgrade);
        let Some(manager) = manager else {
            return;
        };
        let timeout = Duration::from_millis(manager.timeouts().signal_timeout_ms);
        match manager.initiate("signal", timeout) {
            Ok(stats) => info!(graceful = stats.graceful, "signal shutdown finished"),
            Err(err) => debug!(error = %err, "signal ignored"),
        }
    })
    .map_err(|err| match err {
        ctrlc::Error::MultipleHandlers => ShutdownError::SignalHandlersInstalled,
        other => ShutdownError::SignalHandler(other.to_string()),
    })
}
