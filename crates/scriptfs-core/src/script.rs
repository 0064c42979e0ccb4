// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The single cooperative script thread
//!
//! All handler invocations happen on one dedicated thread. Other threads
//! reach it through a [`ScriptHandle`], which queues thunks in arrival
//! order. Handlers may answer later through a deferred [`Promise`]; its
//! [`Resolver`] can be settled from any thread, while the continuations
//! registered with [`ScriptEnv::then`] always run back on the script thread.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::errno;
use crate::value::Value;

/// What a handler hands back: an immediate value or a deferred one.
pub enum Completion {
    Value(Value),
    Deferred(Promise),
}

/// `Err` carries the rejection reason.
pub type HandlerResult = Result<Completion, Value>;

pub type Thunk = Box<dyn FnOnce(&mut ScriptEnv) + Send + 'static>;

/// Settled promises nobody has observed yet are kept for at most this many
/// later settlements; older ones are dropped.
pub const SETTLED_RETENTION: usize = 256;

type Reaction = Box<dyn FnOnce(&mut ScriptEnv, Result<Value, Value>)>;
type Microtask = Box<dyn FnOnce(&mut ScriptEnv)>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    #[error("script thread has stopped")]
    Closed,
    #[error("timed out waiting for the script thread")]
    Timeout,
    #[error("script thunk panicked")]
    Panicked,
    #[error("blocking call issued from the script thread")]
    Reentrant,
}

enum Envelope {
    Call {
        thunk: Thunk,
        delivered: Option<Sender<bool>>,
    },
    Settle {
        id: u64,
        outcome: Result<Value, Value>,
    },
    Stop,
}

/// Thread-safe entry point to the script thread.
#[derive(Clone)]
pub struct ScriptHandle {
    tx: Sender<Envelope>,
    thread: ThreadId,
}

impl ScriptHandle {
    pub fn is_script_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queues `thunk` and waits until it has run.
    pub fn call_blocking<F>(&self, thunk: F) -> Result<(), CallError>
    where
        F: FnOnce(&mut ScriptEnv) + Send + 'static,
    {
        let ack = self.submit(Box::new(thunk))?;
        match ack.recv() {
            Ok(true) => Ok(()),
            Ok(false) => Err(CallError::Panicked),
            Err(_) => Err(CallError::Closed),
        }
    }

    /// Like [`call_blocking`](Self::call_blocking) but gives up after
    /// `timeout`. The thunk may still run later.
    pub fn call_blocking_timeout<F>(&self, thunk: F, timeout: Duration) -> Result<(), CallError>
    where
        F: FnOnce(&mut ScriptEnv) + Send + 'static,
    {
        let ack = self.submit(Box::new(thunk))?;
        match ack.recv_timeout(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CallError::Panicked),
            Err(RecvTimeoutError::Timeout) => Err(CallError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CallError::Closed),
        }
    }

    /// Queues `thunk` without waiting.
    pub fn call<F>(&self, thunk: F) -> Result<(), CallError>
    where
        F: FnOnce(&mut ScriptEnv) + Send + 'static,
    {
        self.tx
            .send(Envelope::Call {
                thunk: Box::new(thunk),
                delivered: None,
            })
            .map_err(|_| CallError::Closed)
    }

    /// Runs `f` on the script thread and returns its result.
    pub fn run<R, F>(&self, f: F) -> Result<R, CallError>
    where
        R: Send + 'static,
        F: FnOnce(&mut ScriptEnv) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.call_blocking(move |env| {
            let _ = tx.send(f(env));
        })?;
        rx.try_recv().map_err(|_| CallError::Closed)
    }

    fn submit(&self, thunk: Thunk) -> Result<Receiver<bool>, CallError> {
        if self.is_script_thread() {
            return Err(CallError::Reentrant);
        }
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(Envelope::Call {
                thunk,
                delivered: Some(ack_tx),
            })
            .map_err(|_| CallError::Closed)?;
        Ok(ack_rx)
    }
}

/// Owner of the script thread; stops and joins it on drop.
pub struct ScriptThread {
    handle: ScriptHandle,
    join: Option<JoinHandle<()>>,
}

impl ScriptThread {
    pub fn spawn(name: &str) -> std::io::Result<ScriptThread> {
        let (tx, rx) = unbounded();
        let env_tx = tx.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(rx, env_tx))?;
        let handle = ScriptHandle {
            tx,
            thread: join.thread().id(),
        };
        debug!(thread = name, "script thread started");
        Ok(ScriptThread {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ScriptHandle {
        self.handle.clone()
    }

    /// Lets queued work finish, then stops the thread.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.handle.tx.send(Envelope::Stop);
        if self.handle.is_script_thread() {
            warn!("script thread asked to stop itself; not joining");
            return;
        }
        if join.join().is_err() {
            error!("script thread terminated abnormally");
        }
    }
}

impl Drop for ScriptThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(rx: Receiver<Envelope>, tx: Sender<Envelope>) {
    let handle = ScriptHandle {
        tx,
        thread: thread::current().id(),
    };
    let mut env = ScriptEnv::new(handle);
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Call { thunk, delivered } => {
                let ran = panic::catch_unwind(AssertUnwindSafe(|| thunk(&mut env))).is_ok();
                if !ran {
                    error!("script thunk panicked");
                }
                env.run_microtasks();
                if let Some(ack) = delivered {
                    let _ = ack.send(ran);
                }
            }
            Envelope::Settle { id, outcome } => {
                env.settle(id, outcome);
                env.run_microtasks();
            }
            Envelope::Stop => break,
        }
    }
    let abandoned = env.pending_promises();
    if abandoned > 0 {
        debug!(abandoned, "script thread stopped with unsettled promises");
    }
}

/// Script-local handle to a deferred value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Promise {
    id: u64,
    _local: PhantomData<*const ()>,
}

impl Promise {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Settles a [`Promise`] from any thread. Dropping an unsettled resolver
/// rejects the promise with `EIO`.
pub struct Resolver {
    id: u64,
    tx: Sender<Envelope>,
    settled: bool,
}

impl Resolver {
    pub fn resolve(mut self, value: Value) {
        self.send(Ok(value));
    }

    pub fn reject(mut self, reason: Value) {
        self.send(Err(reason));
    }

    fn send(&mut self, outcome: Result<Value, Value>) {
        self.settled = true;
        if self
            .tx
            .send(Envelope::Settle {
                id: self.id,
                outcome,
            })
            .is_err()
        {
            debug!(promise = self.id, "script thread gone; settlement dropped");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if !self.settled {
            self.send(Err(errno::error_record(libc::EIO)));
        }
    }
}

enum Slot {
    Pending(Vec<Reaction>),
    Settled(Result<Value, Value>),
}

/// State owned by the script thread and lent to every thunk.
pub struct ScriptEnv {
    handle: ScriptHandle,
    promises: HashMap<u64, Slot>,
    unobserved: VecDeque<u64>,
    microtasks: VecDeque<Microtask>,
    next_promise: u64,
}

impl ScriptEnv {
    fn new(handle: ScriptHandle) -> Self {
        Self {
            handle,
            promises: HashMap::new(),
            unobserved: VecDeque::new(),
            microtasks: VecDeque::new(),
            next_promise: 1,
        }
    }

    pub fn handle(&self) -> ScriptHandle {
        self.handle.clone()
    }

    fn allocate(&mut self, slot: Slot) -> Promise {
        let id = self.next_promise;
        self.next_promise += 1;
        let settled = matches!(slot, Slot::Settled(_));
        self.promises.insert(id, slot);
        if settled {
            self.retain_settled(id);
        }
        Promise {
            id,
            _local: PhantomData,
        }
    }

    /// A pending promise and the resolver that settles it.
    pub fn deferred(&mut self) -> (Promise, Resolver) {
        let promise = self.allocate(Slot::Pending(Vec::new()));
        let resolver = Resolver {
            id: promise.id,
            tx: self.handle.tx.clone(),
            settled: false,
        };
        (promise, resolver)
    }

    pub fn resolved(&mut self, value: Value) -> Promise {
        self.allocate(Slot::Settled(Ok(value)))
    }

    pub fn rejected(&mut self, reason: Value) -> Promise {
        self.allocate(Slot::Settled(Err(reason)))
    }

    /// Registers continuations for `promise`. They run as microtasks on
    /// this thread once the promise settles. A promise can be observed once;
    /// observing it again rejects with `EIO`.
    pub fn then<R, J>(&mut self, promise: Promise, on_resolve: R, on_reject: J)
    where
        R: FnOnce(&mut ScriptEnv, Value) + 'static,
        J: FnOnce(&mut ScriptEnv, Value) + 'static,
    {
        let reaction: Reaction = Box::new(move |env, outcome| match outcome {
            Ok(value) => on_resolve(env, value),
            Err(reason) => on_reject(env, reason),
        });
        match self.promises.remove(&promise.id) {
            Some(Slot::Pending(mut reactions)) => {
                reactions.push(reaction);
                self.promises.insert(promise.id, Slot::Pending(reactions));
            }
            Some(Slot::Settled(outcome)) => {
                self.queue_microtask(move |env| reaction(env, outcome));
            }
            None => {
                warn!(promise = promise.id, "promise observed after settlement");
                let reason = errno::error_record(libc::EIO);
                self.queue_microtask(move |env| reaction(env, Err(reason)));
            }
        }
    }

    pub fn queue_microtask(&mut self, task: impl FnOnce(&mut ScriptEnv) + 'static) {
        self.microtasks.push_back(Box::new(task));
    }

    /// Promises that are pending or settled but not yet observed.
    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    fn settle(&mut self, id: u64, outcome: Result<Value, Value>) {
        match self.promises.remove(&id) {
            Some(Slot::Pending(reactions)) if reactions.is_empty() => {
                self.promises.insert(id, Slot::Settled(outcome));
                self.retain_settled(id);
            }
            Some(Slot::Pending(reactions)) => {
                for reaction in reactions {
                    let outcome = outcome.clone();
                    self.queue_microtask(move |env| reaction(env, outcome));
                }
            }
            Some(settled @ Slot::Settled(_)) => {
                debug!(promise = id, "ignoring second settlement");
                self.promises.insert(id, settled);
            }
            None => debug!(promise = id, "settlement for unknown promise"),
        }
    }

    fn retain_settled(&mut self, id: u64) {
        self.unobserved.push_back(id);
        while self.unobserved.len() > SETTLED_RETENTION {
            let Some(oldest) = self.unobserved.pop_front() else {
                break;
            };
            if matches!(self.promises.get(&oldest), Some(Slot::Settled(_))) {
                self.promises.remove(&oldest);
                debug!(promise = oldest, "dropping unobserved settled promise");
            }
        }
    }

    fn run_microtasks(&mut self) {
        while let Some(task) = self.microtasks.pop_front() {
            if panic::catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                error!("script continuation panicked");
            }
        }
    }
}
