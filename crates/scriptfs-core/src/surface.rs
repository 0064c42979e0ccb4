// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-wide runtime
//!
//! Owns the script thread, handler registry, bridge, write queues,
//! sessions, dispatcher and shutdown manager. Everything is created by
//! [`Runtime::initialize`] and torn down by [`Runtime::shutdown`], so tests
//! can start from a clean slate. [`Runtime::global`] is the instance the
//! host binary uses.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
use crate::error::{BridgeError, BridgeResult};
use crate::errno;
use crate::op::OpTag;
use crate::registry::{Handler, HandlerRegistry};
use crate::script::{ScriptHandle, ScriptThread};
use crate::session::{Mounter, SessionHandle, SessionManager, SessionOptions};
use crate::shutdown::{
    install_signal_handlers, ManagedSession, ShutdownManager, ShutdownState, ShutdownStats,
    ShutdownTimeouts,
};
use crate::value::Value;
use crate::write_queue::{
    WriteExecutor, WriteJob, WritePayload, WritePriority, WriteQueueConfig, WriteQueueManager,
    WriteQueueStats, WriteQueueSummary,
};
use crate::xattr::{self, XattrData};

const DEFAULT_DISPATCHER_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result callback for [`Runtime::enqueue_write`]; runs on the script thread
/// with the byte count or a negative errno.
pub type WriteCallback = Box<dyn FnOnce(Result<usize, i32>) + Send + 'static>;

struct Components {
    script: Mutex<Option<ScriptThread>>,
    script_handle: ScriptHandle,
    registry: Arc<HandlerRegistry>,
    bridge: Arc<Bridge>,
    write_queues: Arc<WriteQueueManager>,
    sessions: SessionManager,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    shutdown: Mutex<Option<Arc<ShutdownManager>>>,
    config: Mutex<BridgeConfig>,
}

impl Components {
    fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.lock().clone()
    }

    fn shutdown_manager(&self) -> Option<Arc<ShutdownManager>> {
        self.shutdown.lock().clone()
    }
}

#[derive(Default)]
pub struct Runtime {
    components: Mutex<Option<Arc<Components>>>,
}

static GLOBAL: Lazy<Runtime> = Lazy::new(Runtime::new);

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Runtime {
        &GLOBAL
    }

    fn components(&self) -> BridgeResult<Arc<Components>> {
        self.components
            .lock()
            .clone()
            .ok_or(BridgeError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.components.lock().is_some()
    }

    /// Starts the script thread and builds every component except the
    /// dispatcher and the shutdown manager, which have their own entry
    /// points.
    pub fn initialize(&self, config: BridgeConfig, mounter: Arc<dyn Mounter>) -> BridgeResult<()> {
        let mut slot = self.components.lock();
        if slot.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }
        let script = ScriptThread::spawn("scriptfs-script")?;
        let registry = Arc::new(HandlerRegistry::new());
        let bridge = Bridge::new(Arc::clone(&registry), config.cache.timeouts());
        let write_queues = Arc::new(WriteQueueManager::new(config.write_queue.clone()));
        *slot = Some(Arc::new(Components {
            script_handle: script.handle(),
            script: Mutex::new(Some(script)),
            registry,
            bridge,
            write_queues,
            sessions: SessionManager::new(mounter),
            dispatcher: Mutex::new(None),
            shutdown: Mutex::new(None),
            config: Mutex::new(config),
        }));
        info!("runtime initialized");
        Ok(())
    }

    /// Tears everything down without running the shutdown state machine.
    pub fn shutdown(&self) -> BridgeResult<()> {
        let components = self
            .components
            .lock()
            .take()
            .ok_or(BridgeError::NotInitialized)?;
        components.bridge.stop_accepting();
        components.sessions.destroy_all();
        let dispatcher = components.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown(TEARDOWN_TIMEOUT);
        }
        components.bridge.set_dispatcher(None);
        components.write_queues.shutdown(TEARDOWN_TIMEOUT);
        components.shutdown.lock().take();
        components.registry.clear();
        let script = components.script.lock().take();
        if let Some(mut script) = script {
            script.stop();
        }
        info!("runtime shut down");
        Ok(())
    }

    pub fn bridge(&self) -> BridgeResult<Arc<Bridge>> {
        Ok(Arc::clone(&self.components()?.bridge))
    }

    pub fn script(&self) -> BridgeResult<ScriptHandle> {
        Ok(self.components()?.script_handle.clone())
    }

    pub fn config(&self) -> BridgeResult<BridgeConfig> {
        Ok(self.components()?.config.lock().clone())
    }

    // Sessions

    pub fn create_session(
        &self,
        mountpoint: impl AsRef<Path>,
        options: SessionOptions,
    ) -> BridgeResult<SessionHandle> {
        let c = self.components()?;
        let handle = c.sessions.create(
            mountpoint.as_ref(),
            options,
            Arc::clone(&c.bridge),
        )?;
        if let (Some(manager), Some(session)) = (c.shutdown_manager(), c.sessions.get(handle.id)) {
            let session: Arc<dyn ManagedSession> = session;
            manager.register_session(&session);
        }
        Ok(handle)
    }

    pub fn mount(&self, handle: &SessionHandle) -> BridgeResult<bool> {
        Ok(self.components()?.sessions.mount(handle)?)
    }

    pub fn unmount(&self, handle: &SessionHandle) -> BridgeResult<bool> {
        Ok(self.components()?.sessions.unmount(handle)?)
    }

    pub fn destroy_session(&self, handle: &SessionHandle) -> BridgeResult<bool> {
        let c = self.components()?;
        if let Some(manager) = c.shutdown_manager() {
            manager.unregister_session(handle.id);
        }
        Ok(c.sessions.destroy(handle)?)
    }

    pub fn is_ready(&self, handle: &SessionHandle) -> bool {
        self.components()
            .map(|c| c.sessions.is_ready(handle))
            .unwrap_or(false)
    }

    // Handlers

    /// Registers `handler` for the operation called `name`.
    pub fn set_operation_handler(
        &self,
        name: &str,
        handler: impl Handler + 'static,
    ) -> BridgeResult<()> {
        let op = OpTag::parse(name);
        if op == OpTag::Unknown {
            return Err(BridgeError::UnknownOperation(name.to_string()));
        }
        let c = self.components()?;
        if c.registry.register(op, Arc::new(handler)).is_some() {
            debug!(op = %op, "handler replaced");
        }
        Ok(())
    }

    pub fn remove_operation_handler(&self, name: &str) -> BridgeResult<bool> {
        let op = OpTag::parse(name);
        if op == OpTag::Unknown {
            return Err(BridgeError::UnknownOperation(name.to_string()));
        }
        Ok(self.components()?.registry.remove(op).is_some())
    }

    // Dispatcher

    /// Starts a dispatcher, replacing one that was shut down. An already
    /// running dispatcher only takes the new configuration.
    pub fn initialize_dispatcher(&self, config: Option<DispatcherConfig>) -> BridgeResult<()> {
        let c = self.components()?;
        let config = {
            let mut stored = c.config.lock();
            if let Some(config) = config {
                stored.dispatcher = config;
            }
            stored.dispatcher.clone()
        };
        if let Some(existing) = c.dispatcher() {
            if existing.is_accepting() {
                existing.set_config(config);
                return Ok(());
            }
        }
        let dispatcher = Dispatcher::new(Arc::clone(&c.registry), c.script_handle.clone(), config);
        dispatcher.start()?;
        *c.dispatcher.lock() = Some(Arc::clone(&dispatcher));
        c.bridge.set_dispatcher(Some(Arc::clone(&dispatcher)));
        if let Some(manager) = c.shutdown_manager() {
            manager.set_dispatcher(Some(dispatcher));
        }
        Ok(())
    }

    pub fn shutdown_dispatcher(&self, timeout: Option<Duration>) -> BridgeResult<bool> {
        let c = self.components()?;
        let Some(dispatcher) = c.dispatcher() else {
            return Ok(true);
        };
        Ok(dispatcher.shutdown(timeout.unwrap_or(DEFAULT_DISPATCHER_TIMEOUT)))
    }

    pub fn get_dispatcher_stats(&self) -> BridgeResult<DispatcherStats> {
        Ok(self
            .components()?
            .dispatcher()
            .map(|d| d.stats())
            .unwrap_or_default())
    }

    pub fn reset_dispatcher_stats(&self) -> BridgeResult<()> {
        if let Some(dispatcher) = self.components()?.dispatcher() {
            dispatcher.reset_stats();
        }
        Ok(())
    }

    pub fn set_dispatcher_config(
        &self,
        update: impl FnOnce(&mut DispatcherConfig),
    ) -> BridgeResult<DispatcherConfig> {
        let c = self.components()?;
        let config = {
            let mut stored = c.config.lock();
            update(&mut stored.dispatcher);
            stored.dispatcher.clone()
        };
        if let Some(dispatcher) = c.dispatcher() {
            dispatcher.set_config(config.clone());
        }
        Ok(config)
    }

    // Write queues

    /// Queues `size` bytes of `buffer` for `fd`. Returns the operation id,
    /// or 0 when the queue refused the job; the callback then receives the
    /// refusal code.
    pub fn enqueue_write(
        &self,
        fd: u64,
        offset: Option<u64>,
        size: usize,
        buffer: WritePayload,
        priority: WritePriority,
        on_complete: Option<WriteCallback>,
    ) -> BridgeResult<u64> {
        let c = self.components()?;
        let mut job = WriteJob::new(fd, offset, buffer)
            .with_size(size)
            .with_priority(priority);
        if let Some(callback) = on_complete {
            let slot = Arc::new(Mutex::new(Some(callback)));
            let on_ok = Arc::clone(&slot);
            let ok_script = c.script_handle.clone();
            let err_script = c.script_handle.clone();
            job = job
                .on_complete(move |written| deliver(&ok_script, &on_ok, Ok(written)))
                .on_error(move |code| deliver(&err_script, &slot, Err(code)));
        }
        Ok(c.write_queues.enqueue(job))
    }

    pub fn process_write_queues(&self, executor: Arc<dyn WriteExecutor>) -> BridgeResult<usize> {
        Ok(self.components()?.write_queues.process_all(executor))
    }

    pub fn flush_write_queue(&self, fd: u64, timeout: Option<Duration>) -> BridgeResult<bool> {
        Ok(self
            .components()?
            .write_queues
            .flush(fd, timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT)))
    }

    pub fn flush_all_write_queues(&self, timeout: Option<Duration>) -> BridgeResult<bool> {
        Ok(self
            .components()?
            .write_queues
            .flush_all(timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT)))
    }

    /// Stats for one descriptor, or for every queue when `fd` is `None`.
    pub fn get_write_queue_stats(&self, fd: Option<u64>) -> BridgeResult<Vec<WriteQueueStats>> {
        let queues = &self.components()?.write_queues;
        Ok(match fd {
            Some(fd) => queues.stats(fd).into_iter().collect(),
            None => queues.all_stats(),
        })
    }

    pub fn get_write_queue_summary(&self) -> BridgeResult<WriteQueueSummary> {
        Ok(self.components()?.write_queues.summary())
    }

    pub fn configure_write_queues(
        &self,
        update: impl FnOnce(&mut WriteQueueConfig),
    ) -> BridgeResult<WriteQueueConfig> {
        let c = self.components()?;
        let config = {
            let mut stored = c.config.lock();
            update(&mut stored.write_queue);
            stored.write_queue.clone()
        };
        c.write_queues.configure(config.clone());
        Ok(config)
    }

    // Shutdown

    /// Creates the shutdown manager, wires it to the running components and
    /// routes SIGINT/SIGTERM to it. Calling it again returns the same manager.
    pub fn initialize_shutdown_manager(&self) -> BridgeResult<Arc<ShutdownManager>> {
        let c = self.components()?;
        if let Some(existing) = c.shutdown_manager() {
            return Ok(existing);
        }
        let timeouts = c.config.lock().shutdown.clone();
        let manager = Arc::new(ShutdownManager::new(timeouts));
        manager.set_bridge(Some(Arc::clone(&c.bridge)));
        manager.set_write_queues(Some(Arc::clone(&c.write_queues)));
        manager.set_dispatcher(c.dispatcher());
        for session in c.sessions.sessions() {
            let session: Arc<dyn ManagedSession> = session;
            manager.register_session(&session);
        }
        if let Err(err) = install_signal_handlers(&manager) {
            warn!(error = %err, "signal handlers not installed");
        }
        *c.shutdown.lock() = Some(Arc::clone(&manager));
        Ok(manager)
    }

    fn require_shutdown_manager(&self) -> BridgeResult<Arc<ShutdownManager>> {
        self.components()?
            .shutdown_manager()
            .ok_or(BridgeError::NotInitialized)
    }

    pub fn initiate_graceful_shutdown(
        &self,
        reason: Option<&str>,
        timeout: Option<Duration>,
    ) -> BridgeResult<ShutdownStats> {
        let manager = self.require_shutdown_manager()?;
        let timeout = timeout
            .unwrap_or_else(|| Duration::from_millis(manager.timeouts().signal_timeout_ms));
        Ok(manager.initiate(reason.unwrap_or("graceful"), timeout)?)
    }

    pub fn force_immediate_shutdown(&self, reason: Option<&str>) -> BridgeResult<ShutdownStats> {
        let manager = self.require_shutdown_manager()?;
        Ok(manager.force(reason.unwrap_or("forced")))
    }

    pub fn get_shutdown_state(&self) -> ShutdownState {
        self.components()
            .ok()
            .and_then(|c| c.shutdown_manager())
            .map_or(ShutdownState::Running, |m| m.state())
    }

    pub fn get_shutdown_stats(&self) -> Option<ShutdownStats> {
        self.components()
            .ok()
            .and_then(|c| c.shutdown_manager())
            .and_then(|m| m.stats())
    }

    pub fn configure_shutdown_timeouts(
        &self,
        update: impl FnOnce(&mut ShutdownTimeouts),
    ) -> BridgeResult<ShutdownTimeouts> {
        let c = self.components()?;
        let timeouts = {
            let mut stored = c.config.lock();
            update(&mut stored.shutdown);
            stored.shutdown.clone()
        };
        if let Some(manager) = c.shutdown_manager() {
            manager.configure_timeouts(timeouts.clone());
        }
        Ok(timeouts)
    }

    // Extended attributes

    pub fn getxattr(&self, path: &Path, name: &str, size: Option<usize>) -> BridgeResult<XattrData> {
        Ok(xattr::getxattr(path, name, size.unwrap_or(0))?)
    }

    pub fn setxattr(&self, path: &Path, name: &str, value: &[u8], flags: i32) -> BridgeResult<()> {
        Ok(xattr::setxattr(path, name, value, flags)?)
    }

    pub fn listxattr(&self, path: &Path, size: Option<usize>) -> BridgeResult<XattrData> {
        Ok(xattr::listxattr(path, size.unwrap_or(0))?)
    }

    pub fn removexattr(&self, path: &Path, name: &str) -> BridgeResult<()> {
        Ok(xattr::removexattr(path, name)?)
    }
}

fn deliver(
    script: &ScriptHandle,
    slot: &Arc<Mutex<Option<WriteCallback>>>,
    result: Result<usize, i32>,
) {
    let Some(callback) = slot.lock().take() else {
        return;
    };
    if script.call(move |_| callback(result)).is_err() {
        warn!("write callback dropped, script thread is gone");
    }
}

/// Converts a serializable stats struct into a script-side record.
pub fn to_record<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value)
        .map(Value::from)
        .unwrap_or_default()
}

/// Constants exported to scripts: negative errnos, file-mode bits, open
/// flags and extended-attribute flags.
pub fn constants() -> Vec<(&'static str, i64)> {
    let mut out: Vec<(&'static str, i64)> = errno::constants()
        .into_iter()
        .map(|(name, code)| (name, i64::from(code)))
        .collect();
    let modes = [
        ("S_IFMT", libc::S_IFMT),
        ("S_IFREG", libc::S_IFREG),
        ("S_IFDIR", libc::S_IFDIR),
        ("S_IFLNK", libc::S_IFLNK),
        ("S_IFCHR", libc::S_IFCHR),
        ("S_IFBLK", libc::S_IFBLK),
        ("S_IFIFO", libc::S_IFIFO),
        ("S_IFSOCK", libc::S_IFSOCK),
        ("S_ISUID", libc::S_ISUID),
        ("S_ISGID", libc::S_ISGID),
        ("S_ISVTX", libc::S_ISVTX),
        ("S_IRWXU", libc::S_IRWXU),
        ("S_IRUSR", libc::S_IRUSR),
        ("S_IWUSR", libc::S_IWUSR),
        ("S_IXUSR", libc::S_IXUSR),
        ("S_IRWXG", libc::S_IRWXG),
        ("S_IRGRP", libc::S_IRGRP),
        ("S_IWGRP", libc::S_IWGRP),
        ("S_IXGRP", libc::S_IXGRP),
        ("S_IRWXO", libc::S_IRWXO),
        ("S_IROTH", libc::S_IROTH),
        ("S_IWOTH", libc::S_IWOTH),
        ("S_IXOTH", libc::S_IXOTH),
    ];
    out.extend(modes.iter().map(|(name, bits)| (*name, i64::from(*bits))));
    let open_flags = [
        ("O_RDONLY", libc::O_RDONLY),
        ("O_WRONLY", libc::O_WRONLY),
        ("O_RDWR", libc::O_RDWR),
        ("O_ACCMODE", libc::O_ACCMODE),
        ("O_CREAT", libc::O_CREAT),
        ("O_EXCL", libc::O_EXCL),
        ("O_NOCTTY", libc::O_NOCTTY),
        ("O_TRUNC", libc::O_TRUNC),
        ("O_APPEND", libc::O_APPEND),
        ("O_NONBLOCK", libc::O_NONBLOCK),
        ("O_DSYNC", libc::O_DSYNC),
        ("O_SYNC", libc::O_SYNC),
        ("O_DIRECTORY", libc::O_DIRECTORY),
        ("O_NOFOLLOW", libc::O_NOFOLLOW),
        ("O_CLOEXEC", libc::O_CLOEXEC),
    ];
    out.extend(open_flags.iter().map(|(name, bits)| (*name, i64::from(*bits))));
    out.push(("XATTR_CREATE", i64::from(xattr::XATTR_CREATE)));
    out.push(("XATTR_REPLACE", i64::from(xattr::XATTR_REPLACE)));
    out
}

/// Looks up one exported constant by name.
pub fn constant(name: &str) -> Option<i64> {
    constants()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RequestArgs, RequestContext};
    use crate::script::{Completion, HandlerResult, ScriptEnv};
    use crate::testing::{MemoryMounter, RecordedReply, RecordingReply};

    fn runtime() -> Runtime {
        let runtime = Runtime::new();
        runtime
            .initialize(BridgeConfig::default(), Arc::new(MemoryMounter::new()))
            .unwrap();
        runtime
    }

    #[test]
    fn uninitialized_runtime_reports_errors() {
        let runtime = Runtime::new();
        assert!(matches!(runtime.bridge(), Err(BridgeError::NotInitialized)));
        assert_eq!(runtime.get_shutdown_state(), ShutdownState::Running);
        assert!(matches!(runtime.shutdown(), Err(BridgeError::NotInitialized)));
    }

    #[test]
    fn double_initialize_is_rejected() {
        let runtime = runtime();
        let err = runtime
            .initialize(BridgeConfig::default(), Arc::new(MemoryMounter::new()))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EBUSY);
        runtime.shutdown().unwrap();
        assert!(!runtime.is_initialized());
    }

    #[test]
    fn handlers_by_name() {
        let runtime = runtime();
        runtime
            .set_operation_handler("READ", |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
                Ok(Completion::Value(Value::from(b"x".to_vec())))
            })
            .unwrap();
        assert!(matches!(
            runtime.set_operation_handler("frobnicate", |_: &mut ScriptEnv, _: Vec<Value>| -> HandlerResult {
                Ok(Completion::Value(Value::Null))
            }),
            Err(BridgeError::UnknownOperation(_))
        ));
        runtime.initialize_dispatcher(None).unwrap();

        let (sink, recorded) = RecordingReply::new();
        runtime.bridge().unwrap().submit(RequestContext::new(
            OpTag::Read,
            1,
            None,
            RequestArgs {
                size: 1,
                ..Default::default()
            },
            sink,
        ));
        assert_eq!(
            recorded.wait(Duration::from_secs(2)),
            Some(RecordedReply::Data(b"x".to_vec()))
        );

        assert!(runtime.remove_operation_handler("read").unwrap());
        assert!(!runtime.remove_operation_handler("read").unwrap());
        runtime.shutdown().unwrap();
    }

    #[test]
    fn dispatcher_can_be_restarted() {
        let runtime = runtime();
        runtime
            .initialize_dispatcher(Some(DispatcherConfig {
                max_queue_size: 8,
                ..Default::default()
            }))
            .unwrap();
        assert!(runtime.shutdown_dispatcher(None).unwrap());
        runtime.initialize_dispatcher(None).unwrap();
        let config = runtime
            .set_dispatcher_config(|c| c.priority_ordering = false)
            .unwrap();
        assert_eq!(config.max_queue_size, 8);
        assert!(!config.priority_ordering);
        assert_eq!(runtime.get_dispatcher_stats().unwrap().dispatched, 0);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn write_callbacks_run_on_script_thread() {
        let runtime = runtime();
        let script = runtime.script().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for chunk in [b"A", b"B"] {
            let tx = tx.clone();
            let script = script.clone();
            runtime
                .enqueue_write(
                    5,
                    None,
                    1,
                    WritePayload::Owned(chunk.to_vec()),
                    WritePriority::Normal,
                    Some(Box::new(move |result| {
                        tx.send((result, script.is_script_thread())).unwrap();
                    })),
                )
                .unwrap();
        }
        let executor: Arc<dyn WriteExecutor> =
            Arc::new(|job: &WriteJob| -> Result<usize, i32> { Ok(job.size) });
        assert_eq!(runtime.process_write_queues(executor).unwrap(), 2);
        for _ in 0..2 {
            let (result, on_script) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(result, Ok(1));
            assert!(on_script);
        }
        let stats = runtime.get_write_queue_stats(Some(5)).unwrap();
        assert_eq!(stats[0].bytes_written, 2);
        assert_eq!(runtime.get_write_queue_summary().unwrap().completed, 2);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn shutdown_requires_manager() {
        let runtime = runtime();
        assert!(matches!(
            runtime.initiate_graceful_shutdown(None, None),
            Err(BridgeError::NotInitialized)
        ));
        runtime
            .configure_shutdown_timeouts(|t| t.draining_ms = 250)
            .unwrap();
        let manager = runtime.initialize_shutdown_manager().unwrap();
        assert_eq!(manager.timeouts().draining_ms, 250);
        let stats = runtime
            .initiate_graceful_shutdown(Some("test"), Some(Duration::from_secs(2)))
            .unwrap();
        assert!(stats.graceful);
        assert_eq!(runtime.get_shutdown_state(), ShutdownState::Closed);
        assert_eq!(runtime.get_shutdown_stats().unwrap().reason, "test");
        runtime.shutdown().unwrap();
    }

    #[test]
    fn stats_convert_to_records() {
        let record = to_record(&DispatcherStats {
            dispatched: 3,
            ..Default::default()
        });
        assert_eq!(record.field_u64("dispatched").unwrap(), 3);
    }

    #[test]
    fn constants_cover_errno_mode_and_flags() {
        assert_eq!(constant("ENOENT"), Some(-i64::from(libc::ENOENT)));
        assert_eq!(constant("S_IFDIR"), Some(i64::from(libc::S_IFDIR)));
        assert_eq!(constant("O_CREAT"), Some(i64::from(libc::O_CREAT)));
        assert_eq!(constant("XATTR_CREATE"), Some(i64::from(xattr::XATTR_CREATE)));
        assert_eq!(constant("NOPE"), None);
    }
}
