// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount life-cycle
//!
//! A session moves CREATED → INITIALIZED → MOUNTED and back to INITIALIZED
//! on unmount; DESTROYED is terminal. The transport is abstracted behind
//! [`Mounter`] so the engine can be driven without a kernel.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::shutdown::ManagedSession;

/// Smallest scratch buffer the receive loop will allocate.
const MIN_RECEIVE_BUFFER: usize = 4096;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub debug: bool,
    pub foreground: bool,
    pub single_threaded: bool,
    pub allow_other: bool,
    pub allow_root: bool,
    pub auto_unmount: bool,
    pub max_read: u32,
    pub max_write: u32,
    #[serde(alias = "timeout")]
    pub timeout_secs: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            debug: false,
            foreground: false,
            single_threaded: false,
            allow_other: false,
            allow_root: false,
            auto_unmount: false,
            max_read: 131_072,
            max_write: 131_072,
            timeout_secs: 1.0,
        }
    }
}

impl SessionOptions {
    /// Mount options in the `-o` form understood by libfuse style mounters.
    pub fn mount_options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if self.allow_other {
            opts.push("allow_other".to_string());
        }
        if self.allow_root {
            opts.push("allow_root".to_string());
        }
        if self.auto_unmount {
            opts.push("auto_unmount".to_string());
        }
        if self.debug {
            opts.push("debug".to_string());
        }
        opts.push(format!("max_read={}", self.max_read));
        opts
    }

    /// Full argv for a libfuse style command line.
    pub fn to_argv(&self, program: &str) -> Vec<String> {
        let mut argv = vec![program.to_string()];
        if self.foreground {
            argv.push("-f".into());
        }
        if self.single_threaded {
            argv.push("-s".into());
        }
        if self.debug {
            argv.push("-d".into());
        }
        for opt in self.mount_options() {
            argv.push("-o".into());
            argv.push(opt);
        }
        argv
    }
}

/// Creates the transport for a session.
pub trait Mounter: Send + Sync {
    fn mount(
        &self,
        mountpoint: &Path,
        options: &SessionOptions,
        bridge: Arc<Bridge>,
    ) -> io::Result<Box<dyn MountedChannel>>;
}

/// A mounted transport, driven by the session's receive loop.
pub trait MountedChannel: Send {
    /// Blocks until a request arrives and returns its length.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn process(&mut self, request: &[u8]);

    /// Handle that tears the mount down from another thread.
    fn unmounter(&mut self) -> Box<dyn Unmounter>;
}

pub trait Unmounter: Send {
    fn unmount(&mut self) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Initialized,
    Mounted,
    Destroyed,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error("session {id} is {state:?}, expected {expected:?}")]
    InvalidState {
        id: u64,
        state: SessionState,
        expected: SessionState,
    },
    #[error("invalid mountpoint {0}")]
    InvalidMountpoint(PathBuf),
    #[error("mount failed: {0}")]
    Mount(#[source] io::Error),
    #[error("failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),
}

impl SessionError {
    pub fn to_errno(&self) -> i32 {
        match self {
            SessionError::UnknownSession(_) => libc::ENODEV,
            SessionError::InvalidState { .. } => libc::EINVAL,
            SessionError::InvalidMountpoint(_) => libc::ENOTDIR,
            SessionError::Mount(err) | SessionError::Spawn(err) => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }
}

/// Script-visible reference to a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: u64,
    pub mountpoint: PathBuf,
}

struct Inner {
    state: SessionState,
    unmounter: Option<Box<dyn Unmounter>>,
    receiver: Option<JoinHandle<()>>,
}

pub struct Session {
    id: u64,
    mountpoint: PathBuf,
    options: SessionOptions,
    bridge: Arc<Bridge>,
    mounter: Arc<dyn Mounter>,
    inner: Mutex<Inner>,
    exit: Arc<AtomicBool>,
    receiving: Arc<AtomicBool>,
}

impl Session {
    fn new(
        id: u64,
        mountpoint: PathBuf,
        options: SessionOptions,
        bridge: Arc<Bridge>,
        mounter: Arc<dyn Mounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            mountpoint,
            options,
            bridge,
            mounter,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                unmounter: None,
                receiver: None,
            }),
            exit: Arc::new(AtomicBool::new(false)),
            receiving: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            mountpoint: self.mountpoint.clone(),
        }
    }

    fn initialize(self: &Arc<Self>) -> Result<(), SessionError> {
        if !self.mountpoint.is_dir() {
            return Err(SessionError::InvalidMountpoint(self.mountpoint.clone()));
        }
        self.bridge.attach_session(Arc::downgrade(self));
        self.inner.lock().state = SessionState::Initialized;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Mounted && self.receiving.load(Ordering::Acquire)
    }

    pub fn mount(&self) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Mounted => return Ok(false),
            SessionState::Initialized => {}
            state => {
                return Err(SessionError::InvalidState {
                    id: self.id,
                    state,
                    expected: SessionState::Initialized,
                })
            }
        }

        let mut channel = self
            .mounter
            .mount(&self.mountpoint, &self.options, Arc::clone(&self.bridge))
            .map_err(SessionError::Mount)?;
        let unmounter = channel.unmounter();

        self.exit.store(false, Ordering::Release);
        self.receiving.store(true, Ordering::Release);
        self.bridge.resume_accepting();

        let id = self.id;
        let buffer_len = (self.options.max_read as usize).max(MIN_RECEIVE_BUFFER);
        let exit = Arc::clone(&self.exit);
        let receiving = Arc::clone(&self.receiving);
        let spawned = thread::Builder::new()
            .name(format!("scriptfs-session-{id}"))
            .spawn(move || {
                receive_loop(id, channel, buffer_len, &exit);
                receiving.store(false, Ordering::Release);
            });
        let receiver = match spawned {
            Ok(receiver) => receiver,
            Err(err) => {
                self.receiving.store(false, Ordering::Release);
                let mut unmounter = unmounter;
                if let Err(unmount_err) = unmounter.unmount() {
                    warn!(session = id, error = %unmount_err, "unmount after spawn failure failed");
                }
                return Err(SessionError::Spawn(err));
            }
        };

        inner.unmounter = Some(unmounter);
        inner.receiver = Some(receiver);
        inner.state = SessionState::Mounted;
        info!(session = id, mountpoint = %self.mountpoint.display(), "mounted");
        Ok(true)
    }

    /// Tears the mount down and joins the receive loop.
    ///
    /// Returns `false` when not mounted, or when called from the receive
    /// loop itself, in which case the loop is signalled but not joined.
    pub fn unmount(&self) -> bool {
        let receiver = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Mounted {
                return false;
            }
            self.exit.store(true, Ordering::Release);
            if let Some(mut unmounter) = inner.unmounter.take() {
                if let Err(err) = unmounter.unmount() {
                    warn!(session = self.id, error = %err, "unmount request failed");
                }
            }
            inner.state = SessionState::Initialized;
            inner.receiver.take()
        };

        let Some(receiver) = receiver else {
            return true;
        };
        if receiver.thread().id() == thread::current().id() {
            warn!(session = self.id, "unmount called from the receive loop, not joining");
            return false;
        }
        if receiver.join().is_err() {
            error!(session = self.id, "receive loop panicked");
        }
        info!(session = self.id, "unmounted");
        true
    }

    pub fn destroy(&self) -> bool {
        if self.state() == SessionState::Destroyed {
            return false;
        }
        self.unmount();
        self.inner.lock().state = SessionState::Destroyed;
        debug!(session = self.id, "destroyed");
        true
    }
}

fn receive_loop(id: u64, mut channel: Box<dyn MountedChannel>, buffer_len: usize, exit: &AtomicBool) {
    let mut buf = vec![0u8; buffer_len];
    debug!(session = id, buffer_len, "receive loop started");
    while !exit.load(Ordering::Acquire) {
        match channel.receive(&mut buf) {
            Ok(0) => continue,
            Ok(len) => channel.process(&buf[..len]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if !exit.load(Ordering::Acquire) {
                    debug!(session = id, error = %err, "receive loop ended");
                }
                break;
            }
        }
    }
    debug!(session = id, "receive loop stopped");
}

impl ManagedSession for Session {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn signal_exit(&self) {
        self.exit.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        if let Some(unmounter) = inner.unmounter.as_mut() {
            if let Err(err) = unmounter.unmount() {
                warn!(session = self.id, error = %err, "exit signal failed");
            }
        }
    }

    fn has_exited(&self) -> bool {
        !self.receiving.load(Ordering::Acquire)
    }
}

/// Owns all sessions of the process, keyed by id.
pub struct SessionManager {
    mounter: Arc<dyn Mounter>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self {
            mounter,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create(
        &self,
        mountpoint: impl Into<PathBuf>,
        options: SessionOptions,
        bridge: Arc<Bridge>,
    ) -> Result<SessionHandle, SessionError> {
        let mountpoint = mountpoint.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, mountpoint, options, bridge, Arc::clone(&self.mounter));
        session.initialize()?;
        let handle = session.handle();
        self.sessions.lock().insert(id, session);
        debug!(session = id, mountpoint = %handle.mountpoint.display(), "session created");
        Ok(handle)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    fn require(&self, handle: &SessionHandle) -> Result<Arc<Session>, SessionError> {
        self.get(handle.id)
            .ok_or(SessionError::UnknownSession(handle.id))
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn mount(&self, handle: &SessionHandle) -> Result<bool, SessionError> {
        self.require(handle)?.mount()
    }

    pub fn unmount(&self, handle: &SessionHandle) -> Result<bool, SessionError> {
        Ok(self.require(handle)?.unmount())
    }

    pub fn is_ready(&self, handle: &SessionHandle) -> bool {
        self.get(handle.id).is_some_and(|s| s.is_ready())
    }

    /// Unmounts if needed and forgets the session.
    pub fn destroy(&self, handle: &SessionHandle) -> Result<bool, SessionError> {
        let session = self
            .sessions
            .lock()
            .remove(&handle.id)
            .ok_or(SessionError::UnknownSession(handle.id))?;
        Ok(session.destroy())
    }

    pub fn destroy_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.destroy();
        }
    }
}
