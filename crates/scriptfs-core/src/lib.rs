// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! scriptfs core: lets a single-threaded script runtime serve a FUSE
//! filesystem.
//!
//! Kernel callbacks arrive on transport threads and are turned into
//! [`RequestContext`]s by the host. The [`Bridge`] routes each one through
//! the [`Dispatcher`] to the script thread, where the registered handler
//! runs, and translates whatever it returns into exactly one reply.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dirent;
pub mod dispatcher;
pub mod errno;
pub mod error;
pub mod op;
pub mod registry;
pub mod script;
pub mod session;
pub mod shutdown;
pub mod surface;
pub mod testing;
pub mod value;
pub mod write_queue;
pub mod xattr;

pub use bridge::Bridge;
pub use codec::{AttrReply, CacheTimeouts, EntryReply, FileInfo, FsStats, LockRecord, Stat};
pub use config::BridgeConfig;
pub use connection::{ConnectionInfo, FuseConfigRecord};
pub use context::{CallerContext, ReplySink, RequestArgs, RequestContext};
pub use dirent::{DirEntry, FileKind};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, Priority};
pub use error::{BridgeError, BridgeResult, CodecError};
pub use op::OpTag;
pub use registry::{Handler, HandlerRef, HandlerRegistry};
pub use script::{Completion, HandlerResult, Promise, Resolver, ScriptEnv, ScriptHandle, ScriptThread};
pub use session::{
    MountedChannel, Mounter, SessionError, SessionHandle, SessionManager, SessionOptions,
    SessionState, Unmounter,
};
pub use shutdown::{ShutdownManager, ShutdownObserver, ShutdownState, ShutdownStats, ShutdownTimeouts};
pub use surface::Runtime;
pub use value::Value;
pub use write_queue::{
    WriteExecutor, WriteJob, WritePayload, WritePriority, WriteQueueConfig, WriteQueueManager,
};
