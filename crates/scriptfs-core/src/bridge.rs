// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel request routing and reply translation
//!
//! Transport callbacks hand every request to [`Bridge::submit`]. The bridge
//! never calls a handler on the calling thread: it either answers at once
//! (no handler, queue full, shutting down) or dispatches a job whose thunk
//! builds the handler's argument tuple, calls it on the script thread and
//! turns the returned value, immediate or deferred, into exactly one reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::codec::{AttrReply, CacheTimeouts, EntryReply, FileInfo, FsStats, LockRecord};
use crate::connection::{ConnectionInfo, FuseConfigRecord};
use crate::context::RequestContext;
use crate::dirent;
use crate::dispatcher::{Dispatcher, ErrorContinuation, Priority, ScriptThunk};
use crate::errno;
use crate::op::OpTag;
use crate::registry::{HandlerRef, HandlerRegistry};
use crate::script::{Completion, ScriptEnv};
use crate::session::{Session, SessionState};
use crate::value::Value;

pub struct Bridge {
    registry: Arc<HandlerRegistry>,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    timeouts: RwLock<CacheTimeouts>,
    connection: Mutex<Option<(ConnectionInfo, FuseConfigRecord)>>,
    accepting: AtomicBool,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl Bridge {
    pub fn new(registry: Arc<HandlerRegistry>, timeouts: CacheTimeouts) -> Arc<Self> {
        Arc::new(Self {
            registry,
            dispatcher: RwLock::new(None),
            timeouts: RwLock::new(timeouts),
            connection: Mutex::new(None),
            accepting: AtomicBool::new(true),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn set_dispatcher(&self, dispatcher: Option<Arc<Dispatcher>>) {
        *self.dispatcher.write() = dispatcher;
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.read().clone()
    }

    pub fn cache_timeouts(&self) -> CacheTimeouts {
        *self.timeouts.read()
    }

    pub fn set_cache_timeouts(&self, timeouts: CacheTimeouts) {
        *self.timeouts.write() = timeouts;
    }

    pub(crate) fn attach_session(&self, session: Weak<Session>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(session);
    }

    fn has_session(&self) -> bool {
        let live: Vec<Arc<Session>> = self.sessions.lock().iter().filter_map(Weak::upgrade).collect();
        live.iter().any(|s| s.state() != SessionState::Destroyed)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Later requests are answered `EIO` (or `ENODEV` once the session is
    /// gone) without reaching the dispatcher.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn resume_accepting(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.connection.lock().as_ref().map(|(info, _)| info.clone())
    }

    pub fn config_record(&self) -> Option<FuseConfigRecord> {
        self.connection.lock().as_ref().map(|(_, cfg)| cfg.clone())
    }

    /// Records the negotiated connection and notifies an `init` handler.
    pub fn init(&self, info: ConnectionInfo, config: FuseConfigRecord) {
        debug!(
            proto_major = info.proto_major,
            proto_minor = info.proto_minor,
            max_write = info.max_write,
            "connection initialized"
        );
        let args = vec![info.to_value(), config.to_value()];
        *self.connection.lock() = Some((info, config));
        self.notify(OpTag::Init, args, Priority::Normal);
    }

    /// Notifies a `destroy` handler; the kernel expects no reply.
    pub fn destroy(&self) {
        self.notify(OpTag::Destroy, Vec::new(), Priority::High);
    }

    fn notify(&self, op: OpTag, args: Vec<Value>, priority: Priority) {
        if !self.registry.has(op) {
            return;
        }
        let Some(dispatcher) = self.dispatcher() else {
            return;
        };
        let thunk: ScriptThunk = Box::new(move |env, handler| {
            if let Some(handler) = handler {
                if let Err(reason) = handler.call(env, args) {
                    debug!(op = %op, errno = errno::extract(&reason), "notification handler failed");
                }
            }
        });
        if dispatcher.dispatch_custom(op.as_str(), thunk, priority, None) == 0 {
            warn!(op = %op, "notification dropped");
        }
    }

    /// Routes one kernel request.
    pub fn submit(self: &Arc<Self>, ctx: RequestContext) {
        let ctx = Arc::new(ctx);
        let op = ctx.op();

        if !self.is_accepting() {
            let code = if self.has_session() {
                libc::EIO
            } else {
                libc::ENODEV
            };
            debug!(op = %op, request_id = ctx.unique(), errno = code, "bridge not accepting");
            if op.is_notification() {
                ctx.reply_none();
            } else {
                ctx.reply_error(code);
            }
            return;
        }

        if op.is_notification() {
            let args = build_args(&ctx);
            ctx.reply_none();
            self.notify(op, args, Priority::Normal);
            return;
        }

        if op == OpTag::Unknown || !self.registry.has(op) {
            ctx.reply_error(libc::ENOSYS);
            return;
        }

        let Some(dispatcher) = self.dispatcher() else {
            ctx.reply_error(libc::EIO);
            return;
        };

        let error_ctx = Arc::clone(&ctx);
        let on_error: ErrorContinuation = Box::new(move |code| {
            error_ctx.reply_error(code.abs());
        });
        let job_ctx = Arc::clone(&ctx);
        let timeouts = self.cache_timeouts();
        let thunk: ScriptThunk =
            Box::new(move |env, handler| run_handler(env, handler, job_ctx, timeouts));

        let id = dispatcher.dispatch_custom(op.as_str(), thunk, Priority::Normal, Some(on_error));
        if id == 0 {
            let code = if dispatcher.is_accepting() {
                libc::EAGAIN
            } else {
                libc::EIO
            };
            debug!(op = %op, request_id = ctx.unique(), errno = code, "dispatch refused");
            ctx.reply_error(code);
        }
    }
}

fn run_handler(
    env: &mut ScriptEnv,
    handler: Option<HandlerRef>,
    ctx: Arc<RequestContext>,
    timeouts: CacheTimeouts,
) {
    let Some(handler) = handler else {
        ctx.reply_error(libc::ENOSYS);
        return;
    };
    let args = build_args(&ctx);
    match handler.call(env, args) {
        Ok(Completion::Value(value)) => translate(&ctx, value, timeouts),
        Ok(Completion::Deferred(promise)) => {
            let resolved = Arc::clone(&ctx);
            env.then(
                promise,
                move |_, value| translate(&resolved, value, timeouts),
                move |_, reason| reject(&ctx, &reason),
            );
        }
        Err(reason) => reject(&ctx, &reason),
    }
}

fn reject(ctx: &RequestContext, reason: &Value) {
    let code = errno::extract(reason);
    debug!(op = %ctx.op(), request_id = ctx.unique(), errno = code, "handler rejected");
    ctx.reply_error(code);
}

fn opt_fi(fi: Option<FileInfo>) -> Value {
    fi.map(|fi| fi.to_value()).unwrap_or_default()
}

fn opt_name(name: &Option<String>) -> Value {
    name.as_deref().map(Value::from).unwrap_or_default()
}

/// Argument tuple handed to the handler for `ctx`'s operation.
pub fn build_args(ctx: &RequestContext) -> Vec<Value> {
    let a = &ctx.args;
    let caller = ctx.caller_value();
    let opts = Value::object;
    match ctx.op() {
        OpTag::Lookup => vec![a.parent.into(), opt_name(&a.name), caller, opts()],
        OpTag::Getattr => vec![a.ino.into(), caller, opt_fi(a.fi), opts()],
        OpTag::Setattr => {
            let request = a.setattr.unwrap_or_default();
            let now = crate::codec::system_time_to_ns(std::time::SystemTime::now());
            vec![
                a.ino.into(),
                request.to_value(now),
                caller,
                Value::object()
                    .with("valid", request.valid())
                    .with("fi", opt_fi(a.fi)),
            ]
        }
        OpTag::Readlink => vec![a.ino.into(), caller, opts()],
        OpTag::Mknod => vec![
            a.parent.into(),
            opt_name(&a.name),
            a.mode.into(),
            a.rdev.into(),
            caller,
            opts().with("umask", a.umask),
        ],
        OpTag::Mkdir => vec![
            a.parent.into(),
            opt_name(&a.name),
            a.mode.into(),
            caller,
            opts().with("umask", a.umask),
        ],
        OpTag::Symlink => vec![
            a.parent.into(),
            opt_name(&a.name),
            opt_name(&a.target),
            caller,
            opts(),
        ],
        OpTag::Create => vec![
            a.parent.into(),
            opt_name(&a.name),
            a.mode.into(),
            caller,
            opts()
                .with("flags", a.flags)
                .with("umask", a.umask)
                .with("fi", opt_fi(a.fi)),
        ],
        OpTag::Unlink | OpTag::Rmdir => {
            vec![a.parent.into(), opt_name(&a.name), caller, opts()]
        }
        OpTag::Rename => vec![
            a.parent.into(),
            opt_name(&a.name),
            a.new_parent.into(),
            opt_name(&a.new_name),
            a.flags.into(),
            caller,
        ],
        OpTag::Link => vec![
            a.ino.into(),
            a.new_parent.into(),
            opt_name(&a.new_name),
            caller,
        ],
        OpTag::Open | OpTag::Opendir => vec![a.ino.into(), a.flags.into(), caller],
        OpTag::Read => vec![
            a.ino.into(),
            caller,
            opts()
                .with("offset", a.offset)
                .with("size", a.size)
                .with("fi", opt_fi(a.fi)),
        ],
        OpTag::Write => vec![
            a.ino.into(),
            a.data.clone().map(Value::Buffer).unwrap_or_default(),
            caller,
            opts().with("offset", a.offset).with("fi", opt_fi(a.fi)),
        ],
        OpTag::Readdir | OpTag::Readdirplus => vec![
            a.ino.into(),
            a.offset.into(),
            caller,
            opt_fi(a.fi),
            opts().with("size", a.size),
        ],
        OpTag::Flush | OpTag::Release | OpTag::Releasedir => vec![
            a.ino.into(),
            opt_fi(a.fi),
            caller,
            opts()
                .with("flags", a.flags)
                .with("lockOwner", a.lock_owner),
        ],
        OpTag::Fsync | OpTag::Fsyncdir => {
            vec![a.ino.into(), a.datasync.into(), opt_fi(a.fi), caller]
        }
        OpTag::Statfs => vec![a.ino.into(), caller, opts()],
        OpTag::Access => vec![a.ino.into(), a.mask.into(), caller],
        OpTag::Setxattr => vec![
            a.ino.into(),
            opt_name(&a.name),
            a.data.clone().map(Value::Buffer).unwrap_or_default(),
            a.flags.into(),
            caller,
            opts().with("position", a.position),
        ],
        OpTag::Getxattr => vec![a.ino.into(), opt_name(&a.name), a.size.into(), caller],
        OpTag::Listxattr => vec![a.ino.into(), a.size.into(), caller],
        OpTag::Removexattr => vec![a.ino.into(), opt_name(&a.name), caller],
        OpTag::Getlk => vec![
            a.ino.into(),
            opt_fi(a.fi),
            a.lock.map(|l| l.to_value()).unwrap_or_default(),
            caller,
        ],
        OpTag::Setlk => vec![
            a.ino.into(),
            opt_fi(a.fi),
            a.lock.map(|l| l.to_value()).unwrap_or_default(),
            a.sleep.into(),
            caller,
        ],
        OpTag::Bmap => vec![a.ino.into(), a.blocksize.into(), a.idx.into(), caller],
        OpTag::Ioctl => vec![
            a.ino.into(),
            a.cmd.into(),
            a.data.clone().map(Value::Buffer).unwrap_or_default(),
            caller,
            opts()
                .with("flags", a.flags)
                .with("outSize", a.out_size)
                .with("fi", opt_fi(a.fi)),
        ],
        OpTag::Poll => vec![
            a.ino.into(),
            opt_fi(a.fi),
            caller,
            opts()
                .with("events", a.poll_events)
                .with("kh", a.poll_handle),
        ],
        OpTag::Fallocate => vec![
            a.ino.into(),
            a.offset.into(),
            a.size.into(),
            a.flags.into(),
            opt_fi(a.fi),
            caller,
        ],
        OpTag::Lseek => vec![
            a.ino.into(),
            a.offset.into(),
            a.whence.into(),
            opt_fi(a.fi),
            caller,
        ],
        OpTag::CopyFileRange => vec![
            a.ino.into(),
            a.offset.into(),
            opt_fi(a.fi),
            a.ino_out.into(),
            a.offset_out.into(),
            opt_fi(a.fi_out),
            a.size.into(),
            a.flags.into(),
            caller,
        ],
        OpTag::Forget => vec![a.ino.into(), a.nlookup.into()],
        OpTag::BatchForget => vec![Value::Array(
            a.forgets
                .iter()
                .map(|(ino, nlookup)| {
                    Value::object()
                        .with("ino", *ino)
                        .with("nlookup", *nlookup)
                })
                .collect(),
        )],
        OpTag::Init | OpTag::Destroy | OpTag::Unknown => Vec::new(),
    }
}

fn invalid(ctx: &RequestContext, what: &str) {
    warn!(op = %ctx.op(), request_id = ctx.unique(), reply = what, "invalid handler reply");
    ctx.reply_error(libc::EIO);
}

fn reply_entry_value(ctx: &RequestContext, value: &Value, timeouts: CacheTimeouts) {
    match EntryReply::from_value(value, timeouts) {
        Ok(entry) => {
            ctx.reply_entry(&entry);
        }
        Err(err) => invalid(ctx, &err.to_string()),
    }
}

fn reply_attr_value(ctx: &RequestContext, value: &Value, timeouts: CacheTimeouts) {
    match AttrReply::from_value(value, timeouts.attr) {
        Ok(reply) => {
            ctx.reply_attr(&reply.attr, reply.timeout);
        }
        Err(err) => invalid(ctx, &err.to_string()),
    }
}

/// Buffer replies for `getxattr`/`listxattr`: a zero-size request asks
/// for the length only.
fn reply_xattr_value(ctx: &RequestContext, value: &Value) {
    let requested = ctx.args.size;
    let data = match value {
        Value::Buffer(b) => b.clone(),
        Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
        Value::Array(names) => {
            let mut list = Vec::new();
            for name in names {
                let Some(name) = name.as_str() else {
                    return invalid(ctx, "xattr name list");
                };
                list.extend_from_slice(name.as_bytes());
                list.push(0);
            }
            Bytes::from(list)
        }
        other => {
            return match other.to_u32("size") {
                Ok(size) => {
                    ctx.reply_xattr_size(size);
                }
                Err(_) if other.is_nullish() => {
                    ctx.reply_error(libc::ENOSYS);
                }
                Err(_) => invalid(ctx, "xattr"),
            };
        }
    };
    let Ok(len) = u32::try_from(data.len()) else {
        ctx.reply_error(libc::E2BIG);
        return;
    };
    if requested == 0 {
        ctx.reply_xattr_size(len);
    } else if u64::from(len) > requested {
        ctx.reply_error(libc::ERANGE);
    } else {
        ctx.reply_buf(data);
    }
}

fn reply_directory_value(ctx: &RequestContext, value: &Value, timeouts: CacheTimeouts) {
    if value.is_nullish() || !matches!(value, Value::Buffer(_) | Value::Array(_)) {
        ctx.reply_error(libc::ENOSYS);
        return;
    }
    let start = u64::try_from(ctx.args.offset).unwrap_or(0);
    match dirent::from_value(value, start, timeouts) {
        Ok(entries) => {
            ctx.reply_directory(&entries);
        }
        Err(err) => invalid(ctx, &err.to_string()),
    }
}

/// Turns a handler's resolved value into the reply its operation expects.
pub fn translate(ctx: &RequestContext, value: Value, timeouts: CacheTimeouts) {
    let a = &ctx.args;
    match ctx.op() {
        OpTag::Lookup | OpTag::Mknod | OpTag::Mkdir | OpTag::Symlink => {
            reply_entry_value(ctx, &value, timeouts)
        }
        OpTag::Link => {
            if value.get("attr").is_some() {
                reply_entry_value(ctx, &value, timeouts)
            } else {
                ctx.reply_error(libc::ENOSYS);
            }
        }
        OpTag::Getattr => reply_attr_value(ctx, &value, timeouts),
        OpTag::Setattr => {
            if value.is_nullish() {
                ctx.reply_error(libc::ENOSYS);
            } else {
                reply_attr_value(ctx, &value, timeouts)
            }
        }
        OpTag::Readlink => match value.as_str().or_else(|| value.get("target").and_then(Value::as_str)) {
            Some(target) => {
                ctx.reply_readlink(target);
            }
            None => invalid(ctx, "readlink"),
        },
        OpTag::Create => {
            let entry = match EntryReply::from_value(&value, timeouts) {
                Ok(entry) => entry,
                Err(err) => return invalid(ctx, &err.to_string()),
            };
            let base = a.fi.unwrap_or_else(|| FileInfo::new(0, a.flags));
            let fi_value = value.get("fi").cloned().unwrap_or_default();
            match FileInfo::from_value(&fi_value, base) {
                Ok(mut fi) => {
                    if let Some(fh) = value.get("fh") {
                        match fh.to_u64_lossless("fh") {
                            Ok(fh) => fi.fh = fh,
                            Err(err) => return invalid(ctx, &err.to_string()),
                        }
                    }
                    ctx.reply_create(&entry, &fi);
                }
                Err(err) => invalid(ctx, &err.to_string()),
            }
        }
        OpTag::Unlink
        | OpTag::Rmdir
        | OpTag::Flush
        | OpTag::Release
        | OpTag::Releasedir
        | OpTag::Fsync
        | OpTag::Fsyncdir
        | OpTag::Access
        | OpTag::Setxattr
        | OpTag::Removexattr
        | OpTag::Setlk
        | OpTag::Fallocate => {
            ctx.reply_ok();
        }
        OpTag::Rename => {
            if value.is_nullish() {
                ctx.reply_ok();
            } else {
                invalid(ctx, "rename");
            }
        }
        OpTag::Open | OpTag::Opendir => {
            let base = a.fi.unwrap_or_else(|| FileInfo::new(0, a.flags));
            let fi = match &value {
                Value::Number(_) | Value::BigInt(_) => value
                    .to_u64_lossless("fh")
                    .map(|fh| FileInfo { fh, ..base }),
                other => FileInfo::from_value(other, base),
            };
            match fi {
                Ok(fi) => {
                    ctx.reply_open(&fi);
                }
                Err(err) => invalid(ctx, &err.to_string()),
            }
        }
        OpTag::Read => match value {
            Value::Buffer(data) => {
                let limit = usize::try_from(a.size).unwrap_or(usize::MAX);
                let data = if data.len() > limit {
                    data.slice(..limit)
                } else {
                    data
                };
                ctx.reply_buf(data);
            }
            _ => {
                ctx.reply_error(libc::ENOSYS);
            }
        },
        OpTag::Write | OpTag::CopyFileRange => match value {
            Value::Number(_) | Value::BigInt(_) => match value.to_u32("written") {
                Ok(n) => {
                    ctx.reply_write(n);
                }
                Err(err) => invalid(ctx, &err.to_string()),
            },
            _ => {
                ctx.reply_error(libc::ENOSYS);
            }
        },
        OpTag::Readdir | OpTag::Readdirplus => reply_directory_value(ctx, &value, timeouts),
        OpTag::Statfs => match FsStats::from_value(&value) {
            Ok(stats) => {
                ctx.reply_statfs(&stats);
            }
            Err(err) => invalid(ctx, &err.to_string()),
        },
        OpTag::Getxattr | OpTag::Listxattr => reply_xattr_value(ctx, &value),
        OpTag::Getlk => match LockRecord::from_value(&value) {
            Ok(lock) => {
                ctx.reply_getlk(&lock);
            }
            Err(err) => invalid(ctx, &err.to_string()),
        },
        OpTag::Bmap => match value.to_u64_lossless("block") {
            Ok(block) => {
                ctx.reply_bmap(block);
            }
            Err(err) => invalid(ctx, &err.to_string()),
        },
        OpTag::Lseek => match value.to_i64_lossless("offset") {
            Ok(offset) => {
                ctx.reply_lseek(offset);
            }
            Err(err) => invalid(ctx, &err.to_string()),
        },
        OpTag::Poll => match value.to_u32("revents") {
            Ok(revents) => {
                ctx.reply_poll(revents);
            }
            Err(err) => invalid(ctx, &err.to_string()),
        },
        OpTag::Ioctl => {
            let (result, data) = match &value {
                Value::Number(_) | Value::BigInt(_) => (value.to_i64_lossless("result"), None),
                Value::Object(_) => (
                    value
                        .get("result")
                        .map(|r| r.to_i64_lossless("result"))
                        .unwrap_or(Ok(0)),
                    value.get("data").and_then(Value::as_bytes).cloned(),
                ),
                _ => (Ok(0), None),
            };
            match result.ok().and_then(|r| i32::try_from(r).ok()) {
                Some(result) => {
                    ctx.reply_ioctl(result, data.unwrap_or_default());
                }
                None => invalid(ctx, "ioctl"),
            }
        }
        OpTag::Init
        | OpTag::Destroy
        | OpTag::Forget
        | OpTag::BatchForget
        | OpTag::Unknown => {
            ctx.reply_none();
        }
    }
}
