// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Built-in demo filesystem: a root directory holding one read-only file.
//!
//! The handlers run on the script thread like any other, so mounting the
//! host without a script still exercises the full request path.

use scriptfs_core::codec::{system_time_to_ns, FsStats, Stat};
use scriptfs_core::errno::error_record;
use scriptfs_core::{BridgeResult, Completion, HandlerResult, Runtime, ScriptEnv, Value};

pub const ROOT_INO: u64 = 1;
pub const HELLO_INO: u64 = 2;
pub const HELLO_NAME: &str = "hello.txt";
pub const HELLO_CONTENT: &[u8] = b"Hello from scriptfs!\n";

fn stat(ino: u64) -> Option<Stat> {
    let now = system_time_to_ns(std::time::SystemTime::now());
    let (mode, nlink, size) = match ino {
        ROOT_INO => (libc::S_IFDIR as u32 | 0o755, 2, 0),
        HELLO_INO => (libc::S_IFREG as u32 | 0o444, 1, HELLO_CONTENT.len() as u64),
        _ => return None,
    };
    // SAFETY: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(Stat {
        ino,
        mode,
        nlink,
        uid,
        gid,
        size,
        blksize: 4096,
        blocks: size.div_ceil(512),
        atime_ns: now,
        mtime_ns: now,
        ctime_ns: now,
        ..Stat::default()
    })
}

fn ino_arg(args: &[Value], index: usize) -> Result<u64, Value> {
    args.get(index)
        .ok_or_else(|| error_record(libc::EINVAL))?
        .to_u64_lossless("ino")
        .map_err(|_| error_record(libc::EINVAL))
}

fn done(value: Value) -> HandlerResult {
    Ok(Completion::Value(value))
}

fn lookup(_: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult {
    let parent = ino_arg(&args, 0)?;
    let name = args.get(1).and_then(Value::as_str);
    match (parent, name, stat(HELLO_INO)) {
        (ROOT_INO, Some(HELLO_NAME), Some(attr)) => done(
            Value::object()
                .with("ino", HELLO_INO)
                .with("attr", attr.to_value()),
        ),
        _ => Err(error_record(libc::ENOENT)),
    }
}

fn getattr(_: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult {
    match stat(ino_arg(&args, 0)?) {
        Some(attr) => done(Value::object().with("attr", attr.to_value())),
        None => Err(error_record(libc::ENOENT)),
    }
}

fn readdir(_: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult {
    if ino_arg(&args, 0)? != ROOT_INO {
        return Err(error_record(libc::ENOTDIR));
    }
    let offset = args
        .get(1)
        .map(|v| v.to_u64_lossless("offset"))
        .transpose()
        .map_err(|_| error_record(libc::EINVAL))?
        .unwrap_or(0);
    let listing = [
        (ROOT_INO, libc::S_IFDIR as u32, "."),
        (ROOT_INO, libc::S_IFDIR as u32, ".."),
        (HELLO_INO, libc::S_IFREG as u32, HELLO_NAME),
    ];
    let entries: Vec<Value> = listing
        .iter()
        .enumerate()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .map(|(i, (ino, mode, name))| {
            Value::object()
                .with("ino", *ino)
                .with("mode", *mode)
                .with("name", *name)
                .with("offset", i as u64 + 1)
        })
        .collect();
    done(Value::from(entries))
}

fn open(_: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult {
    if ino_arg(&args, 0)? != HELLO_INO {
        return Err(error_record(libc::EISDIR));
    }
    let flags = args
        .get(1)
        .and_then(Value::as_f64)
        .map(|f| f as i32)
        .unwrap_or(0);
    if flags & libc::O_ACCMODE != libc::O_RDONLY {
        return Err(error_record(libc::EACCES));
    }
    done(Value::object().with("fh", HELLO_INO).with("keepCache", true))
}

fn read(_: &mut ScriptEnv, args: Vec<Value>) -> HandlerResult {
    if ino_arg(&args, 0)? != HELLO_INO {
        return Err(error_record(libc::ENOENT));
    }
    let opts = args.get(2).cloned().unwrap_or_default();
    let offset = opts
        .get("offset")
        .map(|v| v.to_u64_lossless("offset"))
        .transpose()
        .map_err(|_| error_record(libc::EINVAL))?
        .unwrap_or(0);
    let size = opts.field_u64("size").map_err(|_| error_record(libc::EINVAL))?;
    let start = usize::try_from(offset)
        .unwrap_or(usize::MAX)
        .min(HELLO_CONTENT.len());
    let end = start
        .saturating_add(usize::try_from(size).unwrap_or(usize::MAX))
        .min(HELLO_CONTENT.len());
    done(Value::from(HELLO_CONTENT[start..end].to_vec()))
}

fn statfs(_: &mut ScriptEnv, _: Vec<Value>) -> HandlerResult {
    let stats = FsStats {
        bsize: 4096,
        frsize: 4096,
        blocks: 1,
        files: 2,
        namemax: 255,
        ..FsStats::default()
    };
    done(stats.to_value())
}

/// Registers the demo handlers on `runtime`.
pub fn install(runtime: &Runtime) -> BridgeResult<()> {
    runtime.set_operation_handler("lookup", lookup)?;
    runtime.set_operation_handler("getattr", getattr)?;
    runtime.set_operation_handler("readdir", readdir)?;
    runtime.set_operation_handler("open", open)?;
    runtime.set_operation_handler("read", read)?;
    runtime.set_operation_handler("statfs", statfs)?;
    Ok(())
}
