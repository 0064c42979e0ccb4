// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! POSIX errno names, normalization and extraction from handler rejections

use libc::c_int;

use crate::value::Value;

/// Name/number pairs for every errno the bridge exchanges with scripts.
/// `ENOTSUP` precedes `EOPNOTSUPP` so that reverse lookup prefers it on
/// platforms where both share a number.
pub const ERRNO_TABLE: &[(&str, c_int)] = &[
    ("EPERM", libc::EPERM),
    ("ENOENT", libc::ENOENT),
    ("ESRCH", libc::ESRCH),
    ("EINTR", libc::EINTR),
    ("EIO", libc::EIO),
    ("ENXIO", libc::ENXIO),
    ("E2BIG", libc::E2BIG),
    ("ENOEXEC", libc::ENOEXEC),
    ("EBADF", libc::EBADF),
    ("ECHILD", libc::ECHILD),
    ("EAGAIN", libc::EAGAIN),
    ("ENOMEM", libc::ENOMEM),
    ("EACCES", libc::EACCES),
    ("EFAULT", libc::EFAULT),
    ("EBUSY", libc::EBUSY),
    ("EEXIST", libc::EEXIST),
    ("EXDEV", libc::EXDEV),
    ("ENODEV", libc::ENODEV),
    ("ENOTDIR", libc::ENOTDIR),
    ("EISDIR", libc::EISDIR),
    ("EINVAL", libc::EINVAL),
    ("ENFILE", libc::ENFILE),
    ("EMFILE", libc::EMFILE),
    ("ENOTTY", libc::ENOTTY),
    ("ETXTBSY", libc::ETXTBSY),
    ("EFBIG", libc::EFBIG),
    ("ENOSPC", libc::ENOSPC),
    ("ESPIPE", libc::ESPIPE),
    ("EROFS", libc::EROFS),
    ("EMLINK", libc::EMLINK),
    ("EPIPE", libc::EPIPE),
    ("EDOM", libc::EDOM),
    ("ERANGE", libc::ERANGE),
    ("EDEADLK", libc::EDEADLK),
    ("ENAMETOOLONG", libc::ENAMETOOLONG),
    ("ENOLCK", libc::ENOLCK),
    ("ENOSYS", libc::ENOSYS),
    ("ENOTEMPTY", libc::ENOTEMPTY),
    ("ELOOP", libc::ELOOP),
    ("ENOMSG", libc::ENOMSG),
    ("EIDRM", libc::EIDRM),
    ("ENODATA", libc::ENODATA),
    ("EPROTO", libc::EPROTO),
    ("EBADMSG", libc::EBADMSG),
    ("EOVERFLOW", libc::EOVERFLOW),
    ("EILSEQ", libc::EILSEQ),
    ("EUSERS", libc::EUSERS),
    ("ENOTSOCK", libc::ENOTSOCK),
    ("EDESTADDRREQ", libc::EDESTADDRREQ),
    ("EMSGSIZE", libc::EMSGSIZE),
    ("EPROTOTYPE", libc::EPROTOTYPE),
    ("ENOPROTOOPT", libc::ENOPROTOOPT),
    ("EPROTONOSUPPORT", libc::EPROTONOSUPPORT),
    ("ENOTSUP", libc::ENOTSUP),
    ("EOPNOTSUPP", libc::EOPNOTSUPP),
    ("EAFNOSUPPORT", libc::EAFNOSUPPORT),
    ("EADDRINUSE", libc::EADDRINUSE),
    ("EADDRNOTAVAIL", libc::EADDRNOTAVAIL),
    ("ENETDOWN", libc::ENETDOWN),
    ("ENETUNREACH", libc::ENETUNREACH),
    ("ENETRESET", libc::ENETRESET),
    ("ECONNABORTED", libc::ECONNABORTED),
    ("ECONNRESET", libc::ECONNRESET),
    ("ENOBUFS", libc::ENOBUFS),
    ("EISCONN", libc::EISCONN),
    ("ENOTCONN", libc::ENOTCONN),
    ("ETIMEDOUT", libc::ETIMEDOUT),
    ("ECONNREFUSED", libc::ECONNREFUSED),
    ("EHOSTUNREACH", libc::EHOSTUNREACH),
    ("EALREADY", libc::EALREADY),
    ("EINPROGRESS", libc::EINPROGRESS),
    ("ESTALE", libc::ESTALE),
    ("EDQUOT", libc::EDQUOT),
    ("ECANCELED", libc::ECANCELED),
    ("EOWNERDEAD", libc::EOWNERDEAD),
    ("ENOTRECOVERABLE", libc::ENOTRECOVERABLE),
];

/// Returns a value suitable for a kernel reply: zero and negative inputs
/// are returned unchanged, positive inputs are negated.
pub fn normalize(err: i32) -> i32 {
    if err > 0 {
        -err
    } else {
        err
    }
}

/// Looks up an errno by name, case-insensitively. Unknown names yield `EIO`.
pub fn from_name(name: &str) -> i32 {
    let name = name.trim();
    ERRNO_TABLE
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
        .unwrap_or(libc::EIO)
}

/// Symbolic name for an errno; the sign is ignored.
pub fn name(err: i32) -> Option<&'static str> {
    let code = err.checked_abs()?;
    ERRNO_TABLE
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(n, _)| *n)
}

/// Extracts a positive errno from a handler rejection.
///
/// Order: number, big integer, object with `errno` (recursive), object with
/// `code` (table lookup). Anything else, and zero, become `EIO`.
pub fn extract(reason: &Value) -> i32 {
    let code = match reason {
        Value::Number(n) if n.is_finite() => {
            let abs = n.abs();
            if abs <= f64::from(i32::MAX) {
                abs as i32
            } else {
                libc::EIO
            }
        }
        Value::BigInt(n) => i32::try_from(n.unsigned_abs()).unwrap_or(libc::EIO),
        Value::Object(_) => {
            if let Some(inner) = reason.get("errno") {
                extract(inner)
            } else if let Some(code) = reason.get("code").and_then(Value::as_str) {
                from_name(code)
            } else {
                libc::EIO
            }
        }
        _ => libc::EIO,
    };
    if code == 0 {
        libc::EIO
    } else {
        code
    }
}

/// Rejection record `{errno, code}` for a positive errno.
pub fn error_record(errno: i32) -> Value {
    let code = errno.checked_abs().unwrap_or(libc::EIO);
    Value::object()
        .with("errno", code)
        .with("code", name(code).unwrap_or("EIO"))
}

/// Negative errno constants keyed by name, as exposed to scripts.
pub fn constants() -> Vec<(&'static str, i32)> {
    ERRNO_TABLE
        .iter()
        .map(|(name, code)| (*name, -*code))
        .collect()
}
