// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the scriptfs bridge

use std::io;

use libc::{EAGAIN, EIO, ENODEV, ENOMEM, ENOSYS};

use crate::op::OpTag;
use crate::session::SessionError;
use crate::shutdown::ShutdownError;

/// Errors raised while converting between language-neutral records and
/// native representations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("value for `{0}` cannot be represented without loss")]
    Lossy(String),
    #[error("field `{field}` has the wrong type (expected {expected})")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("invalid timestamp: sec={sec} nsec={nsec}")]
    InvalidTimestamp { sec: i64, nsec: i64 },
    #[error("invalid timeout for `{0}`")]
    InvalidTimeout(String),
    #[error("malformed dirent buffer at byte {0}")]
    MalformedDirent(usize),
}

/// Bridge-level error type
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("no handler registered for {0}")]
    NoHandler(OpTag),
    #[error("dispatcher queue is full")]
    QueueFull,
    #[error("dispatcher is not running")]
    NotRunning,
    #[error("runtime is not initialized")]
    NotInitialized,
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("script thread is unavailable")]
    ScriptThreadGone,
    #[error("invalid reply: {0}")]
    InvalidReply(String),
    #[error("session {0} not found")]
    SessionNotFound(u64),
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Positive errno delivered to the kernel for this failure.
    pub fn to_errno(&self) -> i32 {
        match self {
            BridgeError::UnknownOperation(_) | BridgeError::NoHandler(_) => ENOSYS,
            BridgeError::QueueFull => EAGAIN,
            BridgeError::SessionNotFound(_) => ENODEV,
            BridgeError::OutOfMemory => ENOMEM,
            BridgeError::Io(err) => err.raw_os_error().unwrap_or(EIO),
            BridgeError::Session(err) => err.to_errno(),
            BridgeError::AlreadyInitialized => libc::EBUSY,
            BridgeError::NotRunning
            | BridgeError::Shutdown(_)
            | BridgeError::NotInitialized
            | BridgeError::ScriptThreadGone
            | BridgeError::InvalidReply(_)
            | BridgeError::Codec(_) => EIO,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_map_to_kernel_codes() {
        assert_eq!(BridgeError::NoHandler(OpTag::Read).to_errno(), ENOSYS);
        assert_eq!(BridgeError::QueueFull.to_errno(), EAGAIN);
        assert_eq!(BridgeError::SessionNotFound(3).to_errno(), ENODEV);
        assert_eq!(BridgeError::OutOfMemory.to_errno(), ENOMEM);
        assert_eq!(
            BridgeError::Codec(CodecError::Lossy("size".into())).to_errno(),
            EIO
        );
        let io = BridgeError::Io(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.to_errno(), libc::EACCES);
    }
}
