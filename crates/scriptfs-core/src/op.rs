// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation tags for every low-level request the bridge accepts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of low-level filesystem operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTag {
    Init,
    Destroy,
    Lookup,
    Forget,
    BatchForget,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Symlink,
    Unlink,
    Rmdir,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Readdirplus,
    Releasedir,
    Fsyncdir,
    Statfs,
    Access,
    Create,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
    Getlk,
    Setlk,
    Bmap,
    Ioctl,
    Poll,
    Fallocate,
    Lseek,
    CopyFileRange,
    Unknown,
}

impl OpTag {
    /// Every known tag, excluding `Unknown`.
    pub const ALL: [OpTag; 41] = [
        OpTag::Init,
        OpTag::Destroy,
        OpTag::Lookup,
        OpTag::Forget,
        OpTag::BatchForget,
        OpTag::Getattr,
        OpTag::Setattr,
        OpTag::Readlink,
        OpTag::Mknod,
        OpTag::Mkdir,
        OpTag::Symlink,
        OpTag::Unlink,
        OpTag::Rmdir,
        OpTag::Rename,
        OpTag::Link,
        OpTag::Open,
        OpTag::Read,
        OpTag::Write,
        OpTag::Flush,
        OpTag::Release,
        OpTag::Fsync,
        OpTag::Opendir,
        OpTag::Readdir,
        OpTag::Readdirplus,
        OpTag::Releasedir,
        OpTag::Fsyncdir,
        OpTag::Statfs,
        OpTag::Access,
        OpTag::Create,
        OpTag::Setxattr,
        OpTag::Getxattr,
        OpTag::Listxattr,
        OpTag::Removexattr,
        OpTag::Getlk,
        OpTag::Setlk,
        OpTag::Bmap,
        OpTag::Ioctl,
        OpTag::Poll,
        OpTag::Fallocate,
        OpTag::Lseek,
        OpTag::CopyFileRange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpTag::Init => "init",
            OpTag::Destroy => "destroy",
            OpTag::Lookup => "lookup",
            OpTag::Forget => "forget",
            OpTag::BatchForget => "batch_forget",
            OpTag::Getattr => "getattr",
            OpTag::Setattr => "setattr",
            OpTag::Readlink => "readlink",
            OpTag::Mknod => "mknod",
            OpTag::Mkdir => "mkdir",
            OpTag::Symlink => "symlink",
            OpTag::Unlink => "unlink",
            OpTag::Rmdir => "rmdir",
            OpTag::Rename => "rename",
            OpTag::Link => "link",
            OpTag::Open => "open",
            OpTag::Read => "read",
            OpTag::Write => "write",
            OpTag::Flush => "flush",
            OpTag::Release => "release",
            OpTag::Fsync => "fsync",
            OpTag::Opendir => "opendir",
            OpTag::Readdir => "readdir",
            OpTag::Readdirplus => "readdirplus",
            OpTag::Releasedir => "releasedir",
            OpTag::Fsyncdir => "fsyncdir",
            OpTag::Statfs => "statfs",
            OpTag::Access => "access",
            OpTag::Create => "create",
            OpTag::Setxattr => "setxattr",
            OpTag::Getxattr => "getxattr",
            OpTag::Listxattr => "listxattr",
            OpTag::Removexattr => "removexattr",
            OpTag::Getlk => "getlk",
            OpTag::Setlk => "setlk",
            OpTag::Bmap => "bmap",
            OpTag::Ioctl => "ioctl",
            OpTag::Poll => "poll",
            OpTag::Fallocate => "fallocate",
            OpTag::Lseek => "lseek",
            OpTag::CopyFileRange => "copy_file_range",
            OpTag::Unknown => "unknown",
        }
    }

    /// Case-insensitive parse. Names that match no tag yield `Unknown`.
    pub fn parse(name: &str) -> OpTag {
        let name = name.trim();
        OpTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(name))
            .or_else(|| {
                // camelCase spellings used by script authors
                match name.to_ascii_lowercase().as_str() {
                    "copyfilerange" => Some(OpTag::CopyFileRange),
                    "batchforget" => Some(OpTag::BatchForget),
                    _ => None,
                }
            })
            .unwrap_or(OpTag::Unknown)
    }

    /// Operations the kernel never expects a reply for.
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            OpTag::Init | OpTag::Destroy | OpTag::Forget | OpTag::BatchForget
        )
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for OpTag {
    fn from(name: &str) -> Self {
        OpTag::parse(name)
    }
}
