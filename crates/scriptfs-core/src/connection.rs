// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection parameters negotiated on `init`

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Protocol version, capabilities and size caps agreed with the kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub proto_major: u32,
    pub proto_minor: u32,
    pub capable: u64,
    pub want: u64,
    pub max_read: u32,
    pub max_write: u32,
    pub max_readahead: u32,
    pub max_background: u32,
    pub congestion_threshold: u32,
    pub time_gran: u32,
    pub reserved: [u32; 22],
}

impl ConnectionInfo {
    pub fn to_value(&self) -> Value {
        let reserved = self.reserved.iter().map(|r| Value::from(*r)).collect::<Vec<_>>();
        Value::object()
            .with("proto_major", self.proto_major)
            .with("proto_minor", self.proto_minor)
            .with("capable", self.capable)
            .with("want", self.want)
            .with("max_read", self.max_read)
            .with("max_write", self.max_write)
            .with("max_readahead", self.max_readahead)
            .with("max_background", self.max_background)
            .with("congestion_threshold", self.congestion_threshold)
            .with("time_gran", self.time_gran)
            .with("reserved", reserved)
    }
}

/// Mount-level configuration block captured alongside the connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FuseConfigRecord {
    pub set_uid: bool,
    pub uid: u32,
    pub set_gid: bool,
    pub gid: u32,
    pub set_mode: bool,
    pub umask: u32,
    pub entry_timeout: f64,
    pub negative_timeout: f64,
    pub attr_timeout: f64,
    pub use_ino: bool,
    pub readdir_ino: bool,
    pub direct_io: bool,
    pub kernel_cache: bool,
    pub auto_cache: bool,
    pub ac_attr_timeout: f64,
    pub ac_attr_timeout_set: bool,
    pub nullpath_ok: bool,
    pub show_help: bool,
    pub debug: bool,
}

impl FuseConfigRecord {
    pub fn to_value(&self) -> Value {
        Value::object()
            .with("set_uid", self.set_uid)
            .with("uid", self.uid)
            .with("set_gid", self.set_gid)
            .with("gid", self.gid)
            .with("set_mode", self.set_mode)
            .with("umask", self.umask)
            .with("entry_timeout", self.entry_timeout)
            .with("negative_timeout", self.negative_timeout)
            .with("attr_timeout", self.attr_timeout)
            .with("use_ino", self.use_ino)
            .with("readdir_ino", self.readdir_ino)
            .with("direct_io", self.direct_io)
            .with("kernel_cache", self.kernel_cache)
            .with("auto_cache", self.auto_cache)
            .with("ac_attr_timeout", self.ac_attr_timeout)
            .with("ac_attr_timeout_set", self.ac_attr_timeout_set)
            .with("nullpath_ok", self.nullpath_ok)
            .with("show_help", self.show_help)
            .with("debug", self.debug)
    }
}
