// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge configuration
//!
//! Every section has defaults, so a partial JSON document (or none at all)
//! yields a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CacheTimeouts;
use crate::dispatcher::DispatcherConfig;
use crate::session::SessionOptions;
use crate::shutdown::ShutdownTimeouts;
use crate::write_queue::WriteQueueConfig;

/// Attribute and entry cache timeouts used when handlers omit them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub attr_timeout_secs: f64,
    pub entry_timeout_secs: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_timeout_secs: 1.0,
            entry_timeout_secs: 1.0,
        }
    }
}

impl CacheConfig {
    /// Invalid (negative, non-finite or oversized) values fall back to one second.
    pub fn timeouts(&self) -> CacheTimeouts {
        let secs = |v: f64| Duration::try_from_secs_f64(v).unwrap_or(Duration::from_secs(1));
        CacheTimeouts {
            attr: secs(self.attr_timeout_secs),
            entry: secs(self.entry_timeout_secs),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub dispatcher: DispatcherConfig,
    pub write_queue: WriteQueueConfig,
    pub shutdown: ShutdownTimeouts,
    pub session: SessionOptions,
    pub cache: CacheConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.dispatcher.max_queue_size, 1000);
        assert_eq!(config.write_queue.default_max_queue_size, 256);
        assert_eq!(config.shutdown.draining_ms, 5000);
        assert_eq!(config.session.max_read, 131072);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{
                "dispatcher": { "maxQueueSize": 4 },
                "write_queue": { "fd_max_queue_size": { "3": 8 } },
                "shutdown": { "unmounting_ms": 100 },
                "cache": { "attr_timeout_secs": 0.5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.max_queue_size, 4);
        assert_eq!(config.dispatcher.worker_threads, 1);
        assert_eq!(config.write_queue.fd_max_queue_size.get(&3), Some(&8));
        assert_eq!(config.shutdown.unmounting_ms, 100);
        assert_eq!(config.shutdown.draining_ms, 5000);
        assert_eq!(config.cache.timeouts().attr, Duration::from_millis(500));
        assert_eq!(config.cache.timeouts().entry, Duration::from_secs(1));
    }

    #[test]
    fn invalid_cache_timeouts_fall_back() {
        let cache = CacheConfig {
            attr_timeout_secs: -1.0,
            entry_timeout_secs: f64::NAN,
        };
        assert_eq!(cache.timeouts(), CacheTimeouts::default());
    }
}
