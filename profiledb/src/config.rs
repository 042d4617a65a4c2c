// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration types. Nothing here reads files or the environment; an
//! outer layer deserializes these and hands them over.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_BUFFER_ROW_COUNT: usize = 100_000;
pub const DEFAULT_MAX_ROW_GROUP_BYTES: u64 = 128 << 20;
pub const DEFAULT_APPEND_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(3 * 60 * 60);

/// Thresholds of a single column store.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Cut a row group once this many rows are buffered.
    pub max_buffer_row_count: usize,
    /// Cut a row group once the estimated buffered size reaches this.
    pub max_row_group_bytes: u64,
    /// Depth of the bounded queue in front of the writer thread. A full
    /// queue blocks the caller.
    pub append_queue_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_buffer_row_count: DEFAULT_MAX_BUFFER_ROW_COUNT,
            max_row_group_bytes: DEFAULT_MAX_ROW_GROUP_BYTES,
            append_queue_depth: DEFAULT_APPEND_QUEUE_DEPTH,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeadConfig {
    /// Root of the `head/` and `local/` block directories.
    pub data_path: PathBuf,
    #[serde(with = "duration_secs")]
    pub block_duration: Duration,
    pub store: StoreConfig,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            block_duration: DEFAULT_BLOCK_DURATION,
            store: StoreConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SymDbConfig {
    /// Where `symbols.symdb` is written on flush.
    pub dir: PathBuf,
    /// Node budget of a stack trace chunk; 0 means unlimited.
    pub max_nodes_per_chunk: u32,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: HeadConfig = serde_json::from_str(
            r#"{"data_path": "/var/lib/profiles", "store": {"max_buffer_row_count": 10}}"#,
        )
        .unwrap();
        assert_eq!(cfg.data_path, PathBuf::from("/var/lib/profiles"));
        assert_eq!(cfg.block_duration, DEFAULT_BLOCK_DURATION);
        assert_eq!(cfg.store.max_buffer_row_count, 10);
        assert_eq!(cfg.store.max_row_group_bytes, DEFAULT_MAX_ROW_GROUP_BYTES);
        assert_eq!(cfg.store.append_queue_depth, 32);
    }

    #[test]
    fn block_duration_in_seconds() {
        let cfg: HeadConfig = serde_json::from_str(r#"{"block_duration": 60}"#).unwrap();
        assert_eq!(cfg.block_duration, Duration::from_secs(60));

        let cfg: SymDbConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_nodes_per_chunk, 0);
    }
}
