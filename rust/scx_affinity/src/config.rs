// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::cpuinfo::HOST_CPUINFO_PATH;
use serde::Deserialize;
use std::path::PathBuf;

/// Knobs for building an [`AffinityPolicy`](crate::AffinityPolicy).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Where to read the cpuinfo topology description from.
    pub cpuinfo_path: PathBuf,
    /// Suppress binding when another runtime's tuning variables are set.
    pub honor_env_overrides: bool,
    /// Worker threads are named `<worker_name_prefix>-<index>`.
    pub worker_name_prefix: String,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            cpuinfo_path: PathBuf::from(HOST_CPUINFO_PATH),
            honor_env_overrides: true,
            worker_name_prefix: "affinity-worker".to_string(),
        }
    }
}
