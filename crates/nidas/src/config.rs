// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes the pipeline constants and runtime configuration.
//! **Never hardcode elsewhere!**
//!
//! - **Level 1 (static)**: compile-time constants (reserved ids, ports,
//!   buffer sizes, sorter defaults)
//! - **Level 2 (dynamic)**: [`RuntimeConfig`] for runtime settings (project
//!   identity, per-stream overrides)

use crate::error::{Error, ParseKind, Result};
use crate::sample::{self, SampleId};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

// =======================================================================
// Time
// =======================================================================

/// Microseconds per second; timetags are 64-bit microseconds since the epoch.
pub const USECS_PER_SEC: i64 = 1_000_000;

// =======================================================================
// Reserved sample ids
// =======================================================================

/// Carries the per-second aligned float record.
pub const SYNC_RECORD_ID: SampleId = sample::make_id(0, 1);

/// Carries the ASCII sync-record layout document.
pub const SYNC_RECORD_HEADER_ID: SampleId = sample::make_id(0, 2);

// =======================================================================
// Transport defaults
// =======================================================================

/// Default TCP port for archive-stream socket inputs/outputs.
pub const DEFAULT_SOCKET_PORT: u16 = 30000;

/// Well-known multicast group for service discovery requests.
pub const MULTICAST_GROUP: &str = "239.0.0.10";

/// Well-known multicast port for service discovery requests.
pub const MULTICAST_PORT: u16 = 30001;

// =======================================================================
// Pipeline defaults
// =======================================================================

/// Per-sensor read ring size.
pub const SENSOR_BUF_LEN: usize = 8192;

/// Default IOStream buffer size.
pub const IOSTREAM_BUF_LEN: usize = 8192;

/// Default output latency before a forced flush, microseconds.
pub const DEFAULT_LATENCY_USECS: i64 = 250_000;

/// Default sorter window.
pub const DEFAULT_SORT_LENGTH_USECS: i64 = 250_000;

/// Default sorter heap cap in bytes.
pub const DEFAULT_HEAP_MAX: usize = 50_000_000;

/// Default cap on buffered late samples.
pub const DEFAULT_LATE_SAMPLE_CACHE: usize = 100_000;

/// Sanity bound on a frame's data length when reading an archive stream.
pub const MAX_SAMPLE_DATA_LEN: u32 = 32768;

/// Default sensor statistics window, seconds.
pub const DEFAULT_STATS_PERIOD_SECS: u32 = 300;

/// Default reconnect delay after an output disconnect, seconds.
pub const DEFAULT_RECONNECT_SECS: u32 = 10;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Project identity stamped into archive headers.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub project_name: String,
    pub system_name: String,
    pub config_name: String,
    pub config_version: String,
    /// Aircraft tail number or station name, for the sync header.
    pub platform: String,
    /// Flight or observation-period name, for the sync header.
    pub flight: String,
}

/// Runtime configuration: swappable project identity plus a keyed store
/// for per-stream overrides.
///
/// Reads are lock-free (`ArcSwap` load, `DashMap` get); a SIGHUP
/// reconfiguration swaps in a whole new [`ProjectConfig`].
pub struct RuntimeConfig {
    project: ArcSwap<ProjectConfig>,
    settings: DashMap<Arc<str>, Arc<str>>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            project: ArcSwap::from_pointee(ProjectConfig::default()),
            settings: DashMap::new(),
        }
    }

    /// Current project identity. O(1), lock-free.
    pub fn project(&self) -> Arc<ProjectConfig> {
        self.project.load_full()
    }

    /// Replace the project identity (SIGHUP restart path).
    pub fn set_project(&self, p: ProjectConfig) {
        self.project.store(Arc::new(p));
    }

    pub fn set(&self, key: &str, value: &str) {
        self.settings.insert(Arc::from(key), Arc::from(value));
    }

    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.settings.get(key).map(|r| r.value().clone())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =======================================================================
// Path template expansion
// =======================================================================

/// Environment variables recognized inside configuration path templates.
pub const TEMPLATE_VARS: &[&str] = &[
    "ADS3_CONFIG",
    "ADS3_PROJECT",
    "ADS3_AIRCRAFT",
    "ADS3_FLIGHT",
    "ISFF",
    "HOST",
    "ADSNAME",
];

/// Expand `$VAR` and `${VAR}` references in a path template.
///
/// Only variables actually referenced must be present; a referenced but
/// unset variable is a config parse error naming the variable.
pub fn expand_path(template: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        // $VAR or ${VAR}
        let (name, next) = if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let end = template[i + 2..]
                .find('}')
                .map(|e| i + 2 + e)
                .ok_or_else(|| {
                    Error::parse(ParseKind::Config, i as u64, "unterminated ${ in path template")
                })?;
            (&template[i + 2..end], end + 1)
        } else {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            (&template[start..end], end)
        };
        if name.is_empty() {
            out.push('$');
            i += 1;
            continue;
        }
        match std::env::var(name) {
            Ok(val) => out.push_str(&val),
            Err(_) => {
                return Err(Error::parse(
                    ParseKind::Config,
                    i as u64,
                    format!("environment variable {name} referenced but not set"),
                ))
            }
        }
        i = next;
    }
    Ok(out)
}
