/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-level knobs for the orchestrator.
//!
//! [`EnvConfig`] collects the handful of settings that are usually
//! supplied by the environment rather than by the caller: whether
//! child stderr is captured to files, how verbose logging is, where
//! the shared port-lock directory lives and which local port range
//! the probing allocator draws from. A config can be loaded from the
//! environment, from a YAML file, or built in code, and configs can
//! be merged with the later one taking precedence.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ClusterError;

/// Capture child stderr into `<root>/stderrs`.
pub const CAPTURE_STDERR_TO_FILE_ENV: &str = "LOCALCLUSTER_CAPTURE_STDERR_TO_FILE";
/// Enable debug-level logs for children and the client driver.
pub const ENABLE_DEBUG_LOGGING_ENV: &str = "LOCALCLUSTER_ENABLE_DEBUG_LOGGING";
/// Print timestamps and levels in orchestrator logs.
pub const ENABLE_VERBOSE_LOGGING_ENV: &str = "LOCALCLUSTER_ENABLE_VERBOSE_LOGGING";
/// Directory shared by concurrent instances to coordinate port use.
pub const PORT_LOCKS_PATH_ENV: &str = "LOCALCLUSTER_PORT_LOCKS_PATH";
/// Local port range for the probing allocator, as `low-high`.
pub const LOCAL_PORT_RANGE_ENV: &str = "LOCALCLUSTER_LOCAL_PORT_RANGE";
/// Tracing filter directives for orchestrator logs.
pub const LOG_ENV: &str = "LOCALCLUSTER_LOG";

/// An inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: 10000,
            high: 30000,
        }
    }
}

impl PortRange {
    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        usize::from(self.high - self.low) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.low > self.high
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl FromStr for PortRange {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClusterError::Configuration(format!("invalid port range: {:?}", s));
        let (low, high) = s.trim().split_once('-').ok_or_else(invalid)?;
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;
        if low == 0 || low > high {
            return Err(invalid());
        }
        Ok(Self { low, high })
    }
}

/// Environment-level configuration.
///
/// Unset fields fall back to defaults in the accessors, so that
/// [`EnvConfig::merge`] only overrides what the other config
/// actually sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvConfig {
    capture_stderr_to_file: Option<bool>,
    enable_debug_logging: Option<bool>,
    verbose_logging: Option<bool>,
    port_locks_path: Option<PathBuf>,
    local_port_range: Option<PortRange>,
    log_filter: Option<String>,
}

impl EnvConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ClusterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClusterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.capture_stderr_to_file = lookup(CAPTURE_STDERR_TO_FILE_ENV).map(|v| parse_flag(&v));
        config.enable_debug_logging = lookup(ENABLE_DEBUG_LOGGING_ENV).map(|v| parse_flag(&v));
        config.verbose_logging = lookup(ENABLE_VERBOSE_LOGGING_ENV).map(|v| parse_flag(&v));
        config.port_locks_path = lookup(PORT_LOCKS_PATH_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        if let Some(range) = lookup(LOCAL_PORT_RANGE_ENV).filter(|v| !v.is_empty()) {
            config.local_port_range = Some(range.parse()?);
        }
        config.log_filter = lookup(LOG_ENV).filter(|v| !v.is_empty());

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        if let Some(range) = config.local_port_range {
            if range.low == 0 || range.low > range.high {
                anyhow::bail!("invalid port range: {}", range);
            }
        }
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration, with the other taking precedence.
    pub fn merge(&mut self, other: &Self) {
        if other.capture_stderr_to_file.is_some() {
            self.capture_stderr_to_file = other.capture_stderr_to_file;
        }
        if other.enable_debug_logging.is_some() {
            self.enable_debug_logging = other.enable_debug_logging;
        }
        if other.verbose_logging.is_some() {
            self.verbose_logging = other.verbose_logging;
        }
        if other.port_locks_path.is_some() {
            self.port_locks_path = other.port_locks_path.clone();
        }
        if other.local_port_range.is_some() {
            self.local_port_range = other.local_port_range;
        }
        if other.log_filter.is_some() {
            self.log_filter = other.log_filter.clone();
        }
    }

    pub fn with_capture_stderr_to_file(mut self, value: bool) -> Self {
        self.capture_stderr_to_file = Some(value);
        self
    }

    pub fn with_debug_logging(mut self, value: bool) -> Self {
        self.enable_debug_logging = Some(value);
        self
    }

    pub fn with_verbose_logging(mut self, value: bool) -> Self {
        self.verbose_logging = Some(value);
        self
    }

    pub fn with_port_locks_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.port_locks_path = Some(path.into());
        self
    }

    pub fn with_local_port_range(mut self, range: PortRange) -> Self {
        self.local_port_range = Some(range);
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    // Convenience getters

    /// Whether child stderr is written to per-replica files.
    pub fn capture_stderr_to_file(&self) -> bool {
        self.capture_stderr_to_file.unwrap_or(false)
    }

    pub fn enable_debug_logging(&self) -> bool {
        self.enable_debug_logging.unwrap_or(false)
    }

    pub fn verbose_logging(&self) -> bool {
        self.verbose_logging.unwrap_or(false)
    }

    pub fn port_locks_path(&self) -> Option<&Path> {
        self.port_locks_path.as_deref()
    }

    pub fn local_port_range(&self) -> PortRange {
        self.local_port_range.unwrap_or_default()
    }

    /// Filter directives for orchestrator logs. Defaults to `debug`
    /// when debug logging is enabled and to `info` otherwise.
    pub fn log_filter(&self) -> &str {
        match &self.log_filter {
            Some(filter) => filter,
            None if self.enable_debug_logging() => "debug",
            None => "info",
        }
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}
