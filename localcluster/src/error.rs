/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error types for the local cluster orchestrator.
//!
//! Errors fall in two groups. [`ClusterError`] is returned from
//! `prepare`/`start` and from the individual start operations; a
//! failed start always tears the instance down before the error
//! reaches the caller. [`TeardownWarning`] describes cleanup
//! problems encountered during `stop`; those are logged and never
//! propagated.

use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientError;

/// Errors raised while preparing, starting or inspecting an instance.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The requested topology or options are malformed. Raised
    /// before any process is started.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The probing port allocator ran out of candidates.
    #[error("no free port left in range {low}-{high}")]
    AllocationExhausted { low: u16, high: u16 },

    /// A child exited within its startup grace period, or was found
    /// dead while its readiness was being checked.
    #[error("process {process} ({pid}) is not running: {reason}")]
    ProcessLaunch {
        process: String,
        pid: u32,
        reason: String,
    },

    /// A child failed because one of its ports was taken. Preparing
    /// the instance again with fresh ports may succeed.
    #[error("{process} failed to bind a port (address already in use)")]
    RetriableEnvironment { process: String },

    /// A readiness condition did not hold within its bound.
    #[error("{label} did not become ready within {max_wait:?}{}", cause_suffix(.cause))]
    ReadinessTimeout {
        label: String,
        max_wait: Duration,
        cause: Option<String>,
    },

    /// The cluster client reported a failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A filesystem or process-level operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A persisted configuration document could not be read back.
    #[error("failed to parse {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: localcluster_yson::ParseError,
    },

    /// `start` failed; the instance was stopped before returning.
    #[error("failed to start local cluster: {0}")]
    StartFailed(#[source] Box<ClusterError>),

    /// An uncategorized error, typically from a config provider or a
    /// bootstrap hook.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(": {}", cause),
        None => String::new(),
    }
}

impl ClusterError {
    /// Whether the failure was caused by the environment (a port
    /// conflict) rather than by the cluster itself.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::RetriableEnvironment { .. } => true,
            ClusterError::StartFailed(inner) => inner.is_retriable(),
            _ => false,
        }
    }

    /// Wrap a failure raised during `start`. Already wrapped errors
    /// are passed through unchanged.
    pub(crate) fn start_failed(self) -> Self {
        match self {
            err @ ClusterError::StartFailed(_) => err,
            err => ClusterError::StartFailed(Box::new(err)),
        }
    }
}

/// A non-fatal problem found while tearing an instance down.
#[derive(Debug, thiserror::Error)]
pub enum TeardownWarning {
    /// A containment group directory survived every removal attempt.
    #[error("failed to remove containment group {path} after {attempts} attempts: {source}")]
    GroupNotRemoved {
        path: PathBuf,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    /// Tasks were still enrolled in a group after they were killed.
    #[error("{count} tasks still enrolled in {path}")]
    TasksRemain { path: PathBuf, count: usize },

    /// A tracked process had exited before it was killed.
    #[error("{process} ({pid}) is already terminated")]
    AlreadyTerminated { process: String, pid: u32 },

    /// A teardown step failed; the remaining steps still ran.
    #[error("{step} failed: {error}")]
    Step { step: &'static str, error: String },
}

impl TeardownWarning {
    /// Emit the warning.
    pub fn log(&self) {
        tracing::warn!("{}", self);
    }
}
