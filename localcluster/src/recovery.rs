/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cleanup of working directories whose owning process is gone.
//!
//! Everything here works from what a running instance leaves on disk:
//! the pid ledger and `info.yson`. No in-memory state is needed, so a
//! separate process can clean up after a crashed one.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::signal::killpg;
use nix::unistd::Pid;

use crate::configs::read_config;
use crate::error::ClusterError;
use crate::error::TeardownWarning;
use crate::layout::Layout;
use crate::supervisor::PidLedger;
use crate::supervisor::is_dead_or_zombie;

/// Liveness of one pid recorded in a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub pid: u32,
    pub alive: bool,
}

fn read_ledger(layout: &Layout) -> Result<Vec<u32>, ClusterError> {
    match PidLedger::read(&layout.pids_file()) {
        Ok(pids) => Ok(pids),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Kill the process group of every pid in the ledger under `root` and
/// remove the ledger. Returns the pids that were still alive.
///
/// Processes are spawned as group leaders, so killing the group also
/// takes their children down.
#[tracing::instrument]
pub fn reap(root: &Path) -> Result<Vec<u32>, ClusterError> {
    let layout = Layout::new(root);
    let mut killed = Vec::new();
    for pid in read_ledger(&layout)? {
        if is_dead_or_zombie(pid as i32) {
            continue;
        }
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!("killed process group {}", pid);
                killed.push(pid);
            }
            Err(Errno::ESRCH) => {}
            Err(errno) => TeardownWarning::Step {
                step: "reap",
                error: format!("failed to kill process group {}: {}", pid, errno),
            }
            .log(),
        }
    }

    match std::fs::remove_file(layout.pids_file()) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(killed),
    }
}

/// Reap the leftover processes, then remove the working directory.
pub fn delete(root: &Path) -> Result<(), ClusterError> {
    reap(root)?;
    match std::fs::remove_dir_all(root) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// The proxy address published in `info.yson`, if the instance has an
/// http proxy.
pub fn proxy_address(root: &Path) -> Result<Option<String>, ClusterError> {
    let info = read_config(&Layout::new(root).info_file())?;
    Ok(info
        .pointer("/proxy/address")
        .and_then(|address| address.as_str())
        .map(str::to_string))
}

/// Which of the pids recorded under `root` are still running.
pub fn ledger_status(root: &Path) -> Result<Vec<LedgerEntry>, ClusterError> {
    Ok(read_ledger(&Layout::new(root))?
        .into_iter()
        .map(|pid| LedgerEntry {
            pid,
            alive: !is_dead_or_zombie(pid as i32),
        })
        .collect())
}
