/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! On-disk layout of an instance.
//!
//! ```text
//! <root>/
//!     logs/
//!     configs/<service>-<index>.yson
//!     runtime_data/<service>/<index>/
//!     stderrs/stderr.<service>[-<index>]
//!     pids.txt
//!     lock_file
//!     info.yson
//!     driver.yson -> configs/driver-0.yson
//! ```
//!
//! The layout is stable so that an instance can be resumed from an
//! existing directory.

use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

use crate::topology::Topology;
use crate::topology::master_name;

/// Paths of an instance rooted at a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn runtime_data(&self) -> PathBuf {
        self.root.join("runtime_data")
    }

    pub fn stderrs(&self) -> PathBuf {
        self.root.join("stderrs")
    }

    /// Newline-delimited ledger of every spawned pid.
    pub fn pids_file(&self) -> PathBuf {
        self.root.join("pids.txt")
    }

    /// Advisory lock file maintained by the watcher.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock_file")
    }

    pub fn info_file(&self) -> PathBuf {
        self.root.join("info.yson")
    }

    pub fn driver_link(&self) -> PathBuf {
        self.root.join("driver.yson")
    }

    /// Cell tags recorded at prepare time, read back on resume.
    pub fn manifest(&self) -> PathBuf {
        self.configs().join("topology.yson")
    }

    pub fn config_path(&self, service: &str, index: usize) -> PathBuf {
        self.configs().join(format!("{}-{}.yson", service, index))
    }

    pub fn replica_dir(&self, service: &str, index: usize) -> PathBuf {
        self.runtime_data().join(service).join(index.to_string())
    }

    pub fn stderr_path(&self, service: &str, index: usize) -> PathBuf {
        self.stderrs()
            .join(format!("stderr.{}", replica_name(service, index)))
    }

    /// Create the top-level directories.
    pub fn create(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.logs(),
            self.configs(),
            self.runtime_data(),
            self.stderrs(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Display name of a replica. The first replica goes by the bare
/// service name.
pub fn replica_name(service: &str, index: usize) -> String {
    if index == 0 {
        service.to_string()
    } else {
        format!("{}-{}", service, index)
    }
}

/// Working directories handed to the config provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryMap {
    /// Per cell, per master.
    pub master: Vec<Vec<PathBuf>>,
    pub master_tmpfs: Option<Vec<Vec<PathBuf>>>,
    pub clock: Vec<PathBuf>,
    pub clock_tmpfs: Option<Vec<PathBuf>>,
    pub node: Vec<PathBuf>,
    pub node_tmpfs: Option<Vec<PathBuf>>,
    pub scheduler: Vec<PathBuf>,
    pub controller_agent: Vec<PathBuf>,
    pub http_proxy: Vec<PathBuf>,
    pub rpc_proxy: Vec<PathBuf>,
}

/// Create every replica working directory of `topology`.
///
/// Tmpfs-backed directories are only created for fresh instances:
/// when resuming, their previous contents are gone and the replicas
/// run from disk.
pub fn prepare_directories(
    layout: &Layout,
    topology: &Topology,
    tmpfs: Option<&Path>,
    load_existing: bool,
) -> std::io::Result<DirectoryMap> {
    let tmpfs = tmpfs.filter(|_| !load_existing);

    let replica_dirs = |root: &Path, service: &str, count: usize| -> std::io::Result<Vec<PathBuf>> {
        (0..count)
            .map(|index| {
                let dir = root.join(service).join(index.to_string());
                std::fs::create_dir_all(&dir)?;
                Ok(dir)
            })
            .collect()
    };

    let runtime = layout.runtime_data();
    let mut map = DirectoryMap::default();

    for cell in 0..topology.cell_count() {
        let name = master_name(cell);
        map.master
            .push(replica_dirs(&runtime, &name, topology.master_count)?);
        if let Some(tmpfs) = tmpfs {
            map.master_tmpfs
                .get_or_insert_with(Vec::new)
                .push(replica_dirs(tmpfs, &name, topology.master_count)?);
        }
    }

    map.clock = replica_dirs(&runtime, "clock", topology.clock_count)?;
    if let Some(tmpfs) = tmpfs {
        map.clock_tmpfs = Some(replica_dirs(tmpfs, "clock", topology.clock_count)?);
    }

    map.node = replica_dirs(&runtime, "node", topology.node_count)?;
    if let Some(tmpfs) = tmpfs {
        map.node_tmpfs = Some(replica_dirs(tmpfs, "node", topology.node_count)?);
    }

    map.scheduler = replica_dirs(&runtime, "scheduler", topology.scheduler_count)?;
    map.controller_agent = replica_dirs(
        &runtime,
        "controller_agent",
        topology.controller_agent_count(),
    )?;
    map.http_proxy = replica_dirs(&runtime, "http_proxy", topology.http_proxy_count)?;
    map.rpc_proxy = replica_dirs(&runtime, "rpc_proxy", topology.rpc_proxy_count())?;

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = Layout::new("/tmp/cluster");
        assert_eq!(
            layout.config_path("node", 2),
            PathBuf::from("/tmp/cluster/configs/node-2.yson")
        );
        assert_eq!(
            layout.replica_dir("master_secondary_0", 1),
            PathBuf::from("/tmp/cluster/runtime_data/master_secondary_0/1")
        );
        assert_eq!(
            layout.stderr_path("node", 0),
            PathBuf::from("/tmp/cluster/stderrs/stderr.node")
        );
        assert_eq!(
            layout.stderr_path("node", 3),
            PathBuf::from("/tmp/cluster/stderrs/stderr.node-3")
        );
        assert_eq!(layout.pids_file(), PathBuf::from("/tmp/cluster/pids.txt"));
    }

    #[test]
    fn test_prepare_directories() {
        let root = tempfile::tempdir().unwrap();
        let tmpfs = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path());
        layout.create().unwrap();

        let topology = Topology {
            master_count: 3,
            secondary_cell_count: 1,
            node_count: 2,
            clock_count: 1,
            ..Default::default()
        };
        let dirs = prepare_directories(&layout, &topology, Some(tmpfs.path()), false).unwrap();
        assert_eq!(dirs.master.len(), 2);
        assert_eq!(dirs.master[1].len(), 3);
        assert_eq!(
            dirs.master[1][2],
            root.path().join("runtime_data/master_secondary_0/2")
        );
        assert!(dirs.master[1][2].is_dir());
        assert_eq!(dirs.controller_agent.len(), 1);
        assert!(dirs.rpc_proxy.is_empty());
        assert_eq!(
            dirs.node_tmpfs.as_ref().unwrap()[1],
            tmpfs.path().join("node/1")
        );
        assert_eq!(dirs.clock_tmpfs.as_ref().unwrap()[0], tmpfs.path().join("clock/0"));
        assert!(dirs.master_tmpfs.as_ref().unwrap()[0][0].is_dir());

        let resumed = prepare_directories(&layout, &topology, Some(tmpfs.path()), true).unwrap();
        assert!(resumed.master_tmpfs.is_none());
        assert!(resumed.node_tmpfs.is_none());
        assert_eq!(resumed.node, dirs.node);
    }
}
