/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Containment of server processes in cgroup-v1 hierarchies.
//!
//! Every instance owns one group per accounting kind, at
//! `<root>/<kind>/<user>/localcluster/<instance-id>`, and every replica
//! gets a child group `<service>-<index>` below it. Children enroll
//! themselves between fork and exec (see [`Enrollment`]), so a
//! process is accounted for before it runs any of its own code.
//!
//! Teardown freezes and kills whatever is still enrolled in the
//! freezer groups and then removes the directories bottom-up. Kernel
//! bookkeeping can lag behind the kill, so each removal is retried a
//! few times; groups that still cannot be removed are reported as
//! [`TeardownWarning`]s and left behind.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::AccessFlags;
use nix::unistd::Pid;
use nix::unistd::access;

use crate::error::ClusterError;
use crate::error::TeardownWarning;
use crate::supervisor::is_dead_or_zombie;

/// Default mount point of the cgroup hierarchies.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const REMOVE_ATTEMPTS: usize = 5;
const REMOVE_BACKOFF: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(100);

/// Resource-accounting hierarchies used for containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CgroupKind {
    CpuAcct,
    Cpu,
    Blkio,
    Freezer,
}

impl CgroupKind {
    pub const ALL: [CgroupKind; 4] = [
        CgroupKind::CpuAcct,
        CgroupKind::Cpu,
        CgroupKind::Blkio,
        CgroupKind::Freezer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CgroupKind::CpuAcct => "cpuacct",
            CgroupKind::Cpu => "cpu",
            CgroupKind::Blkio => "blkio",
            CgroupKind::Freezer => "freezer",
        }
    }
}

impl fmt::Display for CgroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Creates, tracks and removes the containment groups of one instance.
#[derive(Debug)]
pub struct ContainmentManager {
    root: PathBuf,
    user: String,
    instance_id: String,
    groups: Vec<(CgroupKind, PathBuf)>,
}

impl ContainmentManager {
    /// A manager rooted at [`CGROUP_ROOT`] for the current user.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self::with_root(CGROUP_ROOT, whoami::username(), instance_id)
    }

    /// A manager rooted at an arbitrary directory.
    pub fn with_root(
        root: impl Into<PathBuf>,
        user: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            user: user.into(),
            instance_id: instance_id.into(),
            groups: Vec::new(),
        }
    }

    /// Whether containment can be used: we are on Linux, the
    /// hierarchies are mounted and, for every kind, either the user's
    /// own subtree or the hierarchy root is readable and writable.
    pub fn is_available(&self) -> bool {
        if !cfg!(target_os = "linux") || !self.root.exists() {
            return false;
        }
        CgroupKind::ALL.iter().all(|kind| {
            let mut checked = self.root.join(kind.name()).join(&self.user);
            if !checked.exists() {
                checked = self.root.join(kind.name());
            }
            access(&checked, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
        })
    }

    /// The path of the instance group of `kind`, extended by `segments`.
    pub fn group_path(&self, kind: CgroupKind, segments: &[&str]) -> PathBuf {
        let mut path = self
            .root
            .join(kind.name())
            .join(&self.user)
            .join("localcluster")
            .join(&self.instance_id);
        for segment in segments {
            path.push(segment);
        }
        path
    }

    /// Create and register one instance group per kind.
    pub fn prepare(&mut self, kinds: &[CgroupKind]) -> Result<Vec<PathBuf>, ClusterError> {
        let mut created = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let path = self.group_path(kind, &[]);
            std::fs::create_dir_all(&path)?;
            tracing::info!("registered cgroup {}", path.display());
            if !self.groups.iter().any(|(_, registered)| registered == &path) {
                self.groups.push((kind, path.clone()));
            }
            created.push(path);
        }
        Ok(created)
    }

    /// Create the per-replica groups for `<service>-<index>` under every
    /// registered instance group.
    pub fn replica_groups(
        &self,
        service: &str,
        index: usize,
    ) -> Result<Vec<PathBuf>, ClusterError> {
        let segment = format!("{}-{}", service, index);
        let mut paths = Vec::with_capacity(self.groups.len());
        for (kind, _) in &self.groups {
            let path = self.group_path(*kind, &[&segment]);
            std::fs::create_dir_all(&path)?;
            paths.push(path);
        }
        Ok(paths)
    }

    /// Registered instance groups.
    pub fn groups(&self) -> impl Iterator<Item = &Path> {
        self.groups.iter().map(|(_, path)| path.as_path())
    }

    /// Remove every registered group without looking for tasks. For
    /// use before any process was enrolled, when the groups are empty.
    pub fn discard(&mut self) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        for (_, group) in std::mem::take(&mut self.groups) {
            for dir in subtree(&group).into_iter().rev() {
                match std::fs::remove_dir(&dir) {
                    Ok(()) => tracing::info!("removed {}", dir.display()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warnings.push(TeardownWarning::GroupNotRemoved {
                        path: dir,
                        attempts: 1,
                        source: err,
                    }),
                }
            }
        }
        for warning in &warnings {
            warning.log();
        }
        warnings
    }

    /// Stop and kill every task enrolled in the freezer groups, then
    /// remove all registered groups bottom-up. Never fails; problems
    /// are logged and returned as warnings.
    pub async fn teardown_all(&mut self) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();

        let freezer_groups: Vec<PathBuf> = self
            .groups
            .iter()
            .filter(|(kind, _)| *kind == CgroupKind::Freezer)
            .flat_map(|(_, path)| subtree(path))
            .collect();

        let mut pids = Vec::new();
        for group in &freezer_groups {
            tracing::info!("checking tasks in {}", group.display());
            pids.extend(read_tasks(group));
        }
        // Stopping first keeps tasks from forking while we kill them.
        for &pid in &pids {
            tracing::info!("sending SIGSTOP (pid: {})", pid);
            let _ = kill(Pid::from_raw(pid), Signal::SIGSTOP);
        }
        for &pid in &pids {
            tracing::info!("sending SIGKILL (pid: {})", pid);
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }

        let deadline = tokio::time::Instant::now() + KILL_WAIT;
        loop {
            let alive: Vec<i32> = pids
                .iter()
                .copied()
                .filter(|&pid| !is_dead_or_zombie(pid))
                .collect();
            if alive.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                for group in &freezer_groups {
                    let count = read_tasks(group)
                        .into_iter()
                        .filter(|pid| alive.contains(pid))
                        .count();
                    if count > 0 {
                        warnings.push(TeardownWarning::TasksRemain {
                            path: group.clone(),
                            count,
                        });
                    }
                }
                break;
            }
            tokio::time::sleep(KILL_POLL).await;
        }

        for (_, group) in std::mem::take(&mut self.groups) {
            // Post-order: children before their parents, the instance
            // group last.
            for dir in subtree(&group).into_iter().rev() {
                if let Err(warning) = remove_group(&dir).await {
                    warnings.push(warning);
                }
            }
        }

        for warning in &warnings {
            warning.log();
        }
        warnings
    }
}

/// Enrolls the calling process into a set of groups.
///
/// The task-file paths are converted to C strings up front so that
/// [`Enrollment::enroll_self`] only issues `open`, `write` and
/// `close`, which are async-signal-safe and therefore usable in a
/// `pre_exec` hook.
#[derive(Debug, Clone, Default)]
pub struct Enrollment {
    task_files: Vec<CString>,
}

impl Enrollment {
    pub fn new(groups: &[PathBuf]) -> Result<Self, ClusterError> {
        let task_files = groups
            .iter()
            .map(|group| {
                CString::new(group.join("tasks").as_os_str().as_bytes()).map_err(|_| {
                    ClusterError::Configuration(format!(
                        "cgroup path contains a NUL byte: {}",
                        group.display()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { task_files })
    }

    pub fn is_empty(&self) -> bool {
        self.task_files.is_empty()
    }

    /// Write "0" (the calling task) into every group's task list.
    pub fn enroll_self(&self) -> std::io::Result<()> {
        const SELF_TASK: &[u8] = b"0\n";
        for path in &self.task_files {
            // SAFETY: `path` is a valid NUL-terminated string and the
            // buffer outlives the calls. Only async-signal-safe calls
            // are made.
            unsafe {
                let fd = libc::open(
                    path.as_ptr(),
                    libc::O_WRONLY | libc::O_APPEND | libc::O_CLOEXEC,
                );
                if fd < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let written = libc::write(fd, SELF_TASK.as_ptr().cast(), SELF_TASK.len());
                let result = if written < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                };
                libc::close(fd);
                result?;
            }
        }
        Ok(())
    }
}

/// `path` followed by all of its descendant directories, parents first.
fn subtree(path: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![path.to_path_buf()];
    let mut index = 0;
    while index < dirs.len() {
        if let Ok(entries) = std::fs::read_dir(&dirs[index]) {
            let mut children: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect();
            children.sort();
            dirs.extend(children);
        }
        index += 1;
    }
    dirs
}

fn read_tasks(group: &Path) -> Vec<i32> {
    std::fs::read_to_string(group.join("tasks"))
        .map(|tasks| {
            tasks
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

async fn remove_group(dir: &Path) -> Result<(), TeardownWarning> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        tracing::info!("removing {}", dir.display());
        match std::fs::remove_dir(dir) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                tracing::warn!(
                    "failed to remove cgroup dir {}, tasks {:?}: {}",
                    dir.display(),
                    read_tasks(dir),
                    err
                );
                if attempt >= REMOVE_ATTEMPTS {
                    return Err(TeardownWarning::GroupNotRemoved {
                        path: dir.to_path_buf(),
                        attempts: attempt,
                        source: err,
                    });
                }
                tokio::time::sleep(REMOVE_BACKOFF).await;
            }
        }
    }
}
