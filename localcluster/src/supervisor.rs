/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Spawning and tracking of server processes.
//!
//! Each replica runs as the leader of its own session, so it and every
//! process it forks can be killed as a unit with `kill(-pgid, ...)`.
//! Replicas are tracked in per-service slots; a slot is emptied when
//! its process is killed. Every pid is appended to the pid ledger as
//! soon as the process is spawned, so that an external reaper can
//! recover orphans if this process dies without stopping the
//! instance.
//!
//! All tracking state sits behind one lock. The lock is never held
//! while sleeping through a startup grace period.

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::containment::Enrollment;
use crate::error::ClusterError;
use crate::error::TeardownWarning;
use crate::layout::Layout;
use crate::layout::replica_name;

/// Bound on waiting for a killed process to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

const ADDRESS_IN_USE: &str = "Address already in use";

/// A launched replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
    pub index: usize,
    /// The full command line, program first.
    pub args: Vec<String>,
}

impl ProcessHandle {
    /// Replicas lead their own session, so the group id is the pid.
    pub fn pgid(&self) -> u32 {
        self.pid
    }
}

/// What to launch, and where to enroll it.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub args: Vec<String>,
    pub name: String,
    pub index: usize,
    /// Containment groups the child enrolls in before exec.
    pub groups: Vec<PathBuf>,
}

#[derive(Debug)]
struct TrackedProcess {
    child: Child,
    handle: ProcessHandle,
}

#[derive(Debug, Default)]
struct State {
    slots: BTreeMap<String, Vec<Option<TrackedProcess>>>,
    /// Every replica ever launched, first launch first.
    launch_order: Vec<(String, usize)>,
    ledger: Option<PidLedger>,
}

/// Tracks the processes of one instance.
#[derive(Debug)]
pub struct ProcessSupervisor {
    layout: Layout,
    capture_stderr: bool,
    kill_child_processes: bool,
    started: AtomicBool,
    state: Mutex<State>,
}

impl ProcessSupervisor {
    pub fn new(layout: Layout, capture_stderr: bool, kill_child_processes: bool) -> Self {
        Self {
            layout,
            capture_stderr,
            kill_child_processes,
            started: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    /// Mark whether the instance finished starting. Only a started
    /// instance reports replicas that died on their own.
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Reserve `count` slots for `name`.
    pub async fn register(&self, name: &str, count: usize) {
        let mut state = self.state.lock().await;
        let slots = state.slots.entry(name.to_string()).or_default();
        if slots.len() < count {
            slots.resize_with(count, || None);
        }
    }

    /// Start the pid ledger, truncating any previous one.
    pub async fn open_ledger(&self) -> Result<(), ClusterError> {
        let ledger = PidLedger::create(self.layout.pids_file())?;
        self.state.lock().await.ledger = Some(ledger);
        Ok(())
    }

    /// Close and remove the pid ledger. Does nothing when no ledger is
    /// open.
    pub async fn close_ledger(&self) -> Result<(), ClusterError> {
        let ledger = self.state.lock().await.ledger.take();
        if let Some(ledger) = ledger {
            ledger.close_and_remove()?;
        }
        Ok(())
    }

    /// Launch a replica and confirm it survives `grace_period`.
    ///
    /// If the slot already holds a live process, that process's handle
    /// is returned and nothing is spawned. A process that exits within
    /// the grace period is a launch failure; its captured stderr is
    /// emitted, and a port conflict in it turns the failure into
    /// [`ClusterError::RetriableEnvironment`].
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(service = %spec.name, index = spec.index, pid = tracing::field::Empty)
    )]
    pub async fn run(
        &self,
        spec: LaunchSpec,
        grace_period: Duration,
    ) -> Result<ProcessHandle, ClusterError> {
        let process = replica_name(&spec.name, spec.index);
        let mut state = self.state.lock().await;

        if let Some(Some(tracked)) = state
            .slots
            .get(&spec.name)
            .and_then(|slots| slots.get(spec.index))
        {
            tracing::debug!(
                "{} is already running (pid: {})",
                process,
                tracked.handle.pid
            );
            return Ok(tracked.handle.clone());
        }

        let (program, args) = spec.args.split_first().ok_or_else(|| {
            ClusterError::Configuration(format!("empty command line for {}", process))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(self.layout.runtime_data())
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if self.capture_stderr {
            let stderr = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.layout.stderr_path(&spec.name, spec.index))?;
            cmd.stderr(Stdio::from(stderr));
        } else {
            cmd.stderr(Stdio::null());
        }

        let enrollment = Enrollment::new(&spec.groups)?;
        let kill_with_parent = self.kill_child_processes;
        // SAFETY: runs in the child between fork and exec. Only
        // async-signal-safe calls are made: `setsid`, `prctl`, and the
        // `open`/`write`/`close` sequence of the enrollment, whose
        // paths were built before forking.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                #[cfg(target_os = "linux")]
                if kill_with_parent && libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                #[cfg(not(target_os = "linux"))]
                let _ = kill_with_parent;
                enrollment.enroll_self()
            });
        }

        let child = cmd.spawn().map_err(|err| {
            anyhow::Error::new(err).context(format!("failed to spawn {} ({})", process, program))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned {} has no pid", process))?;

        tracing::Span::current().record("pid", pid);
        tracing::info!("{} started (pid: {})", process, pid);

        let handle = ProcessHandle {
            pid,
            name: spec.name.clone(),
            index: spec.index,
            args: spec.args.clone(),
        };
        let slots = state.slots.entry(spec.name.clone()).or_default();
        if slots.len() <= spec.index {
            slots.resize_with(spec.index + 1, || None);
        }
        slots[spec.index] = Some(TrackedProcess {
            child,
            handle: handle.clone(),
        });
        let key = (spec.name.clone(), spec.index);
        if !state.launch_order.contains(&key) {
            state.launch_order.push(key);
        }
        if let Some(ledger) = state.ledger.as_mut() {
            ledger.append(pid)?;
        }
        drop(state);

        tokio::time::sleep(grace_period).await;

        let exited = {
            let mut state = self.state.lock().await;
            match tracked_mut(&mut state, &spec.name, spec.index) {
                Some(tracked) => match tracked.child.try_wait()? {
                    Some(status) => {
                        take_tracked(&mut state, &spec.name, spec.index);
                        Some(status)
                    }
                    None => None,
                },
                None => None,
            }
        };

        if let Some(status) = exited {
            self.process_stderrs(&spec.name, Some(spec.index)).await?;
            return Err(ClusterError::ProcessLaunch {
                process,
                pid,
                reason: format!("{} within {:?} of launch", describe(status), grace_period),
            });
        }
        Ok(handle)
    }

    /// Kill replicas of `name`: all of them, or only those at
    /// `indexes`. Empty slots are skipped, so killing twice is a no-op.
    ///
    /// Each process group receives SIGKILL and the replica is reaped
    /// before this returns. Problems are logged and returned.
    pub async fn kill(&self, name: &str, indexes: Option<&[usize]>) -> Vec<TeardownWarning> {
        let started = self.is_started();
        let mut warnings = Vec::new();
        let mut state = self.state.lock().await;
        let Some(slots) = state.slots.get_mut(name) else {
            return warnings;
        };
        let indexes: Vec<usize> = match indexes {
            Some(indexes) => indexes.to_vec(),
            None => (0..slots.len()).collect(),
        };

        for index in indexes {
            let Some(mut tracked) = slots.get_mut(index).and_then(Option::take) else {
                continue;
            };
            let pid = tracked.handle.pid;
            let process = replica_name(name, index);

            if let Ok(Some(_)) = tracked.child.try_wait() {
                if started {
                    warnings.push(TeardownWarning::AlreadyTerminated {
                        process: process.clone(),
                        pid,
                    });
                }
            }

            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => warnings.push(TeardownWarning::Step {
                    step: "kill",
                    error: format!("failed to kill {} ({}): {}", process, pid, errno),
                }),
            }

            let waited = tokio::time::timeout(KILL_TIMEOUT, tracked.child.wait()).await;
            match waited {
                Ok(Ok(_)) => tracing::info!("{} killed (pid: {})", process, pid),
                Ok(Err(err)) => warnings.push(TeardownWarning::Step {
                    step: "kill",
                    error: format!("failed to reap {} ({}): {}", process, pid, err),
                }),
                Err(_) => {
                    warnings.push(TeardownWarning::Step {
                        step: "kill",
                        error: format!(
                            "{} ({}) still running {:?} after SIGKILL",
                            process, pid, KILL_TIMEOUT
                        ),
                    });
                    // Still tracked, so a later kill or stop retries.
                    slots[index] = Some(tracked);
                }
            }
        }
        drop(state);

        for warning in &warnings {
            warning.log();
        }
        warnings
    }

    /// Scan tracked processes in launch order. The first one found
    /// dead is passed to `on_dead` and the scan stops there. Returns
    /// whether every tracked process is alive.
    pub async fn check_liveness<F>(&self, on_dead: F) -> bool
    where
        F: FnOnce(&ProcessHandle),
    {
        let mut state = self.state.lock().await;
        let order = state.launch_order.clone();
        for (name, index) in order {
            let Some(tracked) = tracked_mut(&mut state, &name, index) else {
                continue;
            };
            match tracked.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::error!(
                        "{} (pid: {}) {}, args: {:?}",
                        replica_name(&name, index),
                        tracked.handle.pid,
                        describe(status),
                        tracked.handle.args
                    );
                    on_dead(&tracked.handle);
                    return false;
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    "failed to poll {} (pid: {}): {}",
                    replica_name(&name, index),
                    tracked.handle.pid,
                    err
                ),
            }
        }
        true
    }

    /// Fail if any tracked replica of `name` has exited. Captured
    /// stderr of the service is emitted first.
    pub async fn validate_running(&self, name: &str) -> Result<(), ClusterError> {
        let dead = {
            let mut state = self.state.lock().await;
            let mut dead = None;
            if let Some(slots) = state.slots.get_mut(name) {
                for tracked in slots.iter_mut().flatten() {
                    if let Some(status) = tracked.child.try_wait()? {
                        dead = Some((tracked.handle.clone(), status));
                        break;
                    }
                }
            }
            dead
        };

        match dead {
            None => Ok(()),
            Some((handle, status)) => {
                self.process_stderrs(name, None).await?;
                Err(ClusterError::ProcessLaunch {
                    process: replica_name(name, handle.index),
                    pid: handle.pid,
                    reason: format!("unexpectedly {}", describe(status)),
                })
            }
        }
    }

    /// Emit captured stderr of one replica, or of every replica of
    /// `name`. Fails with [`ClusterError::RetriableEnvironment`] when
    /// any of it reports a port conflict.
    pub async fn process_stderrs(
        &self,
        name: &str,
        index: Option<usize>,
    ) -> Result<(), ClusterError> {
        if !self.capture_stderr {
            return Ok(());
        }
        let indexes: Vec<usize> = match index {
            Some(index) => vec![index],
            None => {
                let state = self.state.lock().await;
                (0..state.slots.get(name).map_or(0, Vec::len)).collect()
            }
        };

        let mut port_conflict = false;
        for index in indexes {
            let Ok(stderr) = std::fs::read_to_string(self.layout.stderr_path(name, index)) else {
                continue;
            };
            if stderr.is_empty() {
                continue;
            }
            tracing::error!("{} stderr:\n{}", capitalize(&replica_name(name, index)), stderr);
            port_conflict |= stderr.contains(ADDRESS_IN_USE);
        }

        if port_conflict {
            return Err(ClusterError::RetriableEnvironment {
                process: name.to_string(),
            });
        }
        Ok(())
    }

    /// Handles of the live-tracked replicas of `name`, by index.
    pub async fn handles(&self, name: &str) -> Vec<Option<ProcessHandle>> {
        let state = self.state.lock().await;
        state
            .slots
            .get(name)
            .map(|slots| {
                slots
                    .iter()
                    .map(|slot| slot.as_ref().map(|tracked| tracked.handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pids of every tracked replica.
    pub async fn pids(&self) -> Vec<u32> {
        let state = self.state.lock().await;
        state
            .slots
            .values()
            .flatten()
            .flatten()
            .map(|tracked| tracked.handle.pid)
            .collect()
    }

    /// Names of every registered service.
    pub async fn services(&self) -> Vec<String> {
        self.state.lock().await.slots.keys().cloned().collect()
    }
}

fn tracked_mut<'a>(
    state: &'a mut State,
    name: &str,
    index: usize,
) -> Option<&'a mut TrackedProcess> {
    state
        .slots
        .get_mut(name)
        .and_then(|slots| slots.get_mut(index))
        .and_then(Option::as_mut)
}

fn take_tracked(state: &mut State, name: &str, index: usize) -> Option<TrackedProcess> {
    state
        .slots
        .get_mut(name)
        .and_then(|slots| slots.get_mut(index))
        .and_then(Option::take)
}

fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(signal)) => format!("was killed by signal {}", signal),
        _ => "exited".to_string(),
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Whether `pid` no longer names a running process: it does not exist,
/// or it is a zombie waiting to be reaped.
pub fn is_dead_or_zombie(pid: i32) -> bool {
    if let Err(Errno::ESRCH) = kill(Pid::from_raw(pid), None) {
        return true;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The state follows the parenthesized command name, which may
        // itself contain parentheses.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| matches!(state, 'Z' | 'X')),
        Err(err) => err.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Newline-delimited record of spawned pids.
#[derive(Debug)]
pub struct PidLedger {
    path: PathBuf,
    file: File,
}

impl PidLedger {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self { path, file })
    }

    /// Append `pid` and flush it to the file.
    pub fn append(&mut self, pid: u32) -> std::io::Result<()> {
        writeln!(self.file, "{}", pid)?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close_and_remove(self) -> std::io::Result<()> {
        let Self { path, file } = self;
        drop(file);
        match std::fs::remove_file(&path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Read a ledger left on disk. Unparsable lines are skipped.
    pub fn read(path: &Path) -> std::io::Result<Vec<u32>> {
        Ok(std::fs::read_to_string(path)?
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }
}
