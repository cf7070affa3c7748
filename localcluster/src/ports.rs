/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Port allocation.
//!
//! Config providers draw every port they need from a [`PortSource`].
//! Two sources are provided:
//!
//! - [`SequentialPorts`] counts up from a caller-supplied base port.
//!   It takes no locks; the caller guarantees exclusivity.
//! - [`OpenPortIterator`] scans the local port range in random order,
//!   keeping only ports that can currently be bound. With a shared
//!   lock directory, each yielded port is additionally reserved by an
//!   exclusive `flock` on `<dir>/<port>`, so that concurrent instances
//!   (in this or other processes) never pick the same port. The locks
//!   are held by [`PortLease`]s until [`PortSource::release_all`].

use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::Flock;
use nix::fcntl::FlockArg;
use rand::seq::SliceRandom;

use crate::config::PortRange;
use crate::error::ClusterError;

/// A source of ports for config generation.
pub trait PortSource: Send {
    /// The next port to use. Ports are never repeated until
    /// [`PortSource::release_all`] is called.
    fn next_port(&mut self) -> Result<u16, ClusterError>;

    /// Release every reservation held by this source.
    fn release_all(&mut self);
}

/// Ports counted up from a base port.
#[derive(Debug, Clone)]
pub struct SequentialPorts {
    start: u16,
    next: Option<u16>,
}

impl SequentialPorts {
    pub fn new(start: u16) -> Self {
        Self {
            start,
            next: Some(start),
        }
    }
}

impl PortSource for SequentialPorts {
    fn next_port(&mut self) -> Result<u16, ClusterError> {
        let port = self.next.ok_or(ClusterError::AllocationExhausted {
            low: self.start,
            high: u16::MAX,
        })?;
        self.next = port.checked_add(1);
        Ok(port)
    }

    fn release_all(&mut self) {
        self.next = Some(self.start);
    }
}

/// A port reserved by [`OpenPortIterator`].
pub struct PortLease {
    port: u16,
    lock: Option<(PathBuf, Flock<File>)>,
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.port)
            .field("lock_path", &self.lock_path())
            .finish()
    }
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The advisory lock file backing this lease, if any.
    pub fn lock_path(&self) -> Option<&Path> {
        self.lock.as_ref().map(|(path, _)| path.as_path())
    }

    fn release(self) {
        if let Some((path, lock)) = self.lock {
            // Unlink while the lock is still held.
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::debug!("failed to remove port lock {}: {}", path.display(), err);
            }
            drop(lock);
        }
    }
}

/// Scans the local port range for bindable ports.
#[derive(Debug)]
pub struct OpenPortIterator {
    range: PortRange,
    candidates: Vec<u16>,
    cursor: usize,
    lock_dir: Option<PathBuf>,
    leases: Vec<PortLease>,
}

impl OpenPortIterator {
    /// Create an iterator over `range`. When `lock_dir` is given it is
    /// created if missing.
    pub fn new(range: PortRange, lock_dir: Option<PathBuf>) -> Result<Self, ClusterError> {
        if range.is_empty() || range.low == 0 {
            return Err(ClusterError::Configuration(format!(
                "invalid local port range {}",
                range
            )));
        }
        if let Some(dir) = &lock_dir {
            std::fs::create_dir_all(dir)?;
        }
        let mut iter = Self {
            range,
            candidates: Vec::new(),
            cursor: 0,
            lock_dir,
            leases: Vec::new(),
        };
        iter.shuffle();
        Ok(iter)
    }

    /// Ports currently reserved by this iterator.
    pub fn leases(&self) -> &[PortLease] {
        &self.leases
    }

    fn shuffle(&mut self) {
        self.candidates = (self.range.low..=self.range.high).collect();
        self.candidates.shuffle(&mut rand::thread_rng());
        self.cursor = 0;
    }

    /// Take the advisory lock for `port`. Returns `None` when another
    /// holder has it.
    fn try_lock(dir: &Path, port: u16) -> Result<Option<(PathBuf, Flock<File>)>, ClusterError> {
        let path = dir.join(port.to_string());
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Self::lock_opened(path, file)
    }

    /// Lock an already opened lock file. A holder releasing its lease
    /// unlinks the file, so the lock only counts if `file` is still the
    /// one linked at `path`.
    fn lock_opened(
        path: PathBuf,
        file: File,
    ) -> Result<Option<(PathBuf, Flock<File>)>, ClusterError> {
        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => return Ok(None),
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };
        let held = lock.metadata()?;
        match std::fs::metadata(&path) {
            Ok(linked) if linked.dev() == held.dev() && linked.ino() == held.ino() => {}
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;
        Ok(Some((path, lock)))
    }
}

impl PortSource for OpenPortIterator {
    fn next_port(&mut self) -> Result<u16, ClusterError> {
        while self.cursor < self.candidates.len() {
            let port = self.candidates[self.cursor];
            self.cursor += 1;

            if !is_port_free(port) {
                continue;
            }
            let lock = match &self.lock_dir {
                Some(dir) => match Self::try_lock(dir, port)? {
                    Some(lock) => Some(lock),
                    None => continue,
                },
                None => None,
            };
            self.leases.push(PortLease { port, lock });
            return Ok(port);
        }
        Err(ClusterError::AllocationExhausted {
            low: self.range.low,
            high: self.range.high,
        })
    }

    fn release_all(&mut self) {
        for lease in self.leases.drain(..) {
            lease.release();
        }
        self.shuffle();
    }
}

impl Drop for OpenPortIterator {
    fn drop(&mut self) {
        for lease in self.leases.drain(..) {
            lease.release();
        }
    }
}

/// Whether `port` can currently be bound on the IPv4 wildcard address,
/// and on the IPv6 one when the host supports IPv6.
pub fn is_port_free(port: u16) -> bool {
    if TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_err() {
        return false;
    }
    match TcpListener::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))) {
        Ok(_) => true,
        Err(err) => matches!(
            err.raw_os_error(),
            Some(libc::EAFNOSUPPORT) | Some(libc::EADDRNOTAVAIL)
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_sequential() {
        let mut ports = SequentialPorts::new(u16::MAX - 2);
        assert_eq!(ports.next_port().unwrap(), u16::MAX - 2);
        assert_eq!(ports.next_port().unwrap(), u16::MAX - 1);
        assert_eq!(ports.next_port().unwrap(), u16::MAX);
        assert!(matches!(
            ports.next_port(),
            Err(ClusterError::AllocationExhausted { .. })
        ));
        ports.release_all();
        assert_eq!(ports.next_port().unwrap(), u16::MAX - 2);
    }

    #[test]
    fn test_open_ports_are_distinct() {
        let range = PortRange {
            low: 20000,
            high: 20999,
        };
        let mut ports = OpenPortIterator::new(range, None).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = ports.next_port().unwrap();
            assert!(range.contains(port));
            assert!(seen.insert(port));
        }
        assert_eq!(ports.leases().len(), 20);
    }

    #[test]
    fn test_busy_port_is_skipped() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut ports = OpenPortIterator::new(
            PortRange {
                low: port,
                high: port,
            },
            None,
        )
        .unwrap();
        assert!(matches!(
            ports.next_port(),
            Err(ClusterError::AllocationExhausted { low, high }) if low == port && high == port
        ));
    }

    #[test]
    fn test_locks_are_shared_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let range = PortRange {
            low: port,
            high: port,
        };

        let mut first = OpenPortIterator::new(range, Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(first.next_port().unwrap(), port);
        let lock_path = dir.path().join(port.to_string());
        assert_eq!(first.leases()[0].lock_path(), Some(lock_path.as_path()));
        assert!(lock_path.exists());

        // A second allocator sharing the lock directory must not reuse it.
        let mut second = OpenPortIterator::new(range, Some(dir.path().to_path_buf())).unwrap();
        assert!(matches!(
            second.next_port(),
            Err(ClusterError::AllocationExhausted { .. })
        ));

        first.release_all();
        assert!(!lock_path.exists());
        assert!(first.leases().is_empty());

        let mut third = OpenPortIterator::new(range, Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(third.next_port().unwrap(), port);
    }

    #[test]
    fn test_lock_on_released_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20000");
        let open = || {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .unwrap()
        };

        // Opened just before the previous holder unlinked it.
        let stale = open();
        std::fs::remove_file(&path).unwrap();
        assert!(OpenPortIterator::lock_opened(path.clone(), stale)
            .unwrap()
            .is_none());

        // Unlinked, then recreated by a new holder.
        let stale = open();
        std::fs::remove_file(&path).unwrap();
        let (_, current) = OpenPortIterator::lock_opened(path.clone(), open())
            .unwrap()
            .unwrap();
        assert!(OpenPortIterator::lock_opened(path.clone(), stale)
            .unwrap()
            .is_none());
        drop(current);

        let (locked, _lock) = OpenPortIterator::lock_opened(path.clone(), open())
            .unwrap()
            .unwrap();
        assert_eq!(locked, path);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", std::process::id())
        );
    }

    #[test]
    fn test_invalid_range() {
        assert!(matches!(
            OpenPortIterator::new(PortRange { low: 0, high: 10 }, None),
            Err(ClusterError::Configuration(_))
        ));
    }
}
