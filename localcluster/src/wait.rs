/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Polling readiness conditions.
//!
//! A condition is polled at a fixed interval until it reports
//! [`Readiness::Ready`] or its bound elapses. Errors returned by the
//! condition itself are fatal and end the wait immediately.
//!
//! Waits can run right away with [`wait_for`], or be registered with
//! [`PendingWaits`] and run later as a batch, so that several services
//! can be launched before blocking on any of them.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::ClusterError;

/// Default interval between polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one poll of a readiness condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotYet,
    /// Not ready, with a diagnostic kept for the timeout error.
    NotYetBecause(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    pub fn because(cause: impl Into<String>) -> Self {
        Readiness::NotYetBecause(cause.into())
    }
}

impl From<bool> for Readiness {
    fn from(ready: bool) -> Self {
        if ready {
            Readiness::Ready
        } else {
            Readiness::NotYet
        }
    }
}

/// Poll `condition` every `poll_interval` until it is ready, or fail
/// with [`ClusterError::ReadinessTimeout`] after `max_wait`.
pub async fn wait_for<F, Fut>(
    label: &str,
    max_wait: Duration,
    poll_interval: Duration,
    mut condition: F,
) -> Result<(), ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Readiness, ClusterError>>,
{
    tracing::info!("waiting for {}...", label);
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut cause = None;
    loop {
        match condition().await? {
            Readiness::Ready => {
                tracing::info!("{} ready", label);
                return Ok(());
            }
            Readiness::NotYet => {}
            Readiness::NotYetBecause(reason) => {
                tracing::debug!("{} not ready: {}", label, reason);
                cause = Some(reason);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ClusterError::ReadinessTimeout {
                label: label.to_string(),
                max_wait,
                cause,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Deferred waits, run in registration order by
/// [`PendingWaits::synchronize`].
#[derive(Default)]
pub struct PendingWaits {
    waits: Vec<(String, BoxFuture<'static, Result<(), ClusterError>>)>,
}

impl std::fmt::Debug for PendingWaits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.waits.iter().map(|(label, _)| label))
            .finish()
    }
}

impl PendingWaits {
    pub fn push(
        &mut self,
        label: impl Into<String>,
        wait: BoxFuture<'static, Result<(), ClusterError>>,
    ) {
        self.waits.push((label.into(), wait));
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Labels of the registered waits, in order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.waits.iter().map(|(label, _)| label.as_str())
    }

    /// Run every registered wait in order. The first failure is
    /// returned and the remaining waits are dropped.
    pub async fn synchronize(&mut self) -> Result<(), ClusterError> {
        for (label, wait) in std::mem::take(&mut self.waits) {
            tracing::debug!("synchronizing {}", label);
            wait.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use futures::FutureExt;
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_ready_after_polls() {
        let mut polls = 0;
        wait_for("clock", Duration::from_secs(30), POLL_INTERVAL, || {
            polls += 1;
            let ready = polls >= 3;
            async move { Ok(Readiness::from(ready)) }
        })
        .await
        .unwrap();
        assert_eq!(polls, 3);
        assert!(logs_contain("waiting for clock..."));
        assert!(logs_contain("clock ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_cause() {
        let start = tokio::time::Instant::now();
        let mut polls = 0;
        let err = wait_for("node", Duration::from_secs(20), POLL_INTERVAL, || {
            polls += 1;
            let cause = format!("{} of 3 nodes are online", polls.min(2));
            async move { Ok(Readiness::because(cause)) }
        })
        .await
        .unwrap_err();

        assert!(start.elapsed() >= Duration::from_secs(20));
        match err {
            ClusterError::ReadinessTimeout {
                label,
                max_wait,
                cause,
            } => {
                assert_eq!(label, "node");
                assert_eq!(max_wait, Duration::from_secs(20));
                assert_eq!(cause.as_deref(), Some("2 of 3 nodes are online"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_error_is_fatal() {
        let start = tokio::time::Instant::now();
        let err = wait_for("scheduler", Duration::from_secs(40), POLL_INTERVAL, || async {
            Err::<Readiness, _>(ClusterError::ProcessLaunch {
                process: "scheduler".to_string(),
                pid: 1,
                reason: "unexpectedly exited with code 1".to_string(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::ProcessLaunch { .. }));
        assert!(start.elapsed() < POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronize_runs_in_order_and_stops_at_failure() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingWaits::default();
        for label in ["master", "clock", "node"] {
            let ran = ran.clone();
            pending.push(
                label,
                async move {
                    ran.lock().unwrap().push(label);
                    if label == "clock" {
                        wait_for(label, Duration::from_secs(1), POLL_INTERVAL, || async {
                            Ok(Readiness::NotYet)
                        })
                        .await
                    } else {
                        Ok(())
                    }
                }
                .boxed(),
            );
        }
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.labels().collect::<Vec<_>>(), ["master", "clock", "node"]);

        let err = pending.synchronize().await.unwrap_err();
        assert!(matches!(err, ClusterError::ReadinessTimeout { .. }));
        assert_eq!(*ran.lock().unwrap(), ["master", "clock"]);
        assert!(pending.is_empty());
        pending.synchronize().await.unwrap();
    }
}
