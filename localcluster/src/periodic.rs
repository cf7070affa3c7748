/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cancellable periodic background work.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;

/// Runs a tick function every period until it breaks or the task is
/// stopped. The first tick happens one period after spawning.
///
/// Dropping the task cancels it without waiting for a tick in flight;
/// [`PeriodicTask::stop`] cancels and waits.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if tick().await.is_break() {
                            tracing::debug!("{} finished", task_name);
                            break;
                        }
                    }
                }
            }
        });
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has exited, on its own or after cancellation.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::warn!("{} panicked: {}", self.name, err);
                }
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keeps a transaction alive by pinging it periodically.
///
/// Failed pings are logged and retried on the next tick. Pinging stops
/// once the transaction no longer exists.
#[derive(Debug)]
pub struct TransactionPinger {
    task: PeriodicTask,
}

impl TransactionPinger {
    pub fn start(
        client: Arc<dyn ClusterClient>,
        transaction_id: impl Into<String>,
        period: Duration,
    ) -> Self {
        let transaction_id = transaction_id.into();
        let name = format!("transaction pinger {}", transaction_id);
        let task = PeriodicTask::spawn(name, period, move || {
            let client = client.clone();
            let transaction_id = transaction_id.clone();
            async move {
                match client.ping_transaction(&transaction_id).await {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) if err.is_not_found() => {
                        tracing::warn!("transaction {} no longer exists", transaction_id);
                        ControlFlow::Break(())
                    }
                    Err(err) => {
                        tracing::warn!("failed to ping transaction {}: {}", transaction_id, err);
                        ControlFlow::Continue(())
                    }
                }
            }
        });
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(self) {
        self.task.stop().await;
    }
}
