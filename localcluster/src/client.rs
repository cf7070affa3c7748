/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The cluster client capability.
//!
//! The orchestrator only needs a small slice of what a real client
//! offers: reads and writes on the hierarchical namespace, typed node
//! creation, group membership and a few transaction calls. Clients are
//! produced by a [`ClusterClientFactory`] supplied by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Errors reported by a cluster client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The path does not exist.
    #[error("{path} does not exist")]
    NotFound { path: String },

    /// The cluster could not serve the request yet.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The cluster returned an error with a numeric code.
    #[error("request failed with code {code}: {message}")]
    Response { code: i64, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    /// The error code, if the cluster returned one.
    pub fn code(&self) -> Option<i64> {
        match self {
            ClientError::Response { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// One child returned by [`ClusterClient::list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    /// The requested attributes that are present on the child.
    pub attributes: Map<String, Value>,
}

impl ListEntry {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub recursive: bool,
    pub ignore_existing: bool,
    pub attributes: Option<Value>,
}

/// Operations on a running cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, ClientError>;

    async fn get(&self, path: &str) -> Result<Value, ClientError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), ClientError>;

    /// List the children of `path`, fetching `attributes` for each.
    async fn list(&self, path: &str, attributes: &[String]) -> Result<Vec<ListEntry>, ClientError>;

    /// Create a node of `node_type`. Objects without a path (users,
    /// for instance) pass `None`. Returns the id of the created object.
    async fn create(
        &self,
        node_type: &str,
        path: Option<String>,
        options: CreateOptions,
    ) -> Result<String, ClientError>;

    async fn link(
        &self,
        target: &str,
        link: &str,
        ignore_existing: bool,
    ) -> Result<(), ClientError>;

    async fn add_member(&self, member: &str, group: &str) -> Result<(), ClientError>;

    async fn abort_transaction(&self, transaction_id: &str) -> Result<(), ClientError>;

    async fn ping_transaction(&self, transaction_id: &str) -> Result<(), ClientError>;

    async fn generate_timestamp(&self) -> Result<u64, ClientError>;
}

/// Where a client should connect.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientTarget {
    /// Through an http proxy at `address`.
    Http { address: String },
    /// Directly, with a driver config read from disk.
    Native { driver: String, config: Value },
}

/// Logging setup for in-process drivers.
///
/// Drivers log process-wide; whoever owns the process decides when
/// [`ClusterClientFactory::configure_logging`] is called, and should
/// call it at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverLoggingConfig {
    pub native: Value,
    pub rpc: Value,
}

/// Creates clients for an instance.
pub trait ClusterClientFactory: Send + Sync {
    fn create_client(&self, target: &ClientTarget) -> Result<Arc<dyn ClusterClient>, ClientError>;

    fn configure_logging(&self, _config: &DriverLoggingConfig) -> Result<(), ClientError> {
        Ok(())
    }
}
