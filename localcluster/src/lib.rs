/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lifecycle orchestration for a local, multi-process cluster.
//!
//! An [`Instance`] owns a working directory. It lays out the
//! directories, generates and persists configuration documents
//! through a [`ConfigProvider`], launches every server process in
//! dependency order, waits for each service to become ready, and tears
//! everything down again. Cluster access goes through the
//! [`ClusterClient`] trait; both it and the config provider are
//! supplied by the embedder.

pub mod client;
pub mod config;
pub mod configs;
pub mod containment;
pub mod error;
pub mod instance;
pub mod layout;
pub mod logging;
pub mod periodic;
pub mod ports;
pub mod readiness;
pub mod recovery;
pub mod supervisor;
#[cfg(test)]
mod test_utils;
pub mod topology;
pub mod wait;
pub mod watcher;

pub use client::ClientError;
pub use client::ClientTarget;
pub use client::ClusterClient;
pub use client::ClusterClientFactory;
pub use config::EnvConfig;
pub use configs::ClusterConfiguration;
pub use configs::ConfigOverrides;
pub use configs::ConfigProvider;
pub use error::ClusterError;
pub use error::TeardownWarning;
pub use instance::Instance;
pub use instance::InstanceOptions;
pub use instance::InstanceStatus;
pub use instance::StartOptions;
pub use logging::initialize_logging;
pub use topology::Topology;
