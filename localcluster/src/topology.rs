/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster topology: how many replicas of each service kind to run,
//! and the provisioning tree derived from it for the config provider.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ClusterError;

/// The kinds of server processes an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Master,
    Clock,
    Node,
    Scheduler,
    ControllerAgent,
    HttpProxy,
    RpcProxy,
    Watcher,
}

impl ServiceKind {
    /// Server kinds launched from `ytserver-*` style binaries, in the
    /// order they are prepared.
    pub const SERVERS: [ServiceKind; 7] = [
        ServiceKind::Master,
        ServiceKind::Clock,
        ServiceKind::Node,
        ServiceKind::Scheduler,
        ServiceKind::ControllerAgent,
        ServiceKind::HttpProxy,
        ServiceKind::RpcProxy,
    ];

    /// The name under which replicas of this kind are tracked, and the
    /// directory name under `runtime_data`.
    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Master => "master",
            ServiceKind::Clock => "clock",
            ServiceKind::Node => "node",
            ServiceKind::Scheduler => "scheduler",
            ServiceKind::ControllerAgent => "controller_agent",
            ServiceKind::HttpProxy => "http_proxy",
            ServiceKind::RpcProxy => "rpc_proxy",
            ServiceKind::Watcher => "watcher",
        }
    }

    /// Suffix of the server binary for this kind.
    pub fn component(self) -> &'static str {
        match self {
            ServiceKind::Master => "master",
            ServiceKind::Clock => "clock",
            ServiceKind::Node => "node",
            ServiceKind::Scheduler => "scheduler",
            ServiceKind::ControllerAgent => "controller-agent",
            ServiceKind::HttpProxy => "http-proxy",
            ServiceKind::RpcProxy => "proxy",
            ServiceKind::Watcher => "watcher",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The tracking name of the master cell with the given index. Cell 0
/// is the primary cell.
pub fn master_name(cell_index: usize) -> String {
    if cell_index == 0 {
        "master".to_string()
    } else {
        format!("master_secondary_{}", cell_index - 1)
    }
}

/// Which driver the cluster's default client uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverBackend {
    #[default]
    Native,
    Rpc,
}

/// Resource limits for jobs run by each node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsResourceLimits {
    pub cpu: Option<f64>,
    pub memory: Option<u64>,
    pub user_slots: Option<u64>,
}

/// Node resource provisioning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeResources {
    pub jobs_resource_limits: JobsResourceLimits,
    pub memory_limit_addition: Option<u64>,
    pub chunk_store_quota: Option<u64>,
    pub allow_chunk_storage_in_tmpfs: bool,
    pub port_set_size: Option<usize>,
}

/// Replica counts per service kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Topology {
    /// Masters per cell.
    pub master_count: usize,
    pub nonvoting_master_count: usize,
    pub secondary_cell_count: usize,
    pub clock_count: usize,
    pub node_count: usize,
    /// Prepare nodes but leave starting them to the caller.
    pub defer_node_start: bool,
    pub scheduler_count: usize,
    /// Defaults to one agent when schedulers are requested.
    pub controller_agent_count: Option<usize>,
    pub http_proxy_count: usize,
    /// Fixed HTTP ports, one per proxy.
    pub http_proxy_ports: Option<Vec<u16>>,
    /// Defaults to one proxy with the rpc driver backend, zero otherwise.
    pub rpc_proxy_count: Option<usize>,
    pub cell_tag: u16,
    pub driver_backend: DriverBackend,
    pub node_resources: NodeResources,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            master_count: 1,
            nonvoting_master_count: 0,
            secondary_cell_count: 0,
            clock_count: 0,
            node_count: 1,
            defer_node_start: false,
            scheduler_count: 1,
            controller_agent_count: None,
            http_proxy_count: 0,
            http_proxy_ports: None,
            rpc_proxy_count: None,
            cell_tag: 0,
            driver_backend: DriverBackend::Native,
            node_resources: NodeResources::default(),
        }
    }
}

impl Topology {
    /// Reject degenerate or contradictory topologies. Zero masters is
    /// accepted: such an instance prepares trivially and never starts.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.nonvoting_master_count > self.master_count {
            return Err(ClusterError::Configuration(format!(
                "{} nonvoting masters requested but cells have only {} masters",
                self.nonvoting_master_count, self.master_count
            )));
        }
        if self.driver_backend == DriverBackend::Rpc && self.rpc_proxy_count == Some(0) {
            return Err(ClusterError::Configuration(
                "driver with rpc backend is requested but rpc proxies are disabled".to_string(),
            ));
        }
        if let Some(ports) = &self.http_proxy_ports {
            if ports.len() != self.http_proxy_count {
                return Err(ClusterError::Configuration(format!(
                    "{} http proxy ports given for {} http proxies",
                    ports.len(),
                    self.http_proxy_count
                )));
            }
        }
        if self.secondary_cell_count > 0 && self.master_count == 0 {
            return Err(ClusterError::Configuration(
                "secondary cells require at least one master per cell".to_string(),
            ));
        }
        Ok(())
    }

    pub fn controller_agent_count(&self) -> usize {
        self.controller_agent_count
            .unwrap_or(if self.scheduler_count > 0 { 1 } else { 0 })
    }

    pub fn rpc_proxy_count(&self) -> usize {
        self.rpc_proxy_count.unwrap_or(match self.driver_backend {
            DriverBackend::Rpc => 1,
            DriverBackend::Native => 0,
        })
    }

    /// Number of master cells, the primary included.
    pub fn cell_count(&self) -> usize {
        self.secondary_cell_count + 1
    }

    /// Replica count for a server kind. Masters are counted per cell.
    pub fn count(&self, kind: ServiceKind) -> usize {
        match kind {
            ServiceKind::Master => self.master_count,
            ServiceKind::Clock => self.clock_count,
            ServiceKind::Node => self.node_count,
            ServiceKind::Scheduler => self.scheduler_count,
            ServiceKind::ControllerAgent => self.controller_agent_count(),
            ServiceKind::HttpProxy => self.http_proxy_count,
            ServiceKind::RpcProxy => self.rpc_proxy_count(),
            ServiceKind::Watcher => 1,
        }
    }

    /// Build the provisioning tree handed to the config provider.
    pub fn provision(&self, fqdn: &str, enable_debug_logging: bool) -> Provision {
        Provision {
            master: MasterProvision {
                cell_size: self.master_count,
                secondary_cell_count: self.secondary_cell_count,
                primary_cell_tag: self.cell_tag,
                cell_nonvoting_master_count: self.nonvoting_master_count,
            },
            clock: ClockProvision {
                cell_size: self.clock_count,
            },
            node: NodeProvision {
                count: self.node_count,
                resources: self.node_resources.clone(),
            },
            scheduler: CountProvision {
                count: self.scheduler_count,
            },
            controller_agent: CountProvision {
                count: self.controller_agent_count(),
            },
            http_proxy: HttpProxyProvision {
                count: self.http_proxy_count,
                http_ports: self.http_proxy_ports.clone(),
            },
            rpc_proxy: CountProvision {
                count: self.rpc_proxy_count(),
            },
            driver: DriverProvision {
                backend: self.driver_backend,
            },
            fqdn: fqdn.to_string(),
            enable_debug_logging,
            enable_master_cache: None,
            enable_structured_master_logging: false,
        }
    }
}

/// Typed provisioning tree. The config provider derives every
/// generated document from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provision {
    pub master: MasterProvision,
    pub clock: ClockProvision,
    pub node: NodeProvision,
    pub scheduler: CountProvision,
    pub controller_agent: CountProvision,
    pub http_proxy: HttpProxyProvision,
    pub rpc_proxy: CountProvision,
    pub driver: DriverProvision,
    pub fqdn: String,
    pub enable_debug_logging: bool,
    pub enable_master_cache: Option<bool>,
    pub enable_structured_master_logging: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterProvision {
    pub cell_size: usize,
    pub secondary_cell_count: usize,
    pub primary_cell_tag: u16,
    pub cell_nonvoting_master_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockProvision {
    pub cell_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProvision {
    pub count: usize,
    pub resources: NodeResources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountProvision {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProxyProvision {
    pub count: usize,
    pub http_ports: Option<Vec<u16>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProvision {
    pub backend: DriverBackend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_counts() {
        let topology = Topology::default();
        assert_eq!(topology.controller_agent_count(), 1);
        assert_eq!(topology.rpc_proxy_count(), 0);

        let topology = Topology {
            scheduler_count: 0,
            driver_backend: DriverBackend::Rpc,
            ..Default::default()
        };
        assert_eq!(topology.controller_agent_count(), 0);
        assert_eq!(topology.rpc_proxy_count(), 1);
        assert_eq!(topology.count(ServiceKind::RpcProxy), 1);
    }

    #[test]
    fn test_validate() {
        assert!(Topology::default().validate().is_ok());
        assert!(
            Topology {
                master_count: 0,
                ..Default::default()
            }
            .validate()
            .is_ok()
        );

        let invalid = [
            Topology {
                driver_backend: DriverBackend::Rpc,
                rpc_proxy_count: Some(0),
                ..Default::default()
            },
            Topology {
                master_count: 1,
                nonvoting_master_count: 2,
                ..Default::default()
            },
            Topology {
                http_proxy_count: 2,
                http_proxy_ports: Some(vec![8000]),
                ..Default::default()
            },
            Topology {
                master_count: 0,
                secondary_cell_count: 1,
                ..Default::default()
            },
        ];
        for topology in invalid {
            assert!(
                matches!(topology.validate(), Err(ClusterError::Configuration(_))),
                "{:?}",
                topology
            );
        }
    }

    #[test]
    fn test_master_names() {
        assert_eq!(master_name(0), "master");
        assert_eq!(master_name(1), "master_secondary_0");
        assert_eq!(master_name(3), "master_secondary_2");
    }

    #[test]
    fn test_provision() {
        let topology = Topology {
            master_count: 3,
            secondary_cell_count: 2,
            cell_tag: 10,
            http_proxy_count: 1,
            http_proxy_ports: Some(vec![8080]),
            ..Default::default()
        };
        let provision = topology.provision("host.example.com", true);
        assert_eq!(provision.master.cell_size, 3);
        assert_eq!(provision.master.secondary_cell_count, 2);
        assert_eq!(provision.master.primary_cell_tag, 10);
        assert_eq!(provision.controller_agent.count, 1);
        assert_eq!(provision.http_proxy.http_ports, Some(vec![8080]));
        assert_eq!(provision.fqdn, "host.example.com");
        assert!(provision.enable_debug_logging);
    }
}
