/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fakes shared by the unit tests: an in-memory cluster, a config
//! provider that records its calls, and shell scripts standing in for
//! server binaries.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::client::ClientError;
use crate::client::ClientTarget;
use crate::client::ClusterClient;
use crate::client::ClusterClientFactory;
use crate::client::CreateOptions;
use crate::client::DriverLoggingConfig;
use crate::client::ListEntry;
use crate::configs::ClusterConfiguration;
use crate::configs::ConfigProvider;
use crate::configs::deep_merge;
use crate::layout::DirectoryMap;
use crate::ports::PortSource;
use crate::topology::Provision;

#[derive(Debug, Default)]
struct State {
    /// Flat map from full path to value. Attributes are stored under
    /// `<path>/@<name>`.
    nodes: BTreeMap<String, Value>,
    aborted: Vec<String>,
    members: Vec<(String, String)>,
    pings: BTreeMap<String, usize>,
    next_id: u64,
    timestamp: u64,
}

/// A cluster namespace kept in memory.
///
/// Reads of a path that was never set directly are assembled from the
/// paths below it, skipping attributes.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, path: &str, value: Value) {
        self.state.lock().unwrap().nodes.insert(path.to_string(), value);
    }

    /// The value set at exactly `path`.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().nodes.get(path).cloned()
    }

    pub fn aborted_transactions(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn members(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().members.clone()
    }

    pub fn pings(&self, transaction_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pings
            .get(transaction_id)
            .copied()
            .unwrap_or(0)
    }

    /// Fail every request with [`ClientError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("no leader".to_string()));
        }
        Ok(())
    }
}

fn has_descendants(nodes: &BTreeMap<String, Value>, path: &str) -> bool {
    let prefix = format!("{}/", path);
    nodes.keys().any(|key| key.starts_with(&prefix))
}

fn insert_at(root: &mut Value, path: &str, value: &Value) {
    let mut current = root;
    for segment in path.split('/') {
        if !current.is_object() {
            *current = json!({});
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    if current.is_null() {
        *current = value.clone();
    } else {
        deep_merge(current, value);
    }
}

fn lookup(nodes: &BTreeMap<String, Value>, path: &str) -> Option<Value> {
    if let Some(value) = nodes.get(path) {
        return Some(value.clone());
    }

    let prefix = format!("{}/", path);
    let mut tree = None;
    for (key, value) in nodes {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        if rest.split('/').any(|segment| segment.starts_with('@')) {
            continue;
        }
        insert_at(tree.get_or_insert_with(|| json!({})), rest, value);
    }
    if tree.is_some() {
        return tree;
    }

    // Inside a value set at an ancestor.
    let mut parent = path;
    while let Some((ancestor, _)) = parent.rsplit_once('/') {
        if let Some(value) = nodes.get(ancestor) {
            return path[ancestor.len() + 1..]
                .split('/')
                .try_fold(value, |value, segment| value.get(segment))
                .cloned();
        }
        parent = ancestor;
    }
    None
}

fn not_found(path: &str) -> ClientError {
    ClientError::NotFound {
        path: path.to_string(),
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn exists(&self, path: &str) -> Result<bool, ClientError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.nodes.contains_key(path) || has_descendants(&state.nodes, path))
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        self.check()?;
        lookup(&self.state.lock().unwrap().nodes, path).ok_or_else(|| not_found(path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), ClientError> {
        self.check()?;
        self.seed(path, value);
        Ok(())
    }

    async fn list(&self, path: &str, attributes: &[String]) -> Result<Vec<ListEntry>, ClientError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        let mut children = BTreeMap::new();
        for key in state.nodes.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let child = rest.split('/').next().unwrap_or_default();
            if child.is_empty() || child.starts_with('@') {
                continue;
            }
            children.entry(child.to_string()).or_insert_with(|| {
                let attributes: Map<String, Value> = attributes
                    .iter()
                    .filter_map(|attribute| {
                        let value = state
                            .nodes
                            .get(&format!("{}{}/@{}", prefix, child, attribute))?;
                        Some((attribute.clone(), value.clone()))
                    })
                    .collect();
                ListEntry {
                    name: child.to_string(),
                    attributes,
                }
            });
        }
        Ok(children.into_values().collect())
    }

    async fn create(
        &self,
        node_type: &str,
        path: Option<String>,
        options: CreateOptions,
    ) -> Result<String, ClientError> {
        self.check()?;
        let path = match path {
            Some(path) => path,
            None => {
                let name = options
                    .attributes
                    .as_ref()
                    .and_then(|attributes| attributes.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("{} has no name", node_type))?;
                format!("//sys/{}s/{}", node_type, name)
            }
        };

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("0-0-0-{}", state.next_id);
        if state.nodes.contains_key(&path) || has_descendants(&state.nodes, &path) {
            if options.ignore_existing {
                return Ok(id);
            }
            return Err(ClientError::Response {
                code: 501,
                message: format!("{} already exists", path),
            });
        }
        state.nodes.insert(path, json!({}));
        Ok(id)
    }

    async fn link(
        &self,
        target: &str,
        link: &str,
        ignore_existing: bool,
    ) -> Result<(), ClientError> {
        if self.exists(link).await? && !ignore_existing {
            return Err(ClientError::Response {
                code: 501,
                message: format!("{} already exists", link),
            });
        }
        self.seed(&format!("{}/@target_path", link), json!(target));
        Ok(())
    }

    async fn add_member(&self, member: &str, group: &str) -> Result<(), ClientError> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .members
            .push((member.to_string(), group.to_string()));
        Ok(())
    }

    async fn abort_transaction(&self, transaction_id: &str) -> Result<(), ClientError> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .aborted
            .push(transaction_id.to_string());
        Ok(())
    }

    async fn ping_transaction(&self, transaction_id: &str) -> Result<(), ClientError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.aborted.iter().any(|aborted| aborted == transaction_id) {
            return Err(not_found(&format!("#{}", transaction_id)));
        }
        *state.pings.entry(transaction_id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn generate_timestamp(&self) -> Result<u64, ClientError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.timestamp += 1;
        Ok(state.timestamp)
    }
}

/// Hands out the same [`InMemoryCluster`] for every target.
#[derive(Debug, Default)]
pub struct FakeFactory {
    cluster: Arc<InMemoryCluster>,
    targets: Mutex<Vec<ClientTarget>>,
    logging: Mutex<Vec<DriverLoggingConfig>>,
}

impl FakeFactory {
    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    pub fn targets(&self) -> Vec<ClientTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn logging_configs(&self) -> Vec<DriverLoggingConfig> {
        self.logging.lock().unwrap().clone()
    }
}

impl ClusterClientFactory for FakeFactory {
    fn create_client(&self, target: &ClientTarget) -> Result<Arc<dyn ClusterClient>, ClientError> {
        self.targets.lock().unwrap().push(target.clone());
        let client: Arc<dyn ClusterClient> = self.cluster.clone();
        Ok(client)
    }

    fn configure_logging(&self, config: &DriverLoggingConfig) -> Result<(), ClientError> {
        self.logging.lock().unwrap().push(config.clone());
        Ok(())
    }
}

/// Generates small documents with real ports and log file names, and
/// counts how often it was asked to.
#[derive(Debug, Default)]
pub struct FakeProvider {
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn logging(logs_dir: &Path, name: &str) -> Value {
    json!({
        "rules": [{"min_level": "info", "writers": ["info"]}],
        "writers": {
            "info": {
                "type": "file",
                "file_name": logs_dir.join(format!("{}.log", name)),
            },
        },
    })
}

fn localhost(port: u16) -> String {
    format!("localhost:{}", port)
}

impl ConfigProvider for FakeProvider {
    fn build_configs(
        &self,
        ports: &mut dyn PortSource,
        dirs: &DirectoryMap,
        logs_dir: &Path,
        provision: &Provision,
    ) -> anyhow::Result<ClusterConfiguration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut configs = ClusterConfiguration::default();

        let primary = provision.master.primary_cell_tag;
        configs.master.primary_cell_tag = primary;
        configs.master.secondary_cell_tags = (1..=provision.master.secondary_cell_count)
            .map(|cell| primary + cell as u16)
            .collect();
        for cell in 0..=provision.master.secondary_cell_count {
            let tag = primary + cell as u16;
            let mut masters = Vec::new();
            let mut addresses = Vec::new();
            for index in 0..provision.master.cell_size {
                let port = ports.next_port()?;
                addresses.push(localhost(port));
                masters.push(json!({
                    "rpc_port": port,
                    "cell_tag": tag,
                    "working_dir": dirs.master[cell][index],
                    "logging": logging(logs_dir, &format!("master-{}-{}", cell, index)),
                }));
            }
            configs.master.cells.insert(tag, masters);
            configs.driver.insert(
                tag,
                json!({"primary_master": {"addresses": addresses, "cell_tag": tag}}),
            );
        }

        configs.clock.cell_tag = primary + 1000;
        let mut clock_addresses = Vec::new();
        for index in 0..provision.clock.cell_size {
            let port = ports.next_port()?;
            clock_addresses.push(localhost(port));
            configs.clock.replicas.push(json!({
                "rpc_port": port,
                "logging": logging(logs_dir, &format!("clock-{}", index)),
            }));
        }
        if provision.clock.cell_size > 0 {
            configs.driver.insert(
                configs.clock.cell_tag,
                json!({"clock_manager": {"addresses": clock_addresses}}),
            );
        }

        for index in 0..provision.node.count {
            configs.node.push(json!({
                "rpc_port": ports.next_port()?,
                "working_dir": dirs.node[index],
                "logging": logging(logs_dir, &format!("node-{}", index)),
                "exec_agent": {
                    "job_proxy_logging": logging(logs_dir, &format!("job_proxy-{}", index)),
                },
            }));
        }
        for index in 0..provision.scheduler.count {
            configs.scheduler.push(json!({
                "rpc_port": ports.next_port()?,
                "logging": logging(logs_dir, &format!("scheduler-{}", index)),
            }));
        }
        for index in 0..provision.controller_agent.count {
            configs.controller_agent.push(json!({
                "rpc_port": ports.next_port()?,
                "logging": logging(logs_dir, &format!("controller_agent-{}", index)),
            }));
        }
        for index in 0..provision.http_proxy.count {
            let port = match &provision.http_proxy.http_ports {
                Some(http_ports) => http_ports[index],
                None => ports.next_port()?,
            };
            configs.http_proxy.push(json!({
                "port": port,
                "logging": logging(logs_dir, &format!("http_proxy-{}", index)),
            }));
        }

        let mut rpc_addresses = Vec::new();
        for index in 0..provision.rpc_proxy.count {
            let port = ports.next_port()?;
            let grpc_port = ports.next_port()?;
            rpc_addresses.push(localhost(port));
            configs.rpc_proxy.push(json!({
                "rpc_port": port,
                "grpc_server": {"addresses": [{"address": localhost(grpc_port)}]},
                "logging": logging(logs_dir, &format!("rpc_proxy-{}", index)),
            }));
        }
        if provision.rpc_proxy.count > 0 {
            configs.rpc_client = Some(json!({"addresses": rpc_addresses}));
            for tag in configs.master.cells.keys() {
                configs.rpc_driver.insert(
                    *tag,
                    json!({"addresses": rpc_addresses, "api_version": 4}),
                );
            }
        }

        Ok(configs)
    }
}

const SERVER_COMPONENTS: [&str; 7] = [
    "master",
    "clock",
    "node",
    "scheduler",
    "controller-agent",
    "http-proxy",
    "proxy",
];

/// Write `ytserver-*` scripts that just sleep, and a `watcher` script
/// that creates the lock file passed as its second argument. They are
/// run through `/bin/sh`.
pub fn write_fake_binaries(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    for component in SERVER_COMPONENTS {
        std::fs::write(
            dir.join(format!("ytserver-{}", component)),
            "exec sleep 1000\n",
        )
        .unwrap();
    }
    std::fs::write(dir.join("watcher"), "touch \"$2\"\nexec sleep 1000\n").unwrap();
}
