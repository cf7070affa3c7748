/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration documents: the provider seam, typed overrides and
//! persistence.
//!
//! Documents themselves are opaque to the orchestrator and are held
//! as [`serde_json::Value`] trees; only a handful of well-known keys
//! (ports, log file names, addresses) are ever read back.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::error::ClusterError;
use crate::layout::DirectoryMap;
use crate::ports::PortSource;
use crate::topology::Provision;
use crate::topology::ServiceKind;

/// Generated documents for every service of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub master: MasterConfigs,
    pub clock: ClockConfigs,
    pub node: Vec<Value>,
    pub scheduler: Vec<Value>,
    pub controller_agent: Vec<Value>,
    pub http_proxy: Vec<Value>,
    pub rpc_proxy: Vec<Value>,
    /// Client configuration for talking to rpc proxies.
    pub rpc_client: Option<Value>,
    /// Native driver configs, by cell tag.
    pub driver: BTreeMap<u16, Value>,
    /// Rpc driver configs, by cell tag.
    pub rpc_driver: BTreeMap<u16, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterConfigs {
    pub primary_cell_tag: u16,
    pub secondary_cell_tags: Vec<u16>,
    /// Per cell tag, one document per master.
    pub cells: BTreeMap<u16, Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockConfigs {
    pub cell_tag: u16,
    pub replicas: Vec<Value>,
}

impl ClusterConfiguration {
    /// Tag of the master cell with the given index.
    pub fn cell_tag(&self, cell_index: usize) -> Option<u16> {
        if cell_index == 0 {
            Some(self.master.primary_cell_tag)
        } else {
            self.master.secondary_cell_tags.get(cell_index - 1).copied()
        }
    }

    /// Mutable access to the replica documents of a non-master kind.
    fn replicas_mut(&mut self, kind: ServiceKind) -> Vec<&mut Value> {
        match kind {
            ServiceKind::Master => self
                .master
                .cells
                .values_mut()
                .flat_map(|cell| cell.iter_mut())
                .collect(),
            ServiceKind::Clock => self.clock.replicas.iter_mut().collect(),
            ServiceKind::Node => self.node.iter_mut().collect(),
            ServiceKind::Scheduler => self.scheduler.iter_mut().collect(),
            ServiceKind::ControllerAgent => self.controller_agent.iter_mut().collect(),
            ServiceKind::HttpProxy => self.http_proxy.iter_mut().collect(),
            ServiceKind::RpcProxy => self.rpc_proxy.iter_mut().collect(),
            ServiceKind::Watcher => Vec::new(),
        }
    }
}

/// Rotation settings for the watcher process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub logs_rotate_max_part_count: u32,
    pub logs_rotate_size: String,
    /// Seconds between rotations.
    pub logs_rotate_interval: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            logs_rotate_max_part_count: 1000,
            logs_rotate_size: "100M".to_string(),
            logs_rotate_interval: 600,
        }
    }
}

/// Produces configuration documents for an instance.
///
/// Implementations own every service-specific detail. `build_configs`
/// is called once per fresh instance and must draw all ports from
/// `ports`; resumed instances never call it.
pub trait ConfigProvider: Send + Sync {
    fn build_configs(
        &self,
        ports: &mut dyn PortSource,
        dirs: &DirectoryMap,
        logs_dir: &Path,
        provision: &Provision,
    ) -> anyhow::Result<ClusterConfiguration>;

    /// Written to `//sys/@config` once the primary cell has quorum.
    fn dynamic_master_config(&self) -> Value {
        json!({})
    }

    /// Logging configuration for an in-process driver named `name`.
    fn driver_logging_config(
        &self,
        logs_dir: &Path,
        name: &str,
        enable_debug_logging: bool,
    ) -> Value {
        let mut writers = serde_json::Map::new();
        let mut rules = vec![json!({"min_level": "info", "writers": ["info"]})];
        writers.insert(
            "info".to_string(),
            json!({
                "type": "file",
                "file_name": logs_dir.join(format!("{}.log", name)),
            }),
        );
        if enable_debug_logging {
            writers.insert(
                "debug".to_string(),
                json!({
                    "type": "file",
                    "file_name": logs_dir.join(format!("{}.debug.log", name)),
                }),
            );
            rules.push(json!({"min_level": "debug", "writers": ["debug"]}));
        }
        json!({"rules": rules, "writers": writers})
    }

    fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig::default()
    }
}

/// Callback applied to freshly generated documents.
pub type ModifyConfigs =
    Arc<dyn Fn(&mut ClusterConfiguration) -> anyhow::Result<()> + Send + Sync>;

/// Caller overrides, deep-merged into every document of a kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub master: Option<Value>,
    pub clock: Option<Value>,
    pub node: Option<Value>,
    pub scheduler: Option<Value>,
    pub controller_agent: Option<Value>,
    pub http_proxy: Option<Value>,
    pub rpc_proxy: Option<Value>,
    pub driver: Option<Value>,
    pub rpc_driver: Option<Value>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn for_kind(&self, kind: ServiceKind) -> Option<&Value> {
        match kind {
            ServiceKind::Master => self.master.as_ref(),
            ServiceKind::Clock => self.clock.as_ref(),
            ServiceKind::Node => self.node.as_ref(),
            ServiceKind::Scheduler => self.scheduler.as_ref(),
            ServiceKind::ControllerAgent => self.controller_agent.as_ref(),
            ServiceKind::HttpProxy => self.http_proxy.as_ref(),
            ServiceKind::RpcProxy => self.rpc_proxy.as_ref(),
            ServiceKind::Watcher => None,
        }
    }

    /// Merge every override into the matching documents.
    pub fn apply(&self, configs: &mut ClusterConfiguration) {
        for kind in ServiceKind::SERVERS {
            if let Some(overrides) = self.for_kind(kind) {
                for doc in configs.replicas_mut(kind) {
                    deep_merge(doc, overrides);
                }
            }
        }
        if let Some(overrides) = &self.driver {
            for doc in configs.driver.values_mut() {
                deep_merge(doc, overrides);
            }
        }
        if let Some(overrides) = &self.rpc_driver {
            for doc in configs.rpc_driver.values_mut() {
                deep_merge(doc, overrides);
            }
        }
    }
}

/// Merge `overrides` into `base`. Maps are merged key by key,
/// recursively; any other override value replaces the base value.
pub fn deep_merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

/// Look up a `/`-separated key in a document.
pub fn get_key<'a>(config: &'a Value, service: &str, key: &str) -> Result<&'a Value, ClusterError> {
    let mut current = config;
    for part in key.split('/') {
        current = match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .filter(|value| !value.is_null())
        .ok_or_else(|| {
            ClusterError::Configuration(format!(
                "failed to get required key {:?} from {} config",
                key, service
            ))
        })?;
    }
    Ok(current)
}

/// Persist a document as pretty text YSON.
pub fn write_config(path: &Path, config: &Value) -> Result<(), ClusterError> {
    std::fs::write(path, localcluster_yson::to_string_pretty(config))?;
    Ok(())
}

/// Read a document written by [`write_config`].
pub fn read_config(path: &Path) -> Result<Value, ClusterError> {
    let text = std::fs::read_to_string(path)?;
    localcluster_yson::from_str(&text).map_err(|source| ClusterError::Document {
        path: path.to_path_buf(),
        source,
    })
}

/// Persist `generated` at `path`, or, when resuming, load what an
/// earlier run persisted there. `what` names the document in errors.
pub(crate) fn materialize(
    path: &Path,
    generated: Option<&Value>,
    load_existing: bool,
    what: &str,
) -> Result<Value, ClusterError> {
    if load_existing {
        if !path.is_file() {
            return Err(ClusterError::Configuration(format!(
                "{} config {} not found. It is possible that you requested more {}s \
                 than configs exist",
                what,
                path.display(),
                what
            )));
        }
        return read_config(path);
    }
    let config = generated.ok_or_else(|| {
        ClusterError::Configuration(format!(
            "config provider produced no {} config for {}",
            what,
            path.display()
        ))
    })?;
    write_config(path, config)?;
    Ok(config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_merge() {
        let mut base = json!({
            "rpc_port": 9013,
            "logging": {"rules": [1, 2], "writers": {"info": {"file_name": "a.log"}}},
            "tags": ["x"],
        });
        deep_merge(
            &mut base,
            &json!({
                "logging": {"rules": [3], "writers": {"debug": {"file_name": "b.log"}}},
                "tags": {"replaced": true},
                "new": 1,
            }),
        );
        assert_eq!(
            base,
            json!({
                "rpc_port": 9013,
                "logging": {
                    "rules": [3],
                    "writers": {
                        "info": {"file_name": "a.log"},
                        "debug": {"file_name": "b.log"},
                    },
                },
                "tags": {"replaced": true},
                "new": 1,
            })
        );
    }

    #[test]
    fn test_overrides_apply_per_kind() {
        let mut configs = ClusterConfiguration {
            master: MasterConfigs {
                primary_cell_tag: 1,
                secondary_cell_tags: vec![2],
                cells: BTreeMap::from([(1, vec![json!({"a": 1})]), (2, vec![json!({"a": 2})])]),
            },
            node: vec![json!({"b": {"c": 1}}), json!({"b": {"c": 2}})],
            driver: BTreeMap::from([(1, json!({}))]),
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            master: Some(json!({"a": 0})),
            node: Some(json!({"b": {"d": true}})),
            driver: Some(json!({"api_version": 4})),
            ..Default::default()
        };
        assert!(!overrides.is_empty());
        overrides.apply(&mut configs);

        assert_eq!(configs.master.cells[&2][0], json!({"a": 0}));
        assert_eq!(configs.node[1], json!({"b": {"c": 2, "d": true}}));
        assert_eq!(configs.driver[&1], json!({"api_version": 4}));
        assert_eq!(configs.cell_tag(1), Some(2));
        assert_eq!(configs.cell_tag(2), None);
    }

    #[test]
    fn test_get_key() {
        let config = json!({
            "port": 80,
            "grpc_server": {"addresses": [{"address": "localhost:9000"}]},
        });
        assert_eq!(get_key(&config, "http_proxy", "port").unwrap(), &json!(80));
        assert_eq!(
            get_key(&config, "rpc_proxy", "grpc_server/addresses/0/address").unwrap(),
            &json!("localhost:9000")
        );
        let err = get_key(&config, "node", "logging/writers").unwrap_err();
        assert!(err.to_string().contains("from node config"), "{}", err);
    }

    #[test]
    fn test_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-0.yson");
        let doc = json!({"rpc_port": 10012, "tags": ["a"], "ratio": 0.5});

        let written = materialize(&path, Some(&doc), false, "node").unwrap();
        assert_eq!(written, doc);
        let bytes = std::fs::read(&path).unwrap();

        // Resuming reads the file back and leaves it untouched.
        let loaded = materialize(&path, None, true, "node").unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);

        let err = materialize(&dir.path().join("node-1.yson"), None, true, "node").unwrap_err();
        assert!(
            err.to_string()
                .contains("requested more nodes than configs exist"),
            "{}",
            err
        );

        std::fs::write(&path, "{broken").unwrap();
        assert!(matches!(
            read_config(&path),
            Err(ClusterError::Document { .. })
        ));
    }
}
