/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The lifecycle of one local cluster instance.
//!
//! An [`Instance`] moves through
//! `NotPrepared -> Prepared -> Starting -> Running -> Stopped`:
//!
//! - [`Instance::prepare`] creates the working directories, asks the
//!   [`ConfigProvider`] for every document (or reads back the documents
//!   of an earlier run when resuming) and persists them.
//! - [`Instance::start`] launches the services in dependency order and
//!   waits for each of them to become ready. Any failure tears the
//!   instance down before the error is returned.
//! - [`Instance::stop`] kills everything in reverse dependency order and
//!   releases every resource the instance holds. Teardown problems are
//!   logged and returned as warnings; they never abort the teardown.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::ops::ControlFlow;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use nix::fcntl::Flock;
use nix::fcntl::FlockArg;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::sync::watch;

use crate::client::ClientTarget;
use crate::client::ClusterClient;
use crate::client::ClusterClientFactory;
use crate::client::DriverLoggingConfig;
use crate::config::EnvConfig;
use crate::configs::ClusterConfiguration;
use crate::configs::ConfigOverrides;
use crate::configs::ConfigProvider;
use crate::configs::ModifyConfigs;
use crate::configs::WatcherConfig;
use crate::configs::get_key;
use crate::configs::materialize;
use crate::configs::read_config;
use crate::configs::write_config;
use crate::containment::CgroupKind;
use crate::containment::ContainmentManager;
use crate::error::ClusterError;
use crate::error::TeardownWarning;
use crate::layout::Layout;
use crate::layout::prepare_directories;
use crate::periodic::PeriodicTask;
use crate::ports::OpenPortIterator;
use crate::ports::PortSource;
use crate::ports::SequentialPorts;
use crate::readiness;
use crate::supervisor::LaunchSpec;
use crate::supervisor::ProcessHandle;
use crate::supervisor::ProcessSupervisor;
use crate::topology::ServiceKind;
use crate::topology::Topology;
use crate::topology::master_name;
use crate::wait::POLL_INTERVAL;
use crate::wait::PendingWaits;
use crate::wait::Readiness;
use crate::wait::wait_for;
use crate::watcher;

const MASTER_WAIT: Duration = Duration::from_secs(30);
const CLOCK_WAIT: Duration = Duration::from_secs(30);
const SCHEDULER_WAIT: Duration = Duration::from_secs(40);
const CONTROLLER_AGENT_WAIT: Duration = Duration::from_secs(20);
const PROXY_WAIT: Duration = Duration::from_secs(20);
const WATCHER_WAIT: Duration = Duration::from_secs(40);
const LOCK_RELEASE_WAIT: Duration = Duration::from_secs(10);

/// Services killed first during stop, in this order. Everything else
/// follows in name order.
const STOP_ORDER: [&str; 7] = [
    "watcher",
    "http_proxy",
    "node",
    "scheduler",
    "controller_agent",
    "master",
    "rpc_proxy",
];

fn node_wait(node_count: usize) -> Duration {
    Duration::from_secs(6 * node_count as u64).max(Duration::from_secs(20))
}

/// Name under which the driver of a master cell is known to
/// [`Instance::create_native_client`].
pub fn driver_name(cell_index: usize) -> String {
    if cell_index == 0 {
        "driver".to_string()
    } else {
        format!("driver_secondary_{}", cell_index - 1)
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    NotPrepared,
    Prepared,
    Starting,
    Running,
    Stopped,
}

/// Per-instance behavior.
#[derive(Clone)]
pub struct InstanceOptions {
    pub topology: Topology,
    /// Resume from an existing working directory instead of wiping it.
    pub preserve_working_dir: bool,
    /// Root of tmpfs-backed working directories, if any.
    pub tmpfs_path: Option<PathBuf>,
    /// Hand out ports sequentially from this base instead of probing.
    pub port_range_start: Option<u16>,
    /// Defaults to the host name.
    pub fqdn: Option<String>,
    /// Directory of the server binaries. Binaries are looked up on
    /// `PATH` when unset.
    pub binary_dir: Option<PathBuf>,
    pub binary_prefix: String,
    /// Prepended to every command line.
    pub command_prefix: Vec<String>,
    /// Children die with this process and pass `--pdeathsig` to
    /// their own children.
    pub kill_child_processes: bool,
    pub run_watcher: bool,
    pub watcher_binary: PathBuf,
    /// Overrides the provider's watcher settings.
    pub watcher_config: Option<WatcherConfig>,
    pub use_cgroups: bool,
    /// Check the cluster through the native driver even when http
    /// proxies exist.
    pub use_native_client: bool,
    pub overrides: ConfigOverrides,
    pub modify_configs: Option<ModifyConfigs>,
    pub startup_grace_period: Duration,
    pub env: EnvConfig,
    /// Overrides [`EnvConfig::capture_stderr_to_file`].
    pub capture_stderr_to_file: Option<bool>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            preserve_working_dir: false,
            tmpfs_path: None,
            port_range_start: None,
            fqdn: None,
            binary_dir: None,
            binary_prefix: "ytserver-".to_string(),
            command_prefix: Vec::new(),
            kill_child_processes: false,
            run_watcher: false,
            watcher_binary: PathBuf::from("yt_env_watcher"),
            watcher_config: None,
            use_cgroups: false,
            use_native_client: false,
            overrides: ConfigOverrides::default(),
            modify_configs: None,
            startup_grace_period: Duration::from_millis(100),
            env: EnvConfig::default(),
            capture_stderr_to_file: None,
        }
    }
}

impl std::fmt::Debug for InstanceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOptions")
            .field("topology", &self.topology)
            .field("preserve_working_dir", &self.preserve_working_dir)
            .field("port_range_start", &self.port_range_start)
            .field("binary_dir", &self.binary_dir)
            .field("command_prefix", &self.command_prefix)
            .field("run_watcher", &self.run_watcher)
            .field("use_cgroups", &self.use_cgroups)
            .field("modify_configs", &self.modify_configs.is_some())
            .finish_non_exhaustive()
    }
}

/// Called once the primary cell is reachable, before the compute tier
/// is launched.
pub type BootstrapHook =
    Box<dyn FnOnce(Arc<dyn ClusterClient>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub struct StartOptions {
    pub start_secondary_cells: bool,
    pub on_primary_ready: Option<BootstrapHook>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            start_secondary_cells: true,
            on_primary_ready: None,
        }
    }
}

/// Cell tags recorded at prepare time so that resuming never needs the
/// config provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    primary_cell_tag: u16,
    secondary_cell_tags: Vec<u16>,
    clock_cell_tag: u16,
}

impl Manifest {
    fn cell_tag(&self, cell_index: usize) -> Result<u16, ClusterError> {
        if cell_index == 0 {
            return Ok(self.primary_cell_tag);
        }
        self.secondary_cell_tags
            .get(cell_index - 1)
            .copied()
            .ok_or_else(|| {
                ClusterError::Configuration(format!(
                    "no cell tag for secondary cell {}",
                    cell_index - 1
                ))
            })
    }
}

/// Everything `prepare` produced.
struct Prepared {
    configs: ClusterConfiguration,
    driver_paths: BTreeMap<String, PathBuf>,
    driver_logging: DriverLoggingConfig,
    dynamic_master_config: Value,
    watcher_config: WatcherConfig,
}

/// One local cluster.
pub struct Instance {
    id: String,
    layout: Layout,
    options: InstanceOptions,
    fqdn: String,
    load_existing: bool,
    provider: Arc<dyn ConfigProvider>,
    clients: Arc<dyn ClusterClientFactory>,
    supervisor: Arc<ProcessSupervisor>,
    containment: Mutex<Option<ContainmentManager>>,
    ports: Mutex<Option<Box<dyn PortSource>>>,
    pending: Mutex<PendingWaits>,
    stop_lock: Mutex<()>,
    prepared: Option<Prepared>,
    status: watch::Sender<InstanceStatus>,
}

impl Instance {
    /// Create an instance rooted at `path`.
    ///
    /// An existing directory is wiped unless
    /// [`InstanceOptions::preserve_working_dir`] is set, in which case
    /// the instance resumes from it.
    pub fn new(
        path: impl Into<PathBuf>,
        options: InstanceOptions,
        provider: Arc<dyn ConfigProvider>,
        clients: Arc<dyn ClusterClientFactory>,
    ) -> Result<Self, ClusterError> {
        options.topology.validate()?;

        let root = path.into();
        let load_existing = root.exists() && options.preserve_working_dir;
        if root.exists() && !options.preserve_working_dir {
            std::fs::remove_dir_all(&root)?;
        }
        let layout = Layout::new(root);
        layout.create()?;

        let id = format!("{:016x}", rand::random::<u64>());
        let fqdn = match &options.fqdn {
            Some(fqdn) => fqdn.clone(),
            None => hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        };

        let containment = if options.use_cgroups {
            let manager = ContainmentManager::new(&id);
            if manager.is_available() {
                Some(manager)
            } else {
                tracing::info!("cgroups are not available, processes run uncontained");
                None
            }
        } else {
            None
        };

        let capture_stderr = options
            .capture_stderr_to_file
            .unwrap_or_else(|| options.env.capture_stderr_to_file());
        let supervisor = Arc::new(ProcessSupervisor::new(
            layout.clone(),
            capture_stderr,
            options.kill_child_processes,
        ));

        Ok(Self {
            id,
            layout,
            options,
            fqdn,
            load_existing,
            provider,
            clients,
            supervisor,
            containment: Mutex::new(containment),
            ports: Mutex::new(None),
            pending: Mutex::new(PendingWaits::default()),
            stop_lock: Mutex::new(()),
            prepared: None,
            status: watch::Sender::new(InstanceStatus::NotPrepared),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn topology(&self) -> &Topology {
        &self.options.topology
    }

    /// Whether the instance resumed from an existing directory.
    pub fn is_resumed(&self) -> bool {
        self.load_existing
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    /// Observe status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<InstanceStatus> {
        self.status.subscribe()
    }

    /// Documents in effect, once prepared.
    pub fn configs(&self) -> Option<&ClusterConfiguration> {
        self.prepared.as_ref().map(|prepared| &prepared.configs)
    }

    pub fn driver_logging_config(&self) -> Option<&DriverLoggingConfig> {
        self.prepared.as_ref().map(|prepared| &prepared.driver_logging)
    }

    /// Hand the driver logging configuration to the client factory.
    /// Driver logging is process-wide: call this at most once per
    /// process.
    pub fn configure_driver_logging(&self) -> Result<(), ClusterError> {
        let prepared = self.prepared()?;
        self.clients.configure_logging(&prepared.driver_logging)?;
        Ok(())
    }

    fn prepared(&self) -> Result<&Prepared, ClusterError> {
        self.prepared
            .as_ref()
            .ok_or_else(|| ClusterError::Configuration("local cluster is not prepared".to_string()))
    }

    fn set_status(&self, status: InstanceStatus) {
        self.status.send_replace(status);
    }

    /// Produce and persist every configuration document. Never starts
    /// a process. On failure, port leases and containment groups taken
    /// so far are released before the error is returned.
    pub fn prepare(&mut self) -> Result<(), ClusterError> {
        let result = self.try_prepare();
        if result.is_err() {
            self.abandon_prepare();
        }
        result
    }

    fn abandon_prepare(&mut self) {
        tracing::info!("releasing resources of unprepared local cluster {}", self.id);
        if let Some(mut ports) = self.ports.get_mut().take() {
            ports.release_all();
        }
        if let Some(containment) = self.containment.get_mut() {
            containment.discard();
        }
    }

    fn try_prepare(&mut self) -> Result<(), ClusterError> {
        let topology = self.options.topology.clone();
        tracing::info!(
            "preparing local cluster {} at {}: {} masters ({} nonvoting) in {} cells, {} clocks, \
             {} nodes, {} schedulers, {} controller agents, {} http proxies, {} rpc proxies",
            self.id,
            self.layout.root().display(),
            topology.master_count,
            topology.nonvoting_master_count,
            topology.cell_count(),
            topology.clock_count,
            topology.node_count,
            topology.scheduler_count,
            topology.controller_agent_count(),
            topology.http_proxy_count,
            topology.rpc_proxy_count(),
        );

        if topology.master_count == 0 {
            tracing::warn!("local cluster has no masters and cannot be started");
            self.prepared = Some(Prepared {
                configs: ClusterConfiguration::default(),
                driver_paths: BTreeMap::new(),
                driver_logging: DriverLoggingConfig::default(),
                dynamic_master_config: json!({}),
                watcher_config: WatcherConfig::default(),
            });
            self.set_status(InstanceStatus::Prepared);
            return Ok(());
        }

        let dirs = prepare_directories(
            &self.layout,
            &topology,
            self.options.tmpfs_path.as_deref(),
            self.load_existing,
        )?;

        let generated = if self.load_existing {
            None
        } else {
            let mut ports: Box<dyn PortSource> = match self.options.port_range_start {
                Some(start) => Box::new(SequentialPorts::new(start)),
                None => Box::new(OpenPortIterator::new(
                    self.options.env.local_port_range(),
                    self.options.env.port_locks_path().map(Path::to_path_buf),
                )?),
            };
            let provision =
                topology.provision(&self.fqdn, self.options.env.enable_debug_logging());
            let built = self.provider.build_configs(
                ports.as_mut(),
                &dirs,
                &self.layout.logs(),
                &provision,
            );
            // Stored before checking the result, so that a failure
            // releases the leases drawn so far.
            *self.ports.get_mut() = Some(ports);
            let mut configs = built?;
            self.options.overrides.apply(&mut configs);
            if let Some(modify) = &self.options.modify_configs {
                modify(&mut configs)?;
            }
            Some(configs)
        };

        let manifest = match &generated {
            Some(configs) => {
                let manifest = Manifest {
                    primary_cell_tag: configs.master.primary_cell_tag,
                    secondary_cell_tags: configs.master.secondary_cell_tags.clone(),
                    clock_cell_tag: configs.clock.cell_tag,
                };
                let value = serde_json::to_value(&manifest).map_err(anyhow::Error::from)?;
                write_config(&self.layout.manifest(), &value)?;
                manifest
            }
            None => {
                let path = self.layout.manifest();
                if !path.is_file() {
                    return Err(ClusterError::Configuration(format!(
                        "cannot resume from {}: {} not found",
                        self.layout.root().display(),
                        path.display()
                    )));
                }
                serde_json::from_value(read_config(&path)?).map_err(anyhow::Error::from)?
            }
        };

        let (configs, driver_paths) =
            self.materialize_all(&topology, generated.as_ref(), &manifest)?;

        let link = self.layout.driver_link();
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(self.layout.config_path("driver", 0), &link)?;

        let logs = self.layout.logs();
        let debug = self.options.env.enable_debug_logging();
        let driver_logging = DriverLoggingConfig {
            native: self.provider.driver_logging_config(&logs, "driver", debug),
            rpc: self.provider.driver_logging_config(&logs, "rpc_driver", debug),
        };

        if let Some(containment) = self.containment.get_mut() {
            containment.prepare(&CgroupKind::ALL)?;
        }

        self.prepared = Some(Prepared {
            configs,
            driver_paths,
            driver_logging,
            dynamic_master_config: self.provider.dynamic_master_config(),
            watcher_config: self
                .options
                .watcher_config
                .clone()
                .unwrap_or_else(|| self.provider.watcher_config()),
        });
        self.set_status(InstanceStatus::Prepared);
        Ok(())
    }

    /// Persist (or, when resuming, load) every server and driver
    /// document.
    fn materialize_all(
        &self,
        topology: &Topology,
        generated: Option<&ClusterConfiguration>,
        manifest: &Manifest,
    ) -> Result<(ClusterConfiguration, BTreeMap<String, PathBuf>), ClusterError> {
        let layout = &self.layout;
        let load_existing = self.load_existing;
        let replicas = |service: &str, what: &str, docs: Option<&Vec<Value>>, count: usize| {
            (0..count)
                .map(|index| {
                    materialize(
                        &layout.config_path(service, index),
                        docs.and_then(|docs| docs.get(index)),
                        load_existing,
                        what,
                    )
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let mut configs = ClusterConfiguration::default();
        configs.master.primary_cell_tag = manifest.primary_cell_tag;
        configs.master.secondary_cell_tags = manifest.secondary_cell_tags.clone();
        for cell in 0..topology.cell_count() {
            let tag = manifest.cell_tag(cell)?;
            let docs = generated.and_then(|g| g.master.cells.get(&tag));
            configs.master.cells.insert(
                tag,
                replicas(&master_name(cell), "master", docs, topology.master_count)?,
            );
        }
        configs.clock.cell_tag = manifest.clock_cell_tag;
        configs.clock.replicas =
            replicas("clock", "clock", generated.map(|g| &g.clock.replicas), topology.clock_count)?;
        configs.node = replicas("node", "node", generated.map(|g| &g.node), topology.node_count)?;
        configs.scheduler = replicas(
            "scheduler",
            "scheduler",
            generated.map(|g| &g.scheduler),
            topology.scheduler_count,
        )?;
        configs.controller_agent = replicas(
            "controller_agent",
            "controller agent",
            generated.map(|g| &g.controller_agent),
            topology.controller_agent_count(),
        )?;
        configs.http_proxy = replicas(
            "http_proxy",
            "http proxy",
            generated.map(|g| &g.http_proxy),
            topology.http_proxy_count,
        )?;
        configs.rpc_proxy = replicas(
            "rpc_proxy",
            "rpc proxy",
            generated.map(|g| &g.rpc_proxy),
            topology.rpc_proxy_count(),
        )?;

        if topology.rpc_proxy_count() > 0 {
            let path = layout.config_path("rpc_client", 0);
            configs.rpc_client = match generated {
                Some(generated) => match &generated.rpc_client {
                    Some(config) => Some(materialize(&path, Some(config), false, "rpc client")?),
                    None => None,
                },
                None if path.is_file() => Some(read_config(&path)?),
                None => None,
            };
        }

        // With an http proxy, rpc drivers discover proxies through it.
        let http_proxy_url = match configs.http_proxy.first() {
            Some(config) => Some(format!(
                "localhost:{}",
                get_key(config, "http_proxy", "port")?
            )),
            None => None,
        };

        let mut driver_paths = BTreeMap::new();
        for cell in 0..topology.cell_count() {
            let tag = manifest.cell_tag(cell)?;
            let path = layout.config_path("driver", cell);
            let config = materialize(
                &path,
                generated.and_then(|g| g.driver.get(&tag)),
                load_existing,
                "driver",
            )?;
            configs.driver.insert(tag, config);
            driver_paths.insert(driver_name(cell), path);

            if topology.rpc_proxy_count() > 0 {
                let rpc_config = generated
                    .and_then(|g| g.rpc_driver.get(&tag))
                    .map(|config| route_through_http_proxy(config, http_proxy_url.as_deref()));
                let path = layout.config_path("rpc_driver", cell);
                let config = materialize(&path, rpc_config.as_ref(), load_existing, "rpc driver")?;
                configs.rpc_driver.insert(tag, config);
                driver_paths.insert(format!("rpc_{}", driver_name(cell)), path);
            }
        }

        if topology.clock_count > 0 {
            let path = layout.config_path("clock_driver", 0);
            let config = materialize(
                &path,
                generated.and_then(|g| g.driver.get(&manifest.clock_cell_tag)),
                load_existing,
                "clock driver",
            )?;
            configs.driver.entry(manifest.clock_cell_tag).or_insert(config);
            driver_paths.insert("clock_driver".to_string(), path);
        }

        Ok((configs, driver_paths))
    }

    /// Launch every service and wait until the cluster is usable.
    ///
    /// On failure the instance is stopped before the error is
    /// returned, wrapped in [`ClusterError::StartFailed`].
    pub async fn start(&self, options: StartOptions) -> Result<(), ClusterError> {
        self.prepared()?;
        if self.options.topology.master_count == 0 {
            tracing::warn!("cannot start local cluster without masters");
            return Ok(());
        }
        if self.status() == InstanceStatus::Running {
            tracing::debug!("local cluster {} is already running", self.id);
            return Ok(());
        }

        self.set_status(InstanceStatus::Starting);
        match self.start_services(options).await {
            Ok(()) => {
                self.supervisor.set_started(true);
                self.set_status(InstanceStatus::Running);
                tracing::info!("local cluster {} started", self.id);
                Ok(())
            }
            Err(err) => {
                tracing::error!("failed to start local cluster {}: {}", self.id, err);
                if let Err(stop_err) = self.stop(true).await {
                    tracing::error!("failed to stop local cluster {}: {}", self.id, stop_err);
                }
                Err(err.start_failed())
            }
        }
    }

    async fn start_services(&self, options: StartOptions) -> Result<(), ClusterError> {
        let topology = &self.options.topology;
        self.supervisor.open_ledger().await?;
        if let Some(containment) = self.containment.lock().await.as_mut() {
            containment.prepare(&CgroupKind::ALL)?;
        }

        if topology.http_proxy_count > 0 {
            self.start_http_proxy(false).await?;
        }
        self.start_master_cell(0, false).await?;
        if topology.clock_count > 0 {
            self.start_clock(false).await?;
        }
        if topology.rpc_proxy_count() > 0 {
            self.start_rpc_proxy(false).await?;
        }
        self.synchronize().await?;

        if options.start_secondary_cells && topology.secondary_cell_count > 0 {
            self.start_secondary_master_cells(false).await?;
            self.synchronize().await?;
        }

        let client = self.cluster_client()?;
        let http_proxy_address = match topology.http_proxy_count {
            0 => None,
            _ => Some(self.http_proxy_address()?),
        };
        readiness::bootstrap_cluster(client.as_ref(), http_proxy_address.as_deref()).await?;
        if let Some(hook) = options.on_primary_ready {
            hook(client).await?;
        }

        if topology.node_count > 0 && !topology.defer_node_start {
            self.start_nodes(false).await?;
        }
        if topology.scheduler_count > 0 {
            self.start_schedulers(false).await?;
        }
        if topology.controller_agent_count() > 0 {
            self.start_controller_agents(false).await?;
        }
        self.synchronize().await?;

        if self.options.run_watcher {
            self.start_watcher().await?;
        }
        self.write_info()?;
        Ok(())
    }

    /// Run every deferred readiness wait, in registration order.
    pub async fn synchronize(&self) -> Result<(), ClusterError> {
        let mut waits = std::mem::take(&mut *self.pending.lock().await);
        waits.synchronize().await
    }

    fn binary_path(&self, component: &str) -> String {
        let binary = format!("{}{}", self.options.binary_prefix, component);
        match &self.options.binary_dir {
            Some(dir) => dir.join(binary).display().to_string(),
            None => binary,
        }
    }

    /// Launch every replica of `service` from its persisted config.
    async fn launch(&self, service: &str, kind: ServiceKind) -> Result<(), ClusterError> {
        let count = self.options.topology.count(kind);
        tracing::info!("starting {} {} replicas", count, service);
        self.supervisor.register(service, count).await;
        for index in 0..count {
            let mut args = self.options.command_prefix.clone();
            args.push(self.binary_path(kind.component()));
            if self.options.kill_child_processes {
                args.extend(["--pdeathsig".to_string(), "9".to_string()]);
            }
            args.push("--config".to_string());
            args.push(self.layout.config_path(service, index).display().to_string());

            let groups = match self.containment.lock().await.as_ref() {
                Some(containment) => containment.replica_groups(service, index)?,
                None => Vec::new(),
            };
            self.supervisor
                .run(
                    LaunchSpec {
                        args,
                        name: service.to_string(),
                        index,
                        groups,
                    },
                    self.options.startup_grace_period,
                )
                .await?;
        }
        Ok(())
    }

    /// Wait for `service` to become ready, now or at the next
    /// [`Instance::synchronize`]. Every poll first checks that the
    /// service's processes are alive; a timeout emits their stderr.
    async fn await_ready<P, Fut>(
        &self,
        service: &str,
        max_wait: Duration,
        sync: bool,
        mut check: P,
    ) -> Result<(), ClusterError>
    where
        P: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Readiness, ClusterError>> + Send + 'static,
    {
        let supervisor = self.supervisor.clone();
        let label = service.to_string();
        let wait = async move {
            let condition = || {
                let supervisor = supervisor.clone();
                let service = label.clone();
                let check = check();
                async move {
                    supervisor.validate_running(&service).await?;
                    check.await
                }
            };
            match wait_for(&label, max_wait, POLL_INTERVAL, condition).await {
                Err(err @ ClusterError::ReadinessTimeout { .. }) => {
                    supervisor.process_stderrs(&label, None).await?;
                    Err(err)
                }
                result => result,
            }
        };

        if sync {
            wait.await
        } else {
            self.pending.lock().await.push(service, wait.boxed());
            Ok(())
        }
    }

    /// Start the masters of one cell. Cell 0 is the primary cell; a
    /// secondary cell is ready once it has quorum and the primary cell
    /// lists it as registered.
    pub async fn start_master_cell(
        &self,
        cell_index: usize,
        sync: bool,
    ) -> Result<(), ClusterError> {
        let prepared = self.prepared()?;
        let name = master_name(cell_index);
        let tag = prepared.configs.cell_tag(cell_index).ok_or_else(|| {
            ClusterError::Configuration(format!("no master cell with index {}", cell_index))
        })?;
        self.launch(&name, ServiceKind::Master).await?;

        let (client, primary) = if cell_index == 0 {
            (self.cluster_client()?, None)
        } else {
            (
                self.create_native_client(&driver_name(cell_index))?,
                Some(self.cluster_client()?),
            )
        };
        let dynamic_config = prepared.dynamic_master_config.clone();
        self.await_ready(&name, MASTER_WAIT, sync, move || {
            let client = client.clone();
            let primary = primary.clone();
            let dynamic_config = dynamic_config.clone();
            async move {
                let quorum = readiness::master_quorum(client.as_ref(), &dynamic_config).await;
                match primary {
                    Some(primary) if quorum.is_ready() => {
                        readiness::secondary_cell_registered(primary.as_ref(), tag).await
                    }
                    _ => Ok(quorum),
                }
            }
        })
        .await
    }

    pub async fn start_secondary_master_cells(&self, sync: bool) -> Result<(), ClusterError> {
        for cell_index in 1..self.options.topology.cell_count() {
            self.start_master_cell(cell_index, sync).await?;
        }
        Ok(())
    }

    pub async fn start_clock(&self, sync: bool) -> Result<(), ClusterError> {
        self.launch("clock", ServiceKind::Clock).await?;
        let client = self.create_native_client("clock_driver")?;
        self.await_ready("clock", CLOCK_WAIT, sync, move || {
            let client = client.clone();
            async move { Ok(readiness::clock_quorum(client.as_ref()).await) }
        })
        .await
    }

    pub async fn start_nodes(&self, sync: bool) -> Result<(), ClusterError> {
        self.launch("node", ServiceKind::Node).await?;
        let client = self.cluster_client()?;
        let expected = self.options.topology.node_count;
        self.await_ready("node", node_wait(expected), sync, move || {
            let client = client.clone();
            async move { readiness::nodes_online(client.as_ref(), expected).await }
        })
        .await
    }

    /// Start the schedulers, after aborting a scheduler lock left by an
    /// earlier run and creating the default pool tree.
    pub async fn start_schedulers(&self, sync: bool) -> Result<(), ClusterError> {
        let client = self.cluster_client()?;
        readiness::abort_stale_scheduler_lock(client.as_ref()).await?;
        readiness::prepare_pool_trees(client.as_ref()).await?;

        self.launch("scheduler", ServiceKind::Scheduler).await?;
        let topology = &self.options.topology;
        let expected = topology.scheduler_count;
        let expected_nodes = (!topology.defer_node_start).then_some(topology.node_count);
        self.await_ready("scheduler", SCHEDULER_WAIT, sync, move || {
            let client = client.clone();
            async move {
                readiness::schedulers_ready(client.as_ref(), expected, expected_nodes).await
            }
        })
        .await
    }

    pub async fn start_controller_agents(&self, sync: bool) -> Result<(), ClusterError> {
        self.launch("controller_agent", ServiceKind::ControllerAgent)
            .await?;
        let client = self.cluster_client()?;
        let expected = self.options.topology.controller_agent_count();
        self.await_ready("controller_agent", CONTROLLER_AGENT_WAIT, sync, move || {
            let client = client.clone();
            async move { readiness::controller_agents_ready(client.as_ref(), expected).await }
        })
        .await
    }

    pub async fn start_http_proxy(&self, sync: bool) -> Result<(), ClusterError> {
        let ports = self.http_proxy_ports()?;
        self.launch("http_proxy", ServiceKind::HttpProxy).await?;
        self.await_ready("http_proxy", PROXY_WAIT, sync, move || {
            let ports = ports.clone();
            async move { Ok(readiness::http_proxies_ready(&ports).await) }
        })
        .await
    }

    pub async fn start_rpc_proxy(&self, sync: bool) -> Result<(), ClusterError> {
        self.launch("rpc_proxy", ServiceKind::RpcProxy).await?;
        let client = self.cluster_client()?;
        let expected = self.options.topology.rpc_proxy_count();
        self.await_ready("rpc_proxy", PROXY_WAIT, sync, move || {
            let client = client.clone();
            async move { readiness::rpc_proxies_ready(client.as_ref(), expected).await }
        })
        .await
    }

    /// Start the log watcher. It is ready once it has created the lock
    /// file.
    pub async fn start_watcher(&self) -> Result<(), ClusterError> {
        let prepared = self.prepared()?;
        let files = watcher::log_files(&prepared.configs, &prepared.driver_logging.native);
        let pids = self.supervisor.pids().await;
        std::fs::write(
            watcher::rotate_config_path(&self.layout),
            watcher::render_rotate_config(&files, &pids, &prepared.watcher_config),
        )?;

        let mut args = self.options.command_prefix.clone();
        args.extend(watcher::watcher_args(
            &self.options.watcher_binary,
            &self.layout,
            &prepared.watcher_config,
        )?);
        self.supervisor.register("watcher", 1).await;
        self.supervisor
            .run(
                LaunchSpec {
                    args,
                    name: "watcher".to_string(),
                    index: 0,
                    groups: Vec::new(),
                },
                self.options.startup_grace_period,
            )
            .await?;

        let supervisor = self.supervisor.clone();
        let lock_file = self.layout.lock_file();
        wait_for("watcher", WATCHER_WAIT, POLL_INTERVAL, || {
            let supervisor = supervisor.clone();
            let lock_file = lock_file.clone();
            async move {
                supervisor.validate_running("watcher").await?;
                Ok(lock_file.exists().into())
            }
        })
        .await
    }

    /// Kill replicas of a tracked service: all of them, or those at
    /// `indexes`.
    pub async fn kill_service(
        &self,
        name: &str,
        indexes: Option<&[usize]>,
    ) -> Vec<TeardownWarning> {
        self.supervisor.kill(name, indexes).await
    }

    pub async fn kill_master_cell(&self, cell_index: usize) -> Vec<TeardownWarning> {
        self.kill_service(&master_name(cell_index), None).await
    }

    pub async fn kill_nodes(&self, indexes: Option<&[usize]>) -> Vec<TeardownWarning> {
        self.kill_service("node", indexes).await
    }

    pub async fn kill_schedulers(&self, indexes: Option<&[usize]>) -> Vec<TeardownWarning> {
        self.kill_service("scheduler", indexes).await
    }

    pub async fn kill_controller_agents(&self, indexes: Option<&[usize]>) -> Vec<TeardownWarning> {
        self.kill_service("controller_agent", indexes).await
    }

    /// Handles of the replicas of a tracked service, by index.
    pub async fn processes(&self, name: &str) -> Vec<Option<ProcessHandle>> {
        self.supervisor.handles(name).await
    }

    /// Scan tracked processes; the first one found dead is passed to
    /// `on_dead`. Returns whether everything is alive.
    pub async fn check_liveness<F>(&self, on_dead: F) -> bool
    where
        F: FnOnce(&ProcessHandle),
    {
        self.supervisor.check_liveness(on_dead).await
    }

    /// Check liveness every `period` until a process is found dead or
    /// the instance is dropped.
    pub fn spawn_liveness_monitor<F>(self: &Arc<Self>, period: Duration, on_dead: F) -> PeriodicTask
    where
        F: Fn(&ProcessHandle) + Send + Sync + 'static,
    {
        let instance = Arc::downgrade(self);
        let on_dead = Arc::new(on_dead);
        PeriodicTask::spawn(format!("liveness monitor {}", self.id), period, move || {
            let instance = instance.clone();
            let on_dead = on_dead.clone();
            async move {
                let Some(instance) = instance.upgrade() else {
                    return ControlFlow::Break(());
                };
                if instance.check_liveness(|handle| on_dead(handle)).await {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            }
        })
    }

    fn http_proxy_ports(&self) -> Result<Vec<u16>, ClusterError> {
        self.prepared()?
            .configs
            .http_proxy
            .iter()
            .map(|config| {
                get_key(config, "http_proxy", "port")?
                    .as_u64()
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| {
                        ClusterError::Configuration(
                            "http proxy port is not a port number".to_string(),
                        )
                    })
            })
            .collect()
    }

    /// `<fqdn>:<port>` of every http proxy.
    pub fn http_proxy_addresses(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .http_proxy_ports()?
            .into_iter()
            .map(|port| format!("{}:{}", self.fqdn, port))
            .collect())
    }

    pub fn http_proxy_address(&self) -> Result<String, ClusterError> {
        self.http_proxy_addresses()?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ClusterError::Configuration("local cluster has no http proxies".to_string())
            })
    }

    /// The gRPC address of the first rpc proxy.
    pub fn grpc_proxy_address(&self) -> Result<String, ClusterError> {
        let config = self.prepared()?.configs.rpc_proxy.first().ok_or_else(|| {
            ClusterError::Configuration("local cluster has no rpc proxies".to_string())
        })?;
        get_key(config, "rpc_proxy", "grpc_server/addresses/0/address")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClusterError::Configuration("grpc address is not a string".to_string()))
    }

    /// A client through the first http proxy, or through the native
    /// driver when there is none.
    pub fn create_client(&self) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        if self.options.topology.http_proxy_count > 0 {
            let address = self.http_proxy_address()?;
            return Ok(self.clients.create_client(&ClientTarget::Http { address })?);
        }
        self.create_native_client("driver")
    }

    /// A client using the named driver config (`driver`,
    /// `driver_secondary_<i>`, `rpc_driver`, `clock_driver`, ...),
    /// read back from disk.
    pub fn create_native_client(
        &self,
        driver: &str,
    ) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let path = self.prepared()?.driver_paths.get(driver).ok_or_else(|| {
            ClusterError::Configuration(format!("unknown driver {}", driver))
        })?;
        let mut config = read_config(path)?;
        if let Value::Object(map) = &mut config {
            map.insert("connection_type".to_string(), json!("native"));
        }
        Ok(self.clients.create_client(&ClientTarget::Native {
            driver: driver.to_string(),
            config,
        })?)
    }

    /// The client readiness checks use.
    fn cluster_client(&self) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        if self.options.use_native_client {
            self.create_native_client("driver")
        } else {
            self.create_client()
        }
    }

    fn write_info(&self) -> Result<(), ClusterError> {
        let addresses = self.http_proxy_addresses()?;
        let mut info = json!({
            "http_proxies": addresses
                .iter()
                .map(|address| json!({"address": address}))
                .collect::<Vec<_>>(),
        });
        if let Some(address) = addresses.first() {
            info["proxy"] = json!({"address": address});
        }
        write_config(&self.layout.info_file(), &info)
    }

    /// Kill every process and release every resource of the instance.
    ///
    /// Does nothing unless the instance finished starting or `force`
    /// is set. Concurrent calls are serialized. Each cleanup step runs
    /// even if an earlier one failed; the problems are logged and
    /// returned. Only a failure to remove the pid ledger is an error.
    pub async fn stop(&self, force: bool) -> Result<Vec<TeardownWarning>, ClusterError> {
        if !self.supervisor.is_started() && !force {
            tracing::debug!("local cluster {} is not started, nothing to stop", self.id);
            return Ok(Vec::new());
        }
        let _guard = self.stop_lock.lock().await;
        tracing::info!("stopping local cluster {}", self.id);

        let mut warnings = Vec::new();
        let services = self.supervisor.services().await;
        let mut order: Vec<&str> = STOP_ORDER
            .iter()
            .copied()
            .filter(|name| services.iter().any(|service| service == name))
            .collect();
        order.extend(
            services
                .iter()
                .map(String::as_str)
                .filter(|name| !STOP_ORDER.iter().any(|ordered| ordered == name)),
        );
        for name in order {
            warnings.extend(self.supervisor.kill(name, None).await);
        }

        if let Some(containment) = self.containment.lock().await.as_mut() {
            warnings.extend(containment.teardown_all().await);
        }

        if let Some(mut ports) = self.ports.lock().await.take() {
            ports.release_all();
        }

        let lock_file = self.layout.lock_file();
        let released = wait_for("lock file release", LOCK_RELEASE_WAIT, POLL_INTERVAL, || {
            let released = lock_released(&lock_file);
            async move { Ok(released.into()) }
        })
        .await;
        if let Err(err) = released {
            let warning = TeardownWarning::Step {
                step: "lock file release",
                error: err.to_string(),
            };
            warning.log();
            warnings.push(warning);
        }

        self.supervisor.set_started(false);
        self.set_status(InstanceStatus::Stopped);
        self.supervisor.close_ledger().await?;
        Ok(warnings)
    }

    /// Stop the instance and remove its working directory.
    pub async fn delete(&self) -> Result<(), ClusterError> {
        self.stop(true).await?;
        std::fs::remove_dir_all(self.layout.root())?;
        tracing::info!("removed {}", self.layout.root().display());
        Ok(())
    }
}

/// Point an rpc driver at the http proxy instead of fixed addresses.
fn route_through_http_proxy(config: &Value, http_proxy_url: Option<&str>) -> Value {
    let mut config = config.clone();
    if let (Some(url), Value::Object(map)) = (http_proxy_url, &mut config) {
        if map.remove("addresses").is_some() {
            map.insert("cluster_url".to_string(), json!(url));
            map.insert("discover_proxies_from_cypress".to_string(), json!(false));
        }
    }
    config
}

/// Whether nobody holds the lock file: it is gone, or an exclusive
/// lock on it can be taken.
fn lock_released(path: &Path) -> bool {
    match File::open(path) {
        Ok(file) => Flock::lock(file, FlockArg::LockExclusiveNonblock).is_ok(),
        Err(err) => err.kind() == std::io::ErrorKind::NotFound,
    }
}
