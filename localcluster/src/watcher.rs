/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Inputs for the watcher process.
//!
//! The watcher is an external binary that holds `<root>/lock_file`
//! while it runs and rotates the logs of every server with logrotate.
//! This module only renders its logrotate config and command line.

use std::fmt::Write;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;

use crate::configs::ClusterConfiguration;
use crate::configs::WatcherConfig;
use crate::layout::Layout;

const LOG_WRITERS: [&str; 2] = ["debug", "info"];

/// File names of the debug and info writers of a logging config.
fn writer_files(logging: Option<&Value>) -> impl Iterator<Item = PathBuf> + '_ {
    LOG_WRITERS.iter().filter_map(move |writer| {
        logging?
            .get("writers")?
            .get(*writer)?
            .get("file_name")?
            .as_str()
            .map(PathBuf::from)
    })
}

/// Every server and driver log file that should be rotated.
pub fn log_files(configs: &ClusterConfiguration, driver_logging: &Value) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = writer_files(Some(driver_logging)).collect();

    let servers = configs
        .master
        .cells
        .values()
        .flatten()
        .chain(&configs.clock.replicas)
        .chain(&configs.scheduler)
        .chain(&configs.controller_agent)
        .chain(&configs.http_proxy)
        .chain(&configs.rpc_proxy);
    for config in servers {
        files.extend(writer_files(config.get("logging")));
    }
    for config in &configs.node {
        files.extend(writer_files(config.get("logging")));
        let job_proxy = config
            .get("exec_agent")
            .and_then(|exec_agent| exec_agent.get("job_proxy_logging"));
        files.extend(writer_files(job_proxy));
    }
    files
}

/// Render a logrotate config for `files`. After each rotation every
/// pid in `pids` that is still running receives SIGHUP so it reopens
/// its logs.
pub fn render_rotate_config(files: &[PathBuf], pids: &[u32], config: &WatcherConfig) -> String {
    let mut options = vec![
        format!("rotate {}", config.logs_rotate_max_part_count),
        format!("size {}", config.logs_rotate_size),
        "missingok".to_string(),
        "copytruncate".to_string(),
        "nodelaycompress".to_string(),
        "nomail".to_string(),
        "noolddir".to_string(),
        "compress".to_string(),
        "create".to_string(),
        "postrotate".to_string(),
    ];
    options.extend(pids.iter().map(|pid| {
        format!(
            "\t/usr/bin/test -d /proc/{0} && kill -HUP {0} >/dev/null 2>&1 || true",
            pid
        )
    }));
    options.push("endscript".to_string());
    let options = options.join("\n");

    let mut rendered = String::new();
    for file in files {
        // Writing to a String cannot fail.
        let _ = write!(rendered, "{}\n{{\n{}\n}}\n\n", file.display(), options);
    }
    rendered
}

/// Path of the rendered logrotate config.
pub fn rotate_config_path(layout: &Layout) -> PathBuf {
    layout.configs().join("logs_rotator")
}

/// Command line of the watcher. Creates its state directory.
pub fn watcher_args(
    binary: &Path,
    layout: &Layout,
    config: &WatcherConfig,
) -> std::io::Result<Vec<String>> {
    let state_dir = layout.runtime_data().join("logs_rotator");
    std::fs::create_dir_all(&state_dir)?;
    let path = |path: PathBuf| path.display().to_string();
    Ok(vec![
        binary.display().to_string(),
        "--lock-file-path".to_string(),
        path(layout.lock_file()),
        "--logrotate-config-path".to_string(),
        path(rotate_config_path(layout)),
        "--logrotate-state-file".to_string(),
        path(state_dir.join("state")),
        "--logrotate-interval".to_string(),
        config.logs_rotate_interval.to_string(),
        "--log-path".to_string(),
        path(layout.logs().join("watcher.log")),
    ])
}
