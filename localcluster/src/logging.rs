/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup for processes embedding the orchestrator.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::EnvConfig;

/// Install a global stderr subscriber configured from `config`.
///
/// In verbose mode every line carries a timestamp, level and target;
/// otherwise only the message is printed. Calling this more than once
/// is harmless: the first subscriber stays installed.
pub fn initialize_logging(config: &EnvConfig) {
    let filter = match EnvFilter::try_new(config.log_filter()) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!(
                "invalid log filter {:?}: {}; falling back to info",
                config.log_filter(),
                err
            );
            EnvFilter::new("info")
        }
    };

    let result = if config.verbose_logging() {
        Registry::default()
            .with(filter)
            .with(fmt::Layer::default().with_writer(std::io::stderr))
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(
                fmt::Layer::default()
                    .without_time()
                    .with_level(false)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if let Err(err) = result {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}

