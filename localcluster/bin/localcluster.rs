/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Inspect and clean up local cluster working directories left behind
//! by processes that are no longer running.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use localcluster::EnvConfig;
use localcluster::initialize_logging;
use localcluster::recovery;

#[derive(Parser)]
#[command()]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct PathArgs {
    /// Working directory of the instance.
    #[arg(long)]
    path: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = r#"Kill every process recorded in the pid ledger"#)]
    Reap(PathArgs),

    #[clap(about = r#"Reap, then remove the working directory"#)]
    Delete(PathArgs),

    #[clap(about = r#"Print the proxy address of the instance"#)]
    GetAddress(PathArgs),

    #[clap(about = r#"Show which recorded processes are still running"#)]
    Status(PathArgs),
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Reap(args) => {
            let killed = recovery::reap(&args.path)?;
            tracing::info!("killed {} process groups", killed.len());
        }
        Command::Delete(args) => {
            recovery::delete(&args.path)?;
            tracing::info!("removed {}", args.path.display());
        }
        Command::GetAddress(args) => {
            let address = recovery::proxy_address(&args.path)?
                .with_context(|| format!("{} has no http proxy", args.path.display()))?;
            println!("{}", address);
        }
        Command::Status(args) => {
            for entry in recovery::ledger_status(&args.path)? {
                println!(
                    "{}\t{}",
                    entry.pid,
                    if entry.alive { "running" } else { "dead" }
                );
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    initialize_logging(&EnvConfig::from_env()?);
    run(cli.command)
}
