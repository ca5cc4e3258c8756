// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod scenarios;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use ordo_common::settings::{CopyOffloadMode, SynchronizedDispatchMode};
use ordo_gpu::DeviceCaps;
use scenarios::{Scenario, ScenarioContext};

/// ordo - in-order GPU command submission on a simulated device
#[derive(Parser, Debug)]
#[command(name = "ordo", version, about = "Runs command-list submission scenarios on a simulated GPU")]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Path to config file (default: auto-detect ordo.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Tile partitions reported by the simulated device
    #[arg(short, long, default_value_t = 1)]
    partitions: u32,

    /// Executions of each Regular list
    #[arg(long, default_value_t = 3)]
    runs: u32,

    /// Override copy offload (disabled, dual, single)
    #[arg(long)]
    copy_offload: Option<String>,

    /// Override synchronized dispatch (disabled, limited, full)
    #[arg(long)]
    sync_dispatch: Option<String>,

    /// Use 64-bit counter compares
    #[arg(long)]
    qword_counters: bool,

    /// Require a cache flush before host-visible signals
    #[arg(long)]
    dc_flush: bool,

    /// Simulate a device without a copy engine
    #[arg(long)]
    no_copy_engine: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("ordo - in-order command submission");
    info!("==================================");

    let mut settings = config::load_config(args.config.as_ref());
    if let Some(mode) = &args.copy_offload {
        settings.copy_offload = Some(CopyOffloadMode::from_str_or_default(mode));
    }
    if let Some(mode) = &args.sync_dispatch {
        settings.synchronized_dispatch = Some(SynchronizedDispatchMode::from_str_or_default(mode));
    }
    if args.qword_counters {
        settings.qword_counters = true;
    }
    info!(
        "Atomic signaling: {:?}, copy offload: {:?}, sync dispatch: {:?}",
        settings.atomic_signaling, settings.copy_offload, settings.synchronized_dispatch
    );

    let caps = DeviceCaps {
        partition_count: args.partitions,
        dc_flush_required_on_signal: args.dc_flush,
        copy_engine_available: !args.no_copy_engine,
        ..DeviceCaps::default()
    };
    info!("Device: {} partition(s), copy engine: {}", caps.partition_count, caps.copy_engine_available);

    let ctx = ScenarioContext {
        settings,
        caps,
        runs: args.runs,
    };
    let reports = match scenarios::run(args.scenario, &ctx) {
        Ok(reports) => reports,
        Err(err) => {
            if let Some(driver) = err.downcast_ref::<ordo_common::Error>() {
                error!("Scenario failed with result code {}", driver.result_code());
            }
            return Err(err.context(format!("Failed to run {:?}", args.scenario)));
        }
    };
    for report in &reports {
        report.print();
    }

    info!("{} scenario(s) finished", reports.len());
    Ok(())
}
