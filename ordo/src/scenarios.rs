// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Canned submission scenarios run against the simulated device.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use ordo_common::settings::{CopyOffloadMode, Settings, SynchronizedDispatchMode};
use ordo_gpu::command_processor::EngineClass;
use ordo_gpu::sync_dispatch::token_value;
use ordo_gpu::{
    BufferSlice, CommandList, CommandListDesc, CommandQueue, Device, DeviceCaps, Event,
    EventFlags, EventPool, KernelLaunch,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// One Immediate list: launch, dependent copy, host synchronize.
    Immediate,
    /// One Regular list executed several times through a queue.
    Regular,
    /// An Immediate list waiting on a Regular list's counter-based event.
    CrossList,
    /// Two Immediate lists sharing the synchronized-dispatch token.
    SyncDispatch,
    /// Unaligned copies under each copy offload mode.
    CopyOffload,
    All,
}

impl Scenario {
    const EACH: [Scenario; 5] = [
        Scenario::Immediate,
        Scenario::Regular,
        Scenario::CrossList,
        Scenario::SyncDispatch,
        Scenario::CopyOffload,
    ];

    fn expand(self) -> Vec<Scenario> {
        match self {
            Scenario::All => Self::EACH.to_vec(),
            other => vec![other],
        }
    }
}

/// Everything a scenario needs besides its own lists.
pub struct ScenarioContext {
    pub settings: Settings,
    pub caps: DeviceCaps,
    pub runs: u32,
}

impl ScenarioContext {
    fn device(&self) -> Result<Arc<Device>> {
        Device::new(self.settings.clone(), self.caps).context("Failed to create device")
    }
}

/// One line of scenario output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct Report {
    pub scenario: Option<Scenario>,
    pub lines: Vec<ReportLine>,
}

impl Report {
    fn new(scenario: Scenario) -> Self {
        Self {
            scenario: Some(scenario),
            lines: Vec::new(),
        }
    }

    fn push(&mut self, label: impl Into<String>, value: impl ToString) {
        self.lines.push(ReportLine {
            label: label.into(),
            value: value.to_string(),
        });
    }

    fn counter(&mut self, label: &str, list: &CommandList) -> Result<()> {
        let counter = list.counter();
        self.push(
            format!("{label} counter"),
            format!(
                "#{} value={} completed={} submissions={} mode={:?}",
                counter.id(),
                counter.current_value(),
                counter.completed_value()?,
                counter.submissions(),
                counter.increment_mode()
            ),
        );
        Ok(())
    }

    fn event(&mut self, label: &str, event: &Event) -> Result<()> {
        self.push(
            format!("{label} event"),
            format!("{:?} packets={}", event.query_status()?, event.packets_used()),
        );
        Ok(())
    }

    pub fn print(&self) {
        if let Some(scenario) = self.scenario {
            println!("== {:?} ==", scenario);
        }
        for line in &self.lines {
            println!("  {:<24} {}", line.label, line.value);
        }
    }
}

pub fn run(scenario: Scenario, ctx: &ScenarioContext) -> Result<Vec<Report>> {
    scenario
        .expand()
        .into_iter()
        .map(|s| {
            info!("Running scenario {:?}", s);
            run_one(s, ctx).with_context(|| format!("Scenario {:?} failed", s))
        })
        .collect()
}

fn run_one(scenario: Scenario, ctx: &ScenarioContext) -> Result<Report> {
    match scenario {
        Scenario::Immediate => immediate(ctx),
        Scenario::Regular => regular(ctx),
        Scenario::CrossList => cross_list(ctx),
        Scenario::SyncDispatch => sync_dispatch(ctx),
        Scenario::CopyOffload => copy_offload(ctx),
        Scenario::All => bail!("`all` is not a single scenario"),
    }
}

fn launch(kernel_id: u32) -> KernelLaunch {
    KernelLaunch {
        kernel_id,
        group_count: 8,
        cooperative: false,
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────

fn immediate(ctx: &ScenarioContext) -> Result<Report> {
    let device = ctx.device()?;
    let mut report = Report::new(Scenario::Immediate);
    let list = CommandList::create(&device, CommandListDesc::immediate())?;
    let pool = EventPool::new(&device, 2, EventFlags::HOST_VISIBLE | EventFlags::TIMESTAMP)?;
    let launched = pool.create_event(0)?;
    let copied = pool.create_event(1)?;

    let src = device.allocate_buffer(256)?;
    let dst = device.allocate_buffer(256)?;
    list.append_memory_fill(BufferSlice::whole(src), 0x0D0E_0A0D, 256, None, &[])?;
    list.append_launch_kernel(&launch(1), Some(&launched), &[])?;
    list.append_memory_copy(
        BufferSlice::whole(dst),
        BufferSlice::whole(src),
        256,
        Some(&copied),
        &[launched.clone()],
    )?;
    report.event("launch (before sync)", &launched)?;
    list.host_synchronize(TIMEOUT)?;

    report.counter("list", &list)?;
    report.event("launch", &launched)?;
    report.event("copy", &copied)?;
    report.push("copy timestamp", copied.query_timestamp()?);
    report.push(
        "copied word",
        format!("{:#010x}", device.memory().read_u32(dst.gpu_va + 252)?),
    );
    Ok(report)
}

fn regular(ctx: &ScenarioContext) -> Result<Report> {
    let device = ctx.device()?;
    let mut report = Report::new(Scenario::Regular);
    let queue = CommandQueue::new(&device);
    let list = CommandList::create(&device, CommandListDesc::regular())?;
    let pool = EventPool::new(&device, 1, EventFlags::HOST_VISIBLE)?;
    let done = pool.create_event(0)?;

    list.append_launch_kernel(&launch(1), None, &[])?;
    list.append_launch_kernel(&launch(2), Some(&done), &[])?;
    list.close()?;
    report.push("patch descriptors", list.patch_count());

    for run in 0..ctx.runs.max(1) {
        queue.execute_command_lists(&[list.clone()])?;
        queue.synchronize(TIMEOUT)?;
        report.push(
            format!("run {run} target"),
            list.counter().host_target(),
        );
    }
    report.counter("list", &list)?;
    report.event("done", &done)?;
    report.push("dispatches", device.gpu().dispatch_trace().len());
    Ok(report)
}

fn cross_list(ctx: &ScenarioContext) -> Result<Report> {
    let device = ctx.device()?;
    let mut report = Report::new(Scenario::CrossList);
    let queue = CommandQueue::new(&device);
    let producer = CommandList::create(&device, CommandListDesc::regular())?;
    let consumer = CommandList::create(&device, CommandListDesc::immediate())?;
    let pool = EventPool::new(&device, 1, EventFlags::COUNTER_BASED)?;
    let produced = pool.create_event(0)?;

    producer.append_launch_kernel(&launch(10), Some(&produced), &[])?;
    producer.close()?;
    queue.execute_command_lists(&[producer.clone()])?;

    consumer.append_launch_kernel(&launch(20), None, &[produced.clone()])?;
    consumer.host_synchronize(TIMEOUT)?;

    let order: Vec<u32> = device
        .gpu()
        .dispatch_trace()
        .iter()
        .map(|d| d.kernel_id)
        .collect();
    report.counter("producer", &producer)?;
    report.counter("consumer", &consumer)?;
    report.event("produced", &produced)?;
    report.push("kernel order", format!("{order:?}"));
    Ok(report)
}

fn sync_dispatch(ctx: &ScenarioContext) -> Result<Report> {
    let device = ctx.device()?;
    let mut report = Report::new(Scenario::SyncDispatch);
    // Single-tile lists never take the token.
    let desc = CommandListDesc {
        partition_count: ctx.caps.partition_count.max(2),
        synchronized_dispatch: SynchronizedDispatchMode::Full,
        ..CommandListDesc::immediate()
    };
    let first = CommandList::create(&device, desc)?;
    let second = CommandList::create(&device, desc)?;

    first.append_launch_kernel(&launch(1), None, &[])?;
    second.append_launch_kernel(&launch(2), None, &[])?;
    first.host_synchronize(TIMEOUT)?;
    second.host_synchronize(TIMEOUT)?;

    report.push("mode", format!("{:?}", first.synchronized_dispatch().mode()));
    report.push("partitions", first.partition_count().to_string());
    report.push(
        "queue ids",
        format!(
            "{} and {}",
            first.synchronized_dispatch().queue_id(),
            second.synchronized_dispatch().queue_id()
        ),
    );
    match device.sync_token() {
        Some(token) => {
            let value = device.memory().read_u64(token.gpu_va)?;
            report.push("token", format!("{value:#018x}"));
            report.push(
                "token held by first",
                format!(
                    "{:#018x}",
                    token_value(first.synchronized_dispatch().queue_id(), first.partition_count())
                ),
            );
        }
        None => report.push("token", "not allocated"),
    }
    report.counter("first", &first)?;
    report.counter("second", &second)?;
    Ok(report)
}

fn copy_offload(ctx: &ScenarioContext) -> Result<Report> {
    let device = ctx.device()?;
    let mut report = Report::new(Scenario::CopyOffload);
    const SIZE: u64 = 10;

    for mode in [
        CopyOffloadMode::Disabled,
        CopyOffloadMode::SingleQueueOffload,
        CopyOffloadMode::DualStream,
    ] {
        let list = CommandList::create(
            &device,
            CommandListDesc {
                copy_offload: Some(mode),
                ..CommandListDesc::immediate()
            },
        )?;
        let src = device.allocate_buffer(64)?;
        let dst = device.allocate_buffer(64)?;
        device.memory().fill(src.gpu_va, 64, 0x5A5A_5A5A)?;

        list.append_launch_kernel(&launch(1), None, &[])?;
        list.append_memory_copy(
            BufferSlice::new(dst, 1),
            BufferSlice::whole(src),
            SIZE,
            None,
            &[],
        )?;
        list.host_synchronize(TIMEOUT)?;

        let mut copied = [0u8; SIZE as usize];
        device.memory().read(dst.gpu_va + 1, &mut copied)?;
        if copied.iter().any(|&b| b != 0x5A) {
            bail!("copy under {:?} produced {:02x?}", mode, copied);
        }
        let engine = match list.engine_for(true) {
            EngineClass::Compute => "compute",
            EngineClass::Copy => "copy",
        };
        report.push(
            format!("{mode:?}"),
            format!(
                "mode={:?} engine={} counter={}",
                list.copy_offload_mode(),
                engine,
                list.counter().completed_value()?
            ),
        );
    }
    Ok(report)
}
