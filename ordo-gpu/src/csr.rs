// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Submission contexts.
//!
//! A submission context owns the task numbering of one hardware queue on one
//! engine. Command lists submit finished buffers through it, make the buffers
//! those commands reference resident, and register as clients so the context
//! knows when relaxed ordering may be used.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ordo_common::{Error, Result, TaskCount};

use crate::command_processor::{ContextId, EngineClass, SimGpu};
use crate::memory_manager::{GpuBuffer, ResidencyTracker};

/// Result of waiting on GPU progress from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
    DeviceLost,
}

impl WaitStatus {
    pub fn into_result(self) -> Result<()> {
        match self {
            WaitStatus::Ready => Ok(()),
            WaitStatus::NotReady => Err(Error::NotReady),
            WaitStatus::GpuHang => Err(Error::GpuHang),
            WaitStatus::DeviceLost => Err(Error::DeviceLost),
        }
    }
}

/// The queue/submission interface the command lists drive.
pub trait SubmissionContext: Send + Sync {
    fn id(&self) -> ContextId;

    fn engine(&self) -> EngineClass;

    /// Submit a finished buffer. Returns the task count it completes as.
    fn submit(&self, words: Vec<u32>) -> Result<TaskCount>;

    fn wait_for_completion(&self, task: TaskCount, timeout: Duration) -> WaitStatus;

    /// Task count of the most recent successful submission.
    fn latest_task(&self) -> TaskCount;

    fn register_client(&self);

    fn unregister_client(&self);

    fn client_count(&self) -> u32;

    /// Relaxed ordering needs scheduler support and more than one client.
    fn relaxed_ordering_enabled(&self) -> bool;

    fn ensure_resident(&self, buffer: &GpuBuffer);

    fn residency(&self) -> &ResidencyTracker;
}

/// Submission context backed by the simulated streamer.
pub struct Csr {
    id: ContextId,
    engine: EngineClass,
    gpu: Arc<SimGpu>,
    task_count: Mutex<TaskCount>,
    clients: AtomicU32,
    relaxed_ordering_supported: bool,
    poll_interval: Duration,
    residency: ResidencyTracker,
}

impl Csr {
    pub fn new(
        id: ContextId,
        engine: EngineClass,
        gpu: Arc<SimGpu>,
        relaxed_ordering_supported: bool,
        poll_interval: Duration,
    ) -> Self {
        log::debug!("Csr: create ctx={} on {:?}", id.0, engine);
        Self {
            id,
            engine,
            gpu,
            task_count: Mutex::new(0),
            clients: AtomicU32::new(0),
            relaxed_ordering_supported,
            poll_interval,
            residency: ResidencyTracker::new(),
        }
    }
}

impl SubmissionContext for Csr {
    fn id(&self) -> ContextId {
        self.id
    }

    fn engine(&self) -> EngineClass {
        self.engine
    }

    fn submit(&self, words: Vec<u32>) -> Result<TaskCount> {
        // Numbering and queueing happen under one lock so tasks reach the
        // streamer in task order.
        let mut task_count = self.task_count.lock();
        let task = *task_count + 1;
        self.gpu.submit(self.engine, self.id, task, words)?;
        *task_count = task;
        Ok(task)
    }

    fn wait_for_completion(&self, task: TaskCount, timeout: Duration) -> WaitStatus {
        let gpu = &self.gpu;
        poll_gpu(gpu, timeout, self.poll_interval, || gpu.is_complete(self.id, task))
    }

    fn latest_task(&self) -> TaskCount {
        *self.task_count.lock()
    }

    fn register_client(&self) {
        let count = self.clients.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("Csr: ctx={} clients={}", self.id.0, count);
    }

    fn unregister_client(&self) {
        let _ = self
            .clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    fn client_count(&self) -> u32 {
        self.clients.load(Ordering::Acquire)
    }

    fn relaxed_ordering_enabled(&self) -> bool {
        self.relaxed_ordering_supported && self.client_count() > 1
    }

    fn ensure_resident(&self, buffer: &GpuBuffer) {
        self.residency.make_resident(buffer);
    }

    fn residency(&self) -> &ResidencyTracker {
        &self.residency
    }
}

/// Drive the simulated GPU until `done` holds, the device fails, or the
/// timeout expires. A zero timeout still gives the GPU one pass.
pub fn poll_gpu(
    gpu: &SimGpu,
    timeout: Duration,
    poll_interval: Duration,
    mut done: impl FnMut() -> bool,
) -> WaitStatus {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if gpu.is_device_lost() {
            return WaitStatus::DeviceLost;
        }
        if done() {
            return WaitStatus::Ready;
        }
        if gpu.is_hung() {
            return WaitStatus::GpuHang;
        }
        gpu.run_until_idle();
        if done() {
            return WaitStatus::Ready;
        }
        if gpu.is_hung() {
            log::warn!("poll: gpu hang detected while waiting");
            return WaitStatus::GpuHang;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return WaitStatus::NotReady;
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}
