// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device-scoped state.
//!
//! Owns GPU memory, the simulated streamer, the counter slot allocator, the
//! default submission context of each engine and the synchronized-dispatch
//! token. Lists, queues and event pools borrow it through an `Arc`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ordo_common::settings::Settings;
use ordo_common::{Error, GpuAddr, QueueId, Result, MAX_PARTITIONS};

use crate::command_processor::{ContextId, EngineClass, SimGpu};
use crate::counter::CounterAllocator;
use crate::csr::{poll_gpu, Csr, SubmissionContext, WaitStatus};
use crate::memory_manager::{AllocationKind, GpuBuffer, GpuMemory};

/// Size of the synchronized-dispatch token: one qword.
pub const SYNC_TOKEN_SIZE: u64 = 8;

/// Hardware policy inputs, fixed when the device is created.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub partition_count: u32,
    pub atomic_signaling_preferred: bool,
    pub dc_flush_required_on_signal: bool,
    pub copy_engine_available: bool,
    pub relaxed_ordering_supported: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            partition_count: 1,
            atomic_signaling_preferred: true,
            dc_flush_required_on_signal: false,
            copy_engine_available: true,
            relaxed_ordering_supported: true,
        }
    }
}

pub struct Device {
    settings: Settings,
    caps: DeviceCaps,
    memory: Arc<GpuMemory>,
    gpu: Arc<SimGpu>,
    counters: Arc<CounterAllocator>,
    default_contexts: [Arc<dyn SubmissionContext>; 2],
    next_context_id: AtomicU32,
    sync_token: Mutex<Option<GpuBuffer>>,
    next_queue_id: AtomicU32,
    work_partition: GpuBuffer,
}

impl Device {
    pub fn new(settings: Settings, caps: DeviceCaps) -> Result<Arc<Self>> {
        Self::with_memory(settings, caps, Arc::new(GpuMemory::new()))
    }

    pub fn with_memory(settings: Settings, caps: DeviceCaps, memory: Arc<GpuMemory>) -> Result<Arc<Self>> {
        if caps.partition_count == 0 || caps.partition_count > MAX_PARTITIONS {
            return Err(Error::invalid_argument(format!(
                "device partition count {} out of range 1..={}",
                caps.partition_count, MAX_PARTITIONS
            )));
        }
        let gpu = Arc::new(SimGpu::new(memory.clone()));
        let poll_interval = Duration::from_micros(settings.host_sync_poll_interval_us);
        let compute: Arc<dyn SubmissionContext> = Arc::new(Csr::new(
            ContextId(0),
            EngineClass::Compute,
            gpu.clone(),
            caps.relaxed_ordering_supported,
            poll_interval,
        ));
        let copy: Arc<dyn SubmissionContext> = Arc::new(Csr::new(
            ContextId(1),
            EngineClass::Copy,
            gpu.clone(),
            caps.relaxed_ordering_supported,
            poll_interval,
        ));
        // Tile 0 reads zero here; secondary tiles would read their index.
        let work_partition = memory.allocate(8, AllocationKind::WorkPartition)?;

        log::info!(
            "Device: created with {} partition(s), atomic_preferred={}, dc_flush={}, copy_engine={}",
            caps.partition_count,
            caps.atomic_signaling_preferred,
            caps.dc_flush_required_on_signal,
            caps.copy_engine_available
        );

        Ok(Arc::new(Self {
            settings,
            caps,
            counters: Arc::new(CounterAllocator::new(memory.clone())),
            memory,
            gpu,
            default_contexts: [compute, copy],
            next_context_id: AtomicU32::new(2),
            sync_token: Mutex::new(None),
            next_queue_id: AtomicU32::new(0),
            work_partition,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn memory(&self) -> &Arc<GpuMemory> {
        &self.memory
    }

    pub fn gpu(&self) -> &Arc<SimGpu> {
        &self.gpu
    }

    pub fn counter_allocator(&self) -> &Arc<CounterAllocator> {
        &self.counters
    }

    /// Shared submission context of an engine.
    pub fn default_context(&self, engine: EngineClass) -> Arc<dyn SubmissionContext> {
        match engine {
            EngineClass::Compute => self.default_contexts[0].clone(),
            EngineClass::Copy => self.default_contexts[1].clone(),
        }
    }

    /// A new, independently numbered submission context.
    pub fn create_context(&self, engine: EngineClass) -> Arc<dyn SubmissionContext> {
        let id = ContextId(self.next_context_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(Csr::new(
            id,
            engine,
            self.gpu.clone(),
            self.caps.relaxed_ordering_supported,
            self.poll_interval(),
        ))
    }

    /// Allocate a user buffer (copy/fill targets).
    pub fn allocate_buffer(&self, size: u64) -> Result<GpuBuffer> {
        Ok(self.memory.allocate(size, AllocationKind::UserBuffer)?)
    }

    pub fn free_buffer(&self, buffer: &GpuBuffer) -> Result<()> {
        Ok(self.memory.free(buffer)?)
    }

    /// Whether counters of a list with `partition_count` tiles use atomics.
    pub fn atomic_signaling_for(&self, partition_count: u32) -> bool {
        self.settings
            .atomic_signaling
            .resolve(partition_count, self.caps.atomic_signaling_preferred)
    }

    pub fn counters_mirrored(&self) -> bool {
        self.settings.duplicated_counter_storage.unwrap_or(false)
    }

    pub fn work_partition_address(&self) -> GpuAddr {
        self.work_partition.gpu_va
    }

    pub fn work_partition_buffer(&self) -> GpuBuffer {
        self.work_partition
    }

    /// The synchronized-dispatch token, allocated on first use and kept for
    /// the lifetime of the device.
    pub fn ensure_token_allocated(&self) -> Result<GpuBuffer> {
        let mut token = self.sync_token.lock();
        if let Some(buffer) = *token {
            return Ok(buffer);
        }
        let buffer = self.memory.allocate(SYNC_TOKEN_SIZE, AllocationKind::SyncToken)?;
        log::info!("Device: sync dispatch token allocated at 0x{:X}", buffer.gpu_va);
        *token = Some(buffer);
        Ok(buffer)
    }

    pub fn sync_token(&self) -> Option<GpuBuffer> {
        *self.sync_token.lock()
    }

    /// Next synchronized-dispatch queue id.
    pub fn assign_queue_id(&self) -> QueueId {
        self.next_queue_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn assigned_queue_ids(&self) -> u32 {
        self.next_queue_id.load(Ordering::Acquire)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.settings.host_sync_poll_interval_us)
    }

    /// Pump the simulated GPU until `done` holds or `timeout` expires.
    pub fn poll(&self, timeout: Duration, done: impl FnMut() -> bool) -> WaitStatus {
        poll_gpu(&self.gpu, timeout, self.poll_interval(), done)
    }
}
