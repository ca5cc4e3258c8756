// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-order completion counters.
//!
//! A counter is a monotonic 64-bit value in GPU memory counting the
//! operations its owner has completed. The host keeps the value the counter
//! will reach once everything appended so far retires; the GPU writes the
//! value as work completes. Storage is carved from shared pages by
//! [`CounterAllocator`], optionally mirrored into host-visible memory.
//!
//! Partition layout of one counter slot:
//!
//! | Offset                | Contents                                  |
//! |-----------------------|-------------------------------------------|
//! | 0                     | partition 0 (or the atomic aggregate)     |
//! | p * PARTITION_STRIDE  | partition p (explicit-store mode only)    |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ordo_common::{
    Error, GpuAddr, Result, COUNTER_SLOT_SIZE, MAX_PARTITIONS, PAGE_SIZE_U64, PARTITION_STRIDE,
};

use crate::memory_manager::{AllocationKind, GpuBuffer, GpuMemory};

static NEXT_COUNTER_ID: AtomicU64 = AtomicU64::new(1);

// -----------------------------------------------------------------------
// Slot allocator
// -----------------------------------------------------------------------

/// One counter-sized piece of a shared page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSlot {
    pub buffer: GpuBuffer,
    pub addr: GpuAddr,
}

struct SlotPool {
    kind: AllocationKind,
    pages: Vec<GpuBuffer>,
    free: Vec<CounterSlot>,
    in_use: usize,
}

impl SlotPool {
    fn new(kind: AllocationKind) -> Self {
        Self {
            kind,
            pages: Vec::new(),
            free: Vec::new(),
            in_use: 0,
        }
    }
}

/// Hands out counter slots from device pages and host-mirror pages, reusing
/// released slots first.
pub struct CounterAllocator {
    memory: Arc<GpuMemory>,
    device_pool: Mutex<SlotPool>,
    host_pool: Mutex<SlotPool>,
}

impl CounterAllocator {
    pub fn new(memory: Arc<GpuMemory>) -> Self {
        Self {
            memory,
            device_pool: Mutex::new(SlotPool::new(AllocationKind::CounterStorage)),
            host_pool: Mutex::new(SlotPool::new(AllocationKind::HostMirror)),
        }
    }

    pub fn allocate(&self, host_visible: bool) -> Result<CounterSlot> {
        let mut pool = self.pool(host_visible).lock();
        if pool.free.is_empty() {
            let page = self.memory.allocate(PAGE_SIZE_U64, pool.kind)?;
            // Reverse so slots come out in address order.
            for i in (0..PAGE_SIZE_U64 / COUNTER_SLOT_SIZE).rev() {
                pool.free.push(CounterSlot {
                    buffer: page,
                    addr: page.gpu_va + i * COUNTER_SLOT_SIZE,
                });
            }
            pool.pages.push(page);
            log::trace!("CounterAllocator: new {} page at 0x{:X}", pool.kind.name(), page.gpu_va);
        }
        let slot = pool
            .free
            .pop()
            .ok_or(Error::AllocationFailure { what: pool.kind.name(), size: COUNTER_SLOT_SIZE })?;
        pool.in_use += 1;
        Ok(slot)
    }

    /// Return a slot; it is zeroed so the next owner starts from 0.
    pub fn release(&self, slot: CounterSlot, host_visible: bool) {
        if let Err(e) = self.memory.write(slot.addr, &[0u8; COUNTER_SLOT_SIZE as usize]) {
            log::warn!("CounterAllocator: failed to clear slot 0x{:X}: {}", slot.addr, e);
        }
        let mut pool = self.pool(host_visible).lock();
        pool.in_use = pool.in_use.saturating_sub(1);
        pool.free.push(slot);
    }

    pub fn slots_in_use(&self, host_visible: bool) -> usize {
        self.pool(host_visible).lock().in_use
    }

    pub fn page_count(&self, host_visible: bool) -> usize {
        self.pool(host_visible).lock().pages.len()
    }

    fn pool(&self, host_visible: bool) -> &Mutex<SlotPool> {
        if host_visible {
            &self.host_pool
        } else {
            &self.device_pool
        }
    }
}

// -----------------------------------------------------------------------
// Counter
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOwner {
    ImmediateList,
    RegularList,
    Standalone,
}

/// How producers move the counter forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementMode {
    /// Each partition stores the new logical value into its own slot.
    ExplicitStore,
    /// One atomic add of the partition count into the aggregate slot.
    AtomicIncrement,
}

#[derive(Debug, Clone, Copy)]
pub struct CounterConfig {
    pub owner: CounterOwner,
    pub partition_count: u32,
    pub atomic: bool,
    pub mirrored: bool,
}

pub struct Counter {
    id: u64,
    owner: CounterOwner,
    partition_count: u32,
    mode: IncrementMode,
    storage: CounterSlot,
    mirror: Option<CounterSlot>,
    value: AtomicU64,
    submissions: AtomicU64,
    allocator: Arc<CounterAllocator>,
    memory: Arc<GpuMemory>,
}

impl Counter {
    pub fn allocate(allocator: &Arc<CounterAllocator>, config: CounterConfig) -> Result<Arc<Self>> {
        if config.partition_count == 0 || config.partition_count > MAX_PARTITIONS {
            return Err(Error::invalid_argument(format!(
                "partition count {} out of range 1..={}",
                config.partition_count, MAX_PARTITIONS
            )));
        }
        let storage = allocator.allocate(false)?;
        let mirror = if config.mirrored {
            match allocator.allocate(true) {
                Ok(slot) => Some(slot),
                Err(e) => {
                    allocator.release(storage, false);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let mode = if config.atomic {
            IncrementMode::AtomicIncrement
        } else {
            IncrementMode::ExplicitStore
        };
        let id = NEXT_COUNTER_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Counter: #{} {:?} at 0x{:X} partitions={} {:?} mirrored={}",
            id,
            config.owner,
            storage.addr,
            config.partition_count,
            mode,
            mirror.is_some()
        );
        Ok(Arc::new(Self {
            id,
            owner: config.owner,
            partition_count: config.partition_count,
            mode,
            storage,
            mirror,
            value: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            allocator: allocator.clone(),
            memory: allocator.memory.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> CounterOwner {
        self.owner
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn increment_mode(&self) -> IncrementMode {
        self.mode
    }

    pub fn is_atomic(&self) -> bool {
        self.mode == IncrementMode::AtomicIncrement
    }

    /// Value the counter holds once everything appended so far has retired.
    pub fn current_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Move the host value forward; returns the new value.
    pub fn advance(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub(crate) fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Amount one signal adds.
    pub fn increment_per_signal(&self) -> u64 {
        match self.mode {
            IncrementMode::AtomicIncrement => self.partition_count as u64,
            IncrementMode::ExplicitStore => 1,
        }
    }

    pub fn primary_address(&self) -> GpuAddr {
        self.storage.addr
    }

    pub fn partition_address(&self, partition: u32) -> GpuAddr {
        self.storage.addr + partition as u64 * PARTITION_STRIDE
    }

    /// Locations a device-side waiter has to check.
    pub fn wait_addresses(&self) -> Vec<GpuAddr> {
        match self.mode {
            IncrementMode::AtomicIncrement => vec![self.primary_address()],
            IncrementMode::ExplicitStore => (0..self.partition_count)
                .map(|p| self.partition_address(p))
                .collect(),
        }
    }

    pub fn mirror_address(&self) -> Result<GpuAddr> {
        self.mirror.map(|slot| slot.addr).ok_or(Error::NoMirror)
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    /// Buffers a submission touching this counter must make resident.
    pub fn storage_buffers(&self) -> Vec<GpuBuffer> {
        let mut buffers = vec![self.storage.buffer];
        if let Some(mirror) = self.mirror {
            buffers.push(mirror.buffer);
        }
        buffers
    }

    /// Back to zero, both on the host and in memory.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
        self.submissions.store(0, Ordering::Release);
        self.clear_memory();
        log::debug!("Counter: #{} reset", self.id);
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Acquire)
    }

    pub fn add_submission(&self) -> u64 {
        self.submissions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Value a `base` recorded inside a Regular list stands for after its
    /// latest execution.
    pub fn adjusted_value(&self, base: u64) -> u64 {
        let submissions = self.submissions();
        if self.owner == CounterOwner::RegularList && submissions > 1 {
            base + self.current_value() * (submissions - 1)
        } else {
            base
        }
    }

    /// Value the host waits for to see all submitted work complete.
    pub fn host_target(&self) -> u64 {
        match self.owner {
            CounterOwner::RegularList => self.current_value() * self.submissions(),
            _ => self.current_value(),
        }
    }

    /// Value the GPU has actually written so far, as the host observes it.
    pub fn completed_value(&self) -> Result<u64> {
        if let Some(mirror) = self.mirror {
            return Ok(self.memory.read_u64(mirror.addr)?);
        }
        match self.mode {
            IncrementMode::AtomicIncrement => Ok(self.memory.read_u64(self.primary_address())?),
            IncrementMode::ExplicitStore => {
                let mut completed = u64::MAX;
                for addr in self.wait_addresses() {
                    completed = completed.min(self.memory.read_u64(addr)?);
                }
                Ok(completed)
            }
        }
    }

    pub fn is_reached(&self, value: u64) -> Result<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// Write `value` from the host into every slot and the mirror.
    pub fn host_signal(&self, value: u64) -> Result<()> {
        for addr in self.wait_addresses() {
            self.memory.write_u64(addr, value)?;
        }
        if let Some(mirror) = self.mirror {
            self.memory.write_u64(mirror.addr, value)?;
        }
        self.value.fetch_max(value, Ordering::AcqRel);
        log::debug!("Counter: #{} host signal {}", self.id, value);
        Ok(())
    }

    fn clear_memory(&self) {
        let zero = [0u8; COUNTER_SLOT_SIZE as usize];
        let mut result = self.memory.write(self.storage.addr, &zero);
        if let Some(mirror) = self.mirror {
            result = result.and(self.memory.write(mirror.addr, &zero));
        }
        if let Err(e) = result {
            log::warn!("Counter: #{} failed to clear storage: {}", self.id, e);
        }
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        self.allocator.release(self.storage, false);
        if let Some(mirror) = self.mirror {
            self.allocator.release(mirror, true);
        }
        log::trace!("Counter: #{} released", self.id);
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("addr", &format_args!("0x{:X}", self.storage.addr))
            .field("value", &self.current_value())
            .field("mode", &self.mode)
            .finish()
    }
}
