// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Events: host- and GPU-visible completion primitives.
//!
//! A plain event owns a set of packets inside its pool's memory. Each packet
//! holds [`EVENT_PACKET_NOT_READY`] until a producer writes it; waiters poll
//! for "not equal to the sentinel". A counter-based event has no packets of
//! its own: it is complete once the counter it is bound to reaches the bound
//! value.
//!
//! Every signal records the submission context that produced it so host
//! waits and later device waits know which engine's work they depend on.

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;

use ordo_common::{
    Error, GpuAddr, Result, TaskCount, EVENT_PACKET_NOT_READY, EVENT_PACKET_SIZE,
    EVENT_SLOT_SIZE, MAX_EVENT_PACKETS,
};

use crate::counter::{Counter, CounterConfig, CounterOwner};
use crate::csr::SubmissionContext;
use crate::device::Device;
use crate::memory_manager::{AllocationKind, GpuBuffer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        /// Signals must be flushed so the host observes them.
        const HOST_VISIBLE  = 1 << 0;
        /// A global timestamp is written alongside completion.
        const TIMESTAMP     = 1 << 1;
        /// Completion is tracked through an in-order counter.
        const COUNTER_BASED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Initial,
    Pending,
    Signaled,
}

/// The counter value an event stands for.
#[derive(Clone)]
pub struct CounterBinding {
    pub counter: Arc<Counter>,
    pub base_value: u64,
}

impl CounterBinding {
    /// Value the counter must reach, accounting for Regular-list re-runs.
    pub fn expected_value(&self) -> u64 {
        self.counter.adjusted_value(self.base_value)
    }
}

/// Submission context and task that last signalled an event.
#[derive(Clone)]
pub struct Producer {
    pub context: Arc<dyn SubmissionContext>,
    pub task: TaskCount,
}

struct EventState {
    status: EventStatus,
    packets_used: u32,
    binding: Option<CounterBinding>,
    producer: Option<Producer>,
}

// -----------------------------------------------------------------------
// Pool
// -----------------------------------------------------------------------

pub struct EventPool {
    device: Arc<Device>,
    buffer: GpuBuffer,
    flags: EventFlags,
    count: u32,
    in_use: Mutex<Vec<bool>>,
}

impl EventPool {
    pub fn new(device: &Arc<Device>, count: u32, flags: EventFlags) -> Result<Arc<Self>> {
        if count == 0 {
            return Err(Error::invalid_argument("event pool needs at least one event"));
        }
        let size = count as u64 * EVENT_SLOT_SIZE;
        let buffer = device.memory().allocate(size, AllocationKind::EventPool)?;
        device.memory().fill(buffer.gpu_va, buffer.size, EVENT_PACKET_NOT_READY as u32)?;
        log::debug!(
            "EventPool: {} events at 0x{:X} flags={:?}",
            count,
            buffer.gpu_va,
            flags
        );
        Ok(Arc::new(Self {
            device: device.clone(),
            buffer,
            flags,
            count,
            in_use: Mutex::new(vec![false; count as usize]),
        }))
    }

    pub fn buffer(&self) -> GpuBuffer {
        self.buffer
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn create_event(self: &Arc<Self>, index: u32) -> Result<Arc<Event>> {
        {
            let mut in_use = self.in_use.lock();
            match in_use.get_mut(index as usize) {
                None => {
                    return Err(Error::invalid_argument(format!(
                        "event index {} outside pool of {}",
                        index, self.count
                    )))
                }
                Some(true) => {
                    return Err(Error::invalid_argument(format!("event index {} already in use", index)))
                }
                Some(slot) => *slot = true,
            }
        }
        let slot_addr = self.buffer.gpu_va + index as u64 * EVENT_SLOT_SIZE;
        Ok(Arc::new(Event {
            device: self.device.clone(),
            pool: Some(self.clone()),
            index,
            flags: self.flags,
            slot_addr: Some(slot_addr),
            state: Mutex::new(EventState {
                status: EventStatus::Initial,
                packets_used: 0,
                binding: None,
                producer: None,
            }),
        }))
    }

    fn release(&self, index: u32) {
        if let Some(slot) = self.in_use.lock().get_mut(index as usize) {
            *slot = false;
        }
    }
}

// -----------------------------------------------------------------------
// Event
// -----------------------------------------------------------------------

pub struct Event {
    device: Arc<Device>,
    pool: Option<Arc<EventPool>>,
    index: u32,
    flags: EventFlags,
    slot_addr: Option<GpuAddr>,
    state: Mutex<EventState>,
}

impl Event {
    /// Counter-based event backed by its own counter rather than a list's.
    /// It completes once that counter reaches `target`.
    pub fn create_standalone(device: &Arc<Device>, target: u64) -> Result<Arc<Self>> {
        let counter = Counter::allocate(
            device.counter_allocator(),
            CounterConfig {
                owner: CounterOwner::Standalone,
                partition_count: 1,
                atomic: false,
                mirrored: device.counters_mirrored(),
            },
        )?;
        Ok(Arc::new(Self {
            device: device.clone(),
            pool: None,
            index: 0,
            flags: EventFlags::COUNTER_BASED | EventFlags::HOST_VISIBLE,
            slot_addr: None,
            state: Mutex::new(EventState {
                status: EventStatus::Pending,
                packets_used: 0,
                binding: Some(CounterBinding {
                    counter,
                    base_value: target,
                }),
                producer: None,
            }),
        }))
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn is_counter_based(&self) -> bool {
        self.flags.contains(EventFlags::COUNTER_BASED)
    }

    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(EventFlags::HOST_VISIBLE)
    }

    pub fn has_timestamp(&self) -> bool {
        self.flags.contains(EventFlags::TIMESTAMP)
    }

    pub fn max_packets(&self) -> u32 {
        if self.slot_addr.is_some() {
            MAX_EVENT_PACKETS
        } else {
            0
        }
    }

    pub fn packet_address(&self, packet: u32) -> Result<GpuAddr> {
        match self.slot_addr {
            Some(base) if packet < MAX_EVENT_PACKETS => Ok(base + packet as u64 * EVENT_PACKET_SIZE),
            Some(_) => Err(Error::invalid_argument(format!(
                "packet {} exceeds {} packets",
                packet, MAX_EVENT_PACKETS
            ))),
            None => Err(Error::invalid_argument("standalone event has no packets")),
        }
    }

    pub fn timestamp_address(&self) -> Result<GpuAddr> {
        match self.slot_addr {
            Some(base) if self.has_timestamp() => {
                Ok(base + MAX_EVENT_PACKETS as u64 * EVENT_PACKET_SIZE)
            }
            _ => Err(Error::invalid_argument("event was not created with timestamps")),
        }
    }

    pub fn packets_used(&self) -> u32 {
        self.state.lock().packets_used
    }

    /// Addresses of the packets the latest signal writes.
    pub fn used_packet_addresses(&self) -> Result<Vec<GpuAddr>> {
        let used = self.packets_used().max(1);
        (0..used).map(|p| self.packet_address(p)).collect()
    }

    /// Last status observed by the host, without touching memory.
    pub fn cached_status(&self) -> EventStatus {
        self.state.lock().status
    }

    pub fn binding(&self) -> Option<CounterBinding> {
        self.state.lock().binding.clone()
    }

    pub fn producer(&self) -> Option<Producer> {
        self.state.lock().producer.clone()
    }

    /// Bound to a counter whose expected value moves with every execution.
    pub fn is_bound_to_regular_list(&self) -> bool {
        self.state
            .lock()
            .binding
            .as_ref()
            .map(|b| b.counter.owner() == CounterOwner::RegularList)
            .unwrap_or(false)
    }

    /// Buffers a submission signalling or waiting on this event touches.
    pub fn resident_buffers(&self) -> Vec<GpuBuffer> {
        let mut buffers = Vec::new();
        if let Some(pool) = &self.pool {
            buffers.push(pool.buffer);
        }
        if let Some(binding) = &self.state.lock().binding {
            buffers.extend(binding.counter.storage_buffers());
        }
        buffers
    }

    /// Check completion against memory. A signalled result is cached unless
    /// the event follows a Regular list's counter.
    pub fn query_status(&self) -> Result<EventStatus> {
        let mut state = self.state.lock();
        let regular_bound = state
            .binding
            .as_ref()
            .map(|b| b.counter.owner() == CounterOwner::RegularList)
            .unwrap_or(false);
        if state.status == EventStatus::Signaled && !regular_bound {
            return Ok(EventStatus::Signaled);
        }

        let reached = match &state.binding {
            Some(binding) => binding.counter.is_reached(binding.expected_value())?,
            None if state.packets_used > 0 => {
                let mut all = true;
                for packet in 0..state.packets_used {
                    let value = self.device.memory().read_u64(self.packet_address(packet)?)?;
                    all &= value != EVENT_PACKET_NOT_READY;
                }
                all
            }
            None => false,
        };

        if reached {
            if !regular_bound {
                state.status = EventStatus::Signaled;
            }
            return Ok(EventStatus::Signaled);
        }
        Ok(state.status)
    }

    /// Poll until signalled, the device fails, or `timeout` expires.
    pub fn host_synchronize(&self, timeout: Duration) -> Result<()> {
        let status = self.device.poll(timeout, || {
            matches!(self.query_status(), Ok(EventStatus::Signaled))
        });
        status.into_result()
    }

    /// Signal from the host. List-bound counter-based events can only be
    /// signalled by their list.
    pub fn host_signal(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(binding) = &state.binding {
            if binding.counter.owner() != CounterOwner::Standalone {
                return Err(Error::invalid_argument(
                    "counter-based event is signalled by its command list",
                ));
            }
            binding.counter.host_signal(binding.base_value)?;
        } else if self.is_counter_based() {
            return Err(Error::invalid_argument("counter-based event has no counter to signal"));
        } else {
            let used = state.packets_used.max(1);
            for packet in 0..used {
                self.device.memory().write_u64(self.packet_address(packet)?, 0)?;
            }
            state.packets_used = used;
        }
        state.status = EventStatus::Signaled;
        log::debug!("Event: {} host signalled", self.index);
        Ok(())
    }

    /// Re-arm from the host. Counter-based events cannot be reset.
    pub fn host_reset(&self) -> Result<()> {
        if self.is_counter_based() {
            return Err(Error::invalid_argument("counter-based events cannot be reset"));
        }
        let mut state = self.state.lock();
        if let Some(base) = self.slot_addr {
            self.device
                .memory()
                .fill(base, EVENT_SLOT_SIZE, EVENT_PACKET_NOT_READY as u32)?;
        }
        state.status = EventStatus::Initial;
        state.packets_used = 0;
        state.producer = None;
        Ok(())
    }

    /// Timestamp written by the most recent signal.
    pub fn query_timestamp(&self) -> Result<u64> {
        let addr = self.timestamp_address()?;
        if self.query_status()? != EventStatus::Signaled {
            return Err(Error::NotReady);
        }
        Ok(self.device.memory().read_u64(addr)?)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    pub(crate) fn bind_counter(&self, counter: &Arc<Counter>, base_value: u64) {
        let mut state = self.state.lock();
        state.binding = Some(CounterBinding {
            counter: counter.clone(),
            base_value,
        });
        state.status = EventStatus::Pending;
        log::trace!("Event: {} bound to counter #{} at {}", self.index, counter.id(), base_value);
    }

    pub(crate) fn mark_pending(&self, packets_used: u32) {
        let mut state = self.state.lock();
        state.packets_used = packets_used;
        state.status = EventStatus::Pending;
    }

    pub(crate) fn mark_reset_pending(&self) {
        let mut state = self.state.lock();
        state.packets_used = 0;
        state.status = EventStatus::Initial;
    }

    pub(crate) fn set_producer(&self, context: &Arc<dyn SubmissionContext>, task: TaskCount) {
        self.state.lock().producer = Some(Producer {
            context: context.clone(),
            task,
        });
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.release(self.index);
        }
    }
}
