// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-order command lists.
//!
//! A command list owns one [`Counter`]. Every append routes the operation to
//! an engine, encodes waits for the events it depends on, encodes the
//! operation itself, then moves the counter forward and signals any event
//! the caller asked for. The counter is the only ordering authority between
//! appends; no host synchronization is involved.
//!
//! Immediate lists submit their recorded chunk eagerly (see [`immediate`]).
//! Regular lists record once, are closed, and are executed any number of
//! times by a [`crate::command_queue::CommandQueue`] (see [`regular`]); every
//! counter-dependent value they encode is registered with a
//! [`PatchRegistry`] and rewritten before each run.
//!
//! An append that fails leaves no trace: the stream, the patch list, the
//! counter and the residency list are rolled back to where they were.

pub mod immediate;
pub mod regular;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use parking_lot::Mutex;

use ordo_common::settings::{CopyOffloadMode, SynchronizedDispatchMode};
use ordo_common::{
    Error, GpuAddr, Result, EVENT_PACKET_NOT_READY, MAX_EVENT_PACKETS, MAX_KERNEL_SPLITS,
    MAX_PARTITIONS,
};

use crate::command_processor::EngineClass;
use crate::command_stream::{
    BranchTarget, CommandEncoder, CommandStream, CompareOp, DecodeError, ParsedCommand,
};
use crate::counter::{Counter, CounterConfig, CounterOwner};
use crate::device::Device;
use crate::event::{Event, EventStatus};
use crate::memory_manager::GpuBuffer;
use crate::partition::{PartitionSignaler, PatchSite, SignalScope, WaitForm};
use crate::patch::{check_rebind, PatchKind, PatchMode, PatchRegistry};
use crate::queue_router::{OpClass, QueueRouter, Route};
use crate::sync_dispatch::SynchronizedDispatchCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Immediate,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Recording,
    Closed,
    Executing,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandListDesc {
    pub kind: ListKind,
    /// Tiles contributing to each dispatch; 0 takes the device's count.
    pub partition_count: u32,
    pub copy_offload: Option<CopyOffloadMode>,
    pub synchronized_dispatch: SynchronizedDispatchMode,
}

impl CommandListDesc {
    pub fn immediate() -> Self {
        Self {
            kind: ListKind::Immediate,
            partition_count: 0,
            copy_offload: None,
            synchronized_dispatch: SynchronizedDispatchMode::Disabled,
        }
    }

    pub fn regular() -> Self {
        Self {
            kind: ListKind::Regular,
            ..Self::immediate()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLaunch {
    pub kernel_id: u32,
    pub group_count: u32,
    pub cooperative: bool,
}

/// A byte offset into a GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: GpuBuffer,
    pub offset: u64,
}

impl BufferSlice {
    pub fn new(buffer: GpuBuffer, offset: u64) -> Self {
        Self { buffer, offset }
    }

    pub fn whole(buffer: GpuBuffer) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Start address of a `size`-byte access, checked against the buffer.
    pub fn address_for(&self, size: u64) -> Result<GpuAddr> {
        let end = self.offset.checked_add(size);
        match end {
            Some(end) if size > 0 && end <= self.buffer.size => Ok(self.buffer.gpu_va + self.offset),
            _ => Err(Error::invalid_argument(format!(
                "access of {} bytes at offset {} exceeds buffer of {} bytes",
                size, self.offset, self.buffer.size
            ))),
        }
    }
}

// -----------------------------------------------------------------------
// Internal operation model
// -----------------------------------------------------------------------

#[derive(Clone)]
enum Operation {
    Launch(KernelLaunch),
    Copy { dst: BufferSlice, src: BufferSlice, size: u64 },
    Fill { dst: BufferSlice, pattern: u32, size: u64 },
    Barrier,
    WaitOnly,
    SignalOnly,
    EventReset(Arc<Event>),
}

impl Operation {
    fn class(&self) -> OpClass {
        match self {
            Operation::Copy { .. } | Operation::Fill { .. } => OpClass::Copy,
            _ => OpClass::Compute,
        }
    }

    /// Operations that may have their waits deferred to the scheduler.
    fn is_non_stalling(&self) -> bool {
        match self {
            Operation::Launch(launch) => !launch.cooperative,
            Operation::Copy { .. } | Operation::Fill { .. } => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Operation::Launch(_) => "launch",
            Operation::Copy { .. } => "copy",
            Operation::Fill { .. } => "fill",
            Operation::Barrier => "barrier",
            Operation::WaitOnly => "wait",
            Operation::SignalOnly => "signal",
            Operation::EventReset(_) => "event reset",
        }
    }
}

/// Event state change applied once an append has been committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventUpdate {
    BindCounter(u64),
    Packets(u32),
    Reset,
}

/// An append before it is encoded.
struct AppendRequest<'a> {
    op: Operation,
    signal: Option<&'a Arc<Event>>,
    waits: &'a [Arc<Event>],
    /// Absolute counter values to wait for in addition to the events.
    counter_waits: Vec<(Arc<Counter>, u64)>,
}

struct Checkpoint {
    stream_len: usize,
    patches_len: usize,
    counter_value: u64,
    residency_len: usize,
}

struct ListInner {
    state: ListState,
    stream: CommandStream,
    patches: PatchRegistry,
    residency: Vec<GpuBuffer>,
    /// Route of the chunk recorded but not yet submitted (Immediate).
    chunk_route: Option<Route>,
    /// Engine of the most recent append.
    last_engine: Option<EngineClass>,
    pending_appends: usize,
    /// Events signalled by the unsubmitted chunk (Immediate) or by the
    /// recording (Regular), with the update each execution applies.
    signal_events: Vec<(Arc<Event>, EventUpdate)>,
}

impl ListInner {
    fn checkpoint(&self, counter: &Counter) -> Checkpoint {
        Checkpoint {
            stream_len: self.stream.len(),
            patches_len: self.patches.len(),
            counter_value: counter.current_value(),
            residency_len: self.residency.len(),
        }
    }

    fn rollback(&mut self, checkpoint: &Checkpoint, counter: &Counter) {
        self.stream.truncate(checkpoint.stream_len);
        self.patches.truncate(checkpoint.patches_len);
        self.residency.truncate(checkpoint.residency_len);
        counter.set_value(checkpoint.counter_value);
    }

    /// Buffers the recorded commands touch, without repeats.
    fn unique_residency(&self) -> Vec<GpuBuffer> {
        let mut buffers: Vec<GpuBuffer> = Vec::with_capacity(self.residency.len());
        for buffer in &self.residency {
            if !buffers.iter().any(|b| b.id == buffer.id) {
                buffers.push(*buffer);
            }
        }
        buffers
    }
}

// -----------------------------------------------------------------------
// Command list
// -----------------------------------------------------------------------

pub struct CommandList {
    device: Arc<Device>,
    kind: ListKind,
    partition_count: u32,
    counter: Arc<Counter>,
    router: QueueRouter,
    sync: SynchronizedDispatchCoordinator,
    inner: Mutex<ListInner>,
}

impl CommandList {
    pub fn create(device: &Arc<Device>, desc: CommandListDesc) -> Result<Arc<Self>> {
        let partition_count = if desc.partition_count == 0 {
            device.caps().partition_count
        } else {
            desc.partition_count
        };
        if partition_count > MAX_PARTITIONS {
            return Err(Error::invalid_argument(format!(
                "partition count {} exceeds {}",
                partition_count, MAX_PARTITIONS
            )));
        }
        let regular = desc.kind == ListKind::Regular;

        let counter = Counter::allocate(
            device.counter_allocator(),
            CounterConfig {
                owner: if regular {
                    CounterOwner::RegularList
                } else {
                    CounterOwner::ImmediateList
                },
                partition_count,
                atomic: device.atomic_signaling_for(partition_count),
                mirrored: device.counters_mirrored(),
            },
        )?;

        let mode = QueueRouter::select_mode(device, desc.copy_offload, regular);
        let router = QueueRouter::new(device, mode, device.default_context(EngineClass::Compute));
        let sync = SynchronizedDispatchCoordinator::enable(device, desc.synchronized_dispatch, partition_count)?;

        if !regular {
            for context in router.contexts() {
                context.register_client();
            }
        }

        log::debug!(
            "CommandList: created {:?} partitions={} copy_offload={:?} sync={:?} counter #{}",
            desc.kind,
            partition_count,
            mode,
            sync.mode(),
            counter.id()
        );

        Ok(Arc::new(Self {
            device: device.clone(),
            kind: desc.kind,
            partition_count,
            counter,
            router,
            sync,
            inner: Mutex::new(ListInner {
                state: ListState::Recording,
                stream: CommandStream::new(),
                patches: PatchRegistry::new(),
                residency: Vec::new(),
                chunk_route: None,
                last_engine: None,
                pending_appends: 0,
                signal_events: Vec::new(),
            }),
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn is_immediate(&self) -> bool {
        self.kind == ListKind::Immediate
    }

    pub fn state(&self) -> ListState {
        self.inner.lock().state
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn counter(&self) -> &Arc<Counter> {
        &self.counter
    }

    pub fn copy_offload_mode(&self) -> CopyOffloadMode {
        self.router.mode()
    }

    pub fn synchronized_dispatch(&self) -> &SynchronizedDispatchCoordinator {
        &self.sync
    }

    /// Number of registered patch descriptors.
    pub fn patch_count(&self) -> usize {
        self.inner.lock().patches.len()
    }

    /// Decode what is currently recorded (Regular) or pending (Immediate).
    pub fn recorded_commands(&self) -> std::result::Result<Vec<ParsedCommand>, DecodeError> {
        self.inner.lock().stream.parse()
    }

    pub fn recorded_words(&self) -> Vec<u32> {
        self.inner.lock().stream.words().to_vec()
    }

    // -------------------------------------------------------------------
    // Appends
    // -------------------------------------------------------------------

    pub fn append_launch_kernel(
        &self,
        launch: &KernelLaunch,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        if launch.group_count == 0 {
            return Err(Error::invalid_argument("kernel launch with zero groups"));
        }
        self.append(AppendRequest {
            op: Operation::Launch(*launch),
            signal,
            waits,
            counter_waits: Vec::new(),
        })
    }

    pub fn append_memory_copy(
        &self,
        dst: BufferSlice,
        src: BufferSlice,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.append(AppendRequest {
            op: Operation::Copy { dst, src, size },
            signal,
            waits,
            counter_waits: Vec::new(),
        })
    }

    pub fn append_memory_fill(
        &self,
        dst: BufferSlice,
        pattern: u32,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.append(AppendRequest {
            op: Operation::Fill { dst, pattern, size },
            signal,
            waits,
            counter_waits: Vec::new(),
        })
    }

    pub fn append_barrier(&self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> Result<()> {
        self.append(AppendRequest {
            op: Operation::Barrier,
            signal,
            waits,
            counter_waits: Vec::new(),
        })
    }

    pub fn append_wait_on_events(&self, waits: &[Arc<Event>]) -> Result<()> {
        if waits.is_empty() {
            return Err(Error::invalid_argument("wait on an empty event list"));
        }
        self.append(AppendRequest {
            op: Operation::WaitOnly,
            signal: None,
            waits,
            counter_waits: Vec::new(),
        })
    }

    pub fn append_signal_event(&self, event: &Arc<Event>) -> Result<()> {
        self.append(AppendRequest {
            op: Operation::SignalOnly,
            signal: Some(event),
            waits: &[],
            counter_waits: Vec::new(),
        })
    }

    /// Clear an event's packets on the GPU, in order with earlier work.
    pub fn append_event_reset(&self, event: &Arc<Event>) -> Result<()> {
        self.append(AppendRequest {
            op: Operation::EventReset(event.clone()),
            signal: None,
            waits: &[],
            counter_waits: Vec::new(),
        })
    }

    /// Point every patch descriptor bound to `old` at `new`, addresses
    /// included. Both counters must have the same number of wait slots.
    pub fn update_in_order_exec_info(
        &self,
        old: &Counter,
        new: &Arc<Counter>,
        preserve_baseline: bool,
    ) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let ids = inner.patches.descriptors_for(old);
        if ids.is_empty() {
            return Ok(0);
        }
        check_rebind(old, new)?;
        for id in &ids {
            inner
                .patches
                .update_in_order_exec_info(&mut inner.stream, *id, new, preserve_baseline)?;
        }
        inner.residency.extend(new.storage_buffers());
        log::debug!(
            "CommandList: rebound {} descriptor(s) from counter #{} to #{} preserve={}",
            ids.len(),
            old.id(),
            new.id(),
            preserve_baseline
        );
        Ok(ids.len())
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn append(&self, request: AppendRequest<'_>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ListState::Recording {
            return Err(Error::InvalidState("command list is not recording"));
        }

        let route = self.router.route(request.op.class());
        if self.is_immediate() {
            let engine_changed = inner
                .chunk_route
                .as_ref()
                .map(|chunk| chunk.engine != route.engine)
                .unwrap_or(false);
            if engine_changed {
                self.flush_locked(&mut inner)?;
            }
        }

        let checkpoint = inner.checkpoint(&self.counter);
        let update = match self.encode_append(&mut inner, &route, &request) {
            Ok(update) => update,
            Err(e) => {
                inner.rollback(&checkpoint, &self.counter);
                log::debug!("CommandList: {} append rolled back: {}", request.op.name(), e);
                return Err(e);
            }
        };

        // Committed: apply event state.
        if let Some(event) = request.signal {
            if let Some(update) = update {
                apply_event_update(event, &self.counter, update);
                inner.signal_events.push((event.clone(), update));
            }
        }
        if let Operation::EventReset(event) = &request.op {
            apply_event_update(event, &self.counter, EventUpdate::Reset);
            inner.signal_events.push((event.clone(), EventUpdate::Reset));
        }
        inner.last_engine = Some(route.engine);

        log::debug!(
            "CommandList: {} on {:?} counter #{} -> {}",
            request.op.name(),
            route.engine,
            self.counter.id(),
            self.counter.current_value()
        );

        if self.is_immediate() {
            inner.chunk_route = Some(route);
            inner.pending_appends += 1;
            if inner.pending_appends >= self.device.settings().flush_batch() || request.signal.is_some() {
                self.flush_locked(&mut inner)?;
            }
        }
        Ok(())
    }

    /// Encode one append. Returns the state change for the signal event.
    fn encode_append(
        &self,
        inner: &mut ListInner,
        route: &Route,
        request: &AppendRequest<'_>,
    ) -> Result<Option<EventUpdate>> {
        let regular = !self.is_immediate();
        let patching = regular && self.device.settings().regular_list_patching;
        let relaxed = self.relaxed_ordering_for(route, &request.op);
        let form = self.wait_form(relaxed);

        // Dependency on this list's own earlier work.
        let own_value = self.counter.current_value();
        let engine_changed = inner.last_engine.map(|e| e != route.engine).unwrap_or(false);
        if own_value > 0 && (regular || self.partition_count > 1 || engine_changed) {
            let sites = PartitionSignaler::new(&self.counter).encode_wait(&mut inner.stream, own_value, form);
            if patching {
                self.register_sites(inner, &sites, &self.counter, own_value, PatchMode::Implicit);
            }
        }

        self.encode_event_waits(inner, request.waits, relaxed, patching, form)?;
        for (counter, value) in &request.counter_waits {
            PartitionSignaler::new(counter).encode_wait(&mut inner.stream, *value, form);
            inner.residency.extend(counter.storage_buffers());
        }

        let guarded = !matches!(request.op, Operation::WaitOnly | Operation::SignalOnly);
        if guarded {
            self.sync.encode_acquire(&mut inner.stream);
        }
        let splits = self.encode_operation(inner, route, &request.op)?;
        if guarded {
            self.sync.encode_release(&mut inner.stream);
            if let Some(token) = self.sync.token_buffer() {
                inner.residency.push(token);
                inner.residency.push(self.device.work_partition_buffer());
            }
        }

        if matches!(request.op, Operation::WaitOnly) && regular {
            self.add_counter_residency(inner);
            return Ok(None);
        }

        // Counter signal.
        let host_flush = request.signal.map(|e| e.is_host_visible()).unwrap_or(false)
            && self.device.caps().dc_flush_required_on_signal;
        let scope = if host_flush {
            SignalScope::HostFlushed
        } else {
            SignalScope::Device
        };
        let new_value = self.counter.advance(self.counter.increment_per_signal());
        let sites = PartitionSignaler::new(&self.counter).encode_signal(&mut inner.stream, new_value, scope);
        if patching {
            self.register_sites(inner, &sites, &self.counter, new_value, PatchMode::Implicit);
        }
        self.add_counter_residency(inner);

        let Some(event) = request.signal else {
            return Ok(None);
        };
        self.encode_event_signal(inner, event, new_value, splits, host_flush, patching)
            .map(Some)
    }

    fn encode_event_waits(
        &self,
        inner: &mut ListInner,
        waits: &[Arc<Event>],
        relaxed: bool,
        patching: bool,
        form: WaitForm,
    ) -> Result<()> {
        // One wait per foreign counter at the highest value any event needs.
        let mut counter_waits: Vec<(Arc<Counter>, u64)> = Vec::new();

        for event in waits {
            if event.is_counter_based() {
                let Some(binding) = event.binding() else {
                    return Err(Error::invalid_argument("counter-based event was never signalled"));
                };
                if binding.counter.id() == self.counter.id() {
                    continue;
                }
                let regular_bound = binding.counter.owner() == CounterOwner::RegularList;
                if !regular_bound && event.query_status()? == EventStatus::Signaled {
                    log::trace!("CommandList: wait on signalled event elided");
                    continue;
                }
                inner.residency.extend(event.resident_buffers());
                match counter_waits.iter_mut().find(|(c, _)| c.id() == binding.counter.id()) {
                    Some((_, base)) => *base = (*base).max(binding.base_value),
                    None => counter_waits.push((binding.counter, binding.base_value)),
                }
            } else {
                if event.query_status()? == EventStatus::Signaled {
                    log::trace!("CommandList: wait on signalled event elided");
                    continue;
                }
                inner.residency.extend(event.resident_buffers());
                for addr in event.used_packet_addresses()? {
                    if relaxed {
                        inner.stream.encode_conditional_branch(
                            addr,
                            EVENT_PACKET_NOT_READY,
                            CompareOp::Equal,
                            true,
                            BranchTarget::Scheduler,
                        );
                    } else {
                        inner
                            .stream
                            .encode_semaphore_wait(addr, EVENT_PACKET_NOT_READY, CompareOp::NotEqual, true);
                    }
                }
            }
        }

        for (counter, base) in counter_waits {
            let value = counter.adjusted_value(base);
            let sites = PartitionSignaler::new(&counter).encode_wait(&mut inner.stream, value, form);
            if patching && counter.owner() == CounterOwner::RegularList {
                self.register_sites(inner, &sites, &counter, base, PatchMode::Explicit);
            }
        }
        Ok(())
    }

    /// Encode the operation body. Returns how many kernel splits it took.
    fn encode_operation(&self, inner: &mut ListInner, route: &Route, op: &Operation) -> Result<u32> {
        match op {
            Operation::Launch(launch) => {
                inner.stream.encode_dispatch(
                    launch.kernel_id,
                    launch.group_count,
                    self.partition_count,
                    launch.cooperative,
                );
                Ok(1)
            }
            Operation::Copy { dst, src, size } => {
                let dst_addr = dst.address_for(*size)?;
                let src_addr = src.address_for(*size)?;
                inner.residency.push(dst.buffer);
                inner.residency.push(src.buffer);
                if route.use_blitter {
                    inner.stream.encode_copy(src_addr, dst_addr, *size, true);
                    return Ok(1);
                }
                let parts = split_copy(dst_addr, *size);
                for (offset, len) in &parts {
                    inner.stream.encode_copy(src_addr + offset, dst_addr + offset, *len, false);
                }
                Ok(parts.len() as u32)
            }
            Operation::Fill { dst, pattern, size } => {
                let dst_addr = dst.address_for(*size)?;
                inner.residency.push(dst.buffer);
                inner.stream.encode_fill(dst_addr, *size, *pattern);
                Ok(1)
            }
            Operation::EventReset(event) => {
                if event.is_counter_based() {
                    return Err(Error::invalid_argument("counter-based events cannot be reset"));
                }
                for packet in 0..event.max_packets() {
                    let addr = event.packet_address(packet)?;
                    inner.stream.encode_store_immediate(addr, EVENT_PACKET_NOT_READY, true);
                }
                inner.residency.extend(event.resident_buffers());
                Ok(1)
            }
            Operation::Barrier | Operation::WaitOnly | Operation::SignalOnly => Ok(1),
        }
    }

    fn encode_event_signal(
        &self,
        inner: &mut ListInner,
        event: &Arc<Event>,
        new_value: u64,
        splits: u32,
        host_flush: bool,
        patching: bool,
    ) -> Result<EventUpdate> {
        inner.residency.extend(event.resident_buffers());

        let update = if event.is_counter_based() {
            if event.binding().map(|b| b.counter.owner() == CounterOwner::Standalone).unwrap_or(false) {
                return Err(Error::invalid_argument(
                    "standalone counter event is signalled from the host",
                ));
            }
            EventUpdate::BindCounter(new_value)
        } else {
            let packets = splits * self.partition_count;
            if packets > MAX_EVENT_PACKETS {
                return Err(Error::invalid_argument(format!(
                    "signal needs {} packets, event has {}",
                    packets, MAX_EVENT_PACKETS
                )));
            }
            for packet in 0..packets {
                let handle = inner.stream.encode_store_immediate(event.packet_address(packet)?, new_value, true);
                if patching {
                    let site = PatchSite {
                        handle,
                        kind: PatchKind::StoreImmediate,
                    };
                    self.register_sites(inner, &[site], &self.counter, new_value, PatchMode::Implicit);
                }
            }
            if host_flush {
                inner.stream.encode_pipe_control(true, None);
            }
            EventUpdate::Packets(packets)
        };

        if event.has_timestamp() {
            inner.stream.encode_timestamp(event.timestamp_address()?);
        }
        Ok(update)
    }

    fn register_sites(
        &self,
        inner: &mut ListInner,
        sites: &[PatchSite],
        counter: &Arc<Counter>,
        baseline: u64,
        mode: PatchMode,
    ) {
        for site in sites {
            inner.patches.register(site.handle, site.kind, counter, baseline, mode);
        }
    }

    fn add_counter_residency(&self, inner: &mut ListInner) {
        inner.residency.extend(self.counter.storage_buffers());
    }

    fn wait_form(&self, relaxed: bool) -> WaitForm {
        if relaxed {
            WaitForm::SchedulerBranch
        } else if self.device.settings().qword_counters {
            WaitForm::RegisterPair
        } else {
            WaitForm::Semaphore
        }
    }

    fn relaxed_ordering_for(&self, route: &Route, op: &Operation) -> bool {
        self.is_immediate()
            && self.device.settings().relaxed_ordering != Some(false)
            && route.context.relaxed_ordering_enabled()
            && op.is_non_stalling()
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.is_immediate() {
            for context in self.router.contexts() {
                context.unregister_client();
            }
        }
        log::trace!("CommandList: counter #{} list dropped", self.counter.id());
    }
}

fn apply_event_update(event: &Arc<Event>, counter: &Arc<Counter>, update: EventUpdate) {
    match update {
        EventUpdate::BindCounter(value) => event.bind_counter(counter, value),
        EventUpdate::Packets(packets) => event.mark_pending(packets),
        EventUpdate::Reset => event.mark_reset_pending(),
    }
}

/// Split a compute-engine copy into an unaligned head, an aligned body and
/// a tail. Returns `(offset, size)` pairs, at most [`MAX_KERNEL_SPLITS`].
fn split_copy(dst: GpuAddr, size: u64) -> Vec<(u64, u64)> {
    let head = ((4 - dst % 4) % 4).min(size);
    let body = (size - head) & !3;
    let tail = size - head - body;
    let parts: Vec<(u64, u64)> = [(0, head), (head, body), (head + body, tail)]
        .into_iter()
        .filter(|(_, len)| *len > 0)
        .collect();
    debug_assert!(parts.len() <= MAX_KERNEL_SPLITS as usize);
    parts
}
