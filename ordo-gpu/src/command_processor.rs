// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated command streamer.
//!
//! Each engine class owns one streamer with a queue of pending submissions.
//! A streamer executes the front submission until it finishes, blocks on an
//! unsatisfied semaphore wait, or takes a conditional branch to the scheduler
//! (in which case the submission is rotated behind the others queued on the
//! same engine). Execution is driven explicitly through [`SimGpu::step`] and
//! [`SimGpu::run_until_idle`], or automatically after every submit when
//! `auto_run` is enabled.
//!
//! Execution happens on tile 0 only: every per-partition write encoded by the
//! driver is carried out by this single streamer, and the work-partition
//! memory tile 0 reads is always zero.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ordo_common::{Error, GpuAddr, Result, TaskCount};

use crate::command_stream::{decode_at, AtomicOp, BranchTarget, Command, GPR0_HI, GPR0_LO};
use crate::memory_manager::{GpuMemory, MemoryError};

/// Upper bound on commands executed per `step` so spinning streams yield.
const MAX_COMMANDS_PER_STEP: usize = 4096;

/// Upper bound on round-robin passes per `run_until_idle`.
const MAX_IDLE_PASSES: usize = 1 << 16;

/// Timestamp ticks added per timestamp write.
const TIMESTAMP_TICK: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineClass {
    Compute,
    Copy,
}

impl EngineClass {
    pub const ALL: [EngineClass; 2] = [EngineClass::Compute, EngineClass::Copy];

    fn index(self) -> usize {
        match self {
            Self::Compute => 0,
            Self::Copy => 1,
        }
    }
}

/// Identifies the submission context a buffer was submitted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// One executed dispatch, recorded for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub engine: EngineClass,
    pub context: ContextId,
    pub task: TaskCount,
    pub kernel_id: u32,
    pub group_count: u32,
    pub partitions: u32,
    pub cooperative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing queued on the engine.
    Idle,
    /// Commands executed; the submission is still running.
    Progress,
    /// The front submission waits on a semaphore that is not satisfied yet.
    Blocked,
    /// The front submission handed control back to the scheduler.
    Yielded,
    Completed,
    /// The submission faulted and the device is now hung.
    Fault,
}

struct Submission {
    context: ContextId,
    task: TaskCount,
    words: Arc<Vec<u32>>,
    pos: usize,
}

#[derive(Default)]
struct Streamer {
    pending: VecDeque<Submission>,
    registers: HashMap<u32, u32>,
}

#[derive(Default)]
struct ContextProgress {
    /// Every task up to and including this one has completed.
    contiguous: TaskCount,
    done_above: BTreeSet<TaskCount>,
}

impl ContextProgress {
    fn complete(&mut self, task: TaskCount) {
        if task <= self.contiguous {
            return;
        }
        self.done_above.insert(task);
        while self.done_above.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
    }

    fn is_complete(&self, task: TaskCount) -> bool {
        task <= self.contiguous || self.done_above.contains(&task)
    }
}

enum Exec {
    Continue,
    Jump(usize),
    Blocked,
    Yield,
    End,
}

/// The simulated GPU: memory plus one streamer per engine class.
pub struct SimGpu {
    memory: Arc<GpuMemory>,
    streamers: [Mutex<Streamer>; 2],
    progress: Mutex<HashMap<ContextId, ContextProgress>>,
    trace: Mutex<Vec<DispatchRecord>>,
    timestamp: AtomicU64,
    hung: AtomicBool,
    device_lost: AtomicBool,
    auto_run: AtomicBool,
}

impl SimGpu {
    pub fn new(memory: Arc<GpuMemory>) -> Self {
        Self {
            memory,
            streamers: [Mutex::new(Streamer::default()), Mutex::new(Streamer::default())],
            progress: Mutex::new(HashMap::new()),
            trace: Mutex::new(Vec::new()),
            timestamp: AtomicU64::new(0),
            hung: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            auto_run: AtomicBool::new(false),
        }
    }

    pub fn memory(&self) -> &Arc<GpuMemory> {
        &self.memory
    }

    pub fn set_auto_run(&self, enabled: bool) {
        self.auto_run.store(enabled, Ordering::Release);
    }

    /// Queue a buffer on an engine.
    pub fn submit(
        &self,
        engine: EngineClass,
        context: ContextId,
        task: TaskCount,
        words: Vec<u32>,
    ) -> Result<()> {
        if self.device_lost.load(Ordering::Acquire) {
            log::warn!("SimGpu: submit on lost device rejected");
            return Err(Error::DeviceLost);
        }
        log::debug!(
            "SimGpu: submit {:?} ctx={} task={} ({} dwords)",
            engine,
            context.0,
            task,
            words.len()
        );
        self.streamers[engine.index()].lock().pending.push_back(Submission {
            context,
            task,
            words: Arc::new(words),
            pos: 0,
        });
        if self.auto_run.load(Ordering::Acquire) {
            self.run_until_idle();
        }
        Ok(())
    }

    pub fn is_complete(&self, context: ContextId, task: TaskCount) -> bool {
        self.progress
            .lock()
            .get(&context)
            .map(|p| p.is_complete(task))
            .unwrap_or(task == 0)
    }

    pub fn pending_count(&self, engine: EngineClass) -> usize {
        self.streamers[engine.index()].lock().pending.len()
    }

    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Acquire)
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Mark the device hung; queued work stops executing.
    pub fn inject_hang(&self) {
        log::warn!("SimGpu: hang injected");
        self.hung.store(true, Ordering::Release);
    }

    /// Mark the device lost; further submissions fail.
    pub fn set_device_lost(&self, lost: bool) {
        self.device_lost.store(lost, Ordering::Release);
    }

    pub fn dispatch_trace(&self) -> Vec<DispatchRecord> {
        self.trace.lock().clone()
    }

    pub fn current_timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Run the streamer of one engine for a bounded number of commands.
    pub fn step(&self, engine: EngineClass) -> StepOutcome {
        if self.is_hung() {
            return StepOutcome::Blocked;
        }
        let mut streamer = self.streamers[engine.index()].lock();
        let Some(mut sub) = streamer.pending.pop_front() else {
            return StepOutcome::Idle;
        };

        let mut executed = 0usize;
        let outcome = loop {
            if executed == MAX_COMMANDS_PER_STEP {
                break StepOutcome::Progress;
            }
            if sub.pos >= sub.words.len() {
                break StepOutcome::Completed;
            }
            let (command, length) = match decode_at(&sub.words, sub.pos) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::warn!("SimGpu: {:?} ctx={} decode fault: {}", engine, sub.context.0, e);
                    break StepOutcome::Fault;
                }
            };
            match self.execute(engine, &mut streamer, &sub, command) {
                Ok(Exec::Continue) => sub.pos += length,
                Ok(Exec::Jump(target)) => {
                    if target >= sub.words.len() {
                        log::warn!("SimGpu: jump out of range to dword {}", target);
                        break StepOutcome::Fault;
                    }
                    sub.pos = target;
                }
                Ok(Exec::Blocked) => break StepOutcome::Blocked,
                Ok(Exec::Yield) => break StepOutcome::Yielded,
                Ok(Exec::End) => break StepOutcome::Completed,
                Err(e) => {
                    log::warn!("SimGpu: {:?} ctx={} memory fault: {}", engine, sub.context.0, e);
                    break StepOutcome::Fault;
                }
            }
            executed += 1;
        };

        match outcome {
            StepOutcome::Completed => {
                log::trace!("SimGpu: {:?} ctx={} task={} completed", engine, sub.context.0, sub.task);
                self.progress
                    .lock()
                    .entry(sub.context)
                    .or_default()
                    .complete(sub.task);
            }
            StepOutcome::Fault => {
                self.hung.store(true, Ordering::Release);
            }
            StepOutcome::Yielded => {
                streamer.pending.push_back(sub);
                if executed > 0 {
                    return StepOutcome::Progress;
                }
                // Nobody else to run: the yield behaves like a blocked wait.
                if streamer.pending.len() == 1 {
                    return StepOutcome::Blocked;
                }
            }
            StepOutcome::Blocked => {
                streamer.pending.push_front(sub);
                if executed > 0 {
                    return StepOutcome::Progress;
                }
            }
            StepOutcome::Progress => streamer.pending.push_front(sub),
            StepOutcome::Idle => {}
        }
        outcome
    }

    /// Round-robin every engine until none of them can make progress.
    /// Returns true when all queues drained.
    ///
    /// A pass in which every submission on every engine either blocked or
    /// yielded without executing a command counts as no progress, and the
    /// number of passes is capped, so this always returns.
    pub fn run_until_idle(&self) -> bool {
        for _ in 0..MAX_IDLE_PASSES {
            let mut advanced = false;
            let mut busy = false;
            for engine in EngineClass::ALL {
                match self.step_engine(engine) {
                    StepOutcome::Idle => {}
                    StepOutcome::Blocked | StepOutcome::Yielded => busy = true,
                    StepOutcome::Progress | StepOutcome::Completed => {
                        advanced = true;
                        busy = true;
                    }
                    StepOutcome::Fault => return false,
                }
            }
            if !busy {
                return true;
            }
            if !advanced {
                return false;
            }
        }
        log::debug!("SimGpu: still busy after {} passes", MAX_IDLE_PASSES);
        false
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    /// Step one engine, rotating past submissions that yield without doing
    /// anything. Returns `Blocked` once every pending submission has yielded.
    fn step_engine(&self, engine: EngineClass) -> StepOutcome {
        let mut yields = 0usize;
        loop {
            let outcome = self.step(engine);
            if outcome != StepOutcome::Yielded {
                return outcome;
            }
            yields += 1;
            if yields >= self.pending_count(engine) {
                return StepOutcome::Blocked;
            }
        }
    }

    fn execute(
        &self,
        engine: EngineClass,
        streamer: &mut Streamer,
        sub: &Submission,
        command: Command,
    ) -> std::result::Result<Exec, MemoryError> {
        log::trace!("SimGpu: {:?} @{} {:?}", engine, sub.pos, command);
        match command {
            Command::Noop => {}
            Command::SemaphoreWait {
                addr,
                value,
                op,
                qword,
                register_mode,
            } => {
                let data = if register_mode {
                    let lo = streamer.registers.get(&GPR0_LO).copied().unwrap_or(0);
                    let hi = streamer.registers.get(&GPR0_HI).copied().unwrap_or(0);
                    (lo as u64) | ((hi as u64) << 32)
                } else {
                    value
                };
                let (memory, data) = self.load(addr, data, qword)?;
                if !op.evaluate(memory, data) {
                    return Ok(Exec::Blocked);
                }
            }
            Command::StoreDataImm { addr, value, qword } => {
                if qword {
                    self.memory.write_u64(addr, value)?;
                } else {
                    self.memory.write_u32(addr, value as u32)?;
                }
            }
            Command::Atomic {
                addr,
                op,
                operand1,
                operand2,
                qword,
            } => {
                if qword {
                    self.memory.atomic_u64(addr, |old| op.apply(old, operand1, operand2))?;
                } else {
                    self.memory.atomic_u32(addr, |old| {
                        op.apply(old as u64, operand1 as u32 as u64, operand2 as u32 as u64) as u32
                    })?;
                }
                if op == AtomicOp::CmpWr {
                    log::trace!("SimGpu: cmpwr at 0x{:X}", addr);
                }
            }
            Command::LoadRegisterImm { register, value } => {
                streamer.registers.insert(register, value);
            }
            Command::PipeControl { dc_flush, post_sync } => {
                if dc_flush {
                    log::trace!("SimGpu: dc flush");
                }
                if let Some((addr, value)) = post_sync {
                    self.memory.write_u64(addr, value)?;
                }
            }
            Command::ConditionalBranch {
                addr,
                value,
                op,
                qword,
                target,
            } => {
                let (memory, data) = self.load(addr, value, qword)?;
                if op.evaluate(memory, data) {
                    return Ok(match target {
                        BranchTarget::Offset(offset) => Exec::Jump(offset as usize),
                        BranchTarget::Scheduler => Exec::Yield,
                    });
                }
            }
            Command::SetPredicate { enable } => log::trace!("SimGpu: predicate enable={}", enable),
            Command::BatchBufferStart { target } => return Ok(Exec::Jump(target as usize)),
            Command::Dispatch {
                kernel_id,
                group_count,
                partitions,
                cooperative,
            } => {
                self.trace.lock().push(DispatchRecord {
                    engine,
                    context: sub.context,
                    task: sub.task,
                    kernel_id,
                    group_count,
                    partitions,
                    cooperative,
                });
            }
            Command::Copy { src, dst, size, .. } => self.memory.copy(src, dst, size)?,
            Command::Fill { dst, size, pattern } => self.memory.fill(dst, size, pattern)?,
            Command::Timestamp { addr } => {
                let now = self.timestamp.fetch_add(TIMESTAMP_TICK, Ordering::AcqRel) + TIMESTAMP_TICK;
                self.memory.write_u64(addr, now)?;
            }
            Command::BatchBufferEnd => return Ok(Exec::End),
        }
        Ok(Exec::Continue)
    }

    /// Read the compared memory value, truncating both sides for dword compares.
    fn load(&self, addr: GpuAddr, data: u64, qword: bool) -> std::result::Result<(u64, u64), MemoryError> {
        if qword {
            Ok((self.memory.read_u64(addr)?, data))
        } else {
            Ok((self.memory.read_u32(addr)? as u64, data as u32 as u64))
        }
    }
}
