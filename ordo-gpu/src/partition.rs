// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Counter signal and wait encoding across tile partitions.

use ordo_common::GpuAddr;

use crate::command_stream::{
    AtomicOp, BranchTarget, CmdHandle, CommandEncoder, CommandStream, CompareOp,
};
use crate::counter::{Counter, IncrementMode};
use crate::patch::PatchKind;

/// A location written or compared by an encoded sequence whose value
/// depends on the counter baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    pub handle: CmdHandle,
    pub kind: PatchKind,
}

/// How a wait is expressed in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitForm {
    /// Inline semaphore wait (dword compare).
    Semaphore,
    /// Register-loaded 64-bit semaphore wait.
    RegisterPair,
    /// Conditional branch back to the scheduler while not yet satisfied.
    SchedulerBranch,
}

/// Whether a flush has to precede the counter write so a host observer
/// sees coherent memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    Device,
    HostFlushed,
}

pub struct PartitionSignaler<'a> {
    counter: &'a Counter,
}

impl<'a> PartitionSignaler<'a> {
    pub fn new(counter: &'a Counter) -> Self {
        Self { counter }
    }

    pub fn partition_count(&self) -> u32 {
        self.counter.partition_count()
    }

    /// Encode the counter moving to `new_value`.
    ///
    /// Atomic mode issues one add of the partition count. Explicit mode
    /// issues one store per partition slot; a single partition that needs a
    /// flush folds the store into the flush as a post-sync write. A mirror
    /// receives one aggregate store after the primary side.
    pub fn encode_signal(
        &self,
        cs: &mut CommandStream,
        new_value: u64,
        scope: SignalScope,
    ) -> Vec<PatchSite> {
        let flush = scope == SignalScope::HostFlushed;
        let partitions = self.partition_count();
        let mut sites = Vec::new();

        match self.counter.increment_mode() {
            IncrementMode::AtomicIncrement => {
                if flush {
                    cs.encode_pipe_control(true, None);
                }
                cs.encode_atomic(
                    self.counter.primary_address(),
                    AtomicOp::Add,
                    [partitions as u64, 0],
                    true,
                );
            }
            IncrementMode::ExplicitStore => {
                if flush && partitions == 1 {
                    let handle =
                        cs.encode_pipe_control(true, Some((self.counter.primary_address(), new_value)));
                    sites.push(PatchSite {
                        handle,
                        kind: PatchKind::PipeControlPostSync,
                    });
                } else {
                    if flush {
                        cs.encode_pipe_control(true, None);
                    }
                    for partition in 0..partitions {
                        let handle = cs.encode_store_immediate(
                            self.counter.partition_address(partition),
                            new_value,
                            true,
                        );
                        sites.push(PatchSite {
                            handle,
                            kind: PatchKind::StoreImmediate,
                        });
                    }
                }
            }
        }

        if let Ok(mirror) = self.counter.mirror_address() {
            let handle = cs.encode_store_immediate(mirror, new_value, true);
            sites.push(PatchSite {
                handle,
                kind: PatchKind::StoreImmediate,
            });
        }

        log::trace!(
            "PartitionSignaler: counter #{} -> {} ({:?}, {} partitions)",
            self.counter.id(),
            new_value,
            self.counter.increment_mode(),
            partitions
        );
        sites
    }

    /// Encode a wait until the counter reaches `value`, once per slot the
    /// producers write.
    pub fn encode_wait(&self, cs: &mut CommandStream, value: u64, form: WaitForm) -> Vec<PatchSite> {
        self.counter
            .wait_addresses()
            .into_iter()
            .map(|addr| encode_wait_at(cs, addr, value, form))
            .collect()
    }
}

fn encode_wait_at(cs: &mut CommandStream, addr: GpuAddr, value: u64, form: WaitForm) -> PatchSite {
    match form {
        WaitForm::Semaphore => PatchSite {
            handle: cs.encode_semaphore_wait(addr, value, CompareOp::GreaterOrEqual, false),
            kind: PatchKind::SemaphoreWait,
        },
        WaitForm::RegisterPair => PatchSite {
            handle: cs.encode_register_semaphore_wait(addr, value, CompareOp::GreaterOrEqual),
            kind: PatchKind::RegisterLoadPair,
        },
        WaitForm::SchedulerBranch => PatchSite {
            handle: cs.encode_conditional_branch(
                addr,
                value,
                CompareOp::Less,
                true,
                BranchTarget::Scheduler,
            ),
            // Scheduler branches are only emitted by lists that never re-execute.
            kind: PatchKind::SemaphoreWait,
        },
    }
}
