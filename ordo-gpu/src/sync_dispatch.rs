// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synchronized dispatch: a token that keeps command lists which must not
//! interleave from running their dispatches concurrently.
//!
//! ## Token layout (one qword, device-wide)
//!
//! | Bytes | Field                                 |
//! |-------|---------------------------------------|
//! | 0..4  | partition count of the current owner  |
//! | 4..8  | owner queue id + 1 (0 = free)         |
//!
//! `Full` lists acquire the token with a compare-and-swap from 0 before each
//! append and release it afterwards. Every tile releases by decrementing the
//! low dword once; the tile that brings it to zero clears the owner. The
//! stream carries one release per tile, the same way per-partition counter
//! writes are spelled out.
//! `Limited` lists only wait for the token to be free and never own it.
//! Single-tile lists have nothing to serialize and stay disabled.

use ordo_common::settings::SynchronizedDispatchMode;
use ordo_common::{GpuAddr, QueueId, Result, QUEUE_ID_NONE};

use crate::command_stream::{AtomicOp, BranchTarget, CommandEncoder, CommandStream, CompareOp};
use crate::device::Device;
use crate::memory_manager::GpuBuffer;

/// Token value while `queue_id` owns it with `partition_count` tiles.
pub fn token_value(queue_id: QueueId, partition_count: u32) -> u64 {
    ((queue_id as u64 + 1) << 32) | partition_count as u64
}

#[derive(Debug, Clone, Copy)]
pub struct SynchronizedDispatchCoordinator {
    mode: SynchronizedDispatchMode,
    queue_id: QueueId,
    token: Option<GpuBuffer>,
    work_partition: GpuAddr,
    partition_count: u32,
}

impl SynchronizedDispatchCoordinator {
    pub fn disabled() -> Self {
        Self {
            mode: SynchronizedDispatchMode::Disabled,
            queue_id: QUEUE_ID_NONE,
            token: None,
            work_partition: 0,
            partition_count: 1,
        }
    }

    /// Set up the protocol for one list. The device override, when set,
    /// replaces the requested mode. Only multi-tile `Full` lists take a
    /// queue id.
    pub fn enable(
        device: &Device,
        requested: SynchronizedDispatchMode,
        partition_count: u32,
    ) -> Result<Self> {
        let mode = device.settings().synchronized_dispatch.unwrap_or(requested);
        if mode == SynchronizedDispatchMode::Disabled || partition_count <= 1 {
            return Ok(Self::disabled());
        }
        let token = device.ensure_token_allocated()?;
        let queue_id = match mode {
            SynchronizedDispatchMode::Full => device.assign_queue_id(),
            _ => QUEUE_ID_NONE,
        };
        log::debug!(
            "SyncDispatch: {:?} queue_id={} partitions={}",
            mode,
            if queue_id == QUEUE_ID_NONE { -1 } else { queue_id as i64 },
            partition_count
        );
        Ok(Self {
            mode,
            queue_id,
            token: Some(token),
            work_partition: device.work_partition_address(),
            partition_count,
        })
    }

    pub fn mode(&self) -> SynchronizedDispatchMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != SynchronizedDispatchMode::Disabled
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn token_buffer(&self) -> Option<GpuBuffer> {
        self.token
    }

    /// Encode what runs before the guarded work.
    pub fn encode_acquire(&self, cs: &mut CommandStream) {
        let Some(token) = self.token else {
            return;
        };
        let token_addr = token.gpu_va;
        let owner_addr = token_addr + 4;

        match self.mode {
            SynchronizedDispatchMode::Disabled => {}
            SynchronizedDispatchMode::Limited => {
                cs.encode_semaphore_wait(owner_addr, 0, CompareOp::Equal, false);
            }
            SynchronizedDispatchMode::Full => {
                let owner = self.queue_id as u64 + 1;

                // Secondary tiles skip the compare-and-swap.
                let to_secondary = cs.encode_conditional_branch(
                    self.work_partition,
                    0,
                    CompareOp::NotEqual,
                    false,
                    BranchTarget::Offset(0),
                );

                let retry = cs.offset();
                cs.encode_set_predicate(false);
                cs.encode_atomic(
                    token_addr,
                    AtomicOp::CmpWr,
                    [0, token_value(self.queue_id, self.partition_count)],
                    true,
                );
                let acquired =
                    cs.encode_conditional_branch(owner_addr, owner, CompareOp::Equal, false, BranchTarget::Offset(0));
                cs.encode_semaphore_wait(owner_addr, 0, CompareOp::Equal, false);
                cs.encode_batch_buffer_start(retry);

                let secondary = cs.offset();
                cs.encode_set_predicate(false);
                cs.encode_semaphore_wait(owner_addr, owner, CompareOp::Equal, false);

                let done = cs.offset();
                cs.encode_set_predicate(false);

                // Both handles were just encoded by this stream.
                let _ = cs.patch_branch_target(to_secondary, secondary);
                let _ = cs.patch_branch_target(acquired, done);
            }
        }
    }

    /// Encode what runs after the guarded work. Only `Full` lists release.
    pub fn encode_release(&self, cs: &mut CommandStream) {
        let (SynchronizedDispatchMode::Full, Some(token)) = (self.mode, self.token) else {
            return;
        };
        let released = (self.queue_id as u64 + 1) << 32;
        for _ in 0..self.partition_count {
            cs.encode_atomic(token.gpu_va, AtomicOp::Decrement, [0, 0], false);
            cs.encode_atomic(token.gpu_va, AtomicOp::CmpWr, [released, 0], true);
        }
    }
}
