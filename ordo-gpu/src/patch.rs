// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Patch descriptors for re-executable command lists.
//!
//! A Regular list is recorded once and executed many times. Every encoded
//! value that depends on a counter baseline is registered here and rewritten
//! by [`PatchRegistry::patch_all`] before each execution.
//!
//! Descriptors refer to counters through an index into the registry's
//! counter table. Pointing a dependency at another counter swaps the index
//! and moves the command's address to the matching slot of the new counter.

use std::sync::Arc;

use ordo_common::{Error, GpuAddr, Result};

use crate::command_stream::{CmdHandle, CommandStream};
use crate::counter::Counter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    SemaphoreWait,
    StoreImmediate,
    RegisterLoadPair,
    PipeControlPostSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    /// Dependency on the list's own counter: `baseline + loop_delta * run`.
    Implicit,
    /// Dependency on another counter: follows that counter's latest run.
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub handle: CmdHandle,
    pub kind: PatchKind,
    pub counter: CounterIndex,
    pub baseline: u64,
    pub mode: PatchMode,
    pub enabled: bool,
}

#[derive(Default)]
pub struct PatchRegistry {
    counters: Vec<Arc<Counter>>,
    descriptors: Vec<PatchDescriptor>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[PatchDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: PatchId) -> Option<&PatchDescriptor> {
        self.descriptors.get(id.0)
    }

    pub fn counter(&self, index: CounterIndex) -> Option<&Arc<Counter>> {
        self.counters.get(index.0)
    }

    pub fn register(
        &mut self,
        handle: CmdHandle,
        kind: PatchKind,
        counter: &Arc<Counter>,
        baseline: u64,
        mode: PatchMode,
    ) -> PatchId {
        let index = self.counter_index(counter);
        self.descriptors.push(PatchDescriptor {
            handle,
            kind,
            counter: index,
            baseline,
            mode,
            enabled: true,
        });
        log::trace!(
            "PatchRegistry: {:?} {:?} at dword {} counter #{} baseline {}",
            mode,
            kind,
            handle.0,
            counter.id(),
            baseline
        );
        PatchId(self.descriptors.len() - 1)
    }

    /// Drop descriptors registered after the first `len` (append rollback).
    pub fn truncate(&mut self, len: usize) {
        self.descriptors.truncate(len);
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.counters.clear();
    }

    pub fn set_enabled(&mut self, id: PatchId, enabled: bool) -> Result<()> {
        let descriptor = self.descriptor_mut(id)?;
        descriptor.enabled = enabled;
        Ok(())
    }

    /// Value the descriptor should hold for execution number `submission_index`
    /// (0 for the first run).
    pub fn expected_value(&self, descriptor: &PatchDescriptor, submission_index: u64) -> u64 {
        let counter = &self.counters[descriptor.counter.0];
        match descriptor.mode {
            PatchMode::Implicit => {
                descriptor.baseline + counter.current_value() * submission_index
            }
            PatchMode::Explicit => counter.adjusted_value(descriptor.baseline),
        }
    }

    /// Rewrite every enabled descriptor for execution number `submission_index`.
    pub fn patch_all(&self, stream: &mut CommandStream, submission_index: u64) -> Result<usize> {
        let mut patched = 0;
        for descriptor in self.descriptors.iter().filter(|d| d.enabled) {
            let value = self.expected_value(descriptor, submission_index);
            match descriptor.kind {
                PatchKind::SemaphoreWait => stream.patch_semaphore_value(descriptor.handle, value)?,
                PatchKind::StoreImmediate => stream.patch_store_value(descriptor.handle, value)?,
                PatchKind::RegisterLoadPair => stream.patch_register_pair(descriptor.handle, value)?,
                PatchKind::PipeControlPostSync => {
                    stream.patch_post_sync_value(descriptor.handle, value)?
                }
            }
            patched += 1;
        }
        log::debug!(
            "PatchRegistry: patched {} of {} descriptors for run {}",
            patched,
            self.descriptors.len(),
            submission_index
        );
        Ok(patched)
    }

    /// Point a descriptor at `counter`. Without `preserve_baseline` the
    /// baseline restarts at the new counter's current value.
    ///
    /// Commands that address a slot of the old counter are moved to the
    /// same slot of the new one, so both counters must expose the same
    /// number of wait slots.
    pub fn update_in_order_exec_info(
        &mut self,
        stream: &mut CommandStream,
        id: PatchId,
        counter: &Arc<Counter>,
        preserve_baseline: bool,
    ) -> Result<()> {
        let descriptor = *self.descriptor_mut(id)?;
        let old = self.counters[descriptor.counter.0].clone();
        check_rebind(&old, counter)?;

        let addr = stream.counter_address(descriptor.handle)?;
        if let Some(new_addr) = retarget(&old, counter, addr)? {
            stream.patch_counter_address(descriptor.handle, new_addr)?;
        }

        let index = self.counter_index(counter);
        let baseline = counter.current_value();
        let descriptor = self.descriptor_mut(id)?;
        descriptor.counter = index;
        if !preserve_baseline {
            descriptor.baseline = baseline;
        }
        Ok(())
    }

    /// Ids of the descriptors currently bound to `counter`.
    pub fn descriptors_for(&self, counter: &Counter) -> Vec<PatchId> {
        self.descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| self.counters[d.counter.0].id() == counter.id())
            .map(|(i, _)| PatchId(i))
            .collect()
    }

    fn counter_index(&mut self, counter: &Arc<Counter>) -> CounterIndex {
        if let Some(i) = self.counters.iter().position(|c| c.id() == counter.id()) {
            return CounterIndex(i);
        }
        self.counters.push(counter.clone());
        CounterIndex(self.counters.len() - 1)
    }

    fn descriptor_mut(&mut self, id: PatchId) -> Result<&mut PatchDescriptor> {
        self.descriptors
            .get_mut(id.0)
            .ok_or_else(|| Error::invalid_argument(format!("unknown patch descriptor {}", id.0)))
    }
}

/// Reject rebinding between counters whose slot layouts differ.
pub fn check_rebind(old: &Counter, new: &Counter) -> Result<()> {
    let (from, to) = (old.wait_addresses().len(), new.wait_addresses().len());
    if from != to {
        return Err(Error::invalid_argument(format!(
            "counter #{} has {} wait slot(s), counter #{} has {}",
            old.id(),
            from,
            new.id(),
            to
        )));
    }
    Ok(())
}

/// Slot of `new` matching `addr` in `old`. `None` when `addr` is not a slot
/// of `old` (an event packet, for instance).
fn retarget(old: &Counter, new: &Counter, addr: GpuAddr) -> Result<Option<GpuAddr>> {
    if let Some(slot) = old.wait_addresses().iter().position(|&a| a == addr) {
        return Ok(new.wait_addresses().get(slot).copied());
    }
    match old.mirror_address() {
        Ok(mirror) if mirror == addr => new.mirror_address().map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_stream::{Command, CommandEncoder, CompareOp};
    use crate::counter::{CounterAllocator, CounterConfig, CounterOwner};
    use crate::memory_manager::GpuMemory;

    fn counter(alloc: &Arc<CounterAllocator>, owner: CounterOwner) -> Arc<Counter> {
        Counter::allocate(
            alloc,
            CounterConfig {
                owner,
                partition_count: 1,
                atomic: false,
                mirrored: false,
            },
        )
        .unwrap()
    }

    fn wait_value(stream: &CommandStream, handle: CmdHandle) -> u64 {
        let parsed = stream.parse().unwrap();
        match parsed.iter().find(|p| p.handle == handle).map(|p| p.command) {
            Some(Command::SemaphoreWait { value, .. }) => value,
            Some(Command::StoreDataImm { value, .. }) => value,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_implicit_patch_per_run() {
        let alloc = Arc::new(CounterAllocator::new(Arc::new(GpuMemory::new())));
        let own = counter(&alloc, CounterOwner::RegularList);
        let mut cs = CommandStream::new();
        let mut registry = PatchRegistry::new();

        let wait = cs.encode_semaphore_wait(own.primary_address(), 1, CompareOp::GreaterOrEqual, false);
        registry.register(wait, PatchKind::SemaphoreWait, &own, 1, PatchMode::Implicit);
        let store = cs.encode_store_immediate(own.primary_address(), 2, true);
        registry.register(store, PatchKind::StoreImmediate, &own, 2, PatchMode::Implicit);
        own.advance(2);

        for run in 0..3u64 {
            assert_eq!(registry.patch_all(&mut cs, run).unwrap(), 2);
            assert_eq!(wait_value(&cs, wait), 1 + 2 * run);
            assert_eq!(wait_value(&cs, store), 2 + 2 * run);
        }
    }

    #[test]
    fn test_disabled_descriptor_is_skipped() {
        let alloc = Arc::new(CounterAllocator::new(Arc::new(GpuMemory::new())));
        let own = counter(&alloc, CounterOwner::RegularList);
        own.advance(1);
        let mut cs = CommandStream::new();
        let mut registry = PatchRegistry::new();
        let wait = cs.encode_semaphore_wait(own.primary_address(), 1, CompareOp::GreaterOrEqual, false);
        let id = registry.register(wait, PatchKind::SemaphoreWait, &own, 1, PatchMode::Implicit);

        registry.set_enabled(id, false).unwrap();
        assert_eq!(registry.patch_all(&mut cs, 5).unwrap(), 0);
        assert_eq!(wait_value(&cs, wait), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.set_enabled(PatchId(7), true).is_err());
    }

    #[test]
    fn test_explicit_rebind() {
        let alloc = Arc::new(CounterAllocator::new(Arc::new(GpuMemory::new())));
        let other = counter(&alloc, CounterOwner::RegularList);
        let replacement = counter(&alloc, CounterOwner::ImmediateList);
        other.advance(3);
        replacement.advance(10);

        let mut cs = CommandStream::new();
        let mut registry = PatchRegistry::new();
        let wait = cs.encode_semaphore_wait(other.primary_address(), 3, CompareOp::GreaterOrEqual, false);
        let id = registry.register(wait, PatchKind::SemaphoreWait, &other, 3, PatchMode::Explicit);

        // Other list ran twice: its second run ends at 6.
        other.add_submission();
        other.add_submission();
        registry.patch_all(&mut cs, 0).unwrap();
        assert_eq!(wait_value(&cs, wait), 6);

        registry.update_in_order_exec_info(&mut cs, id, &replacement, true).unwrap();
        registry.patch_all(&mut cs, 0).unwrap();
        assert_eq!(wait_value(&cs, wait), 3);
        assert_eq!(cs.counter_address(wait).unwrap(), replacement.primary_address());
        assert_eq!(registry.descriptors_for(&replacement), vec![id]);
        assert!(registry.descriptors_for(&other).is_empty());

        registry.update_in_order_exec_info(&mut cs, id, &replacement, false).unwrap();
        registry.patch_all(&mut cs, 0).unwrap();
        assert_eq!(wait_value(&cs, wait), 10);
    }

    #[test]
    fn test_rebind_rejects_slot_mismatch() {
        let alloc = Arc::new(CounterAllocator::new(Arc::new(GpuMemory::new())));
        let single = counter(&alloc, CounterOwner::RegularList);
        let split = Counter::allocate(
            &alloc,
            CounterConfig {
                owner: CounterOwner::RegularList,
                partition_count: 2,
                atomic: false,
                mirrored: false,
            },
        )
        .unwrap();
        single.advance(1);

        let mut cs = CommandStream::new();
        let mut registry = PatchRegistry::new();
        let wait = cs.encode_semaphore_wait(single.primary_address(), 1, CompareOp::GreaterOrEqual, false);
        let id = registry.register(wait, PatchKind::SemaphoreWait, &single, 1, PatchMode::Explicit);

        assert!(registry.update_in_order_exec_info(&mut cs, id, &split, false).is_err());
        assert_eq!(cs.counter_address(wait).unwrap(), single.primary_address());
        assert_eq!(registry.descriptors_for(&single), vec![id]);
    }

    #[test]
    fn test_truncate_for_rollback() {
        let alloc = Arc::new(CounterAllocator::new(Arc::new(GpuMemory::new())));
        let own = counter(&alloc, CounterOwner::RegularList);
        let mut cs = CommandStream::new();
        let mut registry = PatchRegistry::new();
        let a = cs.encode_store_immediate(0x1000, 1, true);
        registry.register(a, PatchKind::StoreImmediate, &own, 1, PatchMode::Implicit);
        let mark = registry.len();
        let b = cs.encode_store_immediate(0x1000, 2, true);
        registry.register(b, PatchKind::StoreImmediate, &own, 2, PatchMode::Implicit);
        registry.truncate(mark);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.descriptors()[0].handle, a);
    }
}
