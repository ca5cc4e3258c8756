// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ordo_common::settings::{
    AtomicSignalingPolicy, CopyOffloadMode, Settings, SynchronizedDispatchMode,
};
use ordo_common::{Error, GpuAddr, EVENT_PACKET_NOT_READY, QUEUE_ID_NONE};

use super::*;
use crate::command_processor::EngineClass;
use crate::command_queue::CommandQueue;
use crate::command_stream::{AtomicOp, Command, GPR0_LO};
use crate::device::DeviceCaps;
use crate::event::{EventFlags, EventPool};

const TIMEOUT: Duration = Duration::from_secs(2);

fn device_with(settings: Settings, caps: DeviceCaps) -> Arc<Device> {
    Device::new(settings, caps).unwrap()
}

fn device() -> Arc<Device> {
    device_with(Settings::default(), DeviceCaps::default())
}

fn launch(kernel_id: u32) -> KernelLaunch {
    KernelLaunch {
        kernel_id,
        group_count: 4,
        cooperative: false,
    }
}

fn regular(device: &Arc<Device>, partition_count: u32) -> Arc<CommandList> {
    CommandList::create(
        device,
        CommandListDesc {
            partition_count,
            ..CommandListDesc::regular()
        },
    )
    .unwrap()
}

fn immediate(device: &Arc<Device>) -> Arc<CommandList> {
    CommandList::create(device, CommandListDesc::immediate()).unwrap()
}

fn commands(list: &CommandList) -> Vec<Command> {
    list.recorded_commands()
        .unwrap()
        .into_iter()
        .map(|p| p.command)
        .collect()
}

fn semaphore_waits(commands: &[Command]) -> Vec<(GpuAddr, u64)> {
    commands
        .iter()
        .filter_map(|c| match *c {
            Command::SemaphoreWait { addr, value, .. } => Some((addr, value)),
            _ => None,
        })
        .collect()
}

fn stores(commands: &[Command]) -> Vec<(GpuAddr, u64)> {
    commands
        .iter()
        .filter_map(|c| match *c {
            Command::StoreDataImm { addr, value, .. } => Some((addr, value)),
            _ => None,
        })
        .collect()
}

// -----------------------------------------------------------------------
// End to end
// -----------------------------------------------------------------------

#[test]
fn test_signal_completes_only_after_gpu_write() {
    let d = device();
    let list = immediate(&d);
    let pool = EventPool::new(&d, 1, EventFlags::HOST_VISIBLE).unwrap();
    let event = pool.create_event(0).unwrap();

    list.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    assert_eq!(list.counter().current_value(), 1);
    assert_eq!(list.counter().completed_value().unwrap(), 0);
    assert_eq!(event.query_status().unwrap(), EventStatus::Pending);

    list.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(list.counter().completed_value().unwrap(), 1);
    assert_eq!(event.query_status().unwrap(), EventStatus::Signaled);
    let producer = event.producer().unwrap();
    assert_eq!(producer.context.engine(), EngineClass::Compute);
    assert_eq!(producer.task, 1);
}

#[test]
fn test_counter_based_event_follows_list_counter() {
    let d = device();
    let list = immediate(&d);
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();

    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.append_launch_kernel(&launch(2), Some(&event), &[]).unwrap();
    let binding = event.binding().unwrap();
    assert_eq!(binding.counter.id(), list.counter().id());
    assert_eq!(binding.base_value, 2);
    assert_eq!(event.query_status().unwrap(), EventStatus::Pending);

    event.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(event.query_status().unwrap(), EventStatus::Signaled);
}

#[test]
fn test_monotonic_counter_with_atomic_partitions() {
    let caps = DeviceCaps {
        partition_count: 4,
        ..DeviceCaps::default()
    };
    let d = device_with(Settings::default(), caps);
    let list = immediate(&d);
    assert!(list.counter().is_atomic());

    for kernel in 0..5 {
        list.append_launch_kernel(&launch(kernel), None, &[]).unwrap();
    }
    assert_eq!(list.counter().current_value(), 20);
    list.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(list.counter().completed_value().unwrap(), 20);
    assert!(d.gpu().dispatch_trace().iter().all(|r| r.partitions == 4));
}

// -----------------------------------------------------------------------
// Partition scaling
// -----------------------------------------------------------------------

#[test]
fn test_atomic_signal_is_one_add_of_partition_count() {
    let d = device();
    let list = regular(&d, 4);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();

    let cmds = commands(&list);
    let atomics: Vec<&Command> = cmds.iter().filter(|c| matches!(c, Command::Atomic { .. })).collect();
    assert_eq!(atomics.len(), 1);
    assert_eq!(
        *atomics[0],
        Command::Atomic {
            addr: list.counter().primary_address(),
            op: AtomicOp::Add,
            operand1: 4,
            operand2: 0,
            qword: true,
        }
    );
    assert!(stores(&cmds).is_empty());
}

#[test]
fn test_explicit_signal_is_one_store_per_partition() {
    let settings = Settings {
        atomic_signaling: AtomicSignalingPolicy::Disabled,
        ..Settings::default()
    };
    let d = device_with(settings, DeviceCaps::default());
    let list = regular(&d, 4);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();

    let cmds = commands(&list);
    assert!(!cmds.iter().any(|c| matches!(c, Command::Atomic { .. })));
    let writes = stores(&cmds);
    assert_eq!(writes.len(), 4);
    assert!(writes.iter().all(|(_, value)| *value == 1));
    let addrs: HashSet<GpuAddr> = writes.iter().map(|(addr, _)| *addr).collect();
    assert_eq!(addrs.len(), 4);
}

// -----------------------------------------------------------------------
// Regular lists and patching
// -----------------------------------------------------------------------

#[test]
fn test_reexecution_patches_every_run() {
    let d = device();
    let queue = CommandQueue::new(&d);
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.append_launch_kernel(&launch(2), None, &[]).unwrap();
    list.close().unwrap();
    assert_eq!(list.patch_count(), 3);

    let counter_addr = list.counter().primary_address();
    for run in 0..3u64 {
        queue.execute_command_lists(&[list.clone()]).unwrap();
        let cmds = commands(&list);
        assert_eq!(semaphore_waits(&cmds), vec![(counter_addr, 1 + 2 * run)]);
        assert_eq!(
            stores(&cmds),
            vec![(counter_addr, 1 + 2 * run), (counter_addr, 2 + 2 * run)]
        );
        queue.synchronize(TIMEOUT).unwrap();
        assert_eq!(list.counter().completed_value().unwrap(), 2 * (run + 1));
    }
    assert_eq!(list.state(), ListState::Executing);
    assert_eq!(list.counter().host_target(), 6);
    list.host_synchronize(TIMEOUT).unwrap();
}

#[test]
fn test_regular_list_state_machine() {
    let d = device();
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.close().unwrap();
    assert_eq!(list.state(), ListState::Closed);
    assert_eq!(list.close(), Err(Error::InvalidState("command list is already closed")));
    assert!(matches!(
        list.append_launch_kernel(&launch(2), None, &[]),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(list.flush(), Err(Error::InvalidState(_))));

    list.reset().unwrap();
    assert_eq!(list.state(), ListState::Recording);
    assert_eq!(list.counter().current_value(), 0);
    assert_eq!(list.patch_count(), 0);
    assert!(list.recorded_words().is_empty());
}

#[test]
fn test_reexecution_refused_without_patching() {
    let settings = Settings {
        regular_list_patching: false,
        ..Settings::default()
    };
    let d = device_with(settings, DeviceCaps::default());
    let queue = CommandQueue::new(&d);
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.append_launch_kernel(&launch(2), None, &[]).unwrap();
    list.close().unwrap();
    assert_eq!(list.patch_count(), 0);

    queue.execute_command_lists(&[list.clone()]).unwrap();
    assert!(matches!(
        queue.execute_command_lists(&[list.clone()]),
        Err(Error::InvalidState(_))
    ));
    queue.synchronize(TIMEOUT).unwrap();
    assert_eq!(list.counter().completed_value().unwrap(), 2);
}

#[test]
fn test_regular_signalled_event_tracks_latest_run() {
    let d = device();
    let queue = CommandQueue::new(&d);
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    list.close().unwrap();

    queue.execute_command_lists(&[list.clone()]).unwrap();
    queue.synchronize(TIMEOUT).unwrap();
    assert_eq!(event.query_status().unwrap(), EventStatus::Signaled);

    queue.execute_command_lists(&[list.clone()]).unwrap();
    assert_eq!(event.binding().unwrap().expected_value(), 2);
    assert_eq!(event.query_status().unwrap(), EventStatus::Pending);
    event.host_synchronize(TIMEOUT).unwrap();
    assert!(event.is_bound_to_regular_list());
}

#[test]
fn test_qword_counters_use_register_pair() {
    let settings = Settings {
        qword_counters: true,
        ..Settings::default()
    };
    let d = device_with(settings, DeviceCaps::default());
    let queue = CommandQueue::new(&d);
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.append_launch_kernel(&launch(2), None, &[]).unwrap();
    list.close().unwrap();

    for _ in 0..2 {
        queue.execute_command_lists(&[list.clone()]).unwrap();
        queue.synchronize(TIMEOUT).unwrap();
    }
    let cmds = commands(&list);
    assert!(cmds.iter().any(|c| *c == Command::LoadRegisterImm { register: GPR0_LO, value: 3 }));
    assert!(cmds
        .iter()
        .any(|c| matches!(c, Command::SemaphoreWait { register_mode: true, qword: true, .. })));
    assert_eq!(list.counter().completed_value().unwrap(), 4);
}

#[test]
fn test_host_flush_folds_signal_into_post_sync() {
    let caps = DeviceCaps {
        dc_flush_required_on_signal: true,
        ..DeviceCaps::default()
    };
    let d = device_with(Settings::default(), caps);
    let pool = EventPool::new(&d, 1, EventFlags::HOST_VISIBLE).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();

    let cmds = commands(&list);
    assert!(cmds.contains(&Command::PipeControl {
        dc_flush: true,
        post_sync: Some((list.counter().primary_address(), 1)),
    }));
    // Post-sync signal and the event packet are both patched.
    assert_eq!(list.patch_count(), 2);
}

// -----------------------------------------------------------------------
// Waits
// -----------------------------------------------------------------------

#[test]
fn test_wait_on_signalled_event_is_elided() {
    let d = device();
    let producer = immediate(&d);
    let pool = EventPool::new(&d, 1, EventFlags::HOST_VISIBLE).unwrap();
    let event = pool.create_event(0).unwrap();
    producer.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();

    let before = regular(&d, 1);
    before.append_launch_kernel(&launch(2), None, &[event.clone()]).unwrap();
    let waits = semaphore_waits(&commands(&before));
    assert_eq!(waits, vec![(event.packet_address(0).unwrap(), EVENT_PACKET_NOT_READY)]);

    producer.host_synchronize(TIMEOUT).unwrap();
    let after = regular(&d, 1);
    after.append_launch_kernel(&launch(2), None, &[event.clone()]).unwrap();
    assert!(semaphore_waits(&commands(&after)).is_empty());
}

#[test]
fn test_regular_bound_event_is_never_elided() {
    let d = device();
    let queue = CommandQueue::new(&d);
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();
    let producer = regular(&d, 1);
    producer.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    producer.close().unwrap();
    queue.execute_command_lists(&[producer.clone()]).unwrap();
    queue.synchronize(TIMEOUT).unwrap();
    assert_eq!(event.query_status().unwrap(), EventStatus::Signaled);

    let consumer = regular(&d, 1);
    consumer.append_launch_kernel(&launch(2), None, &[event.clone()]).unwrap();
    consumer.close().unwrap();
    let producer_addr = producer.counter().primary_address();
    assert_eq!(semaphore_waits(&commands(&consumer)), vec![(producer_addr, 1)]);
    // Explicit wait plus the consumer's own signal.
    assert_eq!(consumer.patch_count(), 2);

    // The dependency follows the producer's latest run.
    queue.execute_command_lists(&[producer.clone()]).unwrap();
    queue.execute_command_lists(&[consumer.clone()]).unwrap();
    assert_eq!(semaphore_waits(&commands(&consumer)), vec![(producer_addr, 2)]);
    queue.synchronize(TIMEOUT).unwrap();
}

#[test]
fn test_cross_list_dependencies_stay_separate() {
    let d = device();
    let pool = EventPool::new(&d, 4, EventFlags::COUNTER_BASED).unwrap();
    let a_first = pool.create_event(0).unwrap();
    let a_second = pool.create_event(1).unwrap();
    let b_event = pool.create_event(2).unwrap();
    let own = pool.create_event(3).unwrap();

    let a = immediate(&d);
    let b = immediate(&d);
    a.append_launch_kernel(&launch(1), Some(&a_first), &[]).unwrap();
    a.append_launch_kernel(&launch(2), Some(&a_second), &[]).unwrap();
    b.append_launch_kernel(&launch(3), Some(&b_event), &[]).unwrap();

    let c = regular(&d, 1);
    c.append_barrier(Some(&own), &[]).unwrap();
    c.append_launch_kernel(
        &launch(4),
        None,
        &[a_first.clone(), a_second.clone(), b_event.clone(), own.clone()],
    )
    .unwrap();

    let waits = semaphore_waits(&commands(&c));
    assert_eq!(
        waits,
        vec![
            (c.counter().primary_address(), 1),
            (a.counter().primary_address(), 2),
            (b.counter().primary_address(), 1),
        ]
    );
    // Dependencies on Immediate lists are absolute: only the list's own
    // counter sites are patched.
    assert_eq!(c.patch_count(), 3);
}

#[test]
fn test_unsignalled_counter_event_is_invalid() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = regular(&d, 1);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    let words = list.recorded_words();
    let patches = list.patch_count();

    assert!(matches!(
        list.append_launch_kernel(&launch(2), None, &[event]),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(list.recorded_words(), words);
    assert_eq!(list.patch_count(), patches);
    assert_eq!(list.counter().current_value(), 1);
}

#[test]
fn test_standalone_event_dependency() {
    let d = device();
    let gate = Event::create_standalone(&d, 1).unwrap();
    let list = immediate(&d);
    list.append_launch_kernel(&launch(1), None, &[gate.clone()]).unwrap();
    assert_eq!(list.host_synchronize(Duration::ZERO), Err(Error::NotReady));
    assert!(d.gpu().dispatch_trace().is_empty());

    gate.host_signal().unwrap();
    list.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(d.gpu().dispatch_trace().len(), 1);
}

#[test]
fn test_relaxed_ordering_defers_waits_to_scheduler() {
    let settings = Settings {
        immediate_flush_batch: 8,
        ..Settings::default()
    };
    let d = device_with(settings, DeviceCaps::default());
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let event = pool.create_event(0).unwrap();
    let a = immediate(&d);
    let b = immediate(&d);
    assert!(d.default_context(EngineClass::Compute).relaxed_ordering_enabled());

    a.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    b.append_launch_kernel(&launch(2), None, &[event.clone()]).unwrap();
    let cmds = commands(&b);
    assert!(cmds.iter().any(|c| matches!(
        c,
        Command::ConditionalBranch { target: BranchTarget::Scheduler, op: CompareOp::Equal, .. }
    )));
    assert!(semaphore_waits(&cmds).is_empty());

    // Cooperative launches keep the blocking wait.
    let coop = KernelLaunch {
        cooperative: true,
        ..launch(3)
    };
    b.append_launch_kernel(&coop, None, &[event.clone()]).unwrap();
    assert_eq!(semaphore_waits(&commands(&b)).len(), 1);
    b.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(d.gpu().dispatch_trace().len(), 3);
}

#[test]
fn test_relaxed_ordering_needs_second_client_and_no_override() {
    let settings = Settings {
        immediate_flush_batch: 8,
        ..Settings::default()
    };
    let d = device_with(settings.clone(), DeviceCaps::default());
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let event = pool.create_event(0).unwrap();
    let only = immediate(&d);
    only.append_launch_kernel(&launch(1), None, &[event.clone()]).unwrap();
    assert_eq!(semaphore_waits(&commands(&only)).len(), 1);

    let disabled = Settings {
        relaxed_ordering: Some(false),
        ..settings
    };
    let d = device_with(disabled, DeviceCaps::default());
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let event = pool.create_event(0).unwrap();
    let first = immediate(&d);
    let _second = immediate(&d);
    first.append_launch_kernel(&launch(1), None, &[event.clone()]).unwrap();
    assert_eq!(semaphore_waits(&commands(&first)).len(), 1);
}

#[test]
fn test_host_synchronize_bounded_when_every_waiter_yields() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::HOST_VISIBLE).unwrap();
    let event = pool.create_event(0).unwrap();
    let a = immediate(&d);
    let b = immediate(&d);
    a.append_launch_kernel(&launch(1), None, &[event.clone()]).unwrap();
    b.append_launch_kernel(&launch(2), None, &[event.clone()]).unwrap();
    assert_eq!(d.gpu().pending_count(EngineClass::Compute), 2);

    let start = std::time::Instant::now();
    assert_eq!(a.host_synchronize(Duration::from_millis(50)), Err(Error::NotReady));
    assert!(start.elapsed() < TIMEOUT);
    assert!(d.gpu().dispatch_trace().is_empty());

    event.host_signal().unwrap();
    a.host_synchronize(TIMEOUT).unwrap();
    b.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(d.gpu().dispatch_trace().len(), 2);
}

// -----------------------------------------------------------------------
// Failures
// -----------------------------------------------------------------------

#[test]
fn test_failed_copy_rolls_back() {
    let d = device();
    let list = regular(&d, 1);
    let buffer = d.allocate_buffer(64).unwrap();
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    let words = list.recorded_words();
    let patches = list.patch_count();

    let result = list.append_memory_copy(
        BufferSlice::new(buffer, 32),
        BufferSlice::whole(buffer),
        64,
        None,
        &[],
    );
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(list.recorded_words(), words);
    assert_eq!(list.patch_count(), patches);
    assert_eq!(list.counter().current_value(), 1);
}

#[test]
fn test_counter_based_event_reset_is_invalid() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = regular(&d, 1);
    assert!(matches!(
        list.append_event_reset(&event),
        Err(Error::InvalidArgument(_))
    ));
    assert!(list.recorded_words().is_empty());
    assert_eq!(list.counter().current_value(), 0);
}

#[test]
fn test_host_synchronize_timeout_and_hang() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let never = pool.create_event(0).unwrap();
    let list = immediate(&d);
    list.append_wait_on_events(&[never.clone()]).unwrap();
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    assert_eq!(list.host_synchronize(Duration::ZERO), Err(Error::NotReady));

    d.gpu().inject_hang();
    assert_eq!(list.host_synchronize(Duration::from_millis(10)), Err(Error::GpuHang));
}

#[test]
fn test_device_lost_on_flush() {
    let d = device();
    let list = immediate(&d);
    d.gpu().set_device_lost(true);
    assert_eq!(
        list.append_launch_kernel(&launch(1), None, &[]),
        Err(Error::DeviceLost)
    );
    assert_eq!(list.host_synchronize(TIMEOUT), Err(Error::DeviceLost));
}

#[test]
fn test_zero_group_launch_rejected() {
    let d = device();
    let list = immediate(&d);
    let empty = KernelLaunch {
        group_count: 0,
        ..launch(1)
    };
    assert!(matches!(
        list.append_launch_kernel(&empty, None, &[]),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(list.counter().current_value(), 0);
}

// -----------------------------------------------------------------------
// Events
// -----------------------------------------------------------------------

#[test]
fn test_event_reset_append() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::HOST_VISIBLE).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = immediate(&d);
    list.append_signal_event(&event).unwrap();
    list.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(event.query_status().unwrap(), EventStatus::Signaled);

    list.append_event_reset(&event).unwrap();
    assert_eq!(event.cached_status(), EventStatus::Initial);
    list.host_synchronize(TIMEOUT).unwrap();
    let packet = event.packet_address(0).unwrap();
    assert_eq!(d.memory().read_u64(packet).unwrap(), EVENT_PACKET_NOT_READY);
    assert_eq!(list.counter().current_value(), 2);
}

#[test]
fn test_timestamp_event() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::TIMESTAMP | EventFlags::HOST_VISIBLE).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = immediate(&d);
    list.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    list.host_synchronize(TIMEOUT).unwrap();
    assert!(event.query_timestamp().unwrap() > 0);
}

#[test]
fn test_mirrored_counter_reports_through_mirror() {
    let settings = Settings {
        duplicated_counter_storage: Some(true),
        ..Settings::default()
    };
    let d = device_with(settings, DeviceCaps::default());
    let list = immediate(&d);
    assert!(list.counter().is_mirrored());
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.host_synchronize(TIMEOUT).unwrap();
    let mirror = list.counter().mirror_address().unwrap();
    assert_eq!(d.memory().read_u64(mirror).unwrap(), 1);
}

// -----------------------------------------------------------------------
// Copies and routing
// -----------------------------------------------------------------------

#[test]
fn test_unaligned_compute_copy_splits() {
    let d = device();
    let src = d.allocate_buffer(64).unwrap();
    let dst = d.allocate_buffer(64).unwrap();
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let event = pool.create_event(0).unwrap();

    let recorded = regular(&d, 1);
    recorded
        .append_memory_copy(BufferSlice::new(dst, 1), BufferSlice::whole(src), 10, Some(&event), &[])
        .unwrap();
    let sizes: Vec<u64> = commands(&recorded)
        .iter()
        .filter_map(|c| match *c {
            Command::Copy { size, blitter: false, .. } => Some(size),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![3, 4, 3]);
    assert_eq!(event.packets_used(), 3);

    let bytes: Vec<u8> = (0..64u8).collect();
    d.memory().write(src.gpu_va, &bytes).unwrap();
    let list = immediate(&d);
    list.append_memory_copy(BufferSlice::new(dst, 1), BufferSlice::whole(src), 10, None, &[])
        .unwrap();
    list.host_synchronize(TIMEOUT).unwrap();
    let mut out = [0u8; 12];
    d.memory().read(dst.gpu_va, &mut out).unwrap();
    assert_eq!(&out[1..11], &bytes[..10]);
    assert_eq!(out[11], 0);
}

#[test]
fn test_single_queue_offload_uses_blitter_forms() {
    let settings = Settings {
        copy_offload: Some(CopyOffloadMode::SingleQueueOffload),
        ..Settings::default()
    };
    let d = device_with(settings, DeviceCaps::default());
    let buffer = d.allocate_buffer(64).unwrap();
    let list = regular(&d, 1);
    list.append_memory_copy(BufferSlice::new(buffer, 32), BufferSlice::whole(buffer), 7, None, &[])
        .unwrap();
    let copies: Vec<Command> = commands(&list)
        .into_iter()
        .filter(|c| matches!(c, Command::Copy { .. }))
        .collect();
    assert_eq!(copies.len(), 1);
    assert!(matches!(copies[0], Command::Copy { blitter: true, size: 7, .. }));
}

#[test]
fn test_dual_stream_routes_copies_to_copy_engine() {
    let d = device();
    let list = CommandList::create(
        &d,
        CommandListDesc {
            copy_offload: Some(CopyOffloadMode::DualStream),
            ..CommandListDesc::immediate()
        },
    )
    .unwrap();
    assert_eq!(list.copy_offload_mode(), CopyOffloadMode::DualStream);
    assert_eq!(list.engine_for(true), EngineClass::Copy);

    let src = d.allocate_buffer(16).unwrap();
    let dst = d.allocate_buffer(16).unwrap();
    d.memory().fill(src.gpu_va, 16, 0xA5A5_A5A5).unwrap();
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.append_memory_fill(BufferSlice::whole(dst), 0, 16, None, &[]).unwrap();
    list.append_memory_copy(BufferSlice::whole(dst), BufferSlice::whole(src), 16, None, &[])
        .unwrap();
    list.host_synchronize(TIMEOUT).unwrap();

    assert_eq!(d.default_context(EngineClass::Compute).latest_task(), 1);
    assert_eq!(d.default_context(EngineClass::Copy).latest_task(), 2);
    assert_eq!(d.memory().read_u32(dst.gpu_va + 12).unwrap(), 0xA5A5_A5A5);
    assert_eq!(list.counter().completed_value().unwrap(), 3);
}

#[test]
fn test_residency_marked_per_submission() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let event = pool.create_event(0).unwrap();
    let src = d.allocate_buffer(16).unwrap();
    let dst = d.allocate_buffer(16).unwrap();
    let list = immediate(&d);
    let ctx = d.default_context(EngineClass::Compute);
    let storage = list.counter().storage_buffers()[0];

    list.append_memory_copy(BufferSlice::whole(dst), BufferSlice::whole(src), 16, Some(&event), &[])
        .unwrap();
    assert_eq!(ctx.residency().resident_count(storage.id), 1);
    assert_eq!(ctx.residency().resident_count(pool.buffer().id), 1);
    assert_eq!(ctx.residency().resident_count(dst.id), 1);
    assert_eq!(ctx.residency().resident_count(src.id), 1);

    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    assert_eq!(ctx.residency().resident_count(storage.id), 2);
    assert_eq!(ctx.residency().resident_count(dst.id), 1);
}

// -----------------------------------------------------------------------
// Synchronized dispatch
// -----------------------------------------------------------------------

#[test]
fn test_full_sync_dispatch_list_releases_token() {
    let d = device();
    let list = CommandList::create(
        &d,
        CommandListDesc {
            partition_count: 2,
            synchronized_dispatch: SynchronizedDispatchMode::Full,
            ..CommandListDesc::immediate()
        },
    )
    .unwrap();
    assert_eq!(list.synchronized_dispatch().queue_id(), 0);
    let buffer = d.allocate_buffer(16).unwrap();
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    list.append_memory_fill(BufferSlice::whole(buffer), 0, 16, None, &[]).unwrap();
    list.append_launch_kernel(&launch(2), None, &[]).unwrap();
    list.host_synchronize(TIMEOUT).unwrap();

    let token = d.sync_token().unwrap();
    assert_eq!(d.memory().read_u64(token.gpu_va).unwrap(), 0);
    assert_eq!(d.gpu().dispatch_trace().len(), 2);
    let ctx = d.default_context(EngineClass::Compute);
    assert_eq!(ctx.residency().resident_count(token.id), 3);
}

#[test]
fn test_single_tile_list_skips_sync_dispatch() {
    let d = device();
    let list = CommandList::create(
        &d,
        CommandListDesc {
            partition_count: 1,
            synchronized_dispatch: SynchronizedDispatchMode::Full,
            ..CommandListDesc::regular()
        },
    )
    .unwrap();
    assert!(!list.synchronized_dispatch().is_enabled());
    assert_eq!(list.synchronized_dispatch().queue_id(), QUEUE_ID_NONE);
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    assert!(d.sync_token().is_none());
    assert_eq!(d.assigned_queue_ids(), 0);
}

#[test]
fn test_sync_dispatch_wraps_every_append() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::empty()).unwrap();
    let event = pool.create_event(0).unwrap();
    let list = CommandList::create(
        &d,
        CommandListDesc {
            partition_count: 2,
            synchronized_dispatch: SynchronizedDispatchMode::Limited,
            ..CommandListDesc::regular()
        },
    )
    .unwrap();
    let src = d.allocate_buffer(16).unwrap();
    let dst = d.allocate_buffer(16).unwrap();
    let token = d.sync_token().unwrap().gpu_va;
    let token_waits = |list: &CommandList| {
        semaphore_waits(&commands(list))
            .into_iter()
            .filter(|w| *w == (token + 4, 0))
            .count()
    };

    list.append_memory_fill(BufferSlice::whole(dst), 0, 16, None, &[]).unwrap();
    assert_eq!(token_waits(&list), 1);
    list.append_memory_copy(BufferSlice::whole(dst), BufferSlice::whole(src), 16, None, &[])
        .unwrap();
    list.append_barrier(None, &[]).unwrap();
    list.append_event_reset(&event).unwrap();
    list.append_launch_kernel(&launch(1), None, &[]).unwrap();
    assert_eq!(token_waits(&list), 5);

    list.append_signal_event(&event).unwrap();
    assert_eq!(token_waits(&list), 5);
    assert_eq!(d.assigned_queue_ids(), 0);
}

// -----------------------------------------------------------------------
// Immediate lists executing Regular lists
// -----------------------------------------------------------------------

#[test]
fn test_append_command_lists_signals_after_all() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::HOST_VISIBLE).unwrap();
    let done = pool.create_event(0).unwrap();
    let first = regular(&d, 1);
    let second = regular(&d, 1);
    first.append_launch_kernel(&launch(1), None, &[]).unwrap();
    second.append_launch_kernel(&launch(2), None, &[]).unwrap();
    second.append_launch_kernel(&launch(3), None, &[]).unwrap();
    first.close().unwrap();
    second.close().unwrap();

    let list = immediate(&d);
    list.append_command_lists(&[first.clone(), second.clone()], Some(&done), &[])
        .unwrap();
    list.host_synchronize(TIMEOUT).unwrap();
    assert_eq!(done.query_status().unwrap(), EventStatus::Signaled);
    assert_eq!(first.counter().completed_value().unwrap(), 1);
    assert_eq!(second.counter().completed_value().unwrap(), 2);
    assert_eq!(second.counter().submissions(), 1);

    assert!(matches!(
        list.append_command_lists(&[list.clone()], None, &[]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_update_in_order_exec_info_rebinds_dependency() {
    let d = device();
    let queue = CommandQueue::new(&d);
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();
    // The producer never runs: only the rebound counter can release the consumer.
    let producer = regular(&d, 1);
    producer.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    producer.close().unwrap();

    let replacement = regular(&d, 1);
    for kernel in 0..3 {
        replacement.append_launch_kernel(&launch(kernel), None, &[]).unwrap();
    }
    replacement.close().unwrap();

    let consumer = regular(&d, 1);
    consumer.append_barrier(None, &[event.clone()]).unwrap();
    consumer.append_launch_kernel(&launch(9), None, &[]).unwrap();
    consumer.close().unwrap();

    let rebound = consumer
        .update_in_order_exec_info(producer.counter(), replacement.counter(), false)
        .unwrap();
    assert_eq!(rebound, 1);

    queue.execute_command_lists(&[replacement.clone()]).unwrap();
    queue.execute_command_lists(&[consumer.clone()]).unwrap();
    queue.synchronize(TIMEOUT).unwrap();

    assert_eq!(replacement.counter().completed_value().unwrap(), 3);
    assert_eq!(d.gpu().dispatch_trace().len(), 4);
    let waits = semaphore_waits(&commands(&consumer));
    assert_eq!(waits, vec![(replacement.counter().primary_address(), 3)]);
    assert_eq!(producer.counter().completed_value().unwrap(), 0);
    assert_eq!(
        consumer.update_in_order_exec_info(producer.counter(), replacement.counter(), true),
        Ok(0)
    );
}

#[test]
fn test_update_in_order_exec_info_rejects_partition_mismatch() {
    let d = device();
    let pool = EventPool::new(&d, 1, EventFlags::COUNTER_BASED).unwrap();
    let event = pool.create_event(0).unwrap();
    let producer = regular(&d, 1);
    producer.append_launch_kernel(&launch(1), Some(&event), &[]).unwrap();
    producer.close().unwrap();

    let consumer = regular(&d, 1);
    consumer.append_barrier(None, &[event.clone()]).unwrap();
    consumer.close().unwrap();

    let split = Counter::allocate(
        d.counter_allocator(),
        CounterConfig {
            owner: CounterOwner::RegularList,
            partition_count: 2,
            atomic: false,
            mirrored: false,
        },
    )
    .unwrap();
    assert!(matches!(
        consumer.update_in_order_exec_info(producer.counter(), &split, false),
        Err(Error::InvalidArgument(_))
    ));
    let waits = semaphore_waits(&commands(&consumer));
    assert_eq!(waits[0].0, producer.counter().primary_address());
}
