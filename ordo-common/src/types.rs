// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// GPU virtual address.
pub type GpuAddr = u64;

/// Monotonic per-context submission number returned by `submit`.
pub type TaskCount = u64;

/// Synchronized-dispatch queue id.
pub type QueueId = u32;

/// Queue id value meaning "not assigned".
pub const QUEUE_ID_NONE: QueueId = u32::MAX;

/// GPU page size (4 KiB).
pub const PAGE_SIZE: usize = 0x1000;

pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

pub const PAGE_SHIFT: u32 = 12;

pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Maximum number of tiles that can contribute to one dispatch.
pub const MAX_PARTITIONS: u32 = 4;

/// Distance between per-partition completion slots.
pub const PARTITION_STRIDE: u64 = 16;

/// Bytes reserved per counter: one slot per partition.
pub const COUNTER_SLOT_SIZE: u64 = PARTITION_STRIDE * MAX_PARTITIONS as u64;

/// Maximum kernel splits a single operation may be broken into.
pub const MAX_KERNEL_SPLITS: u32 = 3;

/// Bytes per event packet (completion qword plus padding).
pub const EVENT_PACKET_SIZE: u64 = 16;

pub const MAX_EVENT_PACKETS: u32 = MAX_PARTITIONS * MAX_KERNEL_SPLITS;

/// Value a packet holds while nothing has signalled it.
pub const EVENT_PACKET_NOT_READY: u64 = u64::MAX;

/// Bytes per event: packets, then a timestamp qword.
pub const EVENT_SLOT_SIZE: u64 = align_up(
    EVENT_PACKET_SIZE * MAX_EVENT_PACKETS as u64 + 8,
    64,
);

/// Simulated timestamp frequency (19.2 MHz).
pub const TIMESTAMP_FREQUENCY_HZ: u64 = 19_200_000;

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}
