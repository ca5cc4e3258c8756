// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space and backing storage.
//!
//! Maps GPU virtual addresses (40-bit, 1 TiB) to host-side backing frames
//! using a 2-level page table with 4 KB pages.
//!
//! Layout: `[L0: 14 bits][L1: 14 bits][Offset: 12 bits]` = 40 bits total.
//!
//! Every buffer the submission core needs (counter storage, host mirrors,
//! event pools, the synchronized-dispatch token, user copy buffers) is carved
//! from here. The simulated command streamer and host pollers read and write
//! the same frames, so a value stored by an executed command is immediately
//! visible to a host query.

use std::collections::{BTreeMap, HashMap};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use ordo_common::GpuAddr;

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const L1_BITS: u32 = 14;
const L0_BITS: u32 = 14;
const L1_SIZE: usize = 1 << L1_BITS;

/// Sentinel for unmapped pages.
const INVALID_FRAME: u32 = u32::MAX;

pub const GPU_VA_BITS: u32 = L0_BITS + L1_BITS + PAGE_BITS;
pub const GPU_VA_SIZE: u64 = 1 << GPU_VA_BITS;

/// First VA handed out; the low 64 MB stay unmapped so null-ish addresses fault.
const ALLOC_BASE: GpuAddr = 0x0400_0000;

/// Default backing budget for a simulated device (256 MiB).
pub const DEFAULT_CAPACITY: u64 = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// What a buffer is used for. Only affects naming in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    CounterStorage,
    HostMirror,
    EventPool,
    SyncToken,
    WorkPartition,
    UserBuffer,
}

impl AllocationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::CounterStorage => "counter storage",
            Self::HostMirror => "host counter mirror",
            Self::EventPool => "event pool",
            Self::SyncToken => "sync token",
            Self::WorkPartition => "work partition",
            Self::UserBuffer => "user buffer",
        }
    }
}

/// A GPU-addressable allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    pub id: BufferId,
    pub gpu_va: GpuAddr,
    pub size: u64,
    pub kind: AllocationKind,
}

impl GpuBuffer {
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.gpu_va && addr < self.gpu_va + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of device memory allocating {kind:?} ({size:#x} bytes)")]
    OutOfMemory { kind: AllocationKind, size: u64 },

    #[error("access to unmapped GPU address {0:#x}")]
    Unmapped(GpuAddr),

    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
}

impl From<MemoryError> for ordo_common::Error {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory { kind, size } => ordo_common::Error::AllocationFailure {
                what: kind.name(),
                size,
            },
            other => ordo_common::Error::InvalidArgument(other.to_string()),
        }
    }
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

struct Inner {
    /// L0 table: each entry is an optional L1 table of frame indices.
    page_table: Vec<Option<Box<[u32; L1_SIZE]>>>,
    frames: Vec<Box<[u8]>>,
    free_frames: Vec<u32>,
    next_va: GpuAddr,
    next_id: u32,
    buffers: BTreeMap<BufferId, GpuBuffer>,
    capacity_pages: u64,
    used_pages: u64,
}

/// GPU memory shared between the host side of the driver and the simulated
/// command streamers.
pub struct GpuMemory {
    inner: RwLock<Inner>,
}

impl GpuMemory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        let l0_size = 1 << L0_BITS;
        let mut page_table = Vec::with_capacity(l0_size);
        for _ in 0..l0_size {
            page_table.push(None);
        }
        Self {
            inner: RwLock::new(Inner {
                page_table,
                frames: Vec::new(),
                free_frames: Vec::new(),
                next_va: ALLOC_BASE,
                next_id: 1,
                buffers: BTreeMap::new(),
                capacity_pages: capacity_bytes / PAGE_SIZE,
                used_pages: 0,
            }),
        }
    }

    /// Allocate zero-filled, page-aligned GPU memory.
    pub fn allocate(&self, size: u64, kind: AllocationKind) -> MemoryResult<GpuBuffer> {
        let aligned_size = (size.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let pages = aligned_size / PAGE_SIZE;

        let mut inner = self.inner.write();
        if inner.used_pages + pages > inner.capacity_pages
            || inner.next_va + aligned_size > GPU_VA_SIZE
        {
            log::warn!(
                "gpu_mm: out of memory for {} ({:#x} bytes, {} of {} pages used)",
                kind.name(),
                size,
                inner.used_pages,
                inner.capacity_pages
            );
            return Err(MemoryError::OutOfMemory { kind, size });
        }

        let gpu_va = inner.next_va;
        inner.next_va += aligned_size;
        for page in 0..pages {
            let frame = inner.take_frame();
            inner.set_entry(gpu_va + page * PAGE_SIZE, frame);
        }
        inner.used_pages += pages;

        let id = BufferId(inner.next_id);
        inner.next_id += 1;
        let buffer = GpuBuffer {
            id,
            gpu_va,
            size: aligned_size,
            kind,
        };
        inner.buffers.insert(id, buffer);

        log::trace!(
            "gpu_mm: alloc {} GPU 0x{:X}..0x{:X}",
            kind.name(),
            gpu_va,
            gpu_va + aligned_size
        );
        Ok(buffer)
    }

    /// Release a buffer; its frames go back to the free list.
    pub fn free(&self, buffer: &GpuBuffer) -> MemoryResult<()> {
        let mut inner = self.inner.write();
        if inner.buffers.remove(&buffer.id).is_none() {
            return Err(MemoryError::UnknownBuffer(buffer.id));
        }
        let mut offset = 0u64;
        while offset < buffer.size {
            let va = buffer.gpu_va + offset;
            let frame = inner.get_entry(va);
            if frame != INVALID_FRAME {
                inner.free_frames.push(frame);
                inner.set_entry(va, INVALID_FRAME);
            }
            offset += PAGE_SIZE;
        }
        inner.used_pages -= buffer.size / PAGE_SIZE;
        log::trace!("gpu_mm: free GPU 0x{:X}..0x{:X}", buffer.gpu_va, buffer.gpu_va + buffer.size);
        Ok(())
    }

    pub fn is_mapped(&self, addr: GpuAddr) -> bool {
        self.inner.read().get_entry(addr) != INVALID_FRAME
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.read().buffers.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.read().used_pages * PAGE_SIZE
    }

    pub fn read(&self, addr: GpuAddr, dst: &mut [u8]) -> MemoryResult<()> {
        self.inner.read().read(addr, dst)
    }

    pub fn write(&self, addr: GpuAddr, src: &[u8]) -> MemoryResult<()> {
        self.inner.write().write(addr, src)
    }

    pub fn read_u32(&self, addr: GpuAddr) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_u64(&self, addr: GpuAddr) -> MemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn write_u32(&self, addr: GpuAddr, value: u32) -> MemoryResult<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(addr, &buf)
    }

    pub fn write_u64(&self, addr: GpuAddr, value: u64) -> MemoryResult<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write(addr, &buf)
    }

    /// Fill `size` bytes with a repeating 32-bit pattern.
    pub fn fill(&self, addr: GpuAddr, size: u64, pattern: u32) -> MemoryResult<()> {
        let mut bytes = vec![0u8; size as usize];
        let pattern = pattern.to_le_bytes();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = pattern[i % 4];
        }
        self.write(addr, &bytes)
    }

    /// Copy `size` bytes inside GPU memory.
    pub fn copy(&self, src: GpuAddr, dst: GpuAddr, size: u64) -> MemoryResult<()> {
        let mut inner = self.inner.write();
        let mut bytes = vec![0u8; size as usize];
        inner.read(src, &mut bytes)?;
        inner.write(dst, &bytes)
    }

    /// Read-modify-write a qword under the write lock. Returns the old value.
    pub fn atomic_u64(&self, addr: GpuAddr, op: impl FnOnce(u64) -> u64) -> MemoryResult<u64> {
        let mut inner = self.inner.write();
        let mut buf = [0u8; 8];
        inner.read(addr, &mut buf)?;
        let old = LittleEndian::read_u64(&buf);
        LittleEndian::write_u64(&mut buf, op(old));
        inner.write(addr, &buf)?;
        Ok(old)
    }

    /// Read-modify-write a dword under the write lock. Returns the old value.
    pub fn atomic_u32(&self, addr: GpuAddr, op: impl FnOnce(u32) -> u32) -> MemoryResult<u32> {
        let mut inner = self.inner.write();
        let mut buf = [0u8; 4];
        inner.read(addr, &mut buf)?;
        let old = LittleEndian::read_u32(&buf);
        LittleEndian::write_u32(&mut buf, op(old));
        inner.write(addr, &buf)?;
        Ok(old)
    }
}

impl Default for GpuMemory {
    fn default() -> Self {
        Self::new()
    }
}

// ── Internal helpers ─────────────────────────────────────────────────

impl Inner {
    fn l0_index(gpu_va: u64) -> usize {
        ((gpu_va >> (L1_BITS + PAGE_BITS)) & ((1 << L0_BITS) - 1)) as usize
    }

    fn l1_index(gpu_va: u64) -> usize {
        ((gpu_va >> PAGE_BITS) & ((1 << L1_BITS) - 1)) as usize
    }

    fn take_frame(&mut self) -> u32 {
        match self.free_frames.pop() {
            Some(frame) => {
                self.frames[frame as usize].fill(0);
                frame
            }
            None => {
                self.frames.push(vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
                (self.frames.len() - 1) as u32
            }
        }
    }

    fn set_entry(&mut self, gpu_va: u64, frame: u32) {
        let l0 = Self::l0_index(gpu_va);
        let l1 = Self::l1_index(gpu_va);
        let table = self.page_table[l0].get_or_insert_with(|| Box::new([INVALID_FRAME; L1_SIZE]));
        table[l1] = frame;
    }

    fn get_entry(&self, gpu_va: u64) -> u32 {
        if gpu_va >= GPU_VA_SIZE {
            return INVALID_FRAME;
        }
        match &self.page_table[Self::l0_index(gpu_va)] {
            Some(table) => table[Self::l1_index(gpu_va)],
            None => INVALID_FRAME,
        }
    }

    fn read(&self, gpu_va: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let mut offset = 0usize;
        while offset < dst.len() {
            let va = gpu_va + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk = std::cmp::min(dst.len() - offset, PAGE_SIZE as usize - page_off);
            let frame = self.get_entry(va);
            if frame == INVALID_FRAME {
                return Err(MemoryError::Unmapped(va));
            }
            dst[offset..offset + chunk]
                .copy_from_slice(&self.frames[frame as usize][page_off..page_off + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    fn write(&mut self, gpu_va: u64, src: &[u8]) -> MemoryResult<()> {
        let mut offset = 0usize;
        while offset < src.len() {
            let va = gpu_va + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk = std::cmp::min(src.len() - offset, PAGE_SIZE as usize - page_off);
            let frame = self.get_entry(va);
            if frame == INVALID_FRAME {
                return Err(MemoryError::Unmapped(va));
            }
            self.frames[frame as usize][page_off..page_off + chunk]
                .copy_from_slice(&src[offset..offset + chunk]);
            offset += chunk;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Residency
// -----------------------------------------------------------------------

/// Counts how often each buffer was made resident for a submission context.
#[derive(Default)]
pub struct ResidencyTracker {
    counts: Mutex<HashMap<BufferId, u32>>,
}

impl ResidencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_resident(&self, buffer: &GpuBuffer) {
        *self.counts.lock().entry(buffer.id).or_insert(0) += 1;
    }

    pub fn resident_count(&self, id: BufferId) -> u32 {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }

    pub fn is_resident(&self, id: BufferId) -> bool {
        self.resident_count(id) > 0
    }

    pub fn evict_all(&self) {
        self.counts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed_and_mapped() {
        let mm = GpuMemory::new();
        let buf = mm.allocate(0x20, AllocationKind::CounterStorage).unwrap();
        assert_eq!(buf.gpu_va, ALLOC_BASE);
        assert_eq!(buf.size, PAGE_SIZE);
        assert!(mm.is_mapped(buf.gpu_va));
        assert_eq!(mm.read_u64(buf.gpu_va).unwrap(), 0);
    }

    #[test]
    fn test_unmapped_access_faults() {
        let mm = GpuMemory::new();
        assert_eq!(mm.read_u32(0x1000), Err(MemoryError::Unmapped(0x1000)));
        assert!(mm.write_u64(0x1000, 1).is_err());
    }

    #[test]
    fn test_read_write_cross_page() {
        let mm = GpuMemory::new();
        let buf = mm.allocate(0x2000, AllocationKind::UserBuffer).unwrap();
        let addr = buf.gpu_va + PAGE_SIZE - 4;
        mm.write_u64(addr, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mm.read_u64(addr).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(mm.read_u32(addr + 4).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_free_reuses_frames() {
        let mm = GpuMemory::new();
        let a = mm.allocate(PAGE_SIZE, AllocationKind::EventPool).unwrap();
        mm.write_u32(a.gpu_va, 0xDEAD_BEEF).unwrap();
        mm.free(&a).unwrap();
        assert!(!mm.is_mapped(a.gpu_va));
        assert_eq!(mm.used_bytes(), 0);

        let b = mm.allocate(PAGE_SIZE, AllocationKind::EventPool).unwrap();
        assert_ne!(a.gpu_va, b.gpu_va);
        assert_eq!(mm.read_u32(b.gpu_va).unwrap(), 0);
        assert_eq!(mm.free(&a), Err(MemoryError::UnknownBuffer(a.id)));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mm = GpuMemory::with_capacity(2 * PAGE_SIZE);
        mm.allocate(PAGE_SIZE, AllocationKind::UserBuffer).unwrap();
        let err = mm.allocate(2 * PAGE_SIZE, AllocationKind::SyncToken).unwrap_err();
        assert_eq!(
            ordo_common::Error::from(err),
            ordo_common::Error::AllocationFailure { what: "sync token", size: 2 * PAGE_SIZE }
        );
    }

    #[test]
    fn test_atomic_and_copy() {
        let mm = GpuMemory::new();
        let buf = mm.allocate(PAGE_SIZE, AllocationKind::UserBuffer).unwrap();
        let old = mm.atomic_u64(buf.gpu_va, |v| v + 5).unwrap();
        assert_eq!(old, 0);
        assert_eq!(mm.read_u64(buf.gpu_va).unwrap(), 5);

        mm.fill(buf.gpu_va + 0x100, 8, 0xAABB_CCDD).unwrap();
        mm.copy(buf.gpu_va + 0x100, buf.gpu_va + 0x200, 8).unwrap();
        assert_eq!(mm.read_u64(buf.gpu_va + 0x200).unwrap(), 0xAABB_CCDD_AABB_CCDD);
    }

    #[test]
    fn test_residency_counts() {
        let mm = GpuMemory::new();
        let buf = mm.allocate(PAGE_SIZE, AllocationKind::CounterStorage).unwrap();
        let tracker = ResidencyTracker::new();
        assert!(!tracker.is_resident(buf.id));
        tracker.make_resident(&buf);
        tracker.make_resident(&buf);
        assert_eq!(tracker.resident_count(buf.id), 2);
        tracker.evict_all();
        assert_eq!(tracker.resident_count(buf.id), 0);
    }
}
