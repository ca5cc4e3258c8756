// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command stream encoding, decoding and in-place patching.
//!
//! A command list owns a `CommandStream`: a flat arena of 32-bit words. Every
//! encoder call returns a `CmdHandle` (the dword offset of the command header)
//! so that values can be rewritten later without re-encoding the stream.
//!
//! ## Command Header (32 bits)
//!
//! | Bits    | Field                       |
//! |---------|-----------------------------|
//! | 15:0    | Length in dwords (incl. hdr)|
//! | 23:16   | Flags (per opcode)          |
//! | 31:24   | Opcode                      |
//!
//! 64-bit operands are stored as two little-endian dwords (low first).

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use ordo_common::{Error, GpuAddr, Result};

pub mod opcode {
    pub const NOOP: u8 = 0x00;
    pub const SEMAPHORE_WAIT: u8 = 0x01;
    pub const STORE_DATA_IMM: u8 = 0x02;
    pub const ATOMIC: u8 = 0x03;
    pub const LOAD_REGISTER_IMM: u8 = 0x04;
    pub const PIPE_CONTROL: u8 = 0x05;
    pub const CONDITIONAL_BRANCH: u8 = 0x06;
    pub const SET_PREDICATE: u8 = 0x07;
    pub const BATCH_BUFFER_START: u8 = 0x08;
    pub const DISPATCH: u8 = 0x09;
    pub const COPY: u8 = 0x0A;
    pub const FILL: u8 = 0x0B;
    pub const TIMESTAMP: u8 = 0x0C;
    pub const BATCH_BUFFER_END: u8 = 0x0F;
}

/// General purpose register pair used by register-mode semaphore waits.
pub const GPR0_LO: u32 = 0x2600;
pub const GPR0_HI: u32 = 0x2604;

/// Dword offset of an encoded command inside its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdHandle(pub u32);

impl CmdHandle {
    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    GreaterOrEqual,
    Less,
}

impl CompareOp {
    fn bits(self) -> u32 {
        match self {
            Self::Equal => 0,
            Self::NotEqual => 1,
            Self::GreaterOrEqual => 2,
            Self::Less => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Equal,
            1 => Self::NotEqual,
            2 => Self::GreaterOrEqual,
            _ => Self::Less,
        }
    }

    /// `memory <op> data`.
    pub fn evaluate(self, memory: u64, data: u64) -> bool {
        match self {
            Self::Equal => memory == data,
            Self::NotEqual => memory != data,
            Self::GreaterOrEqual => memory >= data,
            Self::Less => memory < data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    Sub,
    Increment,
    Decrement,
    /// Compare operand1 with memory; on match store operand2.
    CmpWr,
}

impl AtomicOp {
    fn bits(self) -> u32 {
        match self {
            Self::Add => 0,
            Self::Sub => 1,
            Self::Increment => 2,
            Self::Decrement => 3,
            Self::CmpWr => 4,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0xF {
            0 => Some(Self::Add),
            1 => Some(Self::Sub),
            2 => Some(Self::Increment),
            3 => Some(Self::Decrement),
            4 => Some(Self::CmpWr),
            _ => None,
        }
    }

    /// New memory value for `old` given the operands.
    pub fn apply(self, old: u64, operand1: u64, operand2: u64) -> u64 {
        match self {
            Self::Add => old.wrapping_add(operand1),
            Self::Sub => old.wrapping_sub(operand1),
            Self::Increment => old.wrapping_add(1),
            Self::Decrement => old.wrapping_sub(1),
            Self::CmpWr => {
                if old == operand1 {
                    operand2
                } else {
                    old
                }
            }
        }
    }
}

/// Where a taken conditional branch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Dword offset inside the same stream.
    Offset(u32),
    /// Hand the engine back to the submission scheduler; the command is
    /// re-evaluated when the submission is resumed.
    Scheduler,
}

/// A decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Noop,
    SemaphoreWait {
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        qword: bool,
        register_mode: bool,
    },
    StoreDataImm {
        addr: GpuAddr,
        value: u64,
        qword: bool,
    },
    Atomic {
        addr: GpuAddr,
        op: AtomicOp,
        operand1: u64,
        operand2: u64,
        qword: bool,
    },
    LoadRegisterImm {
        register: u32,
        value: u32,
    },
    PipeControl {
        dc_flush: bool,
        post_sync: Option<(GpuAddr, u64)>,
    },
    ConditionalBranch {
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        qword: bool,
        target: BranchTarget,
    },
    SetPredicate {
        enable: bool,
    },
    BatchBufferStart {
        target: u32,
    },
    Dispatch {
        kernel_id: u32,
        group_count: u32,
        partitions: u32,
        cooperative: bool,
    },
    Copy {
        src: GpuAddr,
        dst: GpuAddr,
        size: u64,
        blitter: bool,
    },
    Fill {
        dst: GpuAddr,
        size: u64,
        pattern: u32,
    },
    Timestamp {
        addr: GpuAddr,
    },
    BatchBufferEnd,
}

impl Command {
    pub fn is_semaphore_wait(&self) -> bool {
        matches!(self, Command::SemaphoreWait { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCommand {
    pub handle: CmdHandle,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("command truncated at dword {0}")]
    Truncated(usize),

    #[error("unknown opcode {opcode:#x} at dword {offset}")]
    UnknownOpcode { offset: usize, opcode: u8 },

    #[error("bad length {length} for opcode {opcode:#x} at dword {offset}")]
    BadLength { offset: usize, opcode: u8, length: usize },
}

/// Semantic command encoder. Implementations return a handle that can later
/// be passed to the matching `patch_*` call.
pub trait CommandEncoder {
    /// Dword offset the next command will be written at.
    fn offset(&self) -> u32;

    fn encode_semaphore_wait(
        &mut self,
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        qword: bool,
    ) -> CmdHandle;

    /// 64-bit compare through GPR0: two register loads followed by a
    /// register-mode semaphore wait. Returns the first register load.
    fn encode_register_semaphore_wait(&mut self, addr: GpuAddr, value: u64, op: CompareOp) -> CmdHandle;

    fn encode_store_immediate(&mut self, addr: GpuAddr, value: u64, qword: bool) -> CmdHandle;

    fn encode_atomic(
        &mut self,
        addr: GpuAddr,
        op: AtomicOp,
        operands: [u64; 2],
        qword: bool,
    ) -> CmdHandle;

    fn encode_conditional_branch(
        &mut self,
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        qword: bool,
        target: BranchTarget,
    ) -> CmdHandle;

    fn encode_pipe_control(&mut self, dc_flush: bool, post_sync: Option<(GpuAddr, u64)>) -> CmdHandle;

    fn encode_set_predicate(&mut self, enable: bool) -> CmdHandle;

    fn encode_batch_buffer_start(&mut self, target: u32) -> CmdHandle;

    fn encode_dispatch(
        &mut self,
        kernel_id: u32,
        group_count: u32,
        partitions: u32,
        cooperative: bool,
    ) -> CmdHandle;

    fn encode_copy(&mut self, src: GpuAddr, dst: GpuAddr, size: u64, blitter: bool) -> CmdHandle;

    fn encode_fill(&mut self, dst: GpuAddr, size: u64, pattern: u32) -> CmdHandle;

    fn encode_timestamp(&mut self, addr: GpuAddr) -> CmdHandle;

    fn encode_batch_buffer_end(&mut self) -> CmdHandle;
}

// Flag bits.
const SEM_REGISTER_MODE: u32 = 1 << 2;
const SEM_QWORD: u32 = 1 << 3;
const SDI_QWORD: u32 = 1 << 0;
const ATOMIC_QWORD: u32 = 1 << 4;
const PC_DC_FLUSH: u32 = 1 << 0;
const PC_POST_SYNC: u32 = 1 << 1;
const BRANCH_QWORD: u32 = 1 << 2;
const BRANCH_SCHEDULER: u32 = 1 << 3;
const DISPATCH_COOPERATIVE: u32 = 1 << 0;
const COPY_BLITTER: u32 = 1 << 0;
const PREDICATE_ENABLE: u32 = 1 << 0;

/// Fixed command length in dwords, including the header.
fn command_length(op: u8) -> Option<usize> {
    Some(match op {
        opcode::NOOP => 1,
        opcode::SEMAPHORE_WAIT => 5,
        opcode::STORE_DATA_IMM => 5,
        opcode::ATOMIC => 7,
        opcode::LOAD_REGISTER_IMM => 3,
        opcode::PIPE_CONTROL => 5,
        opcode::CONDITIONAL_BRANCH => 6,
        opcode::SET_PREDICATE => 1,
        opcode::BATCH_BUFFER_START => 2,
        opcode::DISPATCH => 4,
        opcode::COPY => 7,
        opcode::FILL => 6,
        opcode::TIMESTAMP => 3,
        opcode::BATCH_BUFFER_END => 1,
        _ => return None,
    })
}

fn header(op: u8, flags: u32, length: usize) -> u32 {
    ((op as u32) << 24) | ((flags & 0xFF) << 16) | (length as u32 & 0xFFFF)
}

fn lo(value: u64) -> u32 {
    value as u32
}

fn hi(value: u64) -> u32 {
    (value >> 32) as u32
}

fn join(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

/// Owned, growable command buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandStream {
    words: Vec<u32>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Drop everything encoded after `len` dwords (append rollback).
    pub fn truncate(&mut self, len: usize) {
        self.words.truncate(len);
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Move the encoded words out, leaving the stream empty.
    pub fn take(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.words)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.words.len() * 4];
        LittleEndian::write_u32_into(&self.words, &mut bytes);
        bytes
    }

    pub fn parse(&self) -> std::result::Result<Vec<ParsedCommand>, DecodeError> {
        parse(&self.words)
    }

    /// Rewrite the compare value of an inline semaphore wait.
    pub fn patch_semaphore_value(&mut self, handle: CmdHandle, value: u64) -> Result<()> {
        let at = self.expect_opcode(handle, opcode::SEMAPHORE_WAIT)?;
        self.write_qword(at + 3, value);
        Ok(())
    }

    pub fn patch_store_value(&mut self, handle: CmdHandle, value: u64) -> Result<()> {
        let at = self.expect_opcode(handle, opcode::STORE_DATA_IMM)?;
        self.write_qword(at + 3, value);
        Ok(())
    }

    /// Rewrite the GPR0 pair loaded ahead of a register-mode semaphore wait.
    pub fn patch_register_pair(&mut self, handle: CmdHandle, value: u64) -> Result<()> {
        let first = self.expect_opcode(handle, opcode::LOAD_REGISTER_IMM)?;
        let second = self.expect_opcode(CmdHandle(handle.0 + 3), opcode::LOAD_REGISTER_IMM)?;
        self.words[first + 2] = lo(value);
        self.words[second + 2] = hi(value);
        Ok(())
    }

    pub fn patch_post_sync_value(&mut self, handle: CmdHandle, value: u64) -> Result<()> {
        let at = self.expect_opcode(handle, opcode::PIPE_CONTROL)?;
        if (self.words[at] >> 16) & PC_POST_SYNC == 0 {
            return Err(Error::invalid_argument("pipe control has no post-sync write"));
        }
        self.write_qword(at + 3, value);
        Ok(())
    }

    /// Rewrite the compare value of a conditional branch.
    pub fn patch_branch_value(&mut self, handle: CmdHandle, value: u64) -> Result<()> {
        let at = self.expect_opcode(handle, opcode::CONDITIONAL_BRANCH)?;
        self.write_qword(at + 3, value);
        Ok(())
    }

    pub fn patch_branch_target(&mut self, handle: CmdHandle, target: u32) -> Result<()> {
        let at = self.expect_opcode(handle, opcode::CONDITIONAL_BRANCH)?;
        self.words[at + 5] = target;
        Ok(())
    }

    /// Memory address a patchable command reads or writes. For a
    /// register-mode wait `handle` is the first register load and the
    /// address comes from the semaphore wait behind it.
    pub fn counter_address(&self, handle: CmdHandle) -> Result<GpuAddr> {
        let at = self.address_site(handle)?;
        Ok(join(self.words[at + 1], self.words[at + 2]))
    }

    /// Point a patchable command at another address, keeping its value.
    pub fn patch_counter_address(&mut self, handle: CmdHandle, addr: GpuAddr) -> Result<()> {
        let at = self.address_site(handle)?;
        self.write_qword(at + 1, addr);
        Ok(())
    }

    fn address_site(&self, handle: CmdHandle) -> Result<usize> {
        let at = handle.offset();
        match self.words.get(at).map(|w| (w >> 24) as u8) {
            Some(opcode::SEMAPHORE_WAIT)
            | Some(opcode::STORE_DATA_IMM)
            | Some(opcode::CONDITIONAL_BRANCH)
            | Some(opcode::PIPE_CONTROL) => Ok(at),
            Some(opcode::LOAD_REGISTER_IMM) => {
                self.expect_opcode(CmdHandle(handle.0 + 6), opcode::SEMAPHORE_WAIT)
            }
            _ => Err(Error::invalid_argument(format!(
                "no addressed command at dword {}",
                at
            ))),
        }
    }

    fn emit(&mut self, op: u8, flags: u32, payload: &[u32]) -> CmdHandle {
        let handle = CmdHandle(self.words.len() as u32);
        let length = payload.len() + 1;
        debug_assert_eq!(command_length(op), Some(length));
        self.words.push(header(op, flags, length));
        self.words.extend_from_slice(payload);
        log::trace!(
            "CommandStream: op={:#04x} flags={:#04x} at dword {}",
            op,
            flags,
            handle.0
        );
        handle
    }

    fn expect_opcode(&self, handle: CmdHandle, op: u8) -> Result<usize> {
        let at = handle.offset();
        match self.words.get(at) {
            Some(&word) if (word >> 24) as u8 == op => Ok(at),
            Some(&word) => Err(Error::invalid_argument(format!(
                "patch at dword {} expects opcode {:#x}, found {:#x}",
                at,
                op,
                word >> 24
            ))),
            None => Err(Error::invalid_argument(format!(
                "patch handle {} is outside the stream",
                at
            ))),
        }
    }

    fn write_qword(&mut self, at: usize, value: u64) {
        self.words[at] = lo(value);
        self.words[at + 1] = hi(value);
    }
}

impl CommandEncoder for CommandStream {
    fn offset(&self) -> u32 {
        self.words.len() as u32
    }

    fn encode_semaphore_wait(
        &mut self,
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        qword: bool,
    ) -> CmdHandle {
        let flags = op.bits() | if qword { SEM_QWORD } else { 0 };
        self.emit(
            opcode::SEMAPHORE_WAIT,
            flags,
            &[lo(addr), hi(addr), lo(value), hi(value)],
        )
    }

    fn encode_register_semaphore_wait(&mut self, addr: GpuAddr, value: u64, op: CompareOp) -> CmdHandle {
        let first = self.emit(opcode::LOAD_REGISTER_IMM, 0, &[GPR0_LO, lo(value)]);
        self.emit(opcode::LOAD_REGISTER_IMM, 0, &[GPR0_HI, hi(value)]);
        self.emit(
            opcode::SEMAPHORE_WAIT,
            op.bits() | SEM_REGISTER_MODE | SEM_QWORD,
            &[lo(addr), hi(addr), 0, 0],
        );
        first
    }

    fn encode_store_immediate(&mut self, addr: GpuAddr, value: u64, qword: bool) -> CmdHandle {
        let flags = if qword { SDI_QWORD } else { 0 };
        self.emit(
            opcode::STORE_DATA_IMM,
            flags,
            &[lo(addr), hi(addr), lo(value), hi(value)],
        )
    }

    fn encode_atomic(
        &mut self,
        addr: GpuAddr,
        op: AtomicOp,
        operands: [u64; 2],
        qword: bool,
    ) -> CmdHandle {
        let flags = op.bits() | if qword { ATOMIC_QWORD } else { 0 };
        self.emit(
            opcode::ATOMIC,
            flags,
            &[
                lo(addr),
                hi(addr),
                lo(operands[0]),
                hi(operands[0]),
                lo(operands[1]),
                hi(operands[1]),
            ],
        )
    }

    fn encode_conditional_branch(
        &mut self,
        addr: GpuAddr,
        value: u64,
        op: CompareOp,
        qword: bool,
        target: BranchTarget,
    ) -> CmdHandle {
        let mut flags = op.bits();
        if qword {
            flags |= BRANCH_QWORD;
        }
        let target_word = match target {
            BranchTarget::Offset(offset) => offset,
            BranchTarget::Scheduler => {
                flags |= BRANCH_SCHEDULER;
                0
            }
        };
        self.emit(
            opcode::CONDITIONAL_BRANCH,
            flags,
            &[lo(addr), hi(addr), lo(value), hi(value), target_word],
        )
    }

    fn encode_pipe_control(&mut self, dc_flush: bool, post_sync: Option<(GpuAddr, u64)>) -> CmdHandle {
        let mut flags = if dc_flush { PC_DC_FLUSH } else { 0 };
        let (addr, value) = match post_sync {
            Some(write) => {
                flags |= PC_POST_SYNC;
                write
            }
            None => (0, 0),
        };
        self.emit(
            opcode::PIPE_CONTROL,
            flags,
            &[lo(addr), hi(addr), lo(value), hi(value)],
        )
    }

    fn encode_set_predicate(&mut self, enable: bool) -> CmdHandle {
        let flags = if enable { PREDICATE_ENABLE } else { 0 };
        self.emit(opcode::SET_PREDICATE, flags, &[])
    }

    fn encode_batch_buffer_start(&mut self, target: u32) -> CmdHandle {
        self.emit(opcode::BATCH_BUFFER_START, 0, &[target])
    }

    fn encode_dispatch(
        &mut self,
        kernel_id: u32,
        group_count: u32,
        partitions: u32,
        cooperative: bool,
    ) -> CmdHandle {
        let flags = if cooperative { DISPATCH_COOPERATIVE } else { 0 };
        self.emit(opcode::DISPATCH, flags, &[kernel_id, group_count, partitions])
    }

    fn encode_copy(&mut self, src: GpuAddr, dst: GpuAddr, size: u64, blitter: bool) -> CmdHandle {
        let flags = if blitter { COPY_BLITTER } else { 0 };
        self.emit(
            opcode::COPY,
            flags,
            &[lo(src), hi(src), lo(dst), hi(dst), lo(size), hi(size)],
        )
    }

    fn encode_fill(&mut self, dst: GpuAddr, size: u64, pattern: u32) -> CmdHandle {
        self.emit(
            opcode::FILL,
            0,
            &[lo(dst), hi(dst), lo(size), hi(size), pattern],
        )
    }

    fn encode_timestamp(&mut self, addr: GpuAddr) -> CmdHandle {
        self.emit(opcode::TIMESTAMP, 0, &[lo(addr), hi(addr)])
    }

    fn encode_batch_buffer_end(&mut self) -> CmdHandle {
        self.emit(opcode::BATCH_BUFFER_END, 0, &[])
    }
}

/// Decode the command starting at `offset`. Returns it with its length.
pub fn decode_at(words: &[u32], offset: usize) -> std::result::Result<(Command, usize), DecodeError> {
    let hdr = *words.get(offset).ok_or(DecodeError::Truncated(offset))?;
    let op = (hdr >> 24) as u8;
    let flags = (hdr >> 16) & 0xFF;
    let length = (hdr & 0xFFFF) as usize;

    let expected = command_length(op).ok_or(DecodeError::UnknownOpcode { offset, opcode: op })?;
    if length != expected {
        return Err(DecodeError::BadLength {
            offset,
            opcode: op,
            length,
        });
    }
    if offset + length > words.len() {
        return Err(DecodeError::Truncated(offset));
    }
    let d = &words[offset + 1..offset + length];

    let command = match op {
        opcode::NOOP => Command::Noop,
        opcode::SEMAPHORE_WAIT => Command::SemaphoreWait {
            addr: join(d[0], d[1]),
            value: join(d[2], d[3]),
            op: CompareOp::from_bits(flags),
            qword: flags & SEM_QWORD != 0,
            register_mode: flags & SEM_REGISTER_MODE != 0,
        },
        opcode::STORE_DATA_IMM => Command::StoreDataImm {
            addr: join(d[0], d[1]),
            value: join(d[2], d[3]),
            qword: flags & SDI_QWORD != 0,
        },
        opcode::ATOMIC => Command::Atomic {
            addr: join(d[0], d[1]),
            op: AtomicOp::from_bits(flags).ok_or(DecodeError::UnknownOpcode { offset, opcode: op })?,
            operand1: join(d[2], d[3]),
            operand2: join(d[4], d[5]),
            qword: flags & ATOMIC_QWORD != 0,
        },
        opcode::LOAD_REGISTER_IMM => Command::LoadRegisterImm {
            register: d[0],
            value: d[1],
        },
        opcode::PIPE_CONTROL => Command::PipeControl {
            dc_flush: flags & PC_DC_FLUSH != 0,
            post_sync: if flags & PC_POST_SYNC != 0 {
                Some((join(d[0], d[1]), join(d[2], d[3])))
            } else {
                None
            },
        },
        opcode::CONDITIONAL_BRANCH => Command::ConditionalBranch {
            addr: join(d[0], d[1]),
            value: join(d[2], d[3]),
            op: CompareOp::from_bits(flags),
            qword: flags & BRANCH_QWORD != 0,
            target: if flags & BRANCH_SCHEDULER != 0 {
                BranchTarget::Scheduler
            } else {
                BranchTarget::Offset(d[4])
            },
        },
        opcode::SET_PREDICATE => Command::SetPredicate {
            enable: flags & PREDICATE_ENABLE != 0,
        },
        opcode::BATCH_BUFFER_START => Command::BatchBufferStart { target: d[0] },
        opcode::DISPATCH => Command::Dispatch {
            kernel_id: d[0],
            group_count: d[1],
            partitions: d[2],
            cooperative: flags & DISPATCH_COOPERATIVE != 0,
        },
        opcode::COPY => Command::Copy {
            src: join(d[0], d[1]),
            dst: join(d[2], d[3]),
            size: join(d[4], d[5]),
            blitter: flags & COPY_BLITTER != 0,
        },
        opcode::FILL => Command::Fill {
            dst: join(d[0], d[1]),
            size: join(d[2], d[3]),
            pattern: d[4],
        },
        opcode::TIMESTAMP => Command::Timestamp {
            addr: join(d[0], d[1]),
        },
        opcode::BATCH_BUFFER_END => Command::BatchBufferEnd,
        _ => return Err(DecodeError::UnknownOpcode { offset, opcode: op }),
    };
    Ok((command, length))
}

/// Decode a whole buffer.
pub fn parse(words: &[u32]) -> std::result::Result<Vec<ParsedCommand>, DecodeError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < words.len() {
        let (command, length) = decode_at(words, pos)?;
        out.push(ParsedCommand {
            handle: CmdHandle(pos as u32),
            command,
        });
        pos += length;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut cs = CommandStream::new();
        cs.encode_store_immediate(0x1234_5678_9ABC, 7, true);
        assert_eq!(cs.words()[0], 0x0201_0005);
        assert_eq!(cs.words()[1], 0x5678_9ABC);
        assert_eq!(cs.words()[2], 0x1234);
        assert_eq!(cs.to_bytes()[..4], [0x05, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_parse_mixed_stream() {
        let mut cs = CommandStream::new();
        let wait = cs.encode_semaphore_wait(0x1000, 3, CompareOp::GreaterOrEqual, true);
        cs.encode_dispatch(9, 64, 2, true);
        let atomic = cs.encode_atomic(0x2000, AtomicOp::Add, [4, 0], true);
        cs.encode_conditional_branch(0x3000, 1, CompareOp::Less, false, BranchTarget::Scheduler);
        cs.encode_pipe_control(true, Some((0x4000, 11)));
        cs.encode_batch_buffer_end();

        let parsed = cs.parse().unwrap();
        assert_eq!(parsed.len(), 6);
        assert_eq!(parsed[0].handle, wait);
        assert_eq!(
            parsed[0].command,
            Command::SemaphoreWait {
                addr: 0x1000,
                value: 3,
                op: CompareOp::GreaterOrEqual,
                qword: true,
                register_mode: false,
            }
        );
        assert_eq!(
            parsed[1].command,
            Command::Dispatch {
                kernel_id: 9,
                group_count: 64,
                partitions: 2,
                cooperative: true,
            }
        );
        assert_eq!(parsed[2].handle, atomic);
        assert!(matches!(
            parsed[3].command,
            Command::ConditionalBranch { target: BranchTarget::Scheduler, op: CompareOp::Less, .. }
        ));
        assert_eq!(
            parsed[4].command,
            Command::PipeControl { dc_flush: true, post_sync: Some((0x4000, 11)) }
        );
        assert_eq!(parsed[5].command, Command::BatchBufferEnd);
    }

    #[test]
    fn test_patch_in_place() {
        let mut cs = CommandStream::new();
        let wait = cs.encode_semaphore_wait(0x1000, 1, CompareOp::GreaterOrEqual, true);
        let sdi = cs.encode_store_immediate(0x2000, 1, true);
        let pair = cs.encode_register_semaphore_wait(0x3000, 1, CompareOp::GreaterOrEqual);
        let pc = cs.encode_pipe_control(false, Some((0x4000, 1)));

        cs.patch_semaphore_value(wait, 0x1_0000_0005).unwrap();
        cs.patch_store_value(sdi, 6).unwrap();
        cs.patch_register_pair(pair, 0x2_0000_0007).unwrap();
        cs.patch_post_sync_value(pc, 8).unwrap();

        let parsed = cs.parse().unwrap();
        assert!(matches!(parsed[0].command, Command::SemaphoreWait { value: 0x1_0000_0005, .. }));
        assert!(matches!(parsed[1].command, Command::StoreDataImm { value: 6, .. }));
        assert_eq!(parsed[2].command, Command::LoadRegisterImm { register: GPR0_LO, value: 7 });
        assert_eq!(parsed[3].command, Command::LoadRegisterImm { register: GPR0_HI, value: 2 });
        assert!(matches!(parsed[4].command, Command::SemaphoreWait { register_mode: true, .. }));
        assert!(matches!(parsed[5].command, Command::PipeControl { post_sync: Some((0x4000, 8)), .. }));
    }

    #[test]
    fn test_patch_wrong_kind_rejected() {
        let mut cs = CommandStream::new();
        let sdi = cs.encode_store_immediate(0x2000, 1, true);
        assert!(cs.patch_semaphore_value(sdi, 2).is_err());
        assert!(cs.patch_store_value(CmdHandle(100), 2).is_err());
        let pc = cs.encode_pipe_control(true, None);
        assert!(cs.patch_post_sync_value(pc, 2).is_err());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            parse(&[0xEE00_0001]),
            Err(DecodeError::UnknownOpcode { offset: 0, opcode: 0xEE })
        );
        assert_eq!(parse(&[0x0100_0005, 0]), Err(DecodeError::Truncated(0)));
        assert_eq!(
            parse(&[0x0000_0002, 0]),
            Err(DecodeError::BadLength { offset: 0, opcode: 0, length: 2 })
        );
    }

    #[test]
    fn test_patch_counter_address() {
        let mut cs = CommandStream::new();
        let sem = cs.encode_semaphore_wait(0x1000, 3, CompareOp::GreaterOrEqual, false);
        let pair = cs.encode_register_semaphore_wait(0x1000, 3, CompareOp::GreaterOrEqual);
        let branch = cs.encode_conditional_branch(0x1000, 3, CompareOp::Less, true, BranchTarget::Scheduler);
        let dispatch = cs.encode_dispatch(1, 1, 1, false);

        for handle in [sem, pair, branch] {
            assert_eq!(cs.counter_address(handle).unwrap(), 0x1000);
            cs.patch_counter_address(handle, 0x2_0000_0040).unwrap();
            assert_eq!(cs.counter_address(handle).unwrap(), 0x2_0000_0040);
        }
        assert!(cs.patch_counter_address(dispatch, 0x40).is_err());

        let parsed = cs.parse().unwrap();
        let waits: Vec<(GpuAddr, u64)> = parsed
            .iter()
            .filter_map(|p| match p.command {
                Command::SemaphoreWait { addr, value, .. } => Some((addr, value)),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![(0x2_0000_0040, 3), (0x2_0000_0040, 0)]);
    }

    #[test]
    fn test_truncate_rolls_back() {
        let mut cs = CommandStream::new();
        cs.encode_store_immediate(0x2000, 1, true);
        let mark = cs.len();
        cs.encode_dispatch(1, 1, 1, false);
        cs.truncate(mark);
        assert_eq!(cs.parse().unwrap().len(), 1);
    }

    #[test]
    fn test_compare_and_atomic_semantics() {
        assert!(CompareOp::NotEqual.evaluate(1, u64::MAX));
        assert!(!CompareOp::Less.evaluate(5, 5));
        assert_eq!(AtomicOp::CmpWr.apply(0, 0, 9), 9);
        assert_eq!(AtomicOp::CmpWr.apply(3, 0, 9), 3);
        assert_eq!(AtomicOp::Sub.apply(4, 4, 0), 0);
    }
}
