// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error as ThisError;

/// Driver subsystem a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Subsystem {
    Device = 1,
    Memory = 2,
    CommandList = 3,
    Event = 4,
    Queue = 5,
}

/// Stable status reported across the API boundary. The subsystem sits
/// above bit 16 and the reason below it; zero is success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResultCode(u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_ARGUMENT: Self = Self::of(Subsystem::CommandList, 1);
    pub const INVALID_STATE: Self = Self::of(Subsystem::CommandList, 2);
    pub const OUT_OF_DEVICE_MEMORY: Self = Self::of(Subsystem::Memory, 1);
    pub const NO_MIRROR: Self = Self::of(Subsystem::Memory, 2);
    pub const NOT_READY: Self = Self::of(Subsystem::Event, 1);
    pub const DEVICE_LOST: Self = Self::of(Subsystem::Device, 1);
    pub const GPU_HANG: Self = Self::of(Subsystem::Queue, 1);

    const fn of(subsystem: Subsystem, reason: u16) -> Self {
        Self(((subsystem as u32) << 16) | reason as u32)
    }

    pub fn subsystem(self) -> Option<Subsystem> {
        match self.0 >> 16 {
            1 => Some(Subsystem::Device),
            2 => Some(Subsystem::Memory),
            3 => Some(Subsystem::CommandList),
            4 => Some(Subsystem::Event),
            5 => Some(Subsystem::Queue),
            _ => None,
        }
    }

    pub const fn reason(self) -> u16 {
        self.0 as u16
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.subsystem() {
            _ if self.is_success() => f.write_str("success"),
            Some(subsystem) => write!(f, "{:?}/{}", subsystem, self.reason()),
            None => write!(f, "unknown/{:#x}", self.0),
        }
    }
}

/// Error taxonomy shared by every public driver operation.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to allocate {what} ({size:#x} bytes)")]
    AllocationFailure { what: &'static str, size: u64 },

    #[error("device lost")]
    DeviceLost,

    #[error("gpu hang detected")]
    GpuHang,

    #[error("not ready")]
    NotReady,

    #[error("counter storage is not mirrored")]
    NoMirror,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Stable result code reported across the API boundary.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::InvalidArgument(_) => ResultCode::INVALID_ARGUMENT,
            Error::AllocationFailure { .. } => ResultCode::OUT_OF_DEVICE_MEMORY,
            Error::DeviceLost => ResultCode::DEVICE_LOST,
            Error::GpuHang => ResultCode::GPU_HANG,
            Error::NotReady => ResultCode::NOT_READY,
            Error::NoMirror => ResultCode::NO_MIRROR,
            Error::InvalidState(_) => ResultCode::INVALID_STATE,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<Error> for ResultCode {
    fn from(err: Error) -> Self {
        err.result_code()
    }
}

/// Collapse a driver result into its result code.
pub fn to_result_code<T>(result: &Result<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::SUCCESS,
        Err(e) => e.result_code(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
