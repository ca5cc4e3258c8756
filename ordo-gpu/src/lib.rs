// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-order command submission for ordo.
//!
//! Command lists encode work for a simulated multi-engine GPU and order it
//! through per-list completion counters: semaphore waits, atomic and
//! store-immediate signals, patched re-execution of recorded lists, copy
//! offload routing and a synchronized-dispatch token.

pub mod cmdlist;
pub mod command_processor;
pub mod command_queue;
pub mod command_stream;
pub mod counter;
pub mod csr;
pub mod device;
pub mod event;
pub mod memory_manager;
pub mod partition;
pub mod patch;
pub mod queue_router;
pub mod sync_dispatch;

pub use cmdlist::{BufferSlice, CommandList, CommandListDesc, KernelLaunch, ListKind, ListState};
pub use command_queue::CommandQueue;
pub use counter::Counter;
pub use device::{Device, DeviceCaps};
pub use event::{Event, EventFlags, EventPool, EventStatus};
