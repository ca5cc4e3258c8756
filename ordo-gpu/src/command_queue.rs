// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command queues execute closed Regular lists.

use std::sync::Arc;
use std::time::Duration;

use ordo_common::{Error, Result, TaskCount};

use crate::cmdlist::{CommandList, ListKind};
use crate::command_processor::EngineClass;
use crate::csr::SubmissionContext;
use crate::device::Device;

pub struct CommandQueue {
    device: Arc<Device>,
    context: Arc<dyn SubmissionContext>,
}

impl CommandQueue {
    /// A queue with its own compute submission context.
    pub fn new(device: &Arc<Device>) -> Self {
        Self::with_context(device, device.create_context(EngineClass::Compute))
    }

    pub fn with_context(device: &Arc<Device>, context: Arc<dyn SubmissionContext>) -> Self {
        log::debug!("CommandQueue: on ctx={} ({:?})", context.id().0, context.engine());
        Self {
            device: device.clone(),
            context,
        }
    }

    pub fn context(&self) -> &Arc<dyn SubmissionContext> {
        &self.context
    }

    /// Execute each list once, in order. Stops at the first failure; lists
    /// before it stay submitted.
    pub fn execute_command_lists(&self, lists: &[Arc<CommandList>]) -> Result<TaskCount> {
        if lists.is_empty() {
            return Err(Error::invalid_argument("no command lists to execute"));
        }
        if lists.iter().any(|l| l.kind() != ListKind::Regular) {
            return Err(Error::invalid_argument("immediate lists cannot be executed on a queue"));
        }
        let mut task = self.context.latest_task();
        for list in lists {
            task = list.execute_on(&self.context)?;
        }
        Ok(task)
    }

    /// Wait for everything submitted to this queue.
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        let task = self.context.latest_task();
        let status = self.context.wait_for_completion(task, timeout);
        if self.device.gpu().is_hung() {
            log::warn!("CommandQueue: synchronize saw a hung device");
        }
        status.into_result()
    }
}
