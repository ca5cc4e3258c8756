// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Immediate-list submission: chunk flushing, host synchronization and
//! execution of Regular lists from an Immediate list.

use std::sync::Arc;
use std::time::Duration;

use ordo_common::{Error, Result};

use super::{AppendRequest, CommandList, EventUpdate, ListInner, ListKind, Operation};
use crate::command_processor::EngineClass;
use crate::command_stream::CommandEncoder;
use crate::event::Event;
use crate::queue_router::OpClass;

impl CommandList {
    /// Submit whatever the list has recorded but not yet submitted.
    pub fn flush(&self) -> Result<()> {
        if !self.is_immediate() {
            return Err(Error::InvalidState("only immediate lists flush"));
        }
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    /// Wait until everything appended so far has completed on the GPU.
    ///
    /// The list lock is only held for the flush; polling runs without it.
    pub fn host_synchronize(&self, timeout: Duration) -> Result<()> {
        if self.is_immediate() {
            let mut inner = self.inner.lock();
            self.flush_locked(&mut inner)?;
        }
        let target = self.counter.host_target();
        let counter = &self.counter;
        let status = self.device.poll(timeout, || {
            counter.completed_value().map(|v| v >= target).unwrap_or(false)
        });
        if let Err(e) = status.into_result() {
            log::debug!(
                "CommandList: host sync on counter #{} for {} failed: {}",
                counter.id(),
                target,
                e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Execute closed Regular lists in order on this list's compute context,
    /// then signal `signal` once all of them have completed.
    pub fn append_command_lists(
        &self,
        lists: &[Arc<CommandList>],
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        if !self.is_immediate() {
            return Err(Error::InvalidState("only immediate lists execute command lists"));
        }
        if lists.iter().any(|l| l.kind() != ListKind::Regular) {
            return Err(Error::invalid_argument("only regular lists can be appended"));
        }

        if !waits.is_empty() {
            self.append_wait_on_events(waits)?;
        }
        {
            let mut inner = self.inner.lock();
            self.flush_locked(&mut inner)?;
        }

        let context = self.router.get_context(false);
        let mut counter_waits = Vec::with_capacity(lists.len());
        for list in lists {
            list.execute_on(&context)?;
            counter_waits.push((list.counter().clone(), list.counter().host_target()));
        }

        self.append(AppendRequest {
            op: Operation::Barrier,
            signal,
            waits: &[],
            counter_waits,
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    pub(super) fn flush_locked(&self, inner: &mut ListInner) -> Result<()> {
        let Some(route) = inner.chunk_route.take() else {
            return Ok(());
        };
        if inner.stream.is_empty() {
            inner.pending_appends = 0;
            return Ok(());
        }
        inner.stream.encode_batch_buffer_end();

        for buffer in inner.unique_residency() {
            route.context.ensure_resident(&buffer);
        }
        inner.residency.clear();
        let words = inner.stream.take();
        let appends = std::mem::take(&mut inner.pending_appends);
        let signals = std::mem::take(&mut inner.signal_events);

        let task = match route.context.submit(words) {
            Ok(task) => task,
            Err(e) => {
                log::warn!(
                    "CommandList: flush of {} append(s) on {:?} failed: {}",
                    appends,
                    route.engine,
                    e
                );
                return Err(e);
            }
        };
        for (event, update) in signals {
            if update != EventUpdate::Reset {
                event.set_producer(&route.context, task);
            }
        }
        log::debug!(
            "CommandList: flushed {} append(s) to {:?} ctx={} task={}",
            appends,
            route.engine,
            route.context.id().0,
            task
        );
        Ok(())
    }

    /// Engine the next operation of `class` would go to.
    pub fn engine_for(&self, copy: bool) -> EngineClass {
        let class = if copy { OpClass::Copy } else { OpClass::Compute };
        self.router.route(class).engine
    }
}
