// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Regular-list lifecycle: close, reset and patched execution.

use std::sync::Arc;

use ordo_common::{Error, Result, TaskCount};

use super::{apply_event_update, CommandList, ListState};
use crate::command_stream::CommandEncoder;
use crate::csr::SubmissionContext;

impl CommandList {
    /// Finish recording. Immediate lists have nothing to close.
    pub fn close(&self) -> Result<()> {
        if self.is_immediate() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.state != ListState::Recording {
            return Err(Error::InvalidState("command list is already closed"));
        }
        inner.stream.encode_batch_buffer_end();
        inner.state = ListState::Closed;
        log::debug!(
            "CommandList: closed with {} dwords, {} patch descriptor(s), counter #{} delta {}",
            inner.stream.len(),
            inner.patches.len(),
            self.counter.id(),
            self.counter.current_value()
        );
        Ok(())
    }

    /// Drop everything recorded and start over from a zero counter.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stream.clear();
        inner.patches.clear();
        inner.residency.clear();
        inner.signal_events.clear();
        inner.chunk_route = None;
        inner.last_engine = None;
        inner.pending_appends = 0;
        inner.state = ListState::Recording;
        self.counter.reset();
        log::debug!("CommandList: reset counter #{}", self.counter.id());
        Ok(())
    }

    /// Patch the recording for its next run and submit it on `context`.
    ///
    /// On a failed submission the counter's run count and the events are
    /// left untouched.
    pub(crate) fn execute_on(&self, context: &Arc<dyn SubmissionContext>) -> Result<TaskCount> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !matches!(inner.state, ListState::Closed | ListState::Executing) {
            return Err(Error::InvalidState("command list must be closed before execution"));
        }

        let run = self.counter.submissions();
        if self.device.settings().regular_list_patching {
            inner.patches.patch_all(&mut inner.stream, run)?;
        } else if run > 0 {
            return Err(Error::InvalidState("re-execution needs regular list patching"));
        }

        for buffer in inner.unique_residency() {
            context.ensure_resident(&buffer);
        }
        let task = context.submit(inner.stream.words().to_vec())?;

        self.counter.add_submission();
        for (event, update) in &inner.signal_events {
            apply_event_update(event, &self.counter, *update);
            event.set_producer(context, task);
        }
        inner.state = ListState::Executing;
        log::debug!(
            "CommandList: run {} of counter #{} submitted ctx={} task={}",
            run,
            self.counter.id(),
            context.id().0,
            task
        );
        Ok(task)
    }
}
