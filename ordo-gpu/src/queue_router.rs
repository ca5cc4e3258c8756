// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Engine and submission-context selection per operation.

use std::sync::Arc;

use ordo_common::settings::CopyOffloadMode;

use crate::command_processor::EngineClass;
use crate::csr::SubmissionContext;
use crate::device::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Compute,
    Copy,
}

/// Where one operation goes.
#[derive(Clone)]
pub struct Route {
    pub engine: EngineClass,
    pub context: Arc<dyn SubmissionContext>,
    /// Encode copy-class work with the copy engine's command forms.
    pub use_blitter: bool,
}

pub struct QueueRouter {
    mode: CopyOffloadMode,
    compute: Arc<dyn SubmissionContext>,
    copy: Option<Arc<dyn SubmissionContext>>,
}

impl QueueRouter {
    /// Pick the copy-offload mode for a new list.
    ///
    /// A debug override wins over the descriptor hint. Without an override,
    /// devices that must flush caches on every signal do not offload. Regular
    /// lists submit a single buffer, so dual-stream degrades to single-queue
    /// offload for them.
    pub fn select_mode(device: &Device, hint: Option<CopyOffloadMode>, regular: bool) -> CopyOffloadMode {
        let overridden = device.settings().copy_offload;
        let requested = overridden.or(hint).unwrap_or(CopyOffloadMode::Disabled);

        let mode = if requested == CopyOffloadMode::Disabled || !device.caps().copy_engine_available {
            CopyOffloadMode::Disabled
        } else if overridden.is_none() && device.caps().dc_flush_required_on_signal {
            CopyOffloadMode::Disabled
        } else if regular && requested == CopyOffloadMode::DualStream {
            CopyOffloadMode::SingleQueueOffload
        } else {
            requested
        };

        if mode != requested {
            log::debug!("QueueRouter: copy offload {:?} downgraded to {:?}", requested, mode);
        }
        mode
    }

    pub fn new(device: &Device, mode: CopyOffloadMode, compute: Arc<dyn SubmissionContext>) -> Self {
        let copy = match mode {
            CopyOffloadMode::DualStream => Some(device.default_context(EngineClass::Copy)),
            _ => None,
        };
        Self { mode, compute, copy }
    }

    pub fn mode(&self) -> CopyOffloadMode {
        self.mode
    }

    pub fn route(&self, op: OpClass) -> Route {
        match (op, self.mode) {
            (OpClass::Copy, CopyOffloadMode::DualStream) => {
                let context = self.get_context(true);
                Route {
                    engine: context.engine(),
                    context,
                    use_blitter: true,
                }
            }
            (OpClass::Copy, CopyOffloadMode::SingleQueueOffload) => Route {
                engine: self.compute.engine(),
                context: self.compute.clone(),
                use_blitter: true,
            },
            _ => Route {
                engine: self.compute.engine(),
                context: self.compute.clone(),
                use_blitter: false,
            },
        }
    }

    /// Context of the route for copy or compute work.
    pub fn get_context(&self, is_copy: bool) -> Arc<dyn SubmissionContext> {
        match (&self.copy, is_copy) {
            (Some(copy), true) => copy.clone(),
            _ => self.compute.clone(),
        }
    }

    /// Every context this router may submit through.
    pub fn contexts(&self) -> Vec<Arc<dyn SubmissionContext>> {
        let mut contexts = vec![self.compute.clone()];
        if let Some(copy) = &self.copy {
            contexts.push(copy.clone());
        }
        contexts
    }
}
