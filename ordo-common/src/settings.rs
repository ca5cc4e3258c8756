// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Driver policy inputs and debug overrides, populated from config INI.
///
/// `None` on an `Option` field means "no override": the device capability or
/// the list descriptor decides.
#[derive(Debug, Clone)]
pub struct Settings {
    // Counters
    pub atomic_signaling: AtomicSignalingPolicy,
    pub duplicated_counter_storage: Option<bool>,
    pub qword_counters: bool,

    // Routing
    pub copy_offload: Option<CopyOffloadMode>,
    pub relaxed_ordering: Option<bool>,

    // Dispatch
    pub synchronized_dispatch: Option<SynchronizedDispatchMode>,
    pub regular_list_patching: bool,
    pub immediate_flush_batch: usize,

    // Debug
    pub host_sync_poll_interval_us: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            atomic_signaling: AtomicSignalingPolicy::Auto,
            duplicated_counter_storage: None,
            qword_counters: false,
            copy_offload: None,
            relaxed_ordering: None,
            synchronized_dispatch: None,
            regular_list_patching: true,
            immediate_flush_batch: 1,
            host_sync_poll_interval_us: 50,
        }
    }
}

impl Settings {
    /// Batch size an Immediate list may accumulate before flushing (at least 1).
    pub fn flush_batch(&self) -> usize {
        self.immediate_flush_batch.max(1)
    }
}

/// How counter increments are encoded when several partitions contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicSignalingPolicy {
    /// Atomic when more than one partition contributes and the device prefers it.
    Auto,
    Enabled,
    Disabled,
}

impl AtomicSignalingPolicy {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "on" | "true" | "enabled" => Self::Enabled,
            "0" | "off" | "false" | "disabled" => Self::Disabled,
            _ => Self::Auto,
        }
    }

    /// Resolve the policy for a list running on `partition_count` tiles.
    pub fn resolve(self, partition_count: u32, device_prefers_atomic: bool) -> bool {
        match self {
            Self::Enabled => true,
            Self::Disabled => false,
            Self::Auto => partition_count > 1 && device_prefers_atomic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOffloadMode {
    Disabled,
    /// Compute and copy run on two engines with separate submission contexts.
    DualStream,
    /// One queue; copies use the copy engine's command forms.
    SingleQueueOffload,
}

impl CopyOffloadMode {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "dual" | "dualstream" | "dual-stream" => Self::DualStream,
            "2" | "single" | "singlequeue" | "single-queue" => Self::SingleQueueOffload,
            _ => Self::Disabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizedDispatchMode {
    Disabled,
    Limited,
    Full,
}

impl SynchronizedDispatchMode {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "limited" => Self::Limited,
            "2" | "full" => Self::Full,
            _ => Self::Disabled,
        }
    }
}

/// Parse an optional boolean override; `-1`, `auto` or an empty value mean "no override".
pub fn parse_override(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
