// SPDX-FileCopyrightText: 2025 ordo contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use ordo_common::settings::{
    parse_override, AtomicSignalingPolicy, CopyOffloadMode, Settings, SynchronizedDispatchMode,
};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "ordo.ini";

/// Locate ordo.ini: `$ORDO_CONFIG`, then the XDG and home config directories.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("ORDO_CONFIG") {
        let path = PathBuf::from(explicit);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("ordo").join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("ordo")
            .join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from an ordo.ini file. Missing or unreadable files give defaults.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return Settings::default();
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No ordo config found, using defaults");
                return Settings::default();
            }
        },
    };

    info!("Loading config from: {}", config_path.display());
    load_config_file(&config_path)
}

fn load_config_file(path: &Path) -> Settings {
    let mut settings = Settings::default();

    let conf = match Ini::load_from_file(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };

    // [Counters]
    if let Some(section) = conf.section(Some("Counters")) {
        if let Some(atomic) = section.get("atomic_signaling") {
            settings.atomic_signaling = AtomicSignalingPolicy::from_str_or_default(atomic);
            debug!("Atomic signaling: {:?}", settings.atomic_signaling);
        }
        if let Some(mirror) = section.get("duplicated_storage") {
            settings.duplicated_counter_storage = parse_override(mirror);
        }
        if let Some(qword) = section.get("qword_counters") {
            settings.qword_counters = parse_flag(qword);
        }
    }

    // [Routing]
    if let Some(section) = conf.section(Some("Routing")) {
        if let Some(offload) = section.get("copy_offload") {
            settings.copy_offload = match offload.trim() {
                "" | "-1" | "auto" => None,
                other => Some(CopyOffloadMode::from_str_or_default(other)),
            };
            debug!("Copy offload: {:?}", settings.copy_offload);
        }
        if let Some(relaxed) = section.get("relaxed_ordering") {
            settings.relaxed_ordering = parse_override(relaxed);
        }
    }

    // [Dispatch]
    if let Some(section) = conf.section(Some("Dispatch")) {
        if let Some(sync) = section.get("synchronized_dispatch") {
            settings.synchronized_dispatch = match sync.trim() {
                "" | "-1" | "auto" => None,
                other => Some(SynchronizedDispatchMode::from_str_or_default(other)),
            };
            debug!("Synchronized dispatch: {:?}", settings.synchronized_dispatch);
        }
        if let Some(patching) = section.get("regular_list_patching") {
            settings.regular_list_patching = parse_flag(patching);
        }
        if let Some(batch) = section.get("immediate_flush_batch") {
            settings.immediate_flush_batch = batch.trim().parse().unwrap_or(1);
        }
    }

    // [Debug]
    if let Some(section) = conf.section(Some("Debug")) {
        if let Some(interval) = section.get("host_sync_poll_interval_us") {
            settings.host_sync_poll_interval_us = interval
                .trim()
                .parse()
                .unwrap_or(settings.host_sync_poll_interval_us);
        }
    }

    settings
}

fn parse_flag(value: &str) -> bool {
    parse_override(value).unwrap_or(false)
}
