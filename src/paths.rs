//! Centralized path definitions for all data files and directories.
//!
//! This module is the single source of truth for leaf filenames and directory
//! names. No other module should hard-code these strings.

use std::path::{Path, PathBuf};

// ── Application identity ─────────────────────────────────────────

pub const APP_ID: &str = "logicforge";

// ── Leaf filenames ───────────────────────────────────────────────

pub const SETTINGS_FILE: &str = "settings.json";
pub const CREDENTIALS_FILE: &str = ".credentials";

// ── Directory names ──────────────────────────────────────────────

pub const ATTEMPT_LOGS_DIR: &str = "attempt-logs";

/// Default config directory (`~/.config/logicforge` on Linux).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_ID))
}

// ── Config-dir functions (take config_dir) ───────────────────────

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

pub fn credentials_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CREDENTIALS_FILE)
}

pub fn attempt_logs_dir(config_dir: &Path) -> PathBuf {
    config_dir.join(ATTEMPT_LOGS_DIR)
}

pub fn attempt_log_file(config_dir: &Path, date: &str, session_id: &str) -> PathBuf {
    attempt_logs_dir(config_dir)
        .join(date)
        .join(format!("{session_id}.jsonl"))
}
