// Barcode Manager - Daemon Configuration
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Daemon configuration model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the `[main]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfig {
    /// Kernel subsystems watched for scanners.
    #[serde(default = "default_subsystems")]
    pub subsystems: Vec<String>,

    /// Parent subsystem whose devices carry the driver one level up.
    #[serde(default = "default_bridge_subsystem")]
    pub bridge_subsystem: String,

    /// Time an activation may take before the request gives up.
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,

    /// Time allowed for the bluetooth link to come up.
    #[serde(default = "default_bt_connect_timeout")]
    pub bluetooth_connect_timeout_secs: u64,

    /// Persistent daemon state (NetworkingEnabled).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Unprivileged users allowed to call privileged methods.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            subsystems: default_subsystems(),
            bridge_subsystem: default_bridge_subsystem(),
            activation_timeout_secs: default_activation_timeout(),
            bluetooth_connect_timeout_secs: default_bt_connect_timeout(),
            state_file: default_state_file(),
            allowed_uids: Vec::new(),
        }
    }
}

/// Settings of the `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (ERR, WARN, INFO, DEBUG).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Comma separated log domains, or ALL.
    #[serde(default = "default_log_domains")]
    pub domains: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            domains: default_log_domains(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub main: MainConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_subsystems() -> Vec<String> {
    vec!["hidraw".to_string()]
}

fn default_bridge_subsystem() -> String {
    "ibmebus".to_string()
}

fn default_activation_timeout() -> u64 {
    30
}

fn default_bt_connect_timeout() -> u64 {
    30
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/barcode-manager/barcode-manager.state")
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_domains() -> String {
    "ALL".to_string()
}

impl DaemonConfig {
    /// Load configuration from TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, super::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, falling back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, super::Error> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.main.activation_timeout_secs)
    }

    pub fn bluetooth_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.main.bluetooth_connect_timeout_secs)
    }
}
