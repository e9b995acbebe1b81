// Barcode Manager - State Storage
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Persistent daemon state.
//!
//! Only the networking-enabled flag survives a restart. It lives in a small
//! TOML file:
//!
//! ```toml
//! [main]
//! NetworkingEnabled = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::models::{Error, Result};

/// Where the manager keeps state that outlives the process.
pub trait StateStore {
    /// Stored networking-enabled flag; `true` when nothing is stored.
    fn networking_enabled(&self) -> bool;

    fn set_networking_enabled(&mut self, enabled: bool) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    main: MainSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MainSection {
    #[serde(rename = "NetworkingEnabled", default = "default_enabled")]
    networking_enabled: bool,
}

impl Default for MainSection {
    fn default() -> Self {
        Self {
            networking_enabled: default_enabled(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// State kept in a TOML file on disk.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: MainSection,
}

impl FileStateStore {
    /// Open the state file. A missing or unreadable file means defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match Self::load(&path) {
            Ok(Some(state)) => {
                info!("Loaded daemon state from {:?}", path);
                state
            }
            Ok(None) => MainSection::default(),
            Err(e) => {
                warn!("Failed to load daemon state: {}", e);
                MainSection::default()
            }
        };
        Self { path, state }
    }

    fn load(path: &Path) -> Result<Option<MainSection>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let file: StateFile = toml::from_str(&content)?;
        Ok(Some(file.main))
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(&StateFile {
            main: self.state.clone(),
        })?;
        fs::write(&self.path, content)
            .map_err(|e| Error::ConfigWriteFailed(format!("{:?}: {}", self.path, e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o644));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn networking_enabled(&self) -> bool {
        self.state.networking_enabled
    }

    fn set_networking_enabled(&mut self, enabled: bool) -> Result<()> {
        self.state.networking_enabled = enabled;
        self.save().inspect_err(|e| error!("Failed to save daemon state: {}", e))
    }
}

/// State that only lives as long as the process.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    enabled: bool,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl StateStore for MemoryStateStore {
    fn networking_enabled(&self) -> bool {
        self.enabled
    }

    fn set_networking_enabled(&mut self, enabled: bool) -> Result<()> {
        self.enabled = enabled;
        Ok(())
    }
}
