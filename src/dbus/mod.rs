// Barcode Manager - D-Bus Integration
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Everything that talks to the system bus.
//!
//! - **interface / service**: the exported manager, device and
//!   active-connection objects
//! - **settings**: clients of the system and user settings services
//! - **secrets**: secrets provider backed by those services
//! - **bluez**: paired bluetooth scanners and their links

pub mod bluez;
pub mod interface;
pub mod secrets;
pub mod service;
pub mod settings;

pub use bluez::{BluezClient, BluezEvent};
pub use interface::{ManagerCommand, ManagerError};
pub use secrets::DbusSecrets;
pub use service::DbusService;
pub use settings::{spawn_watchers, SettingsEvent};
