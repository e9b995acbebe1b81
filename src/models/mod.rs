// Barcode Manager - Shared Models
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! # Barcode Manager Models
//!
//! Types shared by every part of the daemon:
//!
//! - **State**: device, manager and active-connection states
//! - **Connection**: settings delivered by the settings services
//! - **Config**: daemon configuration file
//! - **Error**: shared error types

pub mod config;
pub mod connection;
pub mod error;
pub mod state;
pub mod validation;

pub use config::DaemonConfig;
pub use connection::{
    BtType, Connection, ConnectionScope, SettingMap, SettingValue, SettingsError, SettingsHash,
};
pub use error::{Error, Result};
pub use state::{
    ActiveState, Capabilities, DeviceState, DeviceType, ManagerState, StateReason, TransitionError,
};

/// D-Bus service name of the daemon.
pub const DBUS_SERVICE_NAME: &str = "org.freedesktop.BarcodeManager";

/// D-Bus object path of the manager object.
pub const DBUS_OBJECT_PATH: &str = "/org/freedesktop/BarcodeManager";

/// Prefix of exported device object paths.
pub const DBUS_DEVICE_PATH_PREFIX: &str = "/org/freedesktop/BarcodeManager/Devices";

/// Prefix of exported active-connection object paths.
pub const DBUS_ACTIVE_PATH_PREFIX: &str = "/org/freedesktop/BarcodeManager/ActiveConnection";

/// Settings service owned by the system.
pub const SYSTEM_SETTINGS_SERVICE: &str = "org.freedesktop.BarcodeManagerSystemSettings";

/// Settings service owned by the logged in user.
pub const USER_SETTINGS_SERVICE: &str = "org.freedesktop.BarcodeManagerUserSettings";

/// Object path of both settings services.
pub const SETTINGS_OBJECT_PATH: &str = "/org/freedesktop/BarcodeManagerSettings";

/// Default configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/barcode-manager/barcode-manager.conf";
