// Barcode Manager - Error Types
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Shared error types for the Barcode Manager daemon.

use thiserror::Error;

use super::state::TransitionError;

/// Result type alias for Barcode Manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Barcode Manager operations.
#[derive(Debug, Error)]
pub enum Error {
    // ========================================
    // Manager Errors (exported on the bus)
    // ========================================
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device is not managed: {0}")]
    UnmanagedDevice(String),

    #[error("Invalid settings service: {0}")]
    InvalidService(String),

    #[error("Connection is invalid for this device: {0}")]
    ConnectionInvalid(String),

    #[error("Connection is not active: {0}")]
    ConnectionNotActive(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already {}", pick(.0, "asleep", "awake"))]
    AlreadyAsleepOrAwake(bool),

    #[error("Already {}", pick(.0, "enabled", "disabled"))]
    AlreadyEnabledOrDisabled(bool),

    // ========================================
    // Device Errors
    // ========================================
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Device {0} is not available")]
    DeviceNotAvailable(String),

    // ========================================
    // Logging Errors
    // ========================================
    #[error("Unknown logging level: {0}")]
    InvalidLoggingLevel(String),

    #[error("Unknown logging domain: {0}")]
    InvalidLoggingDomain(String),

    // ========================================
    // D-Bus Errors
    // ========================================
    #[error("D-Bus error: {0}")]
    Dbus(String),

    #[error("Settings service error: {0}")]
    SettingsService(String),

    // ========================================
    // Storage Errors
    // ========================================
    #[error("Failed to read configuration: {0}")]
    ConfigReadFailed(String),

    #[error("Failed to write configuration: {0}")]
    ConfigWriteFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParseFailed(String),

    // ========================================
    // System Errors
    // ========================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command failed: {command} - {reason}")]
    CommandFailed { command: String, reason: String },

    // ========================================
    // Generic Errors
    // ========================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Short error name used under `org.freedesktop.BarcodeManager.Error`.
    pub fn dbus_name(&self) -> &'static str {
        match self {
            Self::UnknownConnection(_) => "UnknownConnection",
            Self::UnknownDevice(_) => "UnknownDevice",
            Self::UnmanagedDevice(_) => "UnmanagedDevice",
            Self::InvalidService(_) => "InvalidService",
            Self::ConnectionInvalid(_) => "ConnectionInvalid",
            Self::ConnectionNotActive(_) => "ConnectionNotActive",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::AlreadyAsleepOrAwake(_) => "AlreadyAsleepOrAwake",
            Self::AlreadyEnabledOrDisabled(_) => "AlreadyEnabledOrDisabled",
            Self::InvalidLoggingLevel(_) | Self::InvalidLoggingDomain(_) => "InvalidArgs",
            _ => "Failed",
        }
    }

    /// Check if this error is an authorization error.
    pub fn is_authorization_error(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Check if this error reports a request that matches the current state.
    pub fn is_already_in_state(&self) -> bool {
        matches!(
            self,
            Self::AlreadyAsleepOrAwake(_) | Self::AlreadyEnabledOrDisabled(_)
        )
    }
}

fn pick(flag: &bool, yes: &'static str, no: &'static str) -> &'static str {
    if *flag {
        yes
    } else {
        no
    }
}

// Convert from zbus errors
impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        Error::Dbus(err.to_string())
    }
}

// Convert from toml parse errors
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigParseFailed(err.to_string())
    }
}

// Convert from toml serialize errors
impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::ConfigWriteFailed(err.to_string())
    }
}
