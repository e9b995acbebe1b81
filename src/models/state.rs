// Barcode Manager - Device and Manager States
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! State enums shared by devices, activation requests and the manager.
//!
//! Numeric values are part of the D-Bus API and must not change.

use std::fmt;

use thiserror::Error;

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum DeviceState {
    Unknown = 0,
    /// Initial state of every device.
    #[default]
    Unmanaged = 1,
    Unavailable = 2,
    Disconnected = 3,
    Prepare = 4,
    Config = 5,
    NeedAuth = 6,
    IpConfig = 7,
    Activated = 8,
    Failed = 9,
}

impl DeviceState {
    pub const ALL: [DeviceState; 10] = [
        Self::Unknown,
        Self::Unmanaged,
        Self::Unavailable,
        Self::Disconnected,
        Self::Prepare,
        Self::Config,
        Self::NeedAuth,
        Self::IpConfig,
        Self::Activated,
        Self::Failed,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.as_u32() == value)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Unmanaged => "unmanaged",
            Self::Unavailable => "unavailable",
            Self::Disconnected => "disconnected",
            Self::Prepare => "prepare",
            Self::Config => "config",
            Self::NeedAuth => "need-auth",
            Self::IpConfig => "ip-config",
            Self::Activated => "activated",
            Self::Failed => "failed",
        }
    }

    /// States of the activation pipeline before `Activated`.
    pub fn is_activating(&self) -> bool {
        matches!(
            self,
            Self::Prepare | Self::Config | Self::NeedAuth | Self::IpConfig
        )
    }

    /// States in which an activation request is bound to the device.
    pub fn is_active(&self) -> bool {
        self.is_activating() || *self == Self::Activated
    }

    /// Whether `self -> to` is an edge of the device state machine.
    pub fn can_transition(self, to: DeviceState) -> bool {
        use DeviceState::*;

        match (self, to) {
            (Unmanaged, Unavailable) => true,
            (Unavailable, Disconnected) | (Disconnected, Unavailable) => true,
            (Unavailable, Unmanaged) | (Disconnected, Unmanaged) => true,
            (Disconnected, Prepare) => true,
            (Prepare, Config) => true,
            (Config, NeedAuth) | (Config, IpConfig) => true,
            (NeedAuth, IpConfig) => true,
            (IpConfig, NeedAuth) | (IpConfig, Activated) => true,
            (from, Failed | Disconnected | Unavailable | Unmanaged) if from.is_active() => true,
            (Failed, Disconnected) | (Failed, Unmanaged) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a device changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum StateReason {
    #[default]
    None = 0,
    Unknown = 1,
    NowManaged = 2,
    NowUnmanaged = 3,
    ConfigFailed = 4,
    NoSecrets = 7,
    Carrier = 25,
    FirmwareMissing = 35,
    Removed = 36,
    Sleeping = 37,
    ConnectionRemoved = 38,
    UserRequested = 39,
    LinkFailed = 44,
}

impl StateReason {
    const ALL: [StateReason; 13] = [
        Self::None,
        Self::Unknown,
        Self::NowManaged,
        Self::NowUnmanaged,
        Self::ConfigFailed,
        Self::NoSecrets,
        Self::Carrier,
        Self::FirmwareMissing,
        Self::Removed,
        Self::Sleeping,
        Self::ConnectionRemoved,
        Self::UserRequested,
        Self::LinkFailed,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire value. Values this daemon does not know map to `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_u32() == value)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Unknown => "unknown",
            Self::NowManaged => "now-managed",
            Self::NowUnmanaged => "now-unmanaged",
            Self::ConfigFailed => "config-failed",
            Self::NoSecrets => "no-secrets",
            Self::Carrier => "carrier-lost",
            Self::FirmwareMissing => "firmware-missing",
            Self::Removed => "removed",
            Self::Sleeping => "sleeping",
            Self::ConnectionRemoved => "connection-removed",
            Self::UserRequested => "user-requested",
            Self::LinkFailed => "link-failed",
        }
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change request that is not an edge of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid device state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: DeviceState,
    pub to: DeviceState,
}

/// Device kind, as exported on the `DeviceType` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum DeviceType {
    #[default]
    Unknown = 0,
    Serial = 1,
    Usb = 2,
    Bluetooth = 3,
    Hidraw = 4,
}

impl DeviceType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Serial => "serial",
            Self::Usb => "USB",
            Self::Bluetooth => "Bluetooth",
            Self::Hidraw => "HID raw",
        }
    }
}

/// Generic device capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// The daemon can manage this device.
    pub const SUPPORTED: Capabilities = Capabilities(0x1);
    pub const CARRIER_DETECT: Capabilities = Capabilities(0x2);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Aggregate daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ManagerState {
    #[default]
    Unknown = 0,
    Asleep = 1,
    Connecting = 2,
    Connected = 3,
    Disconnected = 4,
}

impl ManagerState {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Asleep => "asleep",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of an active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ActiveState {
    #[default]
    Unknown = 0,
    Activating = 1,
    Activated = 2,
}

impl ActiveState {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Project a device state onto the active-connection state.
    pub fn from_device_state(state: DeviceState) -> Self {
        match state {
            DeviceState::Prepare
            | DeviceState::Config
            | DeviceState::NeedAuth
            | DeviceState::IpConfig => Self::Activating,
            DeviceState::Activated => Self::Activated,
            _ => Self::Unknown,
        }
    }
}
