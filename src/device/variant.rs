// Barcode Manager - Device Variants
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Per-kind device behaviour.
//!
//! Every concrete device kind implements [`DeviceVariant`]. The generic
//! [`Device`](super::Device) holds one [`VariantKind`] and dispatches to it
//! for compatibility checks and for the activation stages.

use thiserror::Error;
use tokio::time::Instant;

use super::bluetooth::BluetoothVariant;
use super::hidraw::HidrawVariant;
use super::serial::SerialVariant;
use crate::models::{
    BtType, Capabilities, Connection, DeviceType, SettingsError, StateReason,
};

/// Why a connection cannot be used on a device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncompatibilityReason {
    #[error("connection is not of type '{0}'")]
    NotThisType(&'static str),

    #[error("invalid connection settings: {0}")]
    InvalidSettings(SettingsError),

    #[error("device lacks the capability required by the connection")]
    CapabilityMismatch,

    #[error("connection is bound to a different device address")]
    AddressMismatch,
}

/// Identity fields of a device that variants may need for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub udi: String,
    pub iface: String,
    pub driver: String,
    pub ifindex: Option<u32>,
}

/// Secrets a device needs before it can continue activating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsNeeded {
    pub setting_name: String,
    pub hints: Vec<String>,
    pub request_new: bool,
}

/// Link a bluetooth device asks the bluez collaborator to bring up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub bdaddr: String,
    pub bt_type: BtType,
}

/// Result of running one activation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage finished, move to the next one.
    Success,
    /// Stage continues asynchronously; the device stays where it is.
    Postpone,
    /// Stage waits for an external link to come up.
    WaitForLink(LinkRequest),
    /// Stage cannot continue without secrets.
    NeedSecrets(SecretsNeeded),
    /// Stage failed; the device goes to `Failed` with this reason.
    Failure(StateReason),
}

/// Behaviour implemented by each device kind.
pub trait DeviceVariant {
    fn device_type(&self) -> DeviceType;

    /// Name of the connection type (and setting) this kind accepts.
    fn setting_type(&self) -> &'static str;

    /// Generic capabilities of the hardware.
    fn get_capabilities(&self) -> Capabilities {
        Capabilities::SUPPORTED
    }

    fn check_connection_compatible(
        &self,
        device: &DeviceIdentity,
        connection: &Connection,
    ) -> Result<(), IncompatibilityReason>;

    /// First candidate, in the order given, that may be activated
    /// automatically on this device.
    fn get_best_auto_connection<'a>(
        &self,
        device: &DeviceIdentity,
        candidates: &[&'a Connection],
    ) -> Option<&'a Connection> {
        candidates
            .iter()
            .copied()
            .filter(|c| c.autoconnect())
            .find(|c| self.check_connection_compatible(device, c).is_ok())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn act_stage_prepare(&mut self, _device: &DeviceIdentity, _connection: &Connection) -> StageOutcome {
        StageOutcome::Success
    }

    fn act_stage_config(&mut self, _device: &DeviceIdentity, _connection: &Connection) -> StageOutcome {
        StageOutcome::Success
    }

    fn act_stage_ip_config(&mut self, _device: &DeviceIdentity, _connection: &Connection) -> StageOutcome {
        StageOutcome::Success
    }

    /// Secrets for `setting_name` were merged into `connection`.
    fn secrets_updated(
        &mut self,
        _device: &DeviceIdentity,
        _connection: &Connection,
        _setting_name: &str,
    ) -> StageOutcome {
        StageOutcome::Success
    }

    /// The external link reported in. Only link-based kinds care.
    fn link_changed(&mut self, _connection: &Connection, _up: bool) -> StageOutcome {
        StageOutcome::Postpone
    }

    /// Earliest instant at which the variant wants [`Self::deadline_expired`].
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Called once a deadline passed; returns a failure reason to apply.
    fn deadline_expired(&mut self, _now: Instant) -> Option<StateReason> {
        None
    }

    /// Drop any per-activation state.
    fn deactivate(&mut self) {}
}

/// Closed set of device kinds.
#[derive(Debug)]
pub enum VariantKind {
    Bluetooth(BluetoothVariant),
    Hidraw(HidrawVariant),
    Serial(SerialVariant),
}

macro_rules! dispatch {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            VariantKind::Bluetooth($v) => $body,
            VariantKind::Hidraw($v) => $body,
            VariantKind::Serial($v) => $body,
        }
    };
}

impl DeviceVariant for VariantKind {
    fn device_type(&self) -> DeviceType {
        dispatch!(self, v => v.device_type())
    }

    fn setting_type(&self) -> &'static str {
        dispatch!(self, v => v.setting_type())
    }

    fn get_capabilities(&self) -> Capabilities {
        dispatch!(self, v => v.get_capabilities())
    }

    fn check_connection_compatible(
        &self,
        device: &DeviceIdentity,
        connection: &Connection,
    ) -> Result<(), IncompatibilityReason> {
        dispatch!(self, v => v.check_connection_compatible(device, connection))
    }

    fn get_best_auto_connection<'a>(
        &self,
        device: &DeviceIdentity,
        candidates: &[&'a Connection],
    ) -> Option<&'a Connection> {
        dispatch!(self, v => v.get_best_auto_connection(device, candidates))
    }

    fn is_available(&self) -> bool {
        dispatch!(self, v => v.is_available())
    }

    fn act_stage_prepare(&mut self, device: &DeviceIdentity, connection: &Connection) -> StageOutcome {
        dispatch!(self, v => v.act_stage_prepare(device, connection))
    }

    fn act_stage_config(&mut self, device: &DeviceIdentity, connection: &Connection) -> StageOutcome {
        dispatch!(self, v => v.act_stage_config(device, connection))
    }

    fn act_stage_ip_config(&mut self, device: &DeviceIdentity, connection: &Connection) -> StageOutcome {
        dispatch!(self, v => v.act_stage_ip_config(device, connection))
    }

    fn secrets_updated(
        &mut self,
        device: &DeviceIdentity,
        connection: &Connection,
        setting_name: &str,
    ) -> StageOutcome {
        dispatch!(self, v => v.secrets_updated(device, connection, setting_name))
    }

    fn link_changed(&mut self, connection: &Connection, up: bool) -> StageOutcome {
        dispatch!(self, v => v.link_changed(connection, up))
    }

    fn deadline(&self) -> Option<Instant> {
        dispatch!(self, v => v.deadline())
    }

    fn deadline_expired(&mut self, now: Instant) -> Option<StateReason> {
        dispatch!(self, v => v.deadline_expired(now))
    }

    fn deactivate(&mut self) {
        dispatch!(self, v => v.deactivate())
    }
}

/// Shared first step of every compatibility check.
pub(crate) fn check_type(
    setting_type: &'static str,
    connection: &Connection,
) -> Result<(), IncompatibilityReason> {
    if connection.connection_type() != setting_type {
        return Err(IncompatibilityReason::NotThisType(setting_type));
    }
    Ok(())
}
