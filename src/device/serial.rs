// Barcode Manager - Serial Devices
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Scanners attached to a serial line.

use tracing::warn;

use super::variant::{
    check_type, DeviceIdentity, DeviceVariant, IncompatibilityReason, StageOutcome,
};
use crate::models::connection::{SerialSetting, SETTING_SERIAL};
use crate::models::{Connection, DeviceType, SettingsError, StateReason};

/// Payload of a serial device.
#[derive(Debug, Default)]
pub struct SerialVariant {
    /// Line parameters applied by the last config stage.
    active: Option<SerialSetting>,
}

impl SerialVariant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_setting(&self) -> Option<&SerialSetting> {
        self.active.as_ref()
    }
}

impl DeviceVariant for SerialVariant {
    fn device_type(&self) -> DeviceType {
        DeviceType::Serial
    }

    fn setting_type(&self) -> &'static str {
        SETTING_SERIAL
    }

    fn check_connection_compatible(
        &self,
        _device: &DeviceIdentity,
        connection: &Connection,
    ) -> Result<(), IncompatibilityReason> {
        check_type(SETTING_SERIAL, connection)?;
        match connection.serial() {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(IncompatibilityReason::InvalidSettings(e)),
            None => Err(IncompatibilityReason::InvalidSettings(
                SettingsError::MissingSetting(SETTING_SERIAL.to_string()),
            )),
        }
    }

    fn act_stage_config(&mut self, device: &DeviceIdentity, connection: &Connection) -> StageOutcome {
        match connection.serial() {
            Some(Ok(setting)) => {
                self.active = Some(setting);
                StageOutcome::Success
            }
            _ => {
                warn!("({}): invalid serial setting", device.iface);
                StageOutcome::Failure(StateReason::ConfigFailed)
            }
        }
    }

    fn deactivate(&mut self) {
        self.active = None;
    }
}
