// Barcode Manager - Bluetooth Devices
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Bluetooth scanners reached over DUN or PAN.
//!
//! Activation asks bluez for a link during the config stage and waits for
//! it under a connect timeout. DUN connections without a stored PIN stop
//! in `NeedAuth` once the link is up.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::variant::{
    check_type, DeviceIdentity, DeviceVariant, IncompatibilityReason, LinkRequest, SecretsNeeded,
    StageOutcome,
};
use crate::models::connection::SETTING_BLUETOOTH;
use crate::models::validation::canonical_bdaddr;
use crate::models::{BtType, Connection, DeviceType, StateReason};

/// Bluetooth profiles the remote device offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BtCapabilities(u32);

impl BtCapabilities {
    pub const NONE: BtCapabilities = BtCapabilities(0);
    pub const DUN: BtCapabilities = BtCapabilities(0x1);
    pub const NAP: BtCapabilities = BtCapabilities(0x2);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: BtCapabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Capability a connection of the given type needs.
    pub fn required_for(bt_type: BtType) -> Self {
        match bt_type {
            BtType::Dun => Self::DUN,
            BtType::Panu => Self::NAP,
        }
    }
}

impl std::ops::BitOr for BtCapabilities {
    type Output = BtCapabilities;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting { deadline: Instant, bt_type: BtType },
    Up { bt_type: BtType },
}

/// Payload of a bluetooth device.
#[derive(Debug)]
pub struct BluetoothVariant {
    bdaddr: String,
    name: String,
    capabilities: BtCapabilities,
    connect_timeout: Duration,
    link: LinkState,
}

impl BluetoothVariant {
    /// Returns `None` when `bdaddr` is not a valid address.
    pub fn new(
        bdaddr: &str,
        name: impl Into<String>,
        capabilities: BtCapabilities,
        connect_timeout: Duration,
    ) -> Option<Self> {
        Some(Self {
            bdaddr: canonical_bdaddr(bdaddr)?,
            name: name.into(),
            capabilities,
            connect_timeout,
            link: LinkState::Idle,
        })
    }

    /// Canonical upper-case address.
    pub fn bdaddr(&self) -> &str {
        &self.bdaddr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bt_capabilities(&self) -> BtCapabilities {
        self.capabilities
    }

    fn link_bt_type(&self) -> Option<BtType> {
        match self.link {
            LinkState::Idle => None,
            LinkState::Connecting { bt_type, .. } | LinkState::Up { bt_type } => Some(bt_type),
        }
    }

    /// Step taken once the link is up.
    fn after_link_up(&self, connection: &Connection, bt_type: BtType) -> StageOutcome {
        if bt_type == BtType::Panu {
            return StageOutcome::Success;
        }
        let has_pin = matches!(
            connection.bluetooth(),
            Some(Ok(ref s)) if s.pin.as_deref().is_some_and(|p| !p.is_empty())
        );
        if has_pin {
            StageOutcome::Success
        } else {
            StageOutcome::NeedSecrets(SecretsNeeded {
                setting_name: SETTING_BLUETOOTH.to_string(),
                hints: vec!["pin".to_string()],
                request_new: false,
            })
        }
    }
}

impl DeviceVariant for BluetoothVariant {
    fn device_type(&self) -> DeviceType {
        DeviceType::Bluetooth
    }

    fn setting_type(&self) -> &'static str {
        SETTING_BLUETOOTH
    }

    fn check_connection_compatible(
        &self,
        _device: &DeviceIdentity,
        connection: &Connection,
    ) -> Result<(), IncompatibilityReason> {
        check_type(SETTING_BLUETOOTH, connection)?;

        let setting = match connection.bluetooth() {
            Some(Ok(setting)) => setting,
            Some(Err(e)) => return Err(IncompatibilityReason::InvalidSettings(e)),
            None => {
                return Err(IncompatibilityReason::InvalidSettings(
                    crate::models::SettingsError::MissingSetting(SETTING_BLUETOOTH.to_string()),
                ))
            }
        };

        if !self
            .capabilities
            .contains(BtCapabilities::required_for(setting.bt_type))
        {
            return Err(IncompatibilityReason::CapabilityMismatch);
        }

        // Both sides are already canonical upper-case colon-hex.
        if setting.bdaddr != self.bdaddr {
            return Err(IncompatibilityReason::AddressMismatch);
        }

        Ok(())
    }

    fn act_stage_config(&mut self, device: &DeviceIdentity, connection: &Connection) -> StageOutcome {
        let setting = match connection.bluetooth() {
            Some(Ok(setting)) => setting,
            _ => {
                warn!("({}): connection has no valid bluetooth setting", device.iface);
                return StageOutcome::Failure(StateReason::ConfigFailed);
            }
        };

        let deadline = Instant::now() + self.connect_timeout;
        self.link = LinkState::Connecting {
            deadline,
            bt_type: setting.bt_type,
        };
        info!(
            "({}): requesting {} link to {}",
            device.iface,
            setting.bt_type.as_str(),
            self.bdaddr
        );

        StageOutcome::WaitForLink(LinkRequest {
            bdaddr: self.bdaddr.clone(),
            bt_type: setting.bt_type,
        })
    }

    fn link_changed(&mut self, connection: &Connection, up: bool) -> StageOutcome {
        match (self.link, up) {
            (LinkState::Connecting { bt_type, .. }, true) => {
                debug!("({}): bluetooth link is up", self.bdaddr);
                self.link = LinkState::Up { bt_type };
                self.after_link_up(connection, bt_type)
            }
            (LinkState::Connecting { .. }, false) => {
                self.link = LinkState::Idle;
                StageOutcome::Failure(StateReason::LinkFailed)
            }
            (LinkState::Up { .. }, false) => {
                self.link = LinkState::Idle;
                StageOutcome::Failure(StateReason::Carrier)
            }
            _ => StageOutcome::Postpone,
        }
    }

    fn secrets_updated(
        &mut self,
        _device: &DeviceIdentity,
        connection: &Connection,
        setting_name: &str,
    ) -> StageOutcome {
        if setting_name != SETTING_BLUETOOTH {
            return StageOutcome::Failure(StateReason::NoSecrets);
        }
        match self.link_bt_type() {
            Some(bt_type) => match self.after_link_up(connection, bt_type) {
                // Still no usable PIN after the merge.
                StageOutcome::NeedSecrets(_) => StageOutcome::Failure(StateReason::NoSecrets),
                outcome => outcome,
            },
            None => StageOutcome::Failure(StateReason::LinkFailed),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.link {
            LinkState::Connecting { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    fn deadline_expired(&mut self, now: Instant) -> Option<StateReason> {
        match self.link {
            LinkState::Connecting { deadline, .. } if now >= deadline => {
                warn!("({}): bluetooth connect timed out", self.bdaddr);
                self.link = LinkState::Idle;
                Some(StateReason::LinkFailed)
            }
            _ => None,
        }
    }

    fn deactivate(&mut self) {
        self.link = LinkState::Idle;
    }
}
