// Barcode Manager - Connection Data Model
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Connections as delivered by the settings services.
//!
//! A Connection is a named bag of settings. Each setting is a map of
//! primitive values keyed by property name. The `connection` setting is
//! always present and names, in its `type` property, the setting that
//! describes the hardware side of the connection:
//! - `bluetooth`: peer address and profile (`dun` or `panu`)
//! - `serial`: line parameters
//! - `hidraw`: optional interface name to bind to

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use super::validation::{format_bdaddr, validate_uuid};

pub const SETTING_CONNECTION: &str = "connection";
pub const SETTING_BLUETOOTH: &str = "bluetooth";
pub const SETTING_SERIAL: &str = "serial";
pub const SETTING_HIDRAW: &str = "hidraw";

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Str(String),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            Self::U64(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for SettingValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u32> for SettingValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<Vec<u8>> for SettingValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Properties of one setting.
pub type SettingMap = BTreeMap<String, SettingValue>;

/// All settings of a connection, keyed by setting name.
pub type SettingsHash = BTreeMap<String, SettingMap>;

/// Which settings service a connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionScope {
    System,
    User,
}

impl ConnectionScope {
    /// Well-known bus name of the settings service for this scope.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::System => super::SYSTEM_SETTINGS_SERVICE,
            Self::User => super::USER_SETTINGS_SERVICE,
        }
    }

    pub fn from_service_name(name: &str) -> Option<Self> {
        match name {
            super::SYSTEM_SETTINGS_SERVICE => Some(Self::System),
            super::USER_SETTINGS_SERVICE => Some(Self::User),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User => f.write_str("user"),
        }
    }
}

/// Errors raised while building or verifying settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("missing setting '{0}'")]
    MissingSetting(String),

    #[error("{setting}.{property}: missing")]
    MissingProperty { setting: String, property: String },

    #[error("{setting}.{property}: {reason}")]
    InvalidProperty {
        setting: String,
        property: String,
        reason: String,
    },

    #[error("no secrets were received")]
    NoSecrets,

    #[error("no valid secrets for setting '{0}'")]
    InvalidSecrets(String),
}

impl SettingsError {
    fn missing(setting: &str, property: &str) -> Self {
        Self::MissingProperty {
            setting: setting.to_string(),
            property: property.to_string(),
        }
    }

    fn invalid(setting: &str, property: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProperty {
            setting: setting.to_string(),
            property: property.to_string(),
            reason: reason.into(),
        }
    }
}

/// Bluetooth profile requested by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtType {
    /// Dial-up networking over RFCOMM.
    Dun,
    /// Personal area networking user role.
    Panu,
}

impl BtType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dun" => Some(Self::Dun),
            "panu" => Some(Self::Panu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dun => "dun",
            Self::Panu => "panu",
        }
    }
}

/// Typed view of the `connection` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSetting {
    pub id: String,
    pub uuid: String,
    pub connection_type: String,
    pub autoconnect: bool,
    pub timestamp: u64,
    pub read_only: bool,
}

impl ConnectionSetting {
    pub fn from_map(map: &SettingMap) -> Result<Self, SettingsError> {
        let s = SETTING_CONNECTION;
        let id = map
            .get("id")
            .and_then(SettingValue::as_str)
            .ok_or_else(|| SettingsError::missing(s, "id"))?;
        if id.is_empty() {
            return Err(SettingsError::invalid(s, "id", "must not be empty"));
        }
        let uuid = map
            .get("uuid")
            .and_then(SettingValue::as_str)
            .ok_or_else(|| SettingsError::missing(s, "uuid"))?;
        if !validate_uuid(uuid) {
            return Err(SettingsError::invalid(s, "uuid", format!("'{}' is not a UUID", uuid)));
        }
        let connection_type = map
            .get("type")
            .and_then(SettingValue::as_str)
            .ok_or_else(|| SettingsError::missing(s, "type"))?;
        if connection_type.is_empty() {
            return Err(SettingsError::invalid(s, "type", "must not be empty"));
        }

        Ok(Self {
            id: id.to_string(),
            uuid: uuid.to_string(),
            connection_type: connection_type.to_string(),
            autoconnect: map.get("autoconnect").and_then(SettingValue::as_bool).unwrap_or(true),
            timestamp: map.get("timestamp").and_then(SettingValue::as_u64).unwrap_or(0),
            read_only: map.get("read-only").and_then(SettingValue::as_bool).unwrap_or(false),
        })
    }
}

/// Typed view of the `bluetooth` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothSetting {
    /// Canonical `AA:BB:CC:DD:EE:FF` form of the peer address.
    pub bdaddr: String,
    pub bt_type: BtType,
    pub pin: Option<String>,
}

impl BluetoothSetting {
    pub const SECRETS: &'static [&'static str] = &["pin"];

    pub fn from_map(map: &SettingMap) -> Result<Self, SettingsError> {
        let s = SETTING_BLUETOOTH;
        let raw = map
            .get("bdaddr")
            .and_then(SettingValue::as_bytes)
            .ok_or_else(|| SettingsError::missing(s, "bdaddr"))?;
        let bdaddr = format_bdaddr(raw)
            .ok_or_else(|| SettingsError::invalid(s, "bdaddr", "must be 6 bytes"))?;
        let type_str = map
            .get("type")
            .and_then(SettingValue::as_str)
            .ok_or_else(|| SettingsError::missing(s, "type"))?;
        let bt_type = BtType::parse(type_str)
            .ok_or_else(|| SettingsError::invalid(s, "type", format!("unknown type '{}'", type_str)))?;

        Ok(Self {
            bdaddr,
            bt_type,
            pin: map.get("pin").and_then(SettingValue::as_str).map(String::from),
        })
    }
}

/// Parity of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Typed view of the `serial` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSetting {
    pub baud: u32,
    pub bits: u32,
    pub parity: Parity,
    pub stopbits: u32,
    pub send_delay: u64,
}

impl SerialSetting {
    pub fn from_map(map: &SettingMap) -> Result<Self, SettingsError> {
        let s = SETTING_SERIAL;
        let baud = map.get("baud").and_then(SettingValue::as_u32).unwrap_or(57600);
        if baud == 0 {
            return Err(SettingsError::invalid(s, "baud", "must be positive"));
        }
        let bits = map.get("bits").and_then(SettingValue::as_u32).unwrap_or(8);
        if !(5..=8).contains(&bits) {
            return Err(SettingsError::invalid(s, "bits", format!("{} out of range 5-8", bits)));
        }
        let parity = match map.get("parity").and_then(SettingValue::as_str).unwrap_or("n") {
            "n" => Parity::None,
            "E" => Parity::Even,
            "o" => Parity::Odd,
            other => {
                return Err(SettingsError::invalid(s, "parity", format!("unknown parity '{}'", other)))
            }
        };
        let stopbits = map.get("stopbits").and_then(SettingValue::as_u32).unwrap_or(1);
        if !(1..=2).contains(&stopbits) {
            return Err(SettingsError::invalid(s, "stopbits", format!("{} out of range 1-2", stopbits)));
        }

        Ok(Self {
            baud,
            bits,
            parity,
            stopbits,
            send_delay: map.get("send-delay").and_then(SettingValue::as_u64).unwrap_or(0),
        })
    }
}

/// Validate a single setting by name. Unknown setting names are accepted
/// as opaque bags.
pub fn verify_setting(name: &str, map: &SettingMap) -> Result<(), SettingsError> {
    match name {
        SETTING_CONNECTION => ConnectionSetting::from_map(map).map(|_| ()),
        SETTING_BLUETOOTH => BluetoothSetting::from_map(map).map(|_| ()),
        SETTING_SERIAL => SerialSetting::from_map(map).map(|_| ()),
        _ => Ok(()),
    }
}

fn secret_keys(setting: &str) -> &'static [&'static str] {
    match setting {
        SETTING_BLUETOOTH => BluetoothSetting::SECRETS,
        _ => &[],
    }
}

/// A verified connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    scope: ConnectionScope,
    settings: SettingsHash,
    base: ConnectionSetting,
}

impl Connection {
    /// Build a connection from a settings hash, verifying every setting and
    /// that `connection.type` names a setting that is present.
    pub fn new(scope: ConnectionScope, settings: SettingsHash) -> Result<Self, SettingsError> {
        let base = Self::verify(&settings)?;
        Ok(Self {
            scope,
            settings,
            base,
        })
    }

    fn verify(settings: &SettingsHash) -> Result<ConnectionSetting, SettingsError> {
        let map = settings
            .get(SETTING_CONNECTION)
            .ok_or_else(|| SettingsError::MissingSetting(SETTING_CONNECTION.to_string()))?;
        let base = ConnectionSetting::from_map(map)?;
        if !settings.contains_key(&base.connection_type) {
            return Err(SettingsError::MissingSetting(base.connection_type.clone()));
        }
        for (name, map) in settings {
            verify_setting(name, map)?;
        }
        Ok(base)
    }

    pub fn scope(&self) -> ConnectionScope {
        self.scope
    }

    pub fn id(&self) -> &str {
        &self.base.id
    }

    pub fn uuid(&self) -> &str {
        &self.base.uuid
    }

    pub fn connection_type(&self) -> &str {
        &self.base.connection_type
    }

    pub fn autoconnect(&self) -> bool {
        self.base.autoconnect
    }

    pub fn timestamp(&self) -> u64 {
        self.base.timestamp
    }

    pub fn read_only(&self) -> bool {
        self.base.read_only
    }

    pub fn setting(&self, name: &str) -> Option<&SettingMap> {
        self.settings.get(name)
    }

    pub fn settings(&self) -> &SettingsHash {
        &self.settings
    }

    pub fn bluetooth(&self) -> Option<Result<BluetoothSetting, SettingsError>> {
        self.setting(SETTING_BLUETOOTH).map(BluetoothSetting::from_map)
    }

    pub fn serial(&self) -> Option<Result<SerialSetting, SettingsError>> {
        self.setting(SETTING_SERIAL).map(SerialSetting::from_map)
    }

    /// Replace every setting with a new hash. The connection is left
    /// untouched if the new hash does not verify.
    pub fn replace_settings(&mut self, settings: SettingsHash) -> Result<(), SettingsError> {
        self.base = Self::verify(&settings)?;
        self.settings = settings;
        Ok(())
    }

    /// Merge secrets returned by a settings service into `setting_name`.
    ///
    /// If the returned map forms a valid setting on its own it replaces the
    /// held one; otherwise only the known secret properties are copied over.
    pub fn merge_secrets(&mut self, setting_name: &str, secrets: &SettingsHash) -> Result<(), SettingsError> {
        if secrets.is_empty() {
            return Err(SettingsError::NoSecrets);
        }
        let returned = secrets
            .get(setting_name)
            .ok_or_else(|| SettingsError::InvalidSecrets(setting_name.to_string()))?;

        let mut candidate = self.settings.clone();
        if verify_setting(setting_name, returned).is_ok() && !returned.is_empty() {
            candidate.insert(setting_name.to_string(), returned.clone());
        } else {
            let keys = secret_keys(setting_name);
            let target = candidate.entry(setting_name.to_string()).or_default();
            let mut updated = false;
            for (key, value) in returned {
                if keys.contains(&key.as_str()) {
                    target.insert(key.clone(), value.clone());
                    updated = true;
                }
            }
            if !updated {
                return Err(SettingsError::InvalidSecrets(setting_name.to_string()));
            }
        }

        self.replace_settings(candidate)
    }

    /// Record the last time this connection was successfully activated.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        if let Some(map) = self.settings.get_mut(SETTING_CONNECTION) {
            map.insert("timestamp".to_string(), SettingValue::U64(timestamp));
        }
        self.base.timestamp = timestamp;
    }
}
