// Barcode Manager - HID Raw Devices
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! USB scanners exposed through the kernel `hidraw` subsystem.

use std::path::PathBuf;

use super::variant::{check_type, DeviceIdentity, DeviceVariant, IncompatibilityReason};
use crate::models::connection::SETTING_HIDRAW;
use crate::models::{Connection, DeviceType, SettingValue};

/// Payload of a hidraw device.
#[derive(Debug)]
pub struct HidrawVariant {
    /// Character device node, e.g. `/dev/hidraw0`.
    dev_node: PathBuf,
}

impl HidrawVariant {
    pub fn new(dev_node: impl Into<PathBuf>) -> Self {
        Self {
            dev_node: dev_node.into(),
        }
    }

    pub fn dev_node(&self) -> &std::path::Path {
        &self.dev_node
    }
}

impl DeviceVariant for HidrawVariant {
    fn device_type(&self) -> DeviceType {
        DeviceType::Hidraw
    }

    fn setting_type(&self) -> &'static str {
        SETTING_HIDRAW
    }

    fn check_connection_compatible(
        &self,
        device: &DeviceIdentity,
        connection: &Connection,
    ) -> Result<(), IncompatibilityReason> {
        check_type(SETTING_HIDRAW, connection)?;

        // An unbound hidraw connection fits any scanner.
        let bound = connection
            .setting(SETTING_HIDRAW)
            .and_then(|s| s.get("interface-name"))
            .and_then(SettingValue::as_str);
        match bound {
            Some(name) if name != device.iface => Err(IncompatibilityReason::AddressMismatch),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::connection::{SettingMap, SettingsHash, SETTING_CONNECTION};
    use crate::models::ConnectionScope;

    fn hidraw_connection(bound: Option<&str>) -> Connection {
        let mut hash = SettingsHash::new();
        let mut con = SettingMap::new();
        con.insert("id".into(), "usb scanner".into());
        con.insert("uuid".into(), uuid::Uuid::new_v4().to_string().into());
        con.insert("type".into(), SETTING_HIDRAW.into());
        hash.insert(SETTING_CONNECTION.into(), con);
        let mut hid = SettingMap::new();
        if let Some(name) = bound {
            hid.insert("interface-name".into(), name.into());
        }
        hash.insert(SETTING_HIDRAW.into(), hid);
        Connection::new(ConnectionScope::System, hash).expect("valid hidraw connection")
    }

    fn ident() -> DeviceIdentity {
        DeviceIdentity {
            udi: "/sys/devices/pci0000:00/usb1/1-1/hidraw/hidraw0".into(),
            iface: "hidraw0".into(),
            driver: "usbhid".into(),
            ifindex: Some(0),
        }
    }

    #[test]
    fn test_unbound_connection_matches() {
        let v = HidrawVariant::new("/dev/hidraw0");
        assert_eq!(v.check_connection_compatible(&ident(), &hidraw_connection(None)), Ok(()));
    }

    #[test]
    fn test_bound_connection_checks_iface() {
        let v = HidrawVariant::new("/dev/hidraw0");
        assert_eq!(
            v.check_connection_compatible(&ident(), &hidraw_connection(Some("hidraw0"))),
            Ok(())
        );
        assert_eq!(
            v.check_connection_compatible(&ident(), &hidraw_connection(Some("hidraw3"))),
            Err(IncompatibilityReason::AddressMismatch)
        );
    }

    #[test]
    fn test_bluetooth_connection_is_not_this_type() {
        let v = HidrawVariant::new("/dev/hidraw0");
        let conn = crate::models::connection::tests::bt_connection("bt", [1; 6], "dun", true);
        assert_eq!(
            v.check_connection_compatible(&ident(), &conn),
            Err(IncompatibilityReason::NotThisType(SETTING_HIDRAW))
        );
    }
}
