// Barcode Manager - Bluez Client
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Paired bluetooth scanners and their links, via bluez.
//!
//! Discovery walks bluez's object manager for paired devices offering DUN
//! or NAP. Link requests from devices turn into `ConnectProfile` calls; the
//! outcome and any later loss of the link come back as [`BluezEvent::Link`].

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use zbus::fdo::ObjectManagerProxy;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{proxy, Connection};

use super::settings::setting_value;
use crate::device::{BluetoothVariant, BtCapabilities, Device, DeviceIdentity, LinkRequest, VariantKind};
use crate::models::{BtType, SettingValue};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

pub const DUN_UUID: &str = "00001103-0000-1000-8000-00805f9b34fb";
pub const NAP_UUID: &str = "00001116-0000-1000-8000-00805f9b34fb";

/// Upper bound on one `ConnectProfile` call.
const CONNECT_CALL_TIMEOUT: Duration = Duration::from_secs(20);

#[proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
pub trait Device1 {
    fn connect_profile(&self, uuid: &str) -> zbus::Result<()>;

    fn disconnect(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn connected(&self) -> zbus::Result<bool>;
}

/// Something bluez told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluezEvent {
    DeviceFound(BluezDevice),
    DeviceGone { path: String },
    Link { path: String, up: bool },
}

/// A paired remote device that offers a usable profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluezDevice {
    pub path: String,
    pub address: String,
    pub name: String,
    pub capabilities: BtCapabilities,
}

impl BluezDevice {
    /// Read `org.bluez.Device1` properties. `None` for unpaired devices and
    /// devices without DUN or NAP.
    pub fn from_properties(path: &str, props: &HashMap<String, OwnedValue>) -> Option<Self> {
        let get = |key: &str| props.get(key).and_then(|v| setting_value(v));

        if get("Paired").and_then(|v| v.as_bool()) != Some(true) {
            return None;
        }
        let address = get("Address")?.as_str()?.to_string();
        let name = get("Alias")
            .or_else(|| get("Name"))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| address.clone());

        let mut capabilities = BtCapabilities::NONE;
        if let Some(SettingValue::StrList(uuids)) = get("UUIDs") {
            for uuid in uuids {
                if uuid.eq_ignore_ascii_case(DUN_UUID) {
                    capabilities = capabilities | BtCapabilities::DUN;
                } else if uuid.eq_ignore_ascii_case(NAP_UUID) {
                    capabilities = capabilities | BtCapabilities::NAP;
                }
            }
        }
        if capabilities == BtCapabilities::NONE {
            debug!("Bluetooth device {} offers neither DUN nor NAP", address);
            return None;
        }

        Some(Self {
            path: path.to_string(),
            address,
            name,
            capabilities,
        })
    }

    /// Build the managed device. The bluez object path is its UDI and the
    /// address its interface name.
    pub fn into_device(self, connect_timeout: Duration) -> Option<Device> {
        let variant =
            BluetoothVariant::new(&self.address, self.name, self.capabilities, connect_timeout)?;
        Device::new(
            DeviceIdentity {
                udi: self.path,
                iface: variant.bdaddr().to_string(),
                driver: "bluez".to_string(),
                ifindex: None,
            },
            VariantKind::Bluetooth(variant),
        )
    }
}

pub fn profile_uuid(bt_type: BtType) -> &'static str {
    match bt_type {
        BtType::Dun => DUN_UUID,
        BtType::Panu => NAP_UUID,
    }
}

/// Talks to bluez on behalf of the event loop.
pub struct BluezClient {
    conn: Connection,
    tx: mpsc::UnboundedSender<BluezEvent>,
    links: HashMap<String, AbortHandle>,
}

impl BluezClient {
    pub fn new(conn: Connection, tx: mpsc::UnboundedSender<BluezEvent>) -> Self {
        Self {
            conn,
            tx,
            links: HashMap::new(),
        }
    }

    /// Announce the paired devices present now and follow later changes.
    pub fn spawn_discovery(&self) -> JoinHandle<()> {
        let conn = self.conn.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = discover(&conn, &tx).await {
                warn!("Bluetooth discovery stopped: {}", e);
            }
        })
    }

    /// Bring the link up for the device at `path` and keep watching it.
    pub fn connect(&mut self, path: &str, request: &LinkRequest) {
        self.stop_watching(path);

        let conn = self.conn.clone();
        let tx = self.tx.clone();
        let path_owned = path.to_string();
        let uuid = profile_uuid(request.bt_type);
        info!("Connecting {} profile on {}", request.bt_type.as_str(), request.bdaddr);

        let task = tokio::spawn(async move {
            if let Err(e) = run_link(&conn, &path_owned, uuid, &tx).await {
                warn!("Error connecting with bluez: {}", e);
                send(&tx, BluezEvent::Link {
                    path: path_owned,
                    up: false,
                });
            }
        });
        self.links.insert(path.to_string(), task.abort_handle());
    }

    /// Stop watching the link and ask bluez to drop it.
    pub fn disconnect(&mut self, path: &str) {
        if !self.stop_watching(path) {
            return;
        }
        let conn = self.conn.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            if let Err(e) = drop_link(&conn, &path).await {
                debug!("Bluez disconnect of {} failed: {}", path, e);
            }
        });
    }

    fn stop_watching(&mut self, path: &str) -> bool {
        match self.links.remove(path) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

async fn run_link(
    conn: &Connection,
    path: &str,
    uuid: &str,
    tx: &mpsc::UnboundedSender<BluezEvent>,
) -> zbus::Result<()> {
    let proxy = Device1Proxy::builder(conn).path(path)?.build().await?;
    let mut changes = proxy.receive_connected_changed().await;

    tokio::time::timeout(CONNECT_CALL_TIMEOUT, proxy.connect_profile(uuid))
        .await
        .map_err(|_| zbus::Error::Failure("ConnectProfile timed out".to_string()))??;
    debug!("({}): connect request successful", path);
    send(tx, BluezEvent::Link {
        path: path.to_string(),
        up: true,
    });

    while let Some(change) = changes.next().await {
        if !change.get().await? {
            info!("({}): bluetooth link disconnected", path);
            send(tx, BluezEvent::Link {
                path: path.to_string(),
                up: false,
            });
            break;
        }
    }
    Ok(())
}

/// Hand an event to the event loop, which may already have stopped.
fn send(tx: &mpsc::UnboundedSender<BluezEvent>, event: BluezEvent) {
    if let Err(e) = tx.send(event) {
        debug!("Dropping bluez event {:?}: event loop is gone", e.0);
    }
}

async fn drop_link(conn: &Connection, path: &str) -> zbus::Result<()> {
    let proxy = Device1Proxy::builder(conn).path(path)?.build().await?;
    proxy.disconnect().await
}

async fn discover(conn: &Connection, tx: &mpsc::UnboundedSender<BluezEvent>) -> zbus::Result<()> {
    let manager = ObjectManagerProxy::builder(conn)
        .destination(BLUEZ_SERVICE)?
        .path("/")?
        .build()
        .await?;
    let mut added = manager.receive_interfaces_added().await?;
    let mut removed = manager.receive_interfaces_removed().await?;

    for (path, interfaces) in manager.get_managed_objects().await? {
        let props = interfaces
            .iter()
            .find(|(name, _)| name.as_str() == DEVICE_INTERFACE)
            .map(|(_, props)| props);
        if let Some(device) = props.and_then(|p| BluezDevice::from_properties(path.as_str(), p)) {
            send(tx, BluezEvent::DeviceFound(device));
        }
    }

    loop {
        tokio::select! {
            Some(signal) = added.next() => {
                let args = signal.args()?;
                let props = args
                    .interfaces_and_properties()
                    .iter()
                    .find(|(name, _)| name.to_string() == DEVICE_INTERFACE)
                    .map(|(_, props)| owned_properties(props));
                let path = args.object_path().as_str();
                if let Some(device) = props.and_then(|p| BluezDevice::from_properties(path, &p)) {
                    send(tx, BluezEvent::DeviceFound(device));
                }
            }
            Some(signal) = removed.next() => {
                let args = signal.args()?;
                if args.interfaces().iter().any(|name| name.to_string() == DEVICE_INTERFACE) {
                    send(tx, BluezEvent::DeviceGone {
                        path: args.object_path().as_str().to_string(),
                    });
                }
            }
            else => return Ok(()),
        }
    }
}

fn owned_properties(props: &HashMap<&str, Value<'_>>) -> HashMap<String, OwnedValue> {
    props
        .iter()
        .filter_map(|(key, value)| Some((key.to_string(), value.try_to_owned().ok()?)))
        .collect()
}
