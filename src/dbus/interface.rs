// Barcode Manager - D-Bus Interfaces
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Objects exported on the system bus.
//!
//! The manager object forwards method calls to the event loop as
//! [`ManagerCommand`]s and answers property reads from a shared
//! [`ManagerStatus`] snapshot. Device and active-connection objects carry
//! their own snapshot, refreshed by the service whenever the manager
//! reports a change.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};
use zbus::fdo::DBusProxy;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::object_server::SignalContext;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};
use zbus::{interface, Connection};

use crate::activation::{ActivationRequest, ActiveId};
use crate::device::Device;
use crate::models::{Error, Result};
use crate::services::Caller;

/// Errors returned to bus callers.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.freedesktop.BarcodeManager.Error")]
pub enum ManagerError {
    #[zbus(error)]
    ZBus(zbus::Error),
    PermissionDenied(String),
    UnknownConnection(String),
    UnknownDevice(String),
    UnmanagedDevice(String),
    ConnectionInvalid(String),
    ConnectionNotActive(String),
    AlreadyAsleepOrAwake(String),
    AlreadyEnabledOrDisabled(String),
    InvalidService(String),
    InvalidArgs(String),
    Failed(String),
}

impl From<Error> for ManagerError {
    fn from(err: Error) -> Self {
        if err.is_authorization_error() {
            warn!("Refusing bus call: {}", err);
        } else if !err.is_already_in_state() {
            debug!("Replying with {}: {}", err.dbus_name(), err);
        }
        let message = err.to_string();
        match err {
            Error::PermissionDenied(_) => Self::PermissionDenied(message),
            Error::UnknownConnection(_) => Self::UnknownConnection(message),
            Error::UnknownDevice(_) => Self::UnknownDevice(message),
            Error::UnmanagedDevice(_) => Self::UnmanagedDevice(message),
            Error::ConnectionInvalid(_) => Self::ConnectionInvalid(message),
            Error::ConnectionNotActive(_) => Self::ConnectionNotActive(message),
            Error::AlreadyAsleepOrAwake(_) => Self::AlreadyAsleepOrAwake(message),
            Error::AlreadyEnabledOrDisabled(_) => Self::AlreadyEnabledOrDisabled(message),
            Error::InvalidService(_) => Self::InvalidService(message),
            Error::InvalidLoggingLevel(_) | Error::InvalidLoggingDomain(_) => {
                Self::InvalidArgs(message)
            }
            _ => Self::Failed(message),
        }
    }
}

/// Object path from a string we built ourselves.
pub fn owned_path(path: String) -> OwnedObjectPath {
    OwnedObjectPath::try_from(path)
        .unwrap_or_else(|_| ObjectPath::from_static_str_unchecked("/").into())
}

// ============================================================================
// Commands
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T>>;

/// Method calls forwarded to the event loop.
#[derive(Debug)]
pub enum ManagerCommand {
    GetDevices {
        reply: oneshot::Sender<Vec<String>>,
    },
    Enable {
        caller: Caller,
        enable: bool,
        reply: Reply<()>,
    },
    Sleep {
        caller: Caller,
        sleep: bool,
        reply: Reply<()>,
    },
    SetLogging {
        caller: Caller,
        level: String,
        domains: String,
        reply: Reply<()>,
    },
    ActivateConnection {
        caller: Caller,
        service_name: String,
        connection: String,
        device: String,
        specific_object: String,
        reply: Reply<ActiveId>,
    },
    DeactivateConnection {
        caller: Caller,
        active: String,
        reply: Reply<()>,
    },
}

// ============================================================================
// Snapshots
// ============================================================================

/// Manager properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerStatus {
    pub state: u32,
    pub networking_enabled: bool,
    pub active_connections: Vec<OwnedObjectPath>,
}

/// Device properties.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub udi: String,
    pub interface: String,
    pub driver: String,
    pub capabilities: u32,
    pub state: u32,
    pub device_type: u32,
    pub managed: bool,
    pub firmware_missing: bool,
}

impl DeviceStatus {
    pub fn from_device(device: &Device) -> Self {
        Self {
            udi: device.udi().to_string(),
            interface: device.iface().to_string(),
            driver: device.driver().to_string(),
            capabilities: device.capabilities().bits(),
            state: device.state().as_u32(),
            device_type: device.device_type().as_u32(),
            managed: device.managed(),
            firmware_missing: device.firmware_missing(),
        }
    }
}

/// Active connection properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveStatus {
    pub service_name: String,
    pub connection: OwnedObjectPath,
    pub specific_object: OwnedObjectPath,
    pub devices: Vec<OwnedObjectPath>,
    pub state: u32,
    pub default: bool,
    pub default6: bool,
}

impl ActiveStatus {
    pub fn from_request(request: &ActivationRequest) -> Self {
        Self {
            service_name: request.service_name().to_string(),
            connection: owned_path(request.connection_path().to_string()),
            specific_object: owned_path(request.specific_object().to_string()),
            devices: vec![owned_path(request.device().object_path())],
            state: request.state().as_u32(),
            default: request.is_default(),
            default6: request.is_default6(),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct ManagerInterface {
    command_tx: mpsc::Sender<ManagerCommand>,
    status: Arc<RwLock<ManagerStatus>>,
}

impl ManagerInterface {
    pub fn new(command_tx: mpsc::Sender<ManagerCommand>, status: Arc<RwLock<ManagerStatus>>) -> Self {
        Self { command_tx, status }
    }

    async fn call<T>(&self, command: ManagerCommand, reply: oneshot::Receiver<T>) -> std::result::Result<T, ManagerError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|e| ManagerError::Failed(format!("Failed to send command: {}", e)))?;
        reply
            .await
            .map_err(|_| ManagerError::Failed("The daemon is shutting down".to_string()))
    }

    /// Write `NetworkingEnabled` on behalf of `caller`.
    async fn set_networking(&self, caller: Caller, enable: bool) -> zbus::fdo::Result<()> {
        let (reply, rx) = oneshot::channel();
        let result = self
            .call(ManagerCommand::Enable { caller, enable, reply }, rx)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("{:?}", e)))?;
        match result {
            Ok(()) => {
                self.status.write().await.networking_enabled = enable;
                Ok(())
            }
            Err(Error::PermissionDenied(message)) => {
                warn!("Refusing NetworkingEnabled write: {}", message);
                Err(zbus::fdo::Error::AccessDenied(message))
            }
            Err(err) => Err(zbus::fdo::Error::Failed(err.to_string())),
        }
    }
}

/// Unix user behind the sender of a message.
async fn caller(conn: &Connection, header: &Header<'_>) -> std::result::Result<Caller, ManagerError> {
    let sender = header
        .sender()
        .ok_or_else(|| ManagerError::PermissionDenied("Message has no sender".to_string()))?;
    let dbus = DBusProxy::new(conn).await?;
    let uid = dbus
        .get_connection_unix_user(BusName::from(sender.to_owned()))
        .await
        .map_err(|e| ManagerError::PermissionDenied(format!("Could not identify caller: {}", e)))?;
    Ok(Caller { uid })
}

#[interface(name = "org.freedesktop.BarcodeManager")]
impl ManagerInterface {
    async fn get_devices(&self) -> std::result::Result<Vec<OwnedObjectPath>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        let paths = self.call(ManagerCommand::GetDevices { reply }, rx).await?;
        Ok(paths.into_iter().map(owned_path).collect())
    }

    async fn enable(
        &self,
        enable: bool,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> std::result::Result<(), ManagerError> {
        let caller = caller(conn, &header).await?;
        let (reply, rx) = oneshot::channel();
        self.call(ManagerCommand::Enable { caller, enable, reply }, rx)
            .await?
            .map_err(ManagerError::from)
    }

    async fn sleep(
        &self,
        sleep: bool,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> std::result::Result<(), ManagerError> {
        let caller = caller(conn, &header).await?;
        let (reply, rx) = oneshot::channel();
        self.call(ManagerCommand::Sleep { caller, sleep, reply }, rx)
            .await?
            .map_err(ManagerError::from)
    }

    async fn set_logging(
        &self,
        level: String,
        domains: String,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> std::result::Result<(), ManagerError> {
        let caller = caller(conn, &header).await?;
        let (reply, rx) = oneshot::channel();
        let command = ManagerCommand::SetLogging {
            caller,
            level,
            domains,
            reply,
        };
        self.call(command, rx).await?.map_err(ManagerError::from)
    }

    async fn activate_connection(
        &self,
        service_name: String,
        connection: ObjectPath<'_>,
        device: ObjectPath<'_>,
        specific_object: ObjectPath<'_>,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> std::result::Result<OwnedObjectPath, ManagerError> {
        let caller = caller(conn, &header).await?;
        let (reply, rx) = oneshot::channel();
        let command = ManagerCommand::ActivateConnection {
            caller,
            service_name,
            connection: connection.to_string(),
            device: device.to_string(),
            specific_object: specific_object.to_string(),
            reply,
        };
        let active = self.call(command, rx).await??;
        Ok(owned_path(active.object_path()))
    }

    async fn deactivate_connection(
        &self,
        active_connection: ObjectPath<'_>,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> std::result::Result<(), ManagerError> {
        let caller = caller(conn, &header).await?;
        let (reply, rx) = oneshot::channel();
        let command = ManagerCommand::DeactivateConnection {
            caller,
            active: active_connection.to_string(),
            reply,
        };
        self.call(command, rx).await?.map_err(ManagerError::from)
    }

    #[zbus(property)]
    async fn state(&self) -> u32 {
        self.status.read().await.state
    }

    #[zbus(property)]
    async fn networking_enabled(&self) -> bool {
        self.status.read().await.networking_enabled
    }

    #[zbus(property)]
    async fn set_networking_enabled(
        &self,
        enabled: bool,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Option<Header<'_>>,
    ) -> zbus::fdo::Result<()> {
        let caller = match header {
            Some(header) => caller(conn, &header).await,
            None => Err(ManagerError::PermissionDenied("Message has no sender".to_string())),
        }
        .map_err(|e| zbus::fdo::Error::AccessDenied(format!("{:?}", e)))?;
        self.set_networking(caller, enabled).await
    }

    #[zbus(property)]
    async fn active_connections(&self) -> Vec<OwnedObjectPath> {
        self.status.read().await.active_connections.clone()
    }

    #[zbus(signal, name = "DeviceAdded")]
    pub async fn device_added(ctxt: &SignalContext<'_>, device: ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal, name = "DeviceRemoved")]
    pub async fn device_removed(ctxt: &SignalContext<'_>, device: ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal, name = "StateChanged")]
    pub async fn manager_state_changed(ctxt: &SignalContext<'_>, state: u32) -> zbus::Result<()>;

    #[zbus(signal, name = "PropertiesChanged")]
    pub async fn manager_properties_changed(
        ctxt: &SignalContext<'_>,
        properties: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;
}

// ============================================================================
// Device
// ============================================================================

pub struct DeviceInterface {
    status: DeviceStatus,
}

impl DeviceInterface {
    pub fn new(status: DeviceStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
    }
}

#[interface(name = "org.freedesktop.BarcodeManager.Device")]
impl DeviceInterface {
    #[zbus(property)]
    fn udi(&self) -> &str {
        &self.status.udi
    }

    #[zbus(property, name = "Interface")]
    fn iface(&self) -> &str {
        &self.status.interface
    }

    #[zbus(property)]
    fn driver(&self) -> &str {
        &self.status.driver
    }

    #[zbus(property)]
    fn capabilities(&self) -> u32 {
        self.status.capabilities
    }

    #[zbus(property)]
    fn state(&self) -> u32 {
        self.status.state
    }

    #[zbus(property)]
    fn device_type(&self) -> u32 {
        self.status.device_type
    }

    #[zbus(property)]
    fn managed(&self) -> bool {
        self.status.managed
    }

    #[zbus(property)]
    fn firmware_missing(&self) -> bool {
        self.status.firmware_missing
    }

    #[zbus(signal, name = "StateChanged")]
    pub async fn device_state_changed(
        ctxt: &SignalContext<'_>,
        new_state: u32,
        old_state: u32,
        reason: u32,
    ) -> zbus::Result<()>;
}

// ============================================================================
// Active connection
// ============================================================================

pub struct ActiveConnectionInterface {
    status: ActiveStatus,
}

impl ActiveConnectionInterface {
    pub fn new(status: ActiveStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> &ActiveStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: ActiveStatus) {
        self.status = status;
    }
}

#[interface(name = "org.freedesktop.BarcodeManager.Connection.Active")]
impl ActiveConnectionInterface {
    #[zbus(property)]
    fn service_name(&self) -> &str {
        &self.status.service_name
    }

    #[zbus(property)]
    fn connection(&self) -> OwnedObjectPath {
        self.status.connection.clone()
    }

    #[zbus(property)]
    fn specific_object(&self) -> OwnedObjectPath {
        self.status.specific_object.clone()
    }

    #[zbus(property)]
    fn devices(&self) -> Vec<OwnedObjectPath> {
        self.status.devices.clone()
    }

    #[zbus(property)]
    fn state(&self) -> u32 {
        self.status.state
    }

    #[zbus(property)]
    fn default(&self) -> bool {
        self.status.default
    }

    #[zbus(property)]
    fn default6(&self) -> bool {
        self.status.default6
    }

    #[zbus(property)]
    fn vpn(&self) -> bool {
        false
    }
}
