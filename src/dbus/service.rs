// Barcode Manager - D-Bus Service
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Publishes the manager on the system bus.
//!
//! [`DbusService::sync`] mirrors one [`ManagerEvent`] onto the bus:
//! objects are exported and removed as devices and requests come and go,
//! snapshots are refreshed, and the matching signals are emitted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use zbus::object_server::{InterfaceRef, SignalContext};
use zbus::zvariant::{ObjectPath, Value};
use zbus::{connection::Builder, Connection, Result};

use super::interface::{
    owned_path, ActiveConnectionInterface, ActiveStatus, DeviceInterface, DeviceStatus,
    ManagerCommand, ManagerInterface, ManagerStatus,
};
use crate::activation::ActiveId;
use crate::device::DeviceId;
use crate::manager::{Manager, ManagerEvent};
use crate::models::{DeviceState, StateReason, DBUS_OBJECT_PATH, DBUS_SERVICE_NAME};

impl ManagerStatus {
    pub fn from_manager(manager: &Manager) -> Self {
        Self {
            state: manager.state().as_u32(),
            networking_enabled: manager.networking_enabled(),
            active_connections: manager
                .active_connections()
                .iter()
                .map(|id| owned_path(id.object_path()))
                .collect(),
        }
    }
}

/// D-Bus service handle. Keeps the bus connection alive.
pub struct DbusService {
    connection: Connection,
    status: Arc<RwLock<ManagerStatus>>,
}

impl DbusService {
    /// Export the manager object and take the well-known name.
    ///
    /// Fails when the name cannot be acquired, which is fatal for the daemon.
    pub async fn start() -> Result<(Self, mpsc::Receiver<ManagerCommand>)> {
        let (command_tx, command_rx) = mpsc::channel(32);
        let status = Arc::new(RwLock::new(ManagerStatus::default()));
        let interface = ManagerInterface::new(command_tx, status.clone());

        let connection = Builder::system()?
            .name(DBUS_SERVICE_NAME)?
            .serve_at(DBUS_OBJECT_PATH, interface)?
            .build()
            .await?;

        info!("D-Bus service started: {} at {}", DBUS_SERVICE_NAME, DBUS_OBJECT_PATH);
        Ok((Self { connection, status }, command_rx))
    }

    /// The bus connection, shared with the bus clients.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Reset the manager properties from the manager itself.
    pub async fn refresh(&self, manager: &Manager) {
        *self.status.write().await = ManagerStatus::from_manager(manager);
    }

    async fn manager_iface(&self) -> Result<InterfaceRef<ManagerInterface>> {
        self.connection
            .object_server()
            .interface::<_, ManagerInterface>(DBUS_OBJECT_PATH)
            .await
    }

    /// Mirror one manager event onto the bus.
    pub async fn sync(&self, manager: &Manager, event: &ManagerEvent) -> Result<()> {
        match event {
            ManagerEvent::StateChanged(state) => {
                self.status.write().await.state = state.as_u32();
                let iface = self.manager_iface().await?;
                let ctxt = iface.signal_context();
                ManagerInterface::manager_state_changed(ctxt, state.as_u32()).await?;
                iface.get().await.state_changed(ctxt).await?;
                announce(ctxt, "State", Value::from(state.as_u32())).await
            }
            ManagerEvent::NetworkingEnabledChanged(enabled) => {
                self.status.write().await.networking_enabled = *enabled;
                let iface = self.manager_iface().await?;
                let ctxt = iface.signal_context();
                iface.get().await.networking_enabled_changed(ctxt).await?;
                announce(ctxt, "NetworkingEnabled", Value::from(*enabled)).await
            }
            ManagerEvent::ActiveConnectionsChanged => {
                let paths = ManagerStatus::from_manager(manager).active_connections;
                {
                    let mut status = self.status.write().await;
                    if status.active_connections == paths {
                        return Ok(());
                    }
                    status.active_connections = paths.clone();
                }
                let iface = self.manager_iface().await?;
                let ctxt = iface.signal_context();
                iface.get().await.active_connections_changed(ctxt).await?;
                announce(ctxt, "ActiveConnections", Value::from(paths)).await
            }
            ManagerEvent::DeviceAdded(id) => self.export_device(manager, *id).await,
            ManagerEvent::DeviceRemoved(id) => self.unexport_device(*id).await,
            ManagerEvent::DeviceStateChanged {
                device,
                new,
                old,
                reason,
            } => self.device_state_changed(manager, *device, *new, *old, *reason).await,
            ManagerEvent::ActiveConnectionAdded(id) => {
                let Some(request) = manager.request(*id) else {
                    return Ok(());
                };
                let path = id.object_path();
                let status = ActiveStatus::from_request(request);
                self.connection
                    .object_server()
                    .at(path.as_str(), ActiveConnectionInterface::new(status))
                    .await?;
                debug!("Exported active connection {}", path);
                Ok(())
            }
            ManagerEvent::ActiveConnectionRemoved(id) => {
                let path = id.object_path();
                let server = self.connection.object_server();
                if removed(server.remove::<ActiveConnectionInterface, _>(path.as_str()).await)? {
                    debug!("Removed active connection {}", path);
                }
                Ok(())
            }
            ManagerEvent::ActiveConnectionChanged(id) => self.active_changed(manager, *id).await,
            ManagerEvent::SleepingChanged(_) | ManagerEvent::LinkRequested { .. } => Ok(()),
        }
    }

    async fn export_device(&self, manager: &Manager, id: DeviceId) -> Result<()> {
        let Some(device) = manager.device(id) else {
            return Ok(());
        };
        let path = id.object_path();
        self.connection
            .object_server()
            .at(path.as_str(), DeviceInterface::new(DeviceStatus::from_device(device)))
            .await?;

        let iface = self.manager_iface().await?;
        ManagerInterface::device_added(iface.signal_context(), ObjectPath::try_from(path.as_str())?)
            .await?;
        info!("({}): exported as {}", device.iface(), path);
        Ok(())
    }

    async fn unexport_device(&self, id: DeviceId) -> Result<()> {
        let path = id.object_path();
        let server = self.connection.object_server();
        if removed(server.remove::<DeviceInterface, _>(path.as_str()).await)? {
            let iface = self.manager_iface().await?;
            ManagerInterface::device_removed(iface.signal_context(), ObjectPath::try_from(path.as_str())?)
                .await?;
        }
        Ok(())
    }

    async fn device_state_changed(
        &self,
        manager: &Manager,
        id: DeviceId,
        new: DeviceState,
        old: DeviceState,
        reason: StateReason,
    ) -> Result<()> {
        let Some(device) = manager.device(id) else {
            return Ok(());
        };
        let path = id.object_path();
        let Ok(iface) = self
            .connection
            .object_server()
            .interface::<_, DeviceInterface>(path.as_str())
            .await
        else {
            return Ok(());
        };
        let ctxt = iface.signal_context();

        let mut status = DeviceStatus::from_device(device);
        // The property follows the event, the rest is current.
        status.state = new.as_u32();
        {
            let mut guard = iface.get_mut().await;
            let previous = guard.status().clone();
            guard.set_status(status.clone());
            if previous.managed != status.managed {
                guard.managed_changed(ctxt).await?;
            }
            if previous.firmware_missing != status.firmware_missing {
                guard.firmware_missing_changed(ctxt).await?;
            }
            guard.state_changed(ctxt).await?;
        }
        DeviceInterface::device_state_changed(ctxt, new.as_u32(), old.as_u32(), reason.as_u32())
            .await
    }

    async fn active_changed(&self, manager: &Manager, id: ActiveId) -> Result<()> {
        let Some(request) = manager.request(id) else {
            return Ok(());
        };
        let path = id.object_path();
        let Ok(iface) = self
            .connection
            .object_server()
            .interface::<_, ActiveConnectionInterface>(path.as_str())
            .await
        else {
            return Ok(());
        };
        let ctxt = iface.signal_context();
        let status = ActiveStatus::from_request(request);

        let mut guard = iface.get_mut().await;
        let previous = guard.status().clone();
        guard.set_status(status.clone());
        if previous.state != status.state {
            guard.state_changed(ctxt).await?;
        }
        if previous.default != status.default {
            guard.default_changed(ctxt).await?;
        }
        if previous.default6 != status.default6 {
            guard.default6_changed(ctxt).await?;
        }
        Ok(())
    }
}

/// Objects that were never exported count as not removed.
fn removed(result: Result<bool>) -> Result<bool> {
    match result {
        Err(zbus::Error::InterfaceNotFound) => Ok(false),
        other => other,
    }
}

/// The manager's own `PropertiesChanged` signal for one property.
async fn announce(ctxt: &SignalContext<'_>, name: &str, value: Value<'_>) -> Result<()> {
    let mut properties = HashMap::new();
    properties.insert(name, value);
    ManagerInterface::manager_properties_changed(ctxt, properties).await
}
