// Barcode Manager - Settings Service Client
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Client side of the system and user settings services.
//!
//! One watcher task per scope follows the service's bus name. While the
//! name has an owner the watcher lists its connections, follows
//! `NewConnection`, and follows `Updated`/`Removed` on every connection
//! object. Everything it learns is forwarded to the event loop as
//! [`SettingsEvent`]s.

use std::collections::HashMap;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use zbus::fdo::DBusProxy;
use zbus::names::BusName;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{proxy, Connection};

use crate::models::{ConnectionScope, SettingMap, SettingValue, SettingsHash, SETTINGS_OBJECT_PATH};

/// Settings as they travel on the bus (`a{sa{sv}}`).
pub type WireSettings = HashMap<String, HashMap<String, OwnedValue>>;

#[proxy(interface = "org.freedesktop.BarcodeManagerSettings")]
pub trait Settings {
    fn list_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    #[zbus(signal)]
    fn new_connection(&self, path: OwnedObjectPath) -> zbus::Result<()>;
}

#[proxy(interface = "org.freedesktop.BarcodeManagerSettings.Connection")]
pub trait SettingsConnection {
    fn get_settings(&self) -> zbus::Result<WireSettings>;

    #[zbus(signal)]
    fn updated(&self, settings: WireSettings) -> zbus::Result<()>;

    #[zbus(signal)]
    fn removed(&self) -> zbus::Result<()>;
}

/// What the settings services told us.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    ServiceRunning {
        scope: ConnectionScope,
        running: bool,
    },
    ConnectionAdded {
        scope: ConnectionScope,
        path: String,
        settings: SettingsHash,
    },
    ConnectionUpdated {
        scope: ConnectionScope,
        path: String,
        settings: SettingsHash,
    },
    ConnectionRemoved {
        scope: ConnectionScope,
        path: String,
    },
}

// ============================================================================
// Value conversion
// ============================================================================

/// Convert one wire value. Types no setting uses are dropped.
pub fn setting_value(value: &Value<'_>) -> Option<SettingValue> {
    match value {
        Value::Bool(b) => Some(SettingValue::Bool(*b)),
        Value::U32(n) => Some(SettingValue::U32(*n)),
        Value::U64(n) => Some(SettingValue::U64(*n)),
        Value::Str(s) => Some(SettingValue::Str(s.to_string())),
        Value::ObjectPath(p) => Some(SettingValue::Str(p.to_string())),
        Value::Value(inner) => setting_value(inner),
        Value::Array(array) => {
            let owned = value.try_clone().ok()?;
            match array.element_signature().to_string().as_str() {
                "y" => Vec::<u8>::try_from(owned).ok().map(SettingValue::Bytes),
                "s" => Vec::<String>::try_from(owned).ok().map(SettingValue::StrList),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Convert a whole settings hash, dropping values of unknown type.
pub fn settings_from_wire(wire: &WireSettings) -> SettingsHash {
    wire.iter()
        .map(|(name, props)| {
            let map: SettingMap = props
                .iter()
                .filter_map(|(key, value)| match setting_value(value) {
                    Some(v) => Some((key.clone(), v)),
                    None => {
                        debug!("Ignoring property {}.{} of unsupported type", name, key);
                        None
                    }
                })
                .collect();
            (name.clone(), map)
        })
        .collect()
}

// ============================================================================
// Watchers
// ============================================================================

/// Start one watcher per settings service.
pub fn spawn_watchers(
    conn: &Connection,
    tx: mpsc::UnboundedSender<SettingsEvent>,
) -> Vec<JoinHandle<()>> {
    [ConnectionScope::System, ConnectionScope::User]
        .into_iter()
        .map(|scope| {
            let conn = conn.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = watch_service(&conn, scope, &tx).await {
                    warn!("{} settings watcher stopped: {}", scope, e);
                }
            })
        })
        .collect()
}

async fn watch_service(
    conn: &Connection,
    scope: ConnectionScope,
    tx: &mpsc::UnboundedSender<SettingsEvent>,
) -> zbus::Result<()> {
    let dbus = DBusProxy::new(conn).await?;
    let name = scope.service_name();
    let mut owner_changes = dbus
        .receive_name_owner_changed_with_args(&[(0, name)])
        .await?;

    let mut follower: Option<JoinHandle<()>> = None;
    if dbus.name_has_owner(BusName::try_from(name)?).await? {
        follower = Some(spawn_follower(conn, scope, tx));
    }

    while let Some(signal) = owner_changes.next().await {
        let args = signal.args()?;
        if let Some(handle) = follower.take() {
            handle.abort();
            info!("{} settings service disappeared", scope);
            send(tx, SettingsEvent::ServiceRunning {
                scope,
                running: false,
            });
        }
        if args.new_owner().is_some() {
            follower = Some(spawn_follower(conn, scope, tx));
        }
    }
    Ok(())
}

/// Hand an event to the event loop, which may already have stopped.
fn send(tx: &mpsc::UnboundedSender<SettingsEvent>, event: SettingsEvent) {
    if let Err(e) = tx.send(event) {
        debug!("Dropping settings event {:?}: event loop is gone", e.0);
    }
}

fn spawn_follower(
    conn: &Connection,
    scope: ConnectionScope,
    tx: &mpsc::UnboundedSender<SettingsEvent>,
) -> JoinHandle<()> {
    let conn = conn.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = follow_service(&conn, scope, &tx).await {
            warn!("Failed to read {} connections: {}", scope, e);
        }
    })
}

async fn follow_service(
    conn: &Connection,
    scope: ConnectionScope,
    tx: &mpsc::UnboundedSender<SettingsEvent>,
) -> zbus::Result<()> {
    let settings = SettingsProxy::builder(conn)
        .destination(scope.service_name())?
        .path(SETTINGS_OBJECT_PATH)?
        .build()
        .await?;
    let mut new_connections = settings.receive_new_connection().await?;

    info!("{} settings service appeared", scope);
    send(tx, SettingsEvent::ServiceRunning {
        scope,
        running: true,
    });

    // Dropping the set aborts every connection follower with it.
    let mut followers = JoinSet::new();
    for path in settings.list_connections().await? {
        followers.spawn(follow_connection(conn.clone(), scope, path, tx.clone()));
    }

    while let Some(signal) = new_connections.next().await {
        let path = signal.args()?.path().clone();
        debug!("New {} connection {}", scope, path.as_str());
        followers.spawn(follow_connection(conn.clone(), scope, path, tx.clone()));
    }
    Ok(())
}

async fn follow_connection(
    conn: Connection,
    scope: ConnectionScope,
    path: OwnedObjectPath,
    tx: mpsc::UnboundedSender<SettingsEvent>,
) {
    if let Err(e) = read_connection(&conn, scope, &path, &tx).await {
        warn!("Failed to follow connection {}: {}", path.as_str(), e);
    }
}

async fn read_connection(
    conn: &Connection,
    scope: ConnectionScope,
    path: &OwnedObjectPath,
    tx: &mpsc::UnboundedSender<SettingsEvent>,
) -> zbus::Result<()> {
    let proxy = SettingsConnectionProxy::builder(conn)
        .destination(scope.service_name())?
        .path(path.clone())?
        .build()
        .await?;
    let mut updated = proxy.receive_updated().await?;
    let mut removed = proxy.receive_removed().await?;
    let path_str = path.as_str().to_string();

    let wire = proxy.get_settings().await?;
    send(tx, SettingsEvent::ConnectionAdded {
        scope,
        path: path_str.clone(),
        settings: settings_from_wire(&wire),
    });

    loop {
        tokio::select! {
            Some(signal) = updated.next() => {
                let args = signal.args()?;
                send(tx, SettingsEvent::ConnectionUpdated {
                    scope,
                    path: path_str.clone(),
                    settings: settings_from_wire(args.settings()),
                });
            }
            Some(_) = removed.next() => {
                send(tx, SettingsEvent::ConnectionRemoved {
                    scope,
                    path: path_str,
                });
                return Ok(());
            }
            else => return Ok(()),
        }
    }
}
