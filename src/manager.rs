// Barcode Manager - Manager
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! The manager owns every device and every activation request.
//!
//! All mutation happens through `&mut Manager` on the event loop. Device
//! events reach the manager over one channel and each request over its own;
//! [`Manager::settle`] drains them until the system is quiet, runs scheduled
//! autoconnects and recomputes the aggregate state. Observers (the D-Bus
//! layer, the policy) receive [`ManagerEvent`]s on their own channels.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activation::{
    ActivationOptions, ActivationOutcome, ActivationRequest, ActivationSpec, ActiveId,
};
use crate::device::{Device, DeviceEvent, DeviceId, LinkRequest};
use crate::models::{
    Connection, ConnectionScope, DeviceState, Error, ManagerState, Result, SettingsHash,
    StateReason,
};
use crate::services::{Authorizer, Caller, PacketFilter, Permission, SecretsProvider, SecretsReply};
use crate::storage::StateStore;

/// Notifications published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    StateChanged(ManagerState),
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    DeviceStateChanged {
        device: DeviceId,
        new: DeviceState,
        old: DeviceState,
        reason: StateReason,
    },
    /// The `ActiveConnections` property should be re-read.
    ActiveConnectionsChanged,
    ActiveConnectionAdded(ActiveId),
    ActiveConnectionRemoved(ActiveId),
    /// State or default flags of an active connection changed.
    ActiveConnectionChanged(ActiveId),
    NetworkingEnabledChanged(bool),
    SleepingChanged(bool),
    /// A device wants the bluetooth link brought up.
    LinkRequested {
        device: DeviceId,
        request: LinkRequest,
    },
}

// ============================================================================
// Connection caches
// ============================================================================

/// Connections published by one settings service.
#[derive(Debug, Clone)]
pub struct ConnectionCache {
    scope: ConnectionScope,
    running: bool,
    connections: BTreeMap<String, Connection>,
}

impl ConnectionCache {
    pub fn new(scope: ConnectionScope) -> Self {
        Self {
            scope,
            running: false,
            connections: BTreeMap::new(),
        }
    }

    pub fn scope(&self) -> ConnectionScope {
        self.scope
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn get(&self, path: &str) -> Option<&Connection> {
        self.connections.get(path)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.connections.keys()
    }

    /// Connections considered for autoconnect, most recently used first.
    fn candidates(&self) -> Vec<(&String, &Connection)> {
        if !self.running {
            return Vec::new();
        }
        let mut list: Vec<_> = self.connections.iter().collect();
        list.sort_by(|a, b| b.1.timestamp().cmp(&a.1.timestamp()).then(a.0.cmp(b.0)));
        list
    }
}

/// Activation left running on a device after its request timed out.
#[derive(Debug)]
struct Orphan {
    connection: Connection,
    user_requested: bool,
}

/// Collaborators the manager talks to.
pub struct ManagerDeps {
    pub store: Box<dyn StateStore>,
    pub secrets: Box<dyn SecretsProvider>,
    pub filter: Box<dyn PacketFilter>,
    pub auth: Box<dyn Authorizer>,
}

pub struct Manager {
    devices: Vec<Device>,
    requests: BTreeMap<ActiveId, ActivationRequest>,
    next_device: u32,
    next_active: u32,

    system: ConnectionCache,
    user: ConnectionCache,
    /// UUIDs whose automatic activation failed.
    invalid: HashSet<String>,
    pending_autoconnect: Vec<DeviceId>,
    /// Devices still activating after their request timed out.
    orphaned: BTreeMap<DeviceId, Orphan>,

    sleeping: bool,
    net_enabled: bool,
    state: ManagerState,
    activation_timeout: Option<Duration>,

    store: Box<dyn StateStore>,
    secrets: Box<dyn SecretsProvider>,
    filter: Box<dyn PacketFilter>,
    auth: Box<dyn Authorizer>,

    device_tx: mpsc::UnboundedSender<DeviceEvent>,
    device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ManagerEvent>>,
}

impl Manager {
    pub fn new(deps: ManagerDeps, activation_timeout: Option<Duration>) -> Self {
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let net_enabled = deps.store.networking_enabled();
        info!("Networking is {}", if net_enabled { "enabled" } else { "disabled" });

        let mut manager = Self {
            devices: Vec::new(),
            requests: BTreeMap::new(),
            next_device: 0,
            next_active: 0,
            system: ConnectionCache::new(ConnectionScope::System),
            user: ConnectionCache::new(ConnectionScope::User),
            invalid: HashSet::new(),
            pending_autoconnect: Vec::new(),
            orphaned: BTreeMap::new(),
            sleeping: false,
            net_enabled,
            state: ManagerState::Unknown,
            activation_timeout,
            store: deps.store,
            secrets: deps.secrets,
            filter: deps.filter,
            auth: deps.auth,
            device_tx,
            device_rx,
            subscribers: Vec::new(),
        };
        manager.update_state();
        manager
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: ManagerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn networking_enabled(&self) -> bool {
        self.net_enabled
    }

    /// Asleep from the devices' point of view: sleeping or disabled.
    pub fn is_asleep(&self) -> bool {
        self.sleeping || !self.net_enabled
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id() == id)
    }

    pub fn device_by_iface(&self, iface: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.iface() == iface)
    }

    pub fn device_by_udi(&self, udi: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.udi() == udi)
    }

    /// Object paths of all devices, in insertion order.
    pub fn get_devices(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id().object_path()).collect()
    }

    pub fn request(&self, id: ActiveId) -> Option<&ActivationRequest> {
        self.requests.get(&id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &ActivationRequest> {
        self.requests.values()
    }

    pub fn active_connections(&self) -> Vec<ActiveId> {
        self.requests.keys().copied().collect()
    }

    pub fn request_for_device(&self, device: DeviceId) -> Option<ActiveId> {
        self.requests
            .values()
            .find(|r| r.device() == device)
            .map(ActivationRequest::id)
    }

    pub fn cache(&self, scope: ConnectionScope) -> &ConnectionCache {
        match scope {
            ConnectionScope::System => &self.system,
            ConnectionScope::User => &self.user,
        }
    }

    fn cache_mut(&mut self, scope: ConnectionScope) -> &mut ConnectionCache {
        match scope {
            ConnectionScope::System => &mut self.system,
            ConnectionScope::User => &mut self.user,
        }
    }

    pub fn is_invalid_for_autoconnect(&self, uuid: &str) -> bool {
        self.invalid.contains(uuid)
    }

    // ========================================================================
    // Aggregate state
    // ========================================================================

    /// Recompute the aggregate state; emits only on change.
    pub fn update_state(&mut self) {
        let new_state = if self.is_asleep() {
            ManagerState::Asleep
        } else if self.devices.iter().any(|d| d.state() == DeviceState::Activated) {
            ManagerState::Connected
        } else if self.devices.iter().any(Device::is_activating) {
            ManagerState::Connecting
        } else {
            ManagerState::Disconnected
        };

        if new_state != self.state {
            info!("Manager state is now {}", new_state);
            self.state = new_state;
            self.emit(ManagerEvent::StateChanged(new_state));
        }
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Register a device. Returns `None` when a device with the same UDI or
    /// interface is already known.
    pub fn add_device(&mut self, mut device: Device) -> Option<DeviceId> {
        if self
            .devices
            .iter()
            .any(|d| d.udi() == device.udi() || d.iface() == device.iface())
        {
            debug!("({}): device already known, ignoring", device.iface());
            return None;
        }

        let id = DeviceId(self.next_device);
        self.next_device += 1;
        device.set_id(id);
        device.subscribe(self.device_tx.clone());

        info!(
            "({}): new {} device (driver: '{}')",
            device.iface(),
            device.device_type().display_name(),
            device.driver()
        );
        info!("({}): exported as {}", device.iface(), id.object_path());

        let asleep = self.is_asleep();
        self.devices.push(device);
        self.emit(ManagerEvent::DeviceAdded(id));

        if !asleep {
            if let Some(device) = self.device_mut(id) {
                if let Err(e) = device.set_managed(true, StateReason::NowManaged) {
                    warn!("({}): {}", device.iface(), e);
                }
            }
        }
        self.settle();
        Some(id)
    }

    /// Remove the device with this interface name, if any.
    pub fn remove_device_by_iface(&mut self, iface: &str) -> bool {
        match self.device_by_iface(iface).map(Device::id) {
            Some(id) => {
                self.remove_device(id);
                true
            }
            None => false,
        }
    }

    /// Record whether the device with this interface name is waiting for
    /// firmware. Returns `false` for an unknown interface.
    pub fn set_firmware_missing(&mut self, iface: &str, missing: bool) -> bool {
        let Some(id) = self.device_by_iface(iface).map(Device::id) else {
            return false;
        };
        if let Some(device) = self.device_mut(id) {
            if device.firmware_missing() != missing {
                info!(
                    "({}): firmware {}",
                    device.iface(),
                    if missing { "missing" } else { "available" }
                );
            }
            if let Err(e) = device.set_firmware_missing(missing) {
                warn!("({}): {}", device.iface(), e);
            }
        }
        self.settle();
        true
    }

    pub fn remove_device(&mut self, id: DeviceId) {
        if let Some(active) = self.request_for_device(id) {
            self.teardown_request(active, StateReason::Removed);
        }
        if let Some(device) = self.device_mut(id) {
            if let Err(e) = device.set_managed(false, StateReason::Removed) {
                debug!("({}): {}", device.iface(), e);
            }
        }
        self.pump_events();

        if let Some(pos) = self.devices.iter().position(|d| d.id() == id) {
            let device = self.devices.remove(pos);
            info!("({}): removed", device.iface());
            self.pending_autoconnect.retain(|d| *d != id);
            self.emit(ManagerEvent::DeviceRemoved(id));
        }
        self.settle();
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// A settings service appeared or went away. Losing a service drops all
    /// of its connections.
    pub fn set_service_running(&mut self, scope: ConnectionScope, running: bool) {
        if self.cache(scope).running == running {
            return;
        }
        info!("{} settings service is {}", scope, if running { "running" } else { "gone" });
        self.cache_mut(scope).running = running;

        if !running {
            let paths: Vec<String> = self.cache(scope).paths().cloned().collect();
            for path in paths {
                self.connection_removed(scope, &path);
            }
        }
        self.schedule_autoconnect_all();
        self.settle();
    }

    pub fn connection_added(
        &mut self,
        scope: ConnectionScope,
        path: &str,
        settings: SettingsHash,
    ) -> Result<()> {
        let connection = Connection::new(scope, settings).map_err(|e| {
            warn!("Invalid connection {}: {}", path, e);
            Error::ConnectionInvalid(e.to_string())
        })?;
        debug!("New {} connection '{}' at {}", scope, connection.id(), path);
        self.cache_mut(scope)
            .connections
            .insert(path.to_string(), connection);
        self.schedule_autoconnect_all();
        self.settle();
        Ok(())
    }

    /// New settings for a connection. Settings that no longer verify remove
    /// the connection; an update for a path not cached yet (one that failed
    /// to verify earlier) is handled as an addition.
    pub fn connection_updated(&mut self, scope: ConnectionScope, path: &str, settings: SettingsHash) {
        let Some(existing) = self.cache_mut(scope).connections.get_mut(path) else {
            debug!("Update for uncached connection {}, adding it", path);
            if let Err(e) = self.connection_added(scope, path, settings) {
                debug!("Connection {} still invalid: {}", path, e);
            }
            return;
        };
        match existing.replace_settings(settings) {
            Ok(()) => {
                debug!("Connection '{}' updated", existing.id());
                let uuid = existing.uuid().to_string();
                self.invalid.remove(&uuid);
                self.schedule_autoconnect_all();
                self.settle();
            }
            Err(e) => {
                warn!("Updated connection {} is invalid ({}), removing it", path, e);
                self.connection_removed(scope, path);
            }
        }
    }

    /// Drop a connection. A device using it is deactivated.
    pub fn connection_removed(&mut self, scope: ConnectionScope, path: &str) {
        if self.cache_mut(scope).connections.remove(path).is_none() {
            return;
        }
        debug!("Connection {} removed", path);

        let affected: Vec<(ActiveId, DeviceId)> = self
            .requests
            .values()
            .filter(|r| r.connection().scope() == scope && r.connection_path() == path)
            .map(|r| (r.id(), r.device()))
            .collect();
        for (active, device) in affected {
            self.teardown_request(active, StateReason::ConnectionRemoved);
            if let Some(device) = self.device_mut(device) {
                if let Err(e) = device.deactivate(StateReason::ConnectionRemoved) {
                    warn!("({}): {}", device.iface(), e);
                }
            }
        }
        self.settle();
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// `ActivateConnection` from the bus.
    pub fn activate_connection(
        &mut self,
        caller: Caller,
        service_name: &str,
        connection_path: &str,
        device_path: &str,
        specific_object: Option<&str>,
    ) -> Result<ActiveId> {
        self.auth.check(caller, Permission::UseConnection)?;

        let scope = ConnectionScope::from_service_name(service_name)
            .ok_or_else(|| Error::InvalidService(service_name.to_string()))?;
        if !self.cache(scope).is_running() {
            return Err(Error::InvalidService(service_name.to_string()));
        }
        let device = DeviceId::from_object_path(device_path)
            .filter(|id| self.device(*id).is_some())
            .ok_or_else(|| Error::UnknownDevice(device_path.to_string()))?;

        let specific = specific_object
            .filter(|p| !p.is_empty() && *p != "/")
            .map(str::to_string);
        let id = self.activate(device, scope, connection_path, specific, true)?;
        self.settle();
        Ok(id)
    }

    fn activate(
        &mut self,
        device_id: DeviceId,
        scope: ConnectionScope,
        connection_path: &str,
        specific_object: Option<String>,
        user_requested: bool,
    ) -> Result<ActiveId> {
        let connection = self
            .cache(scope)
            .get(connection_path)
            .cloned()
            .ok_or_else(|| Error::UnknownConnection(connection_path.to_string()))?;

        {
            let device = self
                .device(device_id)
                .ok_or_else(|| Error::UnknownDevice(device_id.object_path()))?;
            if !device.managed() {
                return Err(Error::UnmanagedDevice(device.iface().to_string()));
            }
            if matches!(
                device.state(),
                DeviceState::Unavailable | DeviceState::Unmanaged | DeviceState::Unknown
            ) {
                return Err(Error::DeviceNotAvailable(device.iface().to_string()));
            }
            device
                .check_connection_compatible(&connection)
                .map_err(|e| Error::ConnectionInvalid(e.to_string()))?;
        }

        // Only one request per device: the old one is detached before the
        // device sees any further change.
        if let Some(old) = self.request_for_device(device_id) {
            info!("Superseding activation request {}", old);
            self.teardown_request(old, StateReason::UserRequested);
        }

        let id = ActiveId(self.next_active);
        self.next_active += 1;
        let spec = ActivationSpec {
            connection,
            connection_path: connection_path.to_string(),
            specific_object,
            user_requested,
            assumed: false,
            options: ActivationOptions {
                timeout: self.activation_timeout,
                nowait: false,
            },
        };

        if let Some(device) = self.device_mut(device_id) {
            if let Err(e) = device.deactivate(StateReason::UserRequested) {
                warn!("({}): {}", device.iface(), e);
            }
        }
        // Deliver the teardown events before the new request subscribes.
        self.pump_events();
        self.pending_autoconnect.retain(|d| *d != device_id);

        let device = self
            .devices
            .iter_mut()
            .find(|d| d.id() == device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.object_path()))?;
        device.set_activation_scheduled(false);
        if user_requested {
            device.set_autoconnect_inhibited(false);
        }

        let mut request = ActivationRequest::new(id, spec, device);
        if let Err(e) = device.activate(request.connection()) {
            request.detach(
                Some(device),
                StateReason::ConfigFailed,
                self.secrets.as_mut(),
                self.filter.as_mut(),
            );
            return Err(e);
        }

        info!(
            "({}): activation of '{}' started as {}",
            device.iface(),
            request.connection().id(),
            id.object_path()
        );
        self.requests.insert(id, request);
        self.emit(ManagerEvent::ActiveConnectionAdded(id));
        self.emit(ManagerEvent::ActiveConnectionsChanged);
        Ok(id)
    }

    /// `DeactivateConnection` from the bus.
    pub fn deactivate_connection(&mut self, caller: Caller, active_path: &str) -> Result<()> {
        self.auth.check(caller, Permission::UseConnection)?;

        let id = ActiveId::from_object_path(active_path)
            .filter(|id| self.requests.contains_key(id))
            .ok_or_else(|| Error::ConnectionNotActive(active_path.to_string()))?;
        let device = self.requests.get(&id).map(ActivationRequest::device);

        self.teardown_request(id, StateReason::UserRequested);
        // Stay down until the user asks again.
        let result = match device.and_then(|d| self.device_mut(d)) {
            Some(device) => {
                device.set_autoconnect_inhibited(true);
                device
                    .deactivate(StateReason::UserRequested)
                    .inspect_err(|e| warn!("({}): deactivation failed: {}", device.iface(), e))
            }
            None => Ok(()),
        };
        self.settle();
        result
    }

    /// Receiver for the outcome of an activation.
    pub fn wait_for_activation(&mut self, id: ActiveId) -> Option<oneshot::Receiver<ActivationOutcome>> {
        self.requests.get_mut(&id).map(ActivationRequest::wait)
    }

    /// Detach and drop a request. The device is left alone.
    fn teardown_request(&mut self, id: ActiveId, reason: StateReason) {
        let Some(mut request) = self.requests.remove(&id) else {
            return;
        };
        let device = self.devices.iter_mut().find(|d| d.id() == request.device());
        request.detach(device, reason, self.secrets.as_mut(), self.filter.as_mut());
        debug!("Activation request {} removed", id);
        self.emit(ManagerEvent::ActiveConnectionRemoved(id));
        self.emit(ManagerEvent::ActiveConnectionsChanged);
    }

    /// Set the default flags of a request; emits when something changed.
    pub fn set_request_default(&mut self, id: ActiveId, default: bool, default6: bool) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        let changed = request.set_default(default) | request.set_default6(default6);
        if changed {
            self.emit(ManagerEvent::ActiveConnectionChanged(id));
        }
    }

    // ========================================================================
    // Asynchronous completions
    // ========================================================================

    /// Answer to a secrets call.
    pub fn secrets_reply(&mut self, reply: SecretsReply) {
        let Some(request) = self.requests.get_mut(&reply.call.request) else {
            debug!("Secrets reply for unknown request {}", reply.call.request);
            return;
        };
        let Some(device) = self.devices.iter_mut().find(|d| d.id() == request.device()) else {
            return;
        };
        request.secrets_reply(reply.call, reply.result, device);
        self.settle();
    }

    /// The bluetooth link of a device went up or down. A device whose
    /// request timed out keeps following its link.
    pub fn link_changed(&mut self, device_id: DeviceId, up: bool) {
        let active = self.request_for_device(device_id);
        let connection = match active.and_then(|id| self.requests.get(&id)) {
            Some(request) => Some(request.connection()),
            None => self.orphaned.get(&device_id).map(|o| &o.connection),
        };
        let Some(connection) = connection else {
            debug!("Link change for device {} without activation", device_id);
            return;
        };
        if let Some(device) = self.devices.iter_mut().find(|d| d.id() == device_id) {
            device.link_changed(connection, up);
        }
        self.settle();
    }

    /// Earliest pending request or device deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests
            .values()
            .filter_map(ActivationRequest::deadline)
            .chain(self.devices.iter().filter_map(Device::deadline))
            .min()
    }

    /// Fire every deadline that has passed.
    pub fn process_timeouts(&mut self, now: Instant) {
        let expired: Vec<ActiveId> = self
            .requests
            .values_mut()
            .filter_map(|r| r.check_timeout(now).then(|| r.id()))
            .collect();
        for id in expired {
            let Some(request) = self.requests.get(&id) else {
                continue;
            };
            let device_id = request.device();
            let orphan = Orphan {
                connection: request.connection().clone(),
                user_requested: request.user_requested(),
            };
            if self.device(device_id).is_some_and(|d| d.state().is_active()) {
                self.orphaned.insert(device_id, orphan);
            }
            self.teardown_request(id, StateReason::Unknown);
            self.fail_unanswered_auth(device_id);
        }
        for device in &mut self.devices {
            device.poll_deadline(now);
        }
        self.settle();
    }

    /// A device waiting for secrets without a request to fetch them fails.
    fn fail_unanswered_auth(&mut self, device_id: DeviceId) {
        if self.request_for_device(device_id).is_some() {
            return;
        }
        if let Some(device) = self.device_mut(device_id) {
            if device.state() == DeviceState::NeedAuth {
                info!("({}): no activation left to provide secrets", device.iface());
                if let Err(e) = device.state_changed(DeviceState::Failed, StateReason::NoSecrets) {
                    warn!("({}): {}", device.iface(), e);
                }
            }
        }
    }

    // ========================================================================
    // Sleep & enable
    // ========================================================================

    /// Permission check for operations the manager does not perform itself.
    pub fn authorize(&self, caller: Caller, permission: Permission) -> Result<()> {
        self.auth.check(caller, permission)
    }

    pub fn sleep(&mut self, caller: Caller, sleep: bool) -> Result<()> {
        if self.sleeping == sleep {
            return Err(Error::AlreadyAsleepOrAwake(sleep));
        }
        self.auth.check(caller, Permission::Sleep)?;

        info!("{} requested (sleeping: {}  enabled: {})",
            if sleep { "sleep" } else { "wake" },
            if self.sleeping { "yes" } else { "no" },
            if self.net_enabled { "yes" } else { "no" });
        self.sleeping = sleep;
        self.emit(ManagerEvent::SleepingChanged(sleep));
        self.do_sleep_wake();
        Ok(())
    }

    pub fn enable(&mut self, caller: Caller, enable: bool) -> Result<()> {
        if self.net_enabled == enable {
            return Err(Error::AlreadyEnabledOrDisabled(enable));
        }
        self.auth.check(caller, Permission::EnableDisable)?;

        if let Err(e) = self.store.set_networking_enabled(enable) {
            warn!("Writing to the state file failed: {}", e);
        }
        info!("{} requested (sleeping: {}  enabled: {})",
            if enable { "enable" } else { "disable" },
            if self.sleeping { "yes" } else { "no" },
            if self.net_enabled { "yes" } else { "no" });
        self.net_enabled = enable;
        self.emit(ManagerEvent::NetworkingEnabledChanged(enable));
        self.do_sleep_wake();
        Ok(())
    }

    fn do_sleep_wake(&mut self) {
        if self.is_asleep() {
            info!("sleeping or disabling...");
            self.invalid.clear();
            let active: Vec<ActiveId> = self.requests.keys().copied().collect();
            for id in active {
                self.teardown_request(id, StateReason::Sleeping);
            }
            for device in &mut self.devices {
                if let Err(e) = device.set_managed(false, StateReason::Sleeping) {
                    warn!("({}): {}", device.iface(), e);
                }
            }
        } else {
            info!("waking up and re-enabling...");
            for device in &mut self.devices {
                device.set_autoconnect_inhibited(false);
                if let Err(e) = device.set_managed(true, StateReason::NowManaged) {
                    warn!("({}): {}", device.iface(), e);
                }
            }
        }
        self.settle();
    }

    // ========================================================================
    // Event processing
    // ========================================================================

    /// Drain all queued events, run scheduled autoconnects, recompute state.
    pub fn settle(&mut self) {
        loop {
            self.pump_events();
            if self.pending_autoconnect.is_empty() {
                break;
            }
            let pending = std::mem::take(&mut self.pending_autoconnect);
            for id in pending {
                if let Some(device) = self.device_mut(id) {
                    device.set_activation_scheduled(false);
                }
                self.auto_activate(id);
            }
        }
        self.update_state();
    }

    fn pump_events(&mut self) {
        loop {
            let ids: Vec<ActiveId> = self.requests.keys().copied().collect();
            for id in ids {
                let Some(request) = self.requests.get_mut(&id) else {
                    continue;
                };
                let update = request.process_events(self.secrets.as_mut());
                if update.state_changed {
                    self.emit(ManagerEvent::ActiveConnectionChanged(id));
                }
            }

            let mut progressed = false;
            while let Ok(event) = self.device_rx.try_recv() {
                progressed = true;
                self.handle_device_event(event);
            }
            if !progressed {
                break;
            }
        }
    }

    fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::StateChanged {
                device,
                new,
                old,
                reason,
            } => {
                self.emit(ManagerEvent::DeviceStateChanged {
                    device,
                    new,
                    old,
                    reason,
                });
                if matches!(
                    new,
                    DeviceState::Unmanaged
                        | DeviceState::Unavailable
                        | DeviceState::Disconnected
                        | DeviceState::Prepare
                        | DeviceState::Failed
                ) {
                    self.emit(ManagerEvent::ActiveConnectionsChanged);
                }

                if !new.is_active() && new != DeviceState::Failed {
                    self.orphaned.remove(&device);
                }

                match new {
                    DeviceState::Activated => self.update_timestamp(device),
                    DeviceState::Failed => self.activation_failed(device, reason),
                    DeviceState::Disconnected => {
                        if let Some(active) = self.request_for_device(device) {
                            self.teardown_request(active, reason);
                        }
                        self.schedule_autoconnect(device);
                    }
                    DeviceState::Unavailable | DeviceState::Unmanaged => {
                        if let Some(active) = self.request_for_device(device) {
                            self.teardown_request(active, reason);
                        }
                    }
                    _ => {}
                }
                self.update_state();
            }
            DeviceEvent::LinkRequested { device, request } => {
                self.emit(ManagerEvent::LinkRequested { device, request });
            }
            DeviceEvent::NeedSecrets { device, .. } => self.fail_unanswered_auth(device),
        }
    }

    fn activation_failed(&mut self, device_id: DeviceId, reason: StateReason) {
        if let Some(orphan) = self.orphaned.remove(&device_id) {
            if !orphan.user_requested {
                info!(
                    "Marking connection '{}' invalid for autoconnect",
                    orphan.connection.id()
                );
                self.invalid.insert(orphan.connection.uuid().to_string());
            }
        }
        if let Some(active) = self.request_for_device(device_id) {
            if let Some(request) = self.requests.get(&active) {
                if !request.user_requested() {
                    let uuid = request.connection().uuid().to_string();
                    info!(
                        "Marking connection '{}' invalid for autoconnect",
                        request.connection().id()
                    );
                    self.invalid.insert(uuid);
                }
            }
            self.teardown_request(active, reason);
        }
        if let Some(device) = self.device_mut(device_id) {
            if let Err(e) = device.state_changed(DeviceState::Disconnected, reason) {
                warn!("({}): {}", device.iface(), e);
            }
        }
    }

    fn update_timestamp(&mut self, device_id: DeviceId) {
        let Some((scope, path)) = self
            .request_for_device(device_id)
            .and_then(|id| self.requests.get(&id))
            .map(|r| (r.connection().scope(), r.connection_path().to_string()))
        else {
            return;
        };
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if let Some(connection) = self.cache_mut(scope).connections.get_mut(&path) {
            connection.set_timestamp(now);
        }
    }

    // ========================================================================
    // Autoconnect
    // ========================================================================

    fn schedule_autoconnect(&mut self, device_id: DeviceId) {
        if self.is_asleep() || self.pending_autoconnect.contains(&device_id) {
            return;
        }
        if let Some(device) = self.device_mut(device_id) {
            if device.autoconnect_allowed() {
                device.set_activation_scheduled(true);
                self.pending_autoconnect.push(device_id);
            }
        }
    }

    fn schedule_autoconnect_all(&mut self) {
        let ids: Vec<DeviceId> = self.devices.iter().map(Device::id).collect();
        for id in ids {
            self.schedule_autoconnect(id);
        }
    }

    /// Try to start the best automatic connection for a device: system
    /// connections first, then user connections.
    fn auto_activate(&mut self, device_id: DeviceId) -> Option<ActiveId> {
        if self.is_asleep() || self.request_for_device(device_id).is_some() {
            return None;
        }
        let device = self.device(device_id)?;
        if !device.autoconnect_allowed() {
            return None;
        }

        let mut chosen = None;
        for cache in [&self.system, &self.user] {
            let candidates: Vec<(&String, &Connection)> = cache
                .candidates()
                .into_iter()
                .filter(|(_, c)| !self.invalid.contains(c.uuid()))
                .collect();
            let refs: Vec<&Connection> = candidates.iter().map(|(_, c)| *c).collect();
            if let Some(best) = device.get_best_auto_connection(&refs) {
                chosen = candidates
                    .iter()
                    .find(|(_, c)| std::ptr::eq(*c, best))
                    .map(|(path, _)| (cache.scope(), (*path).clone()));
                break;
            }
        }

        let (scope, path) = chosen?;
        info!("({}): auto-activating connection {}", device.iface(), path);
        match self.activate(device_id, scope, &path, None, false) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Auto-activation of {} failed: {}", path, e);
                None
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Tear down every request and announce every device as removed.
    pub fn shutdown(&mut self) {
        info!("Shutting down");
        let active: Vec<ActiveId> = self.requests.keys().copied().collect();
        for id in active {
            self.teardown_request(id, StateReason::Unknown);
        }
        self.orphaned.clear();
        let devices: Vec<DeviceId> = self.devices.iter().map(Device::id).collect();
        for id in devices {
            self.emit(ManagerEvent::DeviceRemoved(id));
        }
        self.devices.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::tests::{bt_device, hidraw_device, ADDR};
    use crate::device::BtCapabilities;
    use crate::models::connection::tests::bt_settings;
    use crate::models::connection::{SETTING_CONNECTION, SETTING_HIDRAW};
    use crate::models::{SettingMap, SYSTEM_SETTINGS_SERVICE};
    use crate::services::firewall::tests::RecordingFilter;
    use crate::services::secrets::tests::RecordingSecrets;
    use crate::services::{SecretsCall, SecretsQuery, UidAuthorizer};
    use crate::storage::MemoryStateStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub(crate) struct SharedSecrets(pub Rc<RefCell<RecordingSecrets>>);

    impl SecretsProvider for SharedSecrets {
        fn get_secrets(&mut self, call: SecretsCall, query: SecretsQuery) {
            self.0.borrow_mut().get_secrets(call, query);
        }

        fn cancel_get_secrets(&mut self, call: SecretsCall) {
            self.0.borrow_mut().cancel_get_secrets(call);
        }
    }

    struct FailingStore;

    impl StateStore for FailingStore {
        fn networking_enabled(&self) -> bool {
            true
        }

        fn set_networking_enabled(&mut self, _enabled: bool) -> Result<()> {
            Err(Error::ConfigWriteFailed("read-only".into()))
        }
    }

    pub(crate) fn manager_with(secrets: SharedSecrets, timeout: Option<Duration>) -> Manager {
        Manager::new(
            ManagerDeps {
                store: Box::new(MemoryStateStore::default()),
                secrets: Box::new(secrets),
                filter: Box::new(RecordingFilter::default()),
                auth: Box::new(UidAuthorizer::new(vec![1000])),
            },
            timeout,
        )
    }

    pub(crate) fn manager() -> Manager {
        manager_with(SharedSecrets::default(), None)
    }

    pub(crate) fn hidraw_settings(id: &str, autoconnect: bool) -> SettingsHash {
        let mut hash = SettingsHash::new();
        let mut con = SettingMap::new();
        con.insert("id".into(), id.into());
        con.insert("uuid".into(), uuid::Uuid::new_v4().to_string().into());
        con.insert("type".into(), SETTING_HIDRAW.into());
        con.insert("autoconnect".into(), autoconnect.into());
        hash.insert(SETTING_CONNECTION.into(), con);
        hash.insert(SETTING_HIDRAW.into(), SettingMap::new());
        hash
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn state_events(events: &[ManagerEvent]) -> Vec<ManagerState> {
        events
            .iter()
            .filter_map(|e| match e {
                ManagerEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    const CONN: &str = "/org/freedesktop/BarcodeManagerSettings/0";

    #[test]
    fn test_initial_state_disconnected() {
        let mgr = manager();
        assert_eq!(mgr.state(), ManagerState::Disconnected);
        assert!(mgr.networking_enabled());
    }

    #[test]
    fn test_update_state_is_idempotent() {
        let mut mgr = manager();
        let mut rx = mgr.subscribe();
        mgr.update_state();
        mgr.update_state();
        assert!(state_events(&drain(&mut rx)).is_empty());
    }

    #[test]
    fn test_add_device_manages_it() {
        let mut mgr = manager();
        let mut rx = mgr.subscribe();
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert_eq!(mgr.get_devices(), vec![id.object_path()]);
        assert!(drain(&mut rx).contains(&ManagerEvent::DeviceAdded(id)));
    }

    #[test]
    fn test_add_then_remove_restores_device_list() {
        let mut mgr = manager();
        mgr.add_device(hidraw_device("hidraw0")).expect("added");
        let before = mgr.get_devices();

        let id = mgr.add_device(hidraw_device("hidraw1")).expect("added");
        assert!(mgr.remove_device_by_iface("hidraw1"));
        assert_eq!(mgr.get_devices(), before);
        assert!(mgr.device(id).is_none());
        assert!(!mgr.remove_device_by_iface("hidraw1"));
    }

    #[test]
    fn test_firmware_arrival_triggers_autoconnect() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", true))
            .expect("valid");

        let mut device = hidraw_device("hidraw0");
        device.set_firmware_missing(true).expect("unmanaged");
        let id = mgr.add_device(device).expect("added");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Unavailable));
        assert!(mgr.active_connections().is_empty());

        assert!(mgr.set_firmware_missing("hidraw0", false));
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Activated));
        assert_eq!(mgr.active_connections().len(), 1);

        assert!(!mgr.set_firmware_missing("hidraw9", true));
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let mut mgr = manager();
        assert!(mgr.add_device(hidraw_device("hidraw0")).is_some());
        assert!(mgr.add_device(hidraw_device("hidraw0")).is_none());
        assert_eq!(mgr.devices().len(), 1);
    }

    #[test]
    fn test_autoconnect_on_add() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", true))
            .expect("valid");
        let mut rx = mgr.subscribe();
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");

        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Activated));
        assert_eq!(mgr.state(), ManagerState::Connected);
        assert_eq!(mgr.active_connections().len(), 1);
        assert!(mgr
            .cache(ConnectionScope::System)
            .get(CONN)
            .is_some_and(|c| c.timestamp() > 0));
        assert_eq!(
            state_events(&drain(&mut rx)).last(),
            Some(&ManagerState::Connected)
        );
    }

    #[test]
    fn test_no_autoconnect_when_service_not_running() {
        let mut mgr = manager();
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", true))
            .expect("valid");
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert!(mgr.active_connections().is_empty());
    }

    #[test]
    fn test_system_connections_before_user() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.set_service_running(ConnectionScope::User, true);
        mgr.connection_added(ConnectionScope::User, CONN, hidraw_settings("user", true))
            .expect("valid");
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("system", true))
            .expect("valid");
        mgr.add_device(hidraw_device("hidraw0")).expect("added");

        let request = mgr.requests().next().expect("one request");
        assert_eq!(request.connection().id(), "system");
        assert_eq!(request.service_name(), SYSTEM_SETTINGS_SERVICE);
    }

    #[test]
    fn test_aggregate_connected_wins() {
        let mut mgr = manager();
        mgr.add_device(hidraw_device("hidraw0")).expect("added");
        mgr.add_device(hidraw_device("hidraw1")).expect("added");
        assert_eq!(mgr.state(), ManagerState::Disconnected);

        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", false))
            .expect("valid");
        let dev = mgr.device_by_iface("hidraw0").map(Device::id).expect("device");
        mgr.activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &dev.object_path(), None)
            .expect("activated");
        assert_eq!(mgr.state(), ManagerState::Connected);
    }

    #[test]
    fn test_aggregate_connecting_and_asleep() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("dun", ADDR, "dun", false),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::DUN)).expect("added");
        mgr.add_device(hidraw_device("hidraw0")).expect("added");

        mgr.activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect("started");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Config));
        assert_eq!(mgr.state(), ManagerState::Connecting);

        mgr.sleep(Caller::ROOT, true).expect("asleep");
        assert_eq!(mgr.state(), ManagerState::Asleep);
        assert!(mgr.active_connections().is_empty());
        assert!(mgr.devices().iter().all(|d| d.state() == DeviceState::Unmanaged));
    }

    #[test]
    fn test_one_request_per_device() {
        let secrets = SharedSecrets::default();
        let mut mgr = manager_with(secrets.clone(), None);
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("dun", ADDR, "dun", false),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::DUN)).expect("added");
        let subscribers_idle = mgr.device(id).map(Device::subscriber_count);

        let first = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect("first");
        mgr.link_changed(id, true);
        assert_eq!(secrets.0.borrow().outstanding().len(), 1);
        let mut first_rx = mgr.wait_for_activation(first).expect("request");

        let second = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect("second");
        assert_ne!(first, second);
        assert_eq!(mgr.active_connections(), vec![second]);
        assert!(secrets.0.borrow().outstanding().is_empty());
        assert_eq!(
            mgr.device(id).map(Device::subscriber_count),
            subscribers_idle.map(|n| n + 1)
        );
        assert!(first_rx.try_recv().expect("first finished").is_err());
    }

    #[test]
    fn test_activate_errors() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", false))
            .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::DUN)).expect("added");

        let err = mgr
            .activate_connection(Caller::ROOT, "org.example.Other", CONN, &id.object_path(), None)
            .expect_err("bad service");
        assert!(matches!(err, Error::InvalidService(_)));

        let err = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, "/nope", &id.object_path(), None)
            .expect_err("bad connection");
        assert!(matches!(err, Error::UnknownConnection(_)));

        let err = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, "/org/x/Devices/9", None)
            .expect_err("bad device");
        assert!(matches!(err, Error::UnknownDevice(_)));

        let err = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect_err("hidraw connection on bluetooth device");
        assert!(matches!(err, Error::ConnectionInvalid(_)));

        let err = mgr
            .activate_connection(Caller { uid: 4242 }, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect_err("denied");
        assert!(err.is_authorization_error());
    }

    #[test]
    fn test_activate_on_unmanaged_device() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", false))
            .expect("valid");
        mgr.enable(Caller::ROOT, false).expect("disabled");
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        let err = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect_err("unmanaged");
        assert!(matches!(err, Error::UnmanagedDevice(_)));
    }

    #[test]
    fn test_deactivate_connection() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", false))
            .expect("valid");
        let dev = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        let active = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &dev.object_path(), None)
            .expect("activated");

        mgr.deactivate_connection(Caller::ROOT, &active.object_path())
            .expect("deactivated");
        assert_eq!(mgr.device(dev).map(Device::state), Some(DeviceState::Disconnected));
        assert_eq!(mgr.state(), ManagerState::Disconnected);

        let err = mgr
            .deactivate_connection(Caller::ROOT, &active.object_path())
            .expect_err("not active");
        assert!(matches!(err, Error::ConnectionNotActive(_)));
    }

    #[test]
    fn test_user_deactivation_inhibits_autoconnect() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", true))
            .expect("valid");
        let dev = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        let active = mgr.active_connections()[0];

        mgr.deactivate_connection(Caller::ROOT, &active.object_path())
            .expect("deactivated");
        assert!(mgr.active_connections().is_empty());
        assert_eq!(mgr.device(dev).map(Device::state), Some(DeviceState::Disconnected));

        mgr.activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &dev.object_path(), None)
            .expect("explicit activation");
        assert_eq!(mgr.device(dev).map(Device::autoconnect_inhibited), Some(false));
        assert_eq!(mgr.state(), ManagerState::Connected);
    }

    #[test]
    fn test_enable_rejects_same_value_and_checks_permission() {
        let mut mgr = manager();
        let err = mgr.enable(Caller::ROOT, true).expect_err("already");
        assert!(matches!(err, Error::AlreadyEnabledOrDisabled(true)));

        let err = mgr.enable(Caller { uid: 4242 }, false).expect_err("denied");
        assert!(err.is_authorization_error());
        assert!(mgr.networking_enabled());

        mgr.enable(Caller { uid: 1000 }, false).expect("allowed user");
        assert!(!mgr.networking_enabled());
        assert_eq!(mgr.state(), ManagerState::Asleep);
    }

    #[test]
    fn test_enable_survives_store_failure() {
        let mut mgr = Manager::new(
            ManagerDeps {
                store: Box::new(FailingStore),
                secrets: Box::new(SharedSecrets::default()),
                filter: Box::new(RecordingFilter::default()),
                auth: Box::new(UidAuthorizer::default()),
            },
            None,
        );
        mgr.enable(Caller::ROOT, false).expect("still applied");
        assert!(!mgr.networking_enabled());
    }

    #[test]
    fn test_sleep_and_wake() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", true))
            .expect("valid");
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        assert_eq!(mgr.state(), ManagerState::Connected);

        assert!(matches!(
            mgr.sleep(Caller::ROOT, false),
            Err(Error::AlreadyAsleepOrAwake(false))
        ));
        mgr.sleep(Caller::ROOT, true).expect("asleep");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Unmanaged));

        mgr.sleep(Caller::ROOT, false).expect("awake");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Activated));
        assert_eq!(mgr.state(), ManagerState::Connected);
    }

    #[test]
    fn test_failed_autoconnect_marked_invalid() {
        let secrets = SharedSecrets::default();
        let mut mgr = manager_with(secrets.clone(), None);
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("dun", ADDR, "dun", true),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::DUN)).expect("added");
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Config));

        mgr.link_changed(id, false);
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert!(mgr.active_connections().is_empty());
        let uuid = mgr
            .cache(ConnectionScope::System)
            .get(CONN)
            .map(|c| c.uuid().to_string())
            .expect("cached");
        assert!(mgr.is_invalid_for_autoconnect(&uuid));

        mgr.sleep(Caller::ROOT, true).expect("asleep");
        assert!(!mgr.is_invalid_for_autoconnect(&uuid));
    }

    #[test]
    fn test_connection_removed_deactivates() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(ConnectionScope::System, CONN, hidraw_settings("usb", true))
            .expect("valid");
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        let mut rx = mgr.subscribe();

        mgr.connection_removed(ConnectionScope::System, CONN);
        assert!(mgr.active_connections().is_empty());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert!(drain(&mut rx).contains(&ManagerEvent::DeviceStateChanged {
            device: id,
            new: DeviceState::Disconnected,
            old: DeviceState::Activated,
            reason: StateReason::ConnectionRemoved,
        }));
    }

    #[test]
    fn test_invalid_update_removes_connection() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::User, true);
        mgr.connection_added(ConnectionScope::User, CONN, hidraw_settings("usb", false))
            .expect("valid");
        let mut broken = hidraw_settings("usb", false);
        broken.remove(SETTING_HIDRAW);
        mgr.connection_updated(ConnectionScope::User, CONN, broken);
        assert!(mgr.cache(ConnectionScope::User).get(CONN).is_none());
    }

    #[test]
    fn test_valid_update_after_invalid_add() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::System, true);
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");

        let mut broken = hidraw_settings("usb", true);
        broken.remove(SETTING_HIDRAW);
        assert!(mgr
            .connection_added(ConnectionScope::System, CONN, broken.clone())
            .is_err());
        mgr.connection_updated(ConnectionScope::System, CONN, broken);
        assert!(mgr.cache(ConnectionScope::System).get(CONN).is_none());

        mgr.connection_updated(ConnectionScope::System, CONN, hidraw_settings("usb", true));
        assert!(mgr.cache(ConnectionScope::System).get(CONN).is_some());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Activated));
    }

    #[test]
    fn test_service_loss_clears_cache() {
        let mut mgr = manager();
        mgr.set_service_running(ConnectionScope::User, true);
        mgr.connection_added(ConnectionScope::User, CONN, hidraw_settings("usb", true))
            .expect("valid");
        let id = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        assert_eq!(mgr.state(), ManagerState::Connected);

        mgr.set_service_running(ConnectionScope::User, false);
        assert!(mgr.cache(ConnectionScope::User).is_empty());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert_eq!(mgr.state(), ManagerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_leaves_device() {
        let mut mgr = manager_with(SharedSecrets::default(), Some(Duration::from_secs(5)));
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("pan", ADDR, "panu", false),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::NAP)).expect("added");
        let active = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect("started");
        let mut rx = mgr.wait_for_activation(active).expect("request");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(mgr.next_deadline().map(|d| d <= Instant::now()), Some(true));
        mgr.process_timeouts(Instant::now());

        assert_eq!(
            rx.try_recv().expect("finished"),
            Err(crate::activation::ActivationError::TimeoutExpired)
        );
        assert!(mgr.active_connections().is_empty());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_up_after_timeout_still_activates() {
        let mut mgr = manager_with(SharedSecrets::default(), Some(Duration::from_secs(5)));
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("pan", ADDR, "panu", false),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::NAP)).expect("added");
        mgr.activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect("started");

        tokio::time::advance(Duration::from_secs(5)).await;
        mgr.process_timeouts(Instant::now());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Config));

        mgr.link_changed(id, true);
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Activated));
        assert_eq!(mgr.state(), ManagerState::Connected);
        assert!(mgr.active_connections().is_empty());

        mgr.link_changed(id, false);
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert_eq!(mgr.state(), ManagerState::Disconnected);

        // Nothing is following the device any more.
        mgr.link_changed(id, true);
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_waiting_for_secrets_fails_device() {
        let secrets = SharedSecrets::default();
        let mut mgr = manager_with(secrets.clone(), Some(Duration::from_secs(5)));
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("dun", ADDR, "dun", false),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::DUN)).expect("added");
        let active = mgr
            .activate_connection(Caller::ROOT, SYSTEM_SETTINGS_SERVICE, CONN, &id.object_path(), None)
            .expect("started");
        mgr.link_changed(id, true);
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::NeedAuth));
        assert_eq!(secrets.0.borrow().outstanding().len(), 1);
        let mut rx = mgr.subscribe();

        tokio::time::advance(Duration::from_secs(5)).await;
        mgr.process_timeouts(Instant::now());

        assert!(mgr.request(active).is_none());
        assert!(secrets.0.borrow().outstanding().is_empty());
        assert!(drain(&mut rx).contains(&ManagerEvent::DeviceStateChanged {
            device: id,
            new: DeviceState::Failed,
            old: DeviceState::NeedAuth,
            reason: StateReason::NoSecrets,
        }));
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
        assert_eq!(mgr.state(), ManagerState::Disconnected);
        assert_eq!(mgr.next_deadline(), None);

        tokio::time::advance(Duration::from_secs(3600)).await;
        mgr.process_timeouts(Instant::now());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_autoconnect_marked_invalid() {
        let mut mgr = manager_with(SharedSecrets::default(), Some(Duration::from_secs(5)));
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            CONN,
            bt_settings("dun", ADDR, "dun", true),
        )
        .expect("valid");
        let id = mgr.add_device(bt_device("bt0", BtCapabilities::DUN)).expect("added");
        mgr.link_changed(id, true);
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::NeedAuth));

        tokio::time::advance(Duration::from_secs(5)).await;
        mgr.process_timeouts(Instant::now());

        let uuid = mgr
            .cache(ConnectionScope::System)
            .get(CONN)
            .map(|c| c.uuid().to_string())
            .expect("cached");
        assert!(mgr.is_invalid_for_autoconnect(&uuid));
        assert!(mgr.active_connections().is_empty());
        assert_eq!(mgr.device(id).map(Device::state), Some(DeviceState::Disconnected));
    }

    #[test]
    fn test_shutdown_announces_removal() {
        let mut mgr = manager();
        let a = mgr.add_device(hidraw_device("hidraw0")).expect("added");
        let b = mgr.add_device(hidraw_device("hidraw1")).expect("added");
        let mut rx = mgr.subscribe();
        mgr.shutdown();
        let events = drain(&mut rx);
        assert!(events.contains(&ManagerEvent::DeviceRemoved(a)));
        assert!(events.contains(&ManagerEvent::DeviceRemoved(b)));
        assert!(mgr.devices().is_empty());
    }
}
