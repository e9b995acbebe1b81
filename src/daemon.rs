// Barcode Manager - Daemon
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Wiring and the main event loop.
//!
//! Every source of change is a channel or future polled by one
//! `select!` loop on a current-thread runtime. Handlers run to completion
//! against `&mut Manager`; nothing else touches core state.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dbus::bluez::BluezEvent;
use crate::dbus::settings::{self, SettingsEvent};
use crate::dbus::{BluezClient, DbusSecrets, DbusService, ManagerCommand};
use crate::device::DeviceId;
use crate::hotplug::{self, HotplugEvent, HotplugWatcher, UdevMonitor, UdevSource};
use crate::logging::LogControl;
use crate::manager::{Manager, ManagerDeps, ManagerEvent};
use crate::models::{DaemonConfig, DeviceState, DeviceType, Result};
use crate::policy::Policy;
use crate::services::{IptablesFilter, Permission, SecretsReply, UidAuthorizer};
use crate::storage::FileStateStore;

/// Receivers drained by the event loop.
pub struct Channels {
    commands: mpsc::Receiver<ManagerCommand>,
    manager: mpsc::UnboundedReceiver<ManagerEvent>,
    hotplug: Option<UdevMonitor>,
    settings: mpsc::UnboundedReceiver<SettingsEvent>,
    secrets: mpsc::UnboundedReceiver<SecretsReply>,
    bluez: mpsc::UnboundedReceiver<BluezEvent>,
}

pub struct Daemon {
    config: DaemonConfig,
    logging: LogControl,
    manager: Manager,
    policy: Policy,
    watcher: HotplugWatcher,
    service: DbusService,
    bluez: BluezClient,
    pid_file: Option<PathBuf>,
}

impl Daemon {
    /// Take the bus name, build the manager and start every watcher.
    /// Failing to own the bus name is the only fatal startup error.
    pub async fn start(
        config: DaemonConfig,
        logging: LogControl,
        pid_file: Option<PathBuf>,
    ) -> Result<(Self, Channels)> {
        let (service, commands) = DbusService::start().await?;
        let conn = service.connection().clone();

        let (secrets_tx, secrets_rx) = mpsc::unbounded_channel();
        let deps = ManagerDeps {
            store: Box::new(FileStateStore::open(&config.main.state_file)),
            secrets: Box::new(DbusSecrets::new(conn.clone(), secrets_tx)),
            filter: Box::new(IptablesFilter::spawn("iptables")),
            auth: Box::new(UidAuthorizer::new(config.main.allowed_uids.clone())),
        };
        let mut manager = Manager::new(deps, Some(config.activation_timeout()));
        let manager_rx = manager.subscribe();
        service.refresh(&manager).await;

        // Listen before enumerating so nothing plugged in between is lost.
        let monitor = match UdevMonitor::open(&config.main.subsystems) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("Failed to open the udev monitor, hotplug disabled: {}", e);
                None
            }
        };
        let source = UdevSource::new(config.main.subsystems.clone());
        let watcher = HotplugWatcher::new(config.main.bridge_subsystem.clone(), hotplug::default_creator());
        for device in watcher.query_devices(&source, manager.is_asleep()) {
            manager.add_device(device);
        }

        let (settings_tx, settings_rx) = mpsc::unbounded_channel();
        settings::spawn_watchers(&conn, settings_tx);

        let (bluez_tx, bluez_rx) = mpsc::unbounded_channel();
        let bluez = BluezClient::new(conn, bluez_tx);
        bluez.spawn_discovery();

        if let Some(path) = &pid_file {
            if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
                warn!("Failed to write pid file {:?}: {}", path, e);
            }
        }

        let daemon = Self {
            config,
            logging,
            manager,
            policy: Policy::new(),
            watcher,
            service,
            bluez,
            pid_file,
        };
        let channels = Channels {
            commands,
            manager: manager_rx,
            hotplug: monitor,
            settings: settings_rx,
            secrets: secrets_rx,
            bluez: bluez_rx,
        };
        Ok((daemon, channels))
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(mut self, mut channels: Channels) -> Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        info!(
            "Barcode Manager running (logging: {} {})",
            self.logging.level(),
            self.logging.domains()
        );

        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                Some(event) = channels.manager.recv() => self.manager_event(event).await,
                Some(command) = channels.commands.recv() => self.command(command),
                event = next_hotplug(&mut channels.hotplug) => self.hotplug_event(event),
                Some(event) = channels.settings.recv() => self.settings_event(event),
                Some(reply) = channels.secrets.recv() => self.manager.secrets_reply(reply),
                Some(event) = channels.bluez.recv() => self.bluez_event(event),
                _ = wait_until(deadline) => self.manager.process_timeouts(Instant::now()),
                _ = tokio::signal::ctrl_c() => {
                    info!("Caught SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Caught SIGTERM, shutting down");
                    break;
                }
            }
        }

        self.manager.shutdown();
        while let Ok(event) = channels.manager.try_recv() {
            if let Err(e) = self.service.sync(&self.manager, &event).await {
                debug!("Failed to publish {:?} during shutdown: {}", event, e);
            }
        }
        if let Some(path) = &self.pid_file {
            let _ = std::fs::remove_file(path);
        }
        info!("Exiting");
        Ok(())
    }

    async fn manager_event(&mut self, event: ManagerEvent) {
        self.policy.handle(&mut self.manager, &event);

        match &event {
            ManagerEvent::LinkRequested { device, request } => {
                if let Some(device) = self.manager.device(*device) {
                    self.bluez.connect(device.udi(), request);
                }
            }
            ManagerEvent::DeviceStateChanged { device, new, .. } if drops_link(*new) => {
                if let Some(device) = self
                    .manager
                    .device(*device)
                    .filter(|d| d.device_type() == DeviceType::Bluetooth)
                {
                    self.bluez.disconnect(device.udi());
                }
            }
            _ => {}
        }

        if let Err(e) = self.service.sync(&self.manager, &event).await {
            warn!("Failed to publish {:?} on the bus: {}", event, e);
        }
    }

    fn command(&mut self, command: ManagerCommand) {
        // A caller that went away no longer needs its reply.
        match command {
            ManagerCommand::GetDevices { reply } => {
                let _ = reply.send(self.manager.get_devices());
            }
            ManagerCommand::Enable {
                caller,
                enable,
                reply,
            } => {
                let _ = reply.send(self.manager.enable(caller, enable));
            }
            ManagerCommand::Sleep {
                caller,
                sleep,
                reply,
            } => {
                let _ = reply.send(self.manager.sleep(caller, sleep));
            }
            ManagerCommand::SetLogging {
                caller,
                level,
                domains,
                reply,
            } => {
                let result = self
                    .manager
                    .authorize(caller, Permission::SetLogging)
                    .and_then(|_| self.logging.set_logging(&level, &domains));
                let _ = reply.send(result);
            }
            ManagerCommand::ActivateConnection {
                caller,
                service_name,
                connection,
                device,
                specific_object,
                reply,
            } => {
                let result = self.manager.activate_connection(
                    caller,
                    &service_name,
                    &connection,
                    &device,
                    Some(&specific_object),
                );
                let _ = reply.send(result);
            }
            ManagerCommand::DeactivateConnection {
                caller,
                active,
                reply,
            } => {
                let _ = reply.send(self.manager.deactivate_connection(caller, &active));
            }
        }
    }

    fn hotplug_event(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Added(raw) => self.hotplug_added(&raw),
            HotplugEvent::Changed(raw) => {
                if !self.manager.set_firmware_missing(&raw.name, raw.firmware_missing) {
                    self.hotplug_added(&raw);
                }
            }
            HotplugEvent::Removed(raw) => {
                if self.manager.remove_device_by_iface(&raw.name) {
                    info!("Removed {} device '{}'", raw.subsystem, raw.name);
                }
            }
        }
    }

    fn hotplug_added(&mut self, raw: &hotplug::RawDevice) {
        if let Some(device) = self.watcher.device_added(raw, self.manager.is_asleep()) {
            self.manager.add_device(device);
        }
    }

    fn settings_event(&mut self, event: SettingsEvent) {
        match event {
            SettingsEvent::ServiceRunning { scope, running } => {
                self.manager.set_service_running(scope, running)
            }
            SettingsEvent::ConnectionAdded {
                scope,
                path,
                settings,
            } => {
                if let Err(e) = self.manager.connection_added(scope, &path, settings) {
                    warn!("Ignoring {} connection {}: {}", scope, path, e);
                }
            }
            SettingsEvent::ConnectionUpdated {
                scope,
                path,
                settings,
            } => self.manager.connection_updated(scope, &path, settings),
            SettingsEvent::ConnectionRemoved { scope, path } => {
                self.manager.connection_removed(scope, &path)
            }
        }
    }

    fn bluez_event(&mut self, event: BluezEvent) {
        match event {
            BluezEvent::DeviceFound(found) => {
                if self.manager.device_by_udi(&found.path).is_some() {
                    return;
                }
                let name = found.name.clone();
                match found.into_device(self.config.bluetooth_connect_timeout()) {
                    Some(device) => {
                        info!("Found new bluetooth device '{}'", name);
                        self.manager.add_device(device);
                    }
                    None => error!("Could not create bluetooth device '{}'", name),
                }
            }
            BluezEvent::DeviceGone { path } => {
                if let Some(id) = self.device_for_udi(&path) {
                    self.bluez.disconnect(&path);
                    self.manager.remove_device(id);
                }
            }
            BluezEvent::Link { path, up } => match self.device_for_udi(&path) {
                Some(id) => self.manager.link_changed(id, up),
                None => debug!("Link change for unknown bluetooth device {}", path),
            },
        }
    }

    fn device_for_udi(&self, udi: &str) -> Option<DeviceId> {
        self.manager.device_by_udi(udi).map(|d| d.id())
    }
}

/// Device states in which a bluetooth link is no longer wanted.
fn drops_link(state: DeviceState) -> bool {
    matches!(
        state,
        DeviceState::Disconnected
            | DeviceState::Failed
            | DeviceState::Unavailable
            | DeviceState::Unmanaged
    )
}

/// Next kernel event, or never when hotplug is disabled. A monitor that
/// fails is dropped.
async fn next_hotplug(monitor: &mut Option<UdevMonitor>) -> HotplugEvent {
    let result = match monitor.as_mut() {
        Some(socket) => socket.recv().await,
        None => return std::future::pending().await,
    };
    match result {
        Ok(event) => event,
        Err(e) => {
            warn!("udev monitor failed, hotplug disabled: {}", e);
            *monitor = None;
            std::future::pending().await
        }
    }
}

/// Sleep until `deadline`, or forever without one.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
