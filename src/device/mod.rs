// Barcode Manager - Devices
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! The generic device entity and its state machine.
//!
//! A [`Device`] owns identity, capabilities and state, and wraps exactly
//! one [`VariantKind`]. Every accepted state change is delivered, in
//! order, to each subscriber over its own channel as a [`DeviceEvent`].
//! Devices are owned by the manager; everything else refers to them by
//! [`DeviceId`].

pub mod bluetooth;
pub mod hidraw;
pub mod serial;
pub mod variant;

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{
    Capabilities, Connection, DeviceState, DeviceType, Error, Result, StateReason,
    TransitionError, DBUS_DEVICE_PATH_PREFIX,
};

pub use bluetooth::{BluetoothVariant, BtCapabilities};
pub use hidraw::HidrawVariant;
pub use serial::SerialVariant;
pub use variant::{
    DeviceIdentity, DeviceVariant, IncompatibilityReason, LinkRequest, SecretsNeeded,
    StageOutcome, VariantKind,
};

/// Handle of a device inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Exported object path.
    pub fn object_path(&self) -> String {
        format!("{}/{}", DBUS_DEVICE_PATH_PREFIX, self.0)
    }

    pub fn from_object_path(path: &str) -> Option<Self> {
        path.strip_prefix(DBUS_DEVICE_PATH_PREFIX)?
            .strip_prefix('/')?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token returned by [`Device::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Events a device publishes to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChanged {
        device: DeviceId,
        new: DeviceState,
        old: DeviceState,
        reason: StateReason,
    },
    /// The device entered `NeedAuth` and waits for these secrets.
    NeedSecrets {
        device: DeviceId,
        secrets: SecretsNeeded,
    },
    /// The device asks for an external link to be brought up.
    LinkRequested {
        device: DeviceId,
        request: LinkRequest,
    },
}

impl DeviceEvent {
    pub fn device(&self) -> DeviceId {
        match self {
            Self::StateChanged { device, .. }
            | Self::NeedSecrets { device, .. }
            | Self::LinkRequested { device, .. } => *device,
        }
    }
}

/// A managed piece of hardware.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    identity: DeviceIdentity,
    capabilities: Capabilities,
    state: DeviceState,
    managed: bool,
    firmware_missing: bool,
    autoconnect_inhibited: bool,
    activation_scheduled: bool,
    variant: VariantKind,
    subscribers: Vec<(SubscriptionId, UnboundedSender<DeviceEvent>)>,
    next_subscription: u64,
}

impl Device {
    /// Build a device around a variant. Returns `None` when the hardware is
    /// not something this daemon can manage.
    pub fn new(identity: DeviceIdentity, variant: VariantKind) -> Option<Self> {
        let capabilities = variant.get_capabilities();
        if !capabilities.contains(Capabilities::SUPPORTED) {
            warn!("({}): unsupported device, not managing it", identity.iface);
            return None;
        }

        Some(Self {
            id: DeviceId::default(),
            identity,
            capabilities,
            state: DeviceState::Unmanaged,
            managed: false,
            firmware_missing: false,
            autoconnect_inhibited: false,
            activation_scheduled: false,
            variant,
            subscribers: Vec::new(),
            next_subscription: 0,
        })
    }

    pub(crate) fn set_id(&mut self, id: DeviceId) {
        self.id = id;
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn udi(&self) -> &str {
        &self.identity.udi
    }

    pub fn iface(&self) -> &str {
        &self.identity.iface
    }

    pub fn driver(&self) -> &str {
        &self.identity.driver
    }

    pub fn ifindex(&self) -> Option<u32> {
        self.identity.ifindex
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn device_type(&self) -> DeviceType {
        self.variant.device_type()
    }

    pub fn variant(&self) -> &VariantKind {
        &self.variant
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn managed(&self) -> bool {
        self.managed
    }

    pub fn firmware_missing(&self) -> bool {
        self.firmware_missing
    }

    /// Lower values win when picking a default device.
    pub fn priority(&self) -> u32 {
        self.device_type().as_u32()
    }

    pub fn is_available(&self) -> bool {
        !self.firmware_missing && self.variant.is_available()
    }

    /// Activating, or an activation has been scheduled but not started yet.
    pub fn is_activating(&self) -> bool {
        self.state.is_activating() || self.activation_scheduled
    }

    pub fn set_activation_scheduled(&mut self, scheduled: bool) {
        self.activation_scheduled = scheduled;
    }

    pub fn autoconnect_inhibited(&self) -> bool {
        self.autoconnect_inhibited
    }

    pub fn set_autoconnect_inhibited(&mut self, inhibited: bool) {
        self.autoconnect_inhibited = inhibited;
    }

    /// Whether the manager may start an automatic activation now.
    pub fn autoconnect_allowed(&self) -> bool {
        self.managed
            && !self.autoconnect_inhibited
            && self.state == DeviceState::Disconnected
            && self.is_available()
    }

    pub fn check_connection_compatible(
        &self,
        connection: &Connection,
    ) -> std::result::Result<(), IncompatibilityReason> {
        self.variant.check_connection_compatible(&self.identity, connection)
    }

    pub fn get_best_auto_connection<'a>(&self, candidates: &[&'a Connection]) -> Option<&'a Connection> {
        self.variant.get_best_auto_connection(&self.identity, candidates)
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    pub fn subscribe(&mut self, tx: UnboundedSender<DeviceEvent>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, tx));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        before != self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn emit(&mut self, event: DeviceEvent) {
        self.subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Move to `new`. Requests for the current state are accepted silently;
    /// anything that is not an edge of the state machine is rejected.
    pub fn state_changed(
        &mut self,
        new: DeviceState,
        reason: StateReason,
    ) -> std::result::Result<(), TransitionError> {
        let old = self.state;
        if old == new {
            return Ok(());
        }
        if !old.can_transition(new) {
            return Err(TransitionError { from: old, to: new });
        }

        info!(
            "({}): device state change: {} -> {} (reason '{}')",
            self.identity.iface, old, new, reason
        );
        self.state = new;
        if old.is_active() && !new.is_active() {
            self.variant.deactivate();
        }

        self.emit(DeviceEvent::StateChanged {
            device: self.id,
            new,
            old,
            reason,
        });
        Ok(())
    }

    /// Start or stop managing the device.
    pub fn set_managed(&mut self, managed: bool, reason: StateReason) -> Result<()> {
        if managed == self.managed {
            return Ok(());
        }
        self.managed = managed;

        if managed {
            self.state_changed(DeviceState::Unavailable, reason)?;
            if self.is_available() {
                self.state_changed(DeviceState::Disconnected, StateReason::None)?;
            }
        } else {
            self.activation_scheduled = false;
            self.state_changed(DeviceState::Unmanaged, reason)?;
        }
        Ok(())
    }

    pub fn set_firmware_missing(&mut self, missing: bool) -> Result<()> {
        if missing == self.firmware_missing {
            return Ok(());
        }
        self.firmware_missing = missing;

        match (missing, self.state) {
            (true, DeviceState::Disconnected) => {
                self.state_changed(DeviceState::Unavailable, StateReason::FirmwareMissing)?
            }
            (false, DeviceState::Unavailable) if self.managed && self.is_available() => {
                self.state_changed(DeviceState::Disconnected, StateReason::None)?
            }
            _ => {}
        }
        Ok(())
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// Begin activating `connection`. The device must be disconnected.
    pub fn activate(&mut self, connection: &Connection) -> Result<()> {
        self.activation_scheduled = false;
        if self.state != DeviceState::Disconnected {
            return Err(Error::DeviceNotAvailable(self.identity.iface.clone()));
        }
        if let Err(e) = self.check_connection_compatible(connection) {
            return Err(Error::ConnectionInvalid(e.to_string()));
        }

        debug!("({}): activating '{}'", self.identity.iface, connection.id());
        self.state_changed(DeviceState::Prepare, StateReason::None)?;
        let outcome = self.variant.act_stage_prepare(&self.identity, connection);
        self.run_stages(outcome, connection);
        Ok(())
    }

    fn run_stages(&mut self, mut outcome: StageOutcome, connection: &Connection) {
        loop {
            match outcome {
                StageOutcome::Success => {
                    let next = match self.state {
                        DeviceState::Prepare => DeviceState::Config,
                        DeviceState::Config | DeviceState::NeedAuth => DeviceState::IpConfig,
                        DeviceState::IpConfig => DeviceState::Activated,
                        _ => return,
                    };
                    if let Err(e) = self.state_changed(next, StateReason::None) {
                        warn!("({}): {}", self.identity.iface, e);
                        return;
                    }
                    outcome = match next {
                        DeviceState::Config => self.variant.act_stage_config(&self.identity, connection),
                        DeviceState::IpConfig => {
                            self.variant.act_stage_ip_config(&self.identity, connection)
                        }
                        _ => return,
                    };
                }
                StageOutcome::Postpone => return,
                StageOutcome::WaitForLink(request) => {
                    self.emit(DeviceEvent::LinkRequested {
                        device: self.id,
                        request,
                    });
                    return;
                }
                StageOutcome::NeedSecrets(secrets) => {
                    match self.state_changed(DeviceState::NeedAuth, StateReason::None) {
                        Ok(()) => self.emit(DeviceEvent::NeedSecrets {
                            device: self.id,
                            secrets,
                        }),
                        Err(e) => warn!("({}): {}", self.identity.iface, e),
                    }
                    return;
                }
                StageOutcome::Failure(reason) => {
                    if let Err(e) = self.state_changed(DeviceState::Failed, reason) {
                        warn!("({}): {}", self.identity.iface, e);
                    }
                    return;
                }
            }
        }
    }

    /// Secrets for `setting_name` were merged into `connection`.
    pub fn secrets_updated(&mut self, connection: &Connection, setting_name: &str) {
        if self.state != DeviceState::NeedAuth {
            debug!(
                "({}): ignoring secrets for '{}' in state {}",
                self.identity.iface, setting_name, self.state
            );
            return;
        }
        let outcome = self
            .variant
            .secrets_updated(&self.identity, connection, setting_name);
        self.run_stages(outcome, connection);
    }

    /// The external link changed while `connection` is being used.
    pub fn link_changed(&mut self, connection: &Connection, up: bool) {
        if !self.state.is_active() {
            return;
        }
        let outcome = self.variant.link_changed(connection, up);
        self.run_stages(outcome, connection);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.variant.deadline()
    }

    /// Fail the activation if a variant deadline has passed.
    pub fn poll_deadline(&mut self, now: Instant) {
        if let Some(reason) = self.variant.deadline_expired(now) {
            if self.state.is_active() {
                if let Err(e) = self.state_changed(DeviceState::Failed, reason) {
                    warn!("({}): {}", self.identity.iface, e);
                }
            }
        }
    }

    /// Tear down whatever activation is in progress.
    pub fn deactivate(&mut self, reason: StateReason) -> Result<()> {
        self.activation_scheduled = false;
        if self.state.is_active() || self.state == DeviceState::Failed {
            self.state_changed(DeviceState::Disconnected, reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::connection::tests::bt_connection;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) const ADDR: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    pub(crate) fn bt_device(iface: &str, caps: BtCapabilities) -> Device {
        let variant = BluetoothVariant::new(
            "aa:bb:cc:dd:ee:ff",
            "Scanner",
            caps,
            Duration::from_secs(30),
        )
        .expect("valid address");
        Device::new(
            DeviceIdentity {
                udi: format!("/org/bluez/hci0/{}", iface),
                iface: iface.to_string(),
                driver: "bluez".to_string(),
                ifindex: None,
            },
            VariantKind::Bluetooth(variant),
        )
        .expect("supported device")
    }

    pub(crate) fn hidraw_device(iface: &str) -> Device {
        Device::new(
            DeviceIdentity {
                udi: format!("/sys/class/hidraw/{}", iface),
                iface: iface.to_string(),
                driver: "usbhid".to_string(),
                ifindex: Some(0),
            },
            VariantKind::Hidraw(HidrawVariant::new(format!("/dev/{}", iface))),
        )
        .expect("supported device")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_initial_state_unmanaged() {
        let dev = hidraw_device("hidraw0");
        assert_eq!(dev.state(), DeviceState::Unmanaged);
        assert!(!dev.managed());
    }

    #[test]
    fn test_set_managed_reaches_disconnected() {
        let mut dev = hidraw_device("hidraw0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dev.subscribe(tx);
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        assert_eq!(dev.state(), DeviceState::Disconnected);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DeviceEvent::StateChanged {
                device: dev.id(),
                new: DeviceState::Unavailable,
                old: DeviceState::Unmanaged,
                reason: StateReason::NowManaged,
            }
        );
    }

    #[test]
    fn test_rejected_transition_emits_nothing() {
        let mut dev = hidraw_device("hidraw0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dev.subscribe(tx);
        let err = dev
            .state_changed(DeviceState::Activated, StateReason::None)
            .expect_err("not an edge");
        assert_eq!(err.from, DeviceState::Unmanaged);
        assert_eq!(dev.state(), DeviceState::Unmanaged);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_same_state_is_silent() {
        let mut dev = hidraw_device("hidraw0");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dev.subscribe(tx);
        dev.state_changed(DeviceState::Unmanaged, StateReason::None).expect("no-op");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_hidraw_activation_runs_to_activated() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let conn = {
            use crate::models::connection::{SettingMap, SettingsHash, SETTING_CONNECTION, SETTING_HIDRAW};
            let mut hash = SettingsHash::new();
            let mut con = SettingMap::new();
            con.insert("id".into(), "usb".into());
            con.insert("uuid".into(), uuid::Uuid::new_v4().to_string().into());
            con.insert("type".into(), SETTING_HIDRAW.into());
            hash.insert(SETTING_CONNECTION.into(), con);
            hash.insert(SETTING_HIDRAW.into(), SettingMap::new());
            Connection::new(crate::models::ConnectionScope::System, hash).expect("valid")
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        dev.subscribe(tx);
        dev.activate(&conn).expect("activation starts");
        assert_eq!(dev.state(), DeviceState::Activated);

        let states: Vec<DeviceState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::StateChanged { new, .. } => Some(new),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                DeviceState::Prepare,
                DeviceState::Config,
                DeviceState::IpConfig,
                DeviceState::Activated
            ]
        );
    }

    #[test]
    fn test_bluetooth_dun_pipeline_with_secrets() {
        let mut dev = bt_device("bt0", BtCapabilities::DUN);
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dev.subscribe(tx);
        let mut conn = bt_connection("dun", ADDR, "dun", true);

        dev.activate(&conn).expect("activation starts");
        assert_eq!(dev.state(), DeviceState::Config);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DeviceEvent::LinkRequested { .. })));

        dev.link_changed(&conn, true);
        assert_eq!(dev.state(), DeviceState::NeedAuth);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DeviceEvent::NeedSecrets { .. })));

        let mut secrets = crate::models::SettingsHash::new();
        let mut bt = crate::models::SettingMap::new();
        bt.insert("pin".into(), "1234".into());
        secrets.insert("bluetooth".into(), bt);
        conn.merge_secrets("bluetooth", &secrets).expect("merged");
        dev.secrets_updated(&conn, "bluetooth");
        assert_eq!(dev.state(), DeviceState::Activated);

        dev.link_changed(&conn, false);
        assert_eq!(dev.state(), DeviceState::Failed);
    }

    #[test]
    fn test_activate_requires_disconnected() {
        let mut dev = bt_device("bt0", BtCapabilities::DUN);
        let conn = bt_connection("dun", ADDR, "dun", true);
        assert!(matches!(dev.activate(&conn), Err(Error::DeviceNotAvailable(_))));
    }

    #[test]
    fn test_activate_rejects_incompatible() {
        let mut dev = bt_device("bt0", BtCapabilities::DUN);
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let conn = bt_connection("pan", ADDR, "panu", true);
        assert!(matches!(dev.activate(&conn), Err(Error::ConnectionInvalid(_))));
        assert_eq!(dev.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_firmware_missing_makes_unavailable() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        dev.set_firmware_missing(true).expect("toggled");
        assert_eq!(dev.state(), DeviceState::Unavailable);
        assert!(!dev.is_available());
        assert!(!dev.autoconnect_allowed());
        dev.set_firmware_missing(false).expect("toggled");
        assert_eq!(dev.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_scheduled_activation_counts_as_activating() {
        let mut dev = hidraw_device("hidraw0");
        assert!(!dev.is_activating());
        dev.set_activation_scheduled(true);
        assert!(dev.is_activating());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut dev = hidraw_device("hidraw0");
        let (tx, rx) = mpsc::unbounded_channel();
        dev.subscribe(tx);
        drop(rx);
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        assert_eq!(dev.subscriber_count(), 0);
    }

    #[test]
    fn test_object_path_round_trip() {
        let id = DeviceId(7);
        assert_eq!(id.object_path(), "/org/freedesktop/BarcodeManager/Devices/7");
        assert_eq!(DeviceId::from_object_path(&id.object_path()), Some(id));
        assert_eq!(DeviceId::from_object_path("/org/freedesktop/Other/7"), None);
    }
}
