// Barcode Manager - Activation Requests
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! One attempt to bring a connection up on a device.
//!
//! An [`ActivationRequest`] subscribes to its device for as long as it
//! lives and follows the device through the activation pipeline. It owns a
//! private copy of the connection (secrets are merged into it), the share
//! rules installed while the connection is shared, at most one outstanding
//! secrets call, and an optional timeout deadline.
//!
//! The request never owns the device. Every operation that has to touch
//! the device takes it as an argument; the manager resolves the
//! [`DeviceId`] at the call site.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceEvent, DeviceId, SecretsNeeded, SubscriptionId};
use crate::models::{
    ActiveState, Connection, DeviceState, Error, Result, SettingsHash, StateReason,
    DBUS_ACTIVE_PATH_PREFIX,
};
use crate::services::{
    FilterAction, PacketFilter, SecretsCall, SecretsProvider, SecretsQuery, ShareRule,
};

/// Handle of an activation request inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActiveId(pub u32);

impl ActiveId {
    pub fn object_path(&self) -> String {
        format!("{}/{}", DBUS_ACTIVE_PATH_PREFIX, self.0)
    }

    pub fn from_object_path(path: &str) -> Option<Self> {
        path.strip_prefix(DBUS_ACTIVE_PATH_PREFIX)?
            .strip_prefix('/')?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for ActiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a request ended without reaching `Activated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActivationError {
    #[error("activation failed (reason '{0}')")]
    ActivationFailed(StateReason),

    #[error("timed out waiting for activation")]
    TimeoutExpired,
}

pub type ActivationOutcome = std::result::Result<ActiveState, ActivationError>;

/// Knobs set when the request is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationOptions {
    /// Give up if the device is not Activated within this time.
    pub timeout: Option<Duration>,
    /// Waiters get the current state straight away.
    pub nowait: bool,
}

/// Parameters describing what to activate.
#[derive(Debug, Clone)]
pub struct ActivationSpec {
    pub connection: Connection,
    pub connection_path: String,
    pub specific_object: Option<String>,
    pub user_requested: bool,
    pub assumed: bool,
    pub options: ActivationOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingSecrets {
    call: SecretsCall,
    setting_name: String,
}

/// What processing device events changed on the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestUpdate {
    pub state_changed: bool,
    pub finished: bool,
}

#[derive(Debug)]
pub struct ActivationRequest {
    id: ActiveId,
    connection: Connection,
    connection_path: String,
    specific_object: Option<String>,
    device: DeviceId,
    user_requested: bool,
    assumed: bool,
    options: ActivationOptions,

    subscription: Option<SubscriptionId>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,

    state: ActiveState,
    is_default: bool,
    is_default6: bool,
    share_rules: Vec<ShareRule>,
    shared: bool,

    secrets: Option<PendingSecrets>,
    next_seq: u64,

    deadline: Option<Instant>,
    outcome: Option<ActivationOutcome>,
    waiters: Vec<oneshot::Sender<ActivationOutcome>>,
}

impl ActivationRequest {
    /// Create a request and subscribe it to `device`.
    pub fn new(id: ActiveId, spec: ActivationSpec, device: &mut Device) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let subscription = device.subscribe(tx);
        let deadline = spec.options.timeout.map(|t| Instant::now() + t);

        debug!(
            "({}): activation request {} for '{}'",
            device.iface(),
            id,
            spec.connection.id()
        );

        Self {
            id,
            connection: spec.connection,
            connection_path: spec.connection_path,
            specific_object: spec.specific_object,
            device: device.id(),
            user_requested: spec.user_requested,
            assumed: spec.assumed,
            options: spec.options,
            subscription: Some(subscription),
            events,
            state: ActiveState::from_device_state(device.state()),
            is_default: false,
            is_default6: false,
            share_rules: Vec::new(),
            shared: false,
            secrets: None,
            next_seq: 0,
            deadline,
            outcome: None,
            waiters: Vec::new(),
        }
    }

    pub fn id(&self) -> ActiveId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_path(&self) -> &str {
        &self.connection_path
    }

    pub fn service_name(&self) -> &'static str {
        self.connection.scope().service_name()
    }

    /// Path of the specific object, `/` when there is none.
    pub fn specific_object(&self) -> &str {
        self.specific_object.as_deref().unwrap_or("/")
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn user_requested(&self) -> bool {
        self.user_requested
    }

    pub fn assumed(&self) -> bool {
        self.assumed
    }

    pub fn state(&self) -> ActiveState {
        self.state
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn is_default6(&self) -> bool {
        self.is_default6
    }

    /// Returns true when the flag changed.
    pub fn set_default(&mut self, default: bool) -> bool {
        std::mem::replace(&mut self.is_default, default) != default
    }

    pub fn set_default6(&mut self, default: bool) -> bool {
        std::mem::replace(&mut self.is_default6, default) != default
    }

    pub fn outcome(&self) -> Option<ActivationOutcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn has_pending_secrets(&self) -> bool {
        self.secrets.is_some()
    }

    // ========================================================================
    // Device events
    // ========================================================================

    /// Drain queued device events in order.
    pub fn process_events(&mut self, secrets: &mut dyn SecretsProvider) -> RequestUpdate {
        let mut update = RequestUpdate::default();
        while let Ok(event) = self.events.try_recv() {
            let was_finished = self.is_finished();
            update.state_changed |= self.handle_event(event, secrets);
            update.finished |= !was_finished && self.is_finished();
        }
        update
    }

    fn handle_event(&mut self, event: DeviceEvent, secrets: &mut dyn SecretsProvider) -> bool {
        match event {
            DeviceEvent::StateChanged { new, reason, .. } => self.device_state_changed(new, reason),
            DeviceEvent::NeedSecrets { secrets: needed, .. } => {
                self.get_secrets(needed, secrets);
                false
            }
            DeviceEvent::LinkRequested { .. } => false,
        }
    }

    fn device_state_changed(&mut self, new: DeviceState, reason: StateReason) -> bool {
        let state = ActiveState::from_device_state(new);
        if state == ActiveState::Unknown {
            self.is_default = false;
            self.is_default6 = false;
        }

        match new {
            DeviceState::Activated => self.finish(Ok(ActiveState::Activated)),
            DeviceState::Failed
            | DeviceState::Disconnected
            | DeviceState::Unavailable
            | DeviceState::Unmanaged => self.finish(Err(ActivationError::ActivationFailed(reason))),
            _ => {}
        }

        std::mem::replace(&mut self.state, state) != state
    }

    fn finish(&mut self, outcome: ActivationOutcome) {
        if self.outcome.is_some() {
            return;
        }
        match outcome {
            Ok(_) => info!("Activation request {} for '{}' succeeded", self.id, self.connection.id()),
            Err(e) => info!("Activation request {} for '{}': {}", self.id, self.connection.id(), e),
        }
        self.deadline = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome);
        }
        self.outcome = Some(outcome);
    }

    /// Receiver for the final outcome of the request.
    ///
    /// With `nowait` set the current state is delivered at once.
    pub fn wait(&mut self) -> oneshot::Receiver<ActivationOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Some(outcome) = self.outcome {
            let _ = tx.send(outcome);
        } else if self.options.nowait {
            let _ = tx.send(Ok(self.state));
        } else {
            self.waiters.push(tx);
        }
        rx
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    fn get_secrets(&mut self, needed: SecretsNeeded, provider: &mut dyn SecretsProvider) {
        self.cancel_secrets(provider);

        let call = SecretsCall {
            request: self.id,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        debug!(
            "Activation request {}: asking for '{}' secrets",
            self.id, needed.setting_name
        );
        provider.get_secrets(
            call,
            SecretsQuery {
                scope: self.connection.scope(),
                connection_path: self.connection_path.clone(),
                setting_name: needed.setting_name.clone(),
                hints: needed.hints,
                request_new: needed.request_new,
            },
        );
        self.secrets = Some(PendingSecrets {
            call,
            setting_name: needed.setting_name,
        });
    }

    /// Cancel the outstanding secrets call, if any.
    pub fn cancel_secrets(&mut self, provider: &mut dyn SecretsProvider) {
        if let Some(pending) = self.secrets.take() {
            provider.cancel_get_secrets(pending.call);
        }
    }

    /// Handle the answer to a secrets call. Returns false for a call this
    /// request is no longer waiting for.
    pub fn secrets_reply(
        &mut self,
        call: SecretsCall,
        result: Result<SettingsHash>,
        device: &mut Device,
    ) -> bool {
        let pending = match self.secrets.take() {
            Some(p) if p.call == call => p,
            other => {
                self.secrets = other;
                debug!("Activation request {}: ignoring stale secrets reply", self.id);
                return false;
            }
        };

        let merged = result.and_then(|secrets| {
            self.connection
                .merge_secrets(&pending.setting_name, &secrets)
                .map_err(|e| Error::SettingsService(e.to_string()))
        });

        match merged {
            Ok(()) => device.secrets_updated(&self.connection, &pending.setting_name),
            Err(e) => {
                warn!(
                    "({}): failed to get '{}' secrets: {}",
                    device.iface(),
                    pending.setting_name,
                    e
                );
                if let Err(e) = device.state_changed(DeviceState::Failed, StateReason::NoSecrets) {
                    debug!("({}): {}", device.iface(), e);
                }
                self.finish(Err(ActivationError::ActivationFailed(StateReason::NoSecrets)));
            }
        }
        true
    }

    // ========================================================================
    // Sharing
    // ========================================================================

    pub fn add_share_rule(&mut self, rule: ShareRule) {
        self.share_rules.push(rule);
    }

    pub fn share_rules(&self) -> &[ShareRule] {
        &self.share_rules
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Install the share rules in order, or remove them in reverse order and
    /// forget them.
    pub fn set_shared(&mut self, shared: bool, filter: &mut dyn PacketFilter) {
        if shared {
            for rule in &self.share_rules {
                if let Err(e) = filter.apply(FilterAction::Insert, rule) {
                    warn!("Failed to insert sharing rule '{}': {}", rule.rule, e);
                }
            }
        } else {
            for rule in self.share_rules.iter().rev() {
                if let Err(e) = filter.apply(FilterAction::Delete, rule) {
                    warn!("Failed to delete sharing rule '{}': {}", rule.rule, e);
                }
            }
            self.share_rules.clear();
        }
        self.shared = shared;
    }

    // ========================================================================
    // Timeout & teardown
    // ========================================================================

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail with `TimeoutExpired` once the deadline passed. The device is
    /// not touched.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline && self.outcome.is_none() => {
                warn!(
                    "Activation request {} for '{}' timed out",
                    self.id,
                    self.connection.id()
                );
                self.finish(Err(ActivationError::TimeoutExpired));
                true
            }
            _ => false,
        }
    }

    /// Stop following the device: unsubscribe, cancel secrets, drop share
    /// rules. Waiters still pending get `ActivationFailed(reason)`.
    pub fn detach(
        &mut self,
        device: Option<&mut Device>,
        reason: StateReason,
        secrets: &mut dyn SecretsProvider,
        filter: &mut dyn PacketFilter,
    ) {
        if let (Some(device), Some(sub)) = (device, self.subscription.take()) {
            device.unsubscribe(sub);
        }
        self.cancel_secrets(secrets);
        if self.shared || !self.share_rules.is_empty() {
            self.set_shared(false, filter);
        }
        self.finish(Err(ActivationError::ActivationFailed(reason)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{bt_device, hidraw_device, ADDR};
    use crate::device::BtCapabilities;
    use crate::models::connection::tests::bt_connection;
    use crate::models::{ConnectionScope, SettingMap, SettingsHash};
    use crate::services::firewall::tests::RecordingFilter;
    use crate::services::secrets::tests::{RecordingSecrets, SecretsOp};

    fn spec(connection: Connection, options: ActivationOptions) -> ActivationSpec {
        ActivationSpec {
            connection,
            connection_path: "/org/freedesktop/BarcodeManagerSettings/0".into(),
            specific_object: None,
            user_requested: true,
            assumed: false,
            options,
        }
    }

    fn hidraw_connection() -> Connection {
        use crate::models::connection::{SETTING_CONNECTION, SETTING_HIDRAW};
        let mut hash = SettingsHash::new();
        let mut con = SettingMap::new();
        con.insert("id".into(), "usb".into());
        con.insert("uuid".into(), uuid::Uuid::new_v4().to_string().into());
        con.insert("type".into(), SETTING_HIDRAW.into());
        hash.insert(SETTING_CONNECTION.into(), con);
        hash.insert(SETTING_HIDRAW.into(), SettingMap::new());
        Connection::new(ConnectionScope::System, hash).expect("valid")
    }

    fn pin_secrets(pin: &str) -> SettingsHash {
        let mut hash = SettingsHash::new();
        let mut bt = SettingMap::new();
        bt.insert("pin".into(), pin.into());
        hash.insert("bluetooth".into(), bt);
        hash
    }

    /// DUN device sitting in NeedAuth with one secrets call outstanding.
    fn dun_needing_pin() -> (Device, ActivationRequest, RecordingSecrets) {
        let mut dev = bt_device("bt0", BtCapabilities::DUN);
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let conn = bt_connection("dun", ADDR, "dun", true);
        let mut req = ActivationRequest::new(
            ActiveId(0),
            spec(conn.clone(), ActivationOptions::default()),
            &mut dev,
        );
        let mut provider = RecordingSecrets::default();
        dev.activate(&conn).expect("activation starts");
        dev.link_changed(&conn, true);
        req.process_events(&mut provider);
        assert_eq!(dev.state(), DeviceState::NeedAuth);
        (dev, req, provider)
    }

    #[test]
    fn test_object_path() {
        assert_eq!(
            ActiveId(3).object_path(),
            "/org/freedesktop/BarcodeManager/ActiveConnection/3"
        );
        assert_eq!(ActiveId::from_object_path(&ActiveId(3).object_path()), Some(ActiveId(3)));
    }

    #[test]
    fn test_nowait_completes_on_activated() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let conn = hidraw_connection();
        let options = ActivationOptions {
            timeout: None,
            nowait: true,
        };
        let mut req = ActivationRequest::new(ActiveId(0), spec(conn.clone(), options), &mut dev);
        let mut provider = RecordingSecrets::default();

        dev.activate(&conn).expect("activation starts");
        let update = req.process_events(&mut provider);
        assert!(update.state_changed);
        assert!(update.finished);

        let mut rx = req.wait();
        assert_eq!(rx.try_recv().expect("ready"), Ok(ActiveState::Activated));
    }

    #[test]
    fn test_nowait_returns_current_state() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let options = ActivationOptions {
            timeout: None,
            nowait: true,
        };
        let mut req = ActivationRequest::new(ActiveId(0), spec(hidraw_connection(), options), &mut dev);
        dev.state_changed(DeviceState::Prepare, StateReason::None).expect("edge");
        req.process_events(&mut RecordingSecrets::default());

        let mut rx = req.wait();
        assert_eq!(rx.try_recv().expect("ready"), Ok(ActiveState::Activating));
    }

    #[test]
    fn test_waiter_notified_on_failure() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let mut req = ActivationRequest::new(
            ActiveId(0),
            spec(hidraw_connection(), ActivationOptions::default()),
            &mut dev,
        );
        let mut rx = req.wait();
        dev.state_changed(DeviceState::Prepare, StateReason::None).expect("edge");
        dev.state_changed(DeviceState::Failed, StateReason::ConfigFailed).expect("edge");
        req.process_events(&mut RecordingSecrets::default());

        assert_eq!(
            rx.try_recv().expect("ready"),
            Err(ActivationError::ActivationFailed(StateReason::ConfigFailed))
        );
        assert_eq!(req.state(), ActiveState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_device_in_prepare() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let options = ActivationOptions {
            timeout: Some(Duration::from_secs(5)),
            nowait: false,
        };
        let mut req = ActivationRequest::new(ActiveId(0), spec(hidraw_connection(), options), &mut dev);
        let mut rx = req.wait();
        dev.state_changed(DeviceState::Prepare, StateReason::None).expect("edge");
        req.process_events(&mut RecordingSecrets::default());

        assert!(!req.check_timeout(Instant::now()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(req.check_timeout(Instant::now()));

        assert_eq!(rx.try_recv().expect("ready"), Err(ActivationError::TimeoutExpired));
        assert_eq!(dev.state(), DeviceState::Prepare);
        assert!(req.deadline().is_none());
    }

    #[test]
    fn test_need_secrets_issues_one_call() {
        let (_dev, req, provider) = dun_needing_pin();
        let (call, query) = provider.last_get().expect("secrets requested");
        assert_eq!(call.request, req.id());
        assert_eq!(query.setting_name, "bluetooth");
        assert_eq!(query.hints, vec!["pin".to_string()]);
        assert_eq!(provider.outstanding(), vec![call]);
    }

    #[test]
    fn test_new_secrets_request_cancels_previous() {
        let (dev, mut req, mut provider) = dun_needing_pin();
        let (first, _) = provider.last_get().expect("first call");

        req.handle_event(
            DeviceEvent::NeedSecrets {
                device: dev.id(),
                secrets: SecretsNeeded {
                    setting_name: "bluetooth".into(),
                    hints: vec!["pin".into()],
                    request_new: true,
                },
            },
            &mut provider,
        );

        let (second, query) = provider.last_get().expect("second call");
        assert_ne!(first, second);
        assert!(query.request_new);
        let cancel_at = provider
            .ops
            .iter()
            .position(|op| *op == SecretsOp::Cancel(first))
            .expect("first cancelled");
        let second_at = provider
            .ops
            .iter()
            .position(|op| matches!(op, SecretsOp::Get(c, _) if *c == second))
            .expect("second issued");
        assert!(cancel_at < second_at);
        assert_eq!(provider.outstanding(), vec![second]);
    }

    #[test]
    fn test_secrets_success_activates() {
        let (mut dev, mut req, mut provider) = dun_needing_pin();
        let (call, _) = provider.last_get().expect("call");
        assert!(req.secrets_reply(call, Ok(pin_secrets("1234")), &mut dev));
        req.process_events(&mut provider);

        assert_eq!(dev.state(), DeviceState::Activated);
        assert_eq!(req.outcome(), Some(Ok(ActiveState::Activated)));
        let bt = req.connection().bluetooth().expect("present").expect("valid");
        assert_eq!(bt.pin.as_deref(), Some("1234"));
    }

    #[test]
    fn test_stale_secrets_reply_ignored() {
        let (mut dev, mut req, provider) = dun_needing_pin();
        let (call, _) = provider.last_get().expect("call");
        let stale = SecretsCall {
            request: call.request,
            seq: call.seq + 7,
        };
        assert!(!req.secrets_reply(stale, Ok(pin_secrets("1")), &mut dev));
        assert!(req.has_pending_secrets());
        assert_eq!(dev.state(), DeviceState::NeedAuth);
    }

    #[test]
    fn test_secrets_failure_fails_request() {
        let (mut dev, mut req, provider) = dun_needing_pin();
        let (call, _) = provider.last_get().expect("call");
        assert!(req.secrets_reply(call, Ok(SettingsHash::new()), &mut dev));

        assert_eq!(dev.state(), DeviceState::Failed);
        assert_eq!(
            req.outcome(),
            Some(Err(ActivationError::ActivationFailed(StateReason::NoSecrets)))
        );
    }

    #[test]
    fn test_share_rules_removed_in_reverse() {
        let mut dev = hidraw_device("hidraw0");
        let mut req = ActivationRequest::new(
            ActiveId(0),
            spec(hidraw_connection(), ActivationOptions::default()),
            &mut dev,
        );
        let first = ShareRule::new("filter", "FORWARD -i hidraw0 -j ACCEPT");
        let second = ShareRule::new("nat", "POSTROUTING -o hidraw0 -j MASQUERADE");
        req.add_share_rule(first.clone());
        req.add_share_rule(second.clone());

        let mut filter = RecordingFilter::default();
        req.set_shared(true, &mut filter);
        req.set_shared(false, &mut filter);

        assert_eq!(
            filter.applied,
            vec![
                (FilterAction::Insert, first.clone()),
                (FilterAction::Insert, second.clone()),
                (FilterAction::Delete, second),
                (FilterAction::Delete, first),
            ]
        );
        assert!(req.share_rules().is_empty());
        assert!(!req.shared());
    }

    #[test]
    fn test_detach_unsubscribes_and_cancels() {
        let (mut dev, mut req, mut provider) = dun_needing_pin();
        let mut rx = req.wait();
        let before = dev.subscriber_count();
        req.detach(
            Some(&mut dev),
            StateReason::UserRequested,
            &mut provider,
            &mut RecordingFilter::default(),
        );

        assert_eq!(dev.subscriber_count(), before - 1);
        assert!(provider.outstanding().is_empty());
        assert!(!req.has_pending_secrets());
        assert_eq!(
            rx.try_recv().expect("ready"),
            Err(ActivationError::ActivationFailed(StateReason::UserRequested))
        );
    }

    #[test]
    fn test_defaults_cleared_when_deactivated() {
        let mut dev = hidraw_device("hidraw0");
        dev.set_managed(true, StateReason::NowManaged).expect("managed");
        let conn = hidraw_connection();
        let mut req = ActivationRequest::new(
            ActiveId(0),
            spec(conn.clone(), ActivationOptions::default()),
            &mut dev,
        );
        let mut provider = RecordingSecrets::default();
        dev.activate(&conn).expect("activation starts");
        req.process_events(&mut provider);
        req.set_default(true);
        req.set_default6(true);

        dev.deactivate(StateReason::UserRequested).expect("deactivated");
        req.process_events(&mut provider);
        assert!(!req.is_default());
        assert!(!req.is_default6());
        assert_eq!(req.state(), ActiveState::Unknown);
    }
}
