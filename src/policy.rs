// Barcode Manager - Policy
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Default-connection policy.
//!
//! The policy listens to manager events and marks exactly one activated
//! request as the default. It owns no devices or connections; everything
//! goes through the manager.

use tracing::debug;

use crate::activation::ActiveId;
use crate::manager::{Manager, ManagerEvent};
use crate::models::DeviceState;

#[derive(Debug, Default)]
pub struct Policy {
    current: Option<ActiveId>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The request currently marked default.
    pub fn current(&self) -> Option<ActiveId> {
        self.current
    }

    /// React to one manager event.
    pub fn handle(&mut self, manager: &mut Manager, event: &ManagerEvent) {
        match event {
            ManagerEvent::DeviceStateChanged { .. }
            | ManagerEvent::DeviceRemoved(_)
            | ManagerEvent::ActiveConnectionRemoved(_)
            | ManagerEvent::StateChanged(_) => self.update_default(manager),
            _ => {}
        }
    }

    /// Among requests whose device is activated, the one on the device with
    /// the lowest non-zero priority wins. Ties go to the oldest request.
    pub fn best_request(manager: &Manager) -> Option<ActiveId> {
        manager
            .requests()
            .filter_map(|request| {
                let device = manager.device(request.device())?;
                let priority = device.priority();
                (device.state() == DeviceState::Activated && priority > 0)
                    .then_some((priority, request.id()))
            })
            .min()
            .map(|(_, id)| id)
    }

    pub fn update_default(&mut self, manager: &mut Manager) {
        let best = Self::best_request(manager);

        let others: Vec<ActiveId> = manager
            .active_connections()
            .into_iter()
            .filter(|id| Some(*id) != best)
            .collect();
        for id in others {
            manager.set_request_default(id, false, false);
        }
        if let Some(id) = best {
            manager.set_request_default(id, true, true);
        }

        if best != self.current {
            match best {
                Some(id) => debug!("Policy set {} as default", id),
                None => debug!("Policy cleared the default connection"),
            }
            self.current = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{bt_device, hidraw_device, ADDR};
    use crate::device::BtCapabilities;
    use crate::manager::tests::{hidraw_settings, manager};
    use crate::models::connection::tests::bt_settings;
    use crate::models::{ConnectionScope, SYSTEM_SETTINGS_SERVICE};
    use crate::services::Caller;

    fn run(policy: &mut Policy, manager: &mut Manager, rx: &mut tokio::sync::mpsc::UnboundedReceiver<ManagerEvent>) {
        while let Ok(event) = rx.try_recv() {
            policy.handle(manager, &event);
        }
    }

    #[test]
    fn test_single_activated_request_is_default() {
        let mut mgr = manager();
        let mut rx = mgr.subscribe();
        let mut policy = Policy::new();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            "/org/freedesktop/BarcodeManagerSettings/0",
            hidraw_settings("usb", true),
        )
        .expect("valid");
        mgr.add_device(hidraw_device("hidraw0")).expect("added");
        run(&mut policy, &mut mgr, &mut rx);

        let request = mgr.requests().next().expect("request");
        assert!(request.is_default());
        assert!(request.is_default6());
        assert_eq!(policy.current(), Some(request.id()));
    }

    #[test]
    fn test_lowest_priority_wins() {
        let mut mgr = manager();
        let mut rx = mgr.subscribe();
        let mut policy = Policy::new();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            "/org/freedesktop/BarcodeManagerSettings/0",
            hidraw_settings("usb", true),
        )
        .expect("valid");
        mgr.connection_added(
            ConnectionScope::System,
            "/org/freedesktop/BarcodeManagerSettings/1",
            bt_settings("pan", ADDR, "panu", false),
        )
        .expect("valid");

        let bt = mgr.add_device(bt_device("bt0", BtCapabilities::NAP)).expect("added");
        mgr.activate_connection(
            Caller::ROOT,
            SYSTEM_SETTINGS_SERVICE,
            "/org/freedesktop/BarcodeManagerSettings/1",
            &bt.object_path(),
            None,
        )
        .expect("started");
        mgr.link_changed(bt, true);
        mgr.add_device(hidraw_device("hidraw0")).expect("added");
        run(&mut policy, &mut mgr, &mut rx);

        let best = Policy::best_request(&mgr).expect("best");
        let best_device = mgr.request(best).map(|r| r.device()).and_then(|d| mgr.device(d));
        let lowest = mgr.devices().iter().map(|d| d.priority()).min();
        assert_eq!(best_device.map(|d| d.priority()), lowest);
        assert_eq!(mgr.requests().filter(|r| r.is_default()).count(), 1);
    }

    #[test]
    fn test_default_cleared_when_deactivated() {
        let mut mgr = manager();
        let mut rx = mgr.subscribe();
        let mut policy = Policy::new();
        mgr.set_service_running(ConnectionScope::System, true);
        mgr.connection_added(
            ConnectionScope::System,
            "/org/freedesktop/BarcodeManagerSettings/0",
            hidraw_settings("usb", true),
        )
        .expect("valid");
        mgr.add_device(hidraw_device("hidraw0")).expect("added");
        run(&mut policy, &mut mgr, &mut rx);
        let active = policy.current().expect("default set");

        mgr.deactivate_connection(Caller::ROOT, &active.object_path())
            .expect("deactivated");
        run(&mut policy, &mut mgr, &mut rx);
        assert_eq!(policy.current(), None);
    }
}
