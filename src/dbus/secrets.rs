// Barcode Manager - D-Bus Secrets Provider
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Secrets fetched from the settings service that owns a connection.
//!
//! Each `GetSecrets` call runs on its own task and the answer comes back to
//! the event loop as a [`SecretsReply`]. Cancelling a call aborts its task,
//! so no reply is ever delivered for it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use zbus::{proxy, Connection};

use super::settings::{settings_from_wire, WireSettings};
use crate::models::Error;
use crate::services::{SecretsCall, SecretsProvider, SecretsQuery, SecretsReply};

/// The settings service may prompt the user, so allow it some time.
const GET_SECRETS_TIMEOUT: Duration = Duration::from_secs(120);

#[proxy(interface = "org.freedesktop.BarcodeManagerSettings.Connection.Secrets")]
pub trait ConnectionSecrets {
    fn get_secrets(
        &self,
        setting_name: &str,
        hints: Vec<String>,
        request_new: bool,
    ) -> zbus::Result<WireSettings>;
}

/// Secrets provider backed by the settings services on the bus.
pub struct DbusSecrets {
    conn: Connection,
    replies: mpsc::UnboundedSender<SecretsReply>,
    calls: HashMap<SecretsCall, AbortHandle>,
}

impl DbusSecrets {
    pub fn new(conn: Connection, replies: mpsc::UnboundedSender<SecretsReply>) -> Self {
        Self {
            conn,
            replies,
            calls: HashMap::new(),
        }
    }
}

async fn fetch(conn: &Connection, query: &SecretsQuery) -> Result<WireSettings, Error> {
    let proxy = ConnectionSecretsProxy::builder(conn)
        .destination(query.scope.service_name())?
        .path(query.connection_path.as_str())?
        .build()
        .await?;
    let call = proxy.get_secrets(&query.setting_name, query.hints.clone(), query.request_new);
    tokio::time::timeout(GET_SECRETS_TIMEOUT, call)
        .await
        .map_err(|_| Error::SettingsService("secrets request timed out".to_string()))?
        .map_err(Error::from)
}

impl SecretsProvider for DbusSecrets {
    fn get_secrets(&mut self, call: SecretsCall, query: SecretsQuery) {
        self.calls.retain(|_, handle| !handle.is_finished());

        let conn = self.conn.clone();
        let replies = self.replies.clone();
        debug!(
            "Requesting '{}' secrets for {} from the {} service",
            query.setting_name, query.connection_path, query.scope
        );

        let task = tokio::spawn(async move {
            let result = fetch(&conn, &query).await.map(|wire| settings_from_wire(&wire));
            if let Err(e) = &result {
                warn!("Failed to get secrets for {}: {}", query.connection_path, e);
            }
            if replies.send(SecretsReply { call, result }).is_err() {
                debug!("Dropping secrets reply {}/{}: event loop is gone", call.request, call.seq);
            }
        });
        self.calls.insert(call, task.abort_handle());
    }

    fn cancel_get_secrets(&mut self, call: SecretsCall) {
        if let Some(handle) = self.calls.remove(&call) {
            debug!("Cancelling secrets call {}/{}", call.request, call.seq);
            handle.abort();
        }
    }
}
