// Barcode Manager - Secrets Provider
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Asking a settings service for connection secrets.
//!
//! A request never blocks on the answer: [`SecretsProvider::get_secrets`]
//! starts the call and the result comes back later as a [`SecretsReply`]
//! carrying the same [`SecretsCall`] handle, which the owning activation
//! request compares against the call it is still waiting for.

use crate::activation::ActiveId;
use crate::models::{ConnectionScope, Result, SettingsHash};

/// Handle of one outstanding secrets call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretsCall {
    pub request: ActiveId,
    pub seq: u64,
}

/// What to ask the settings service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsQuery {
    pub scope: ConnectionScope,
    pub connection_path: String,
    pub setting_name: String,
    pub hints: Vec<String>,
    pub request_new: bool,
}

/// Result of a finished secrets call.
#[derive(Debug)]
pub struct SecretsReply {
    pub call: SecretsCall,
    pub result: Result<SettingsHash>,
}

/// Source of connection secrets.
pub trait SecretsProvider {
    /// Start fetching secrets. The answer arrives as a [`SecretsReply`].
    fn get_secrets(&mut self, call: SecretsCall, query: SecretsQuery);

    /// Drop interest in an outstanding call. No reply is delivered for it.
    fn cancel_get_secrets(&mut self, call: SecretsCall);
}
