// Barcode Manager - Collaborator Services
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Seams to the world outside the core engine:
//! - Secrets: fetching connection secrets from a settings service
//! - Firewall: packet-filter rules for shared connections
//! - Auth: permission checks for privileged methods

pub mod auth;
pub mod firewall;
pub mod secrets;

pub use auth::{Authorizer, Caller, Permission, UidAuthorizer};
pub use firewall::{FilterAction, IptablesFilter, PacketFilter, ShareRule};
pub use secrets::{SecretsCall, SecretsProvider, SecretsQuery, SecretsReply};
