// Barcode Manager - Authorization
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Permission checks for privileged bus methods.

use std::fmt;

use crate::models::{Error, Result};

/// Privileged operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    EnableDisable,
    Sleep,
    UseConnection,
    SetLogging,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnableDisable => "org.freedesktop.BarcodeManager.enable-disable",
            Self::Sleep => "org.freedesktop.BarcodeManager.sleep-wake",
            Self::UseConnection => "org.freedesktop.BarcodeManager.use-connection",
            Self::SetLogging => "org.freedesktop.BarcodeManager.set-logging",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
}

impl Caller {
    pub const ROOT: Caller = Caller { uid: 0 };
}

pub trait Authorizer {
    fn is_authorized(&self, caller: Caller, permission: Permission) -> bool;

    /// `PermissionDenied` unless the caller may perform `permission`.
    fn check(&self, caller: Caller, permission: Permission) -> Result<()> {
        if self.is_authorized(caller, permission) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "uid {} may not use {}",
                caller.uid, permission
            )))
        }
    }
}

/// Allows root and a configured list of users.
#[derive(Debug, Clone, Default)]
pub struct UidAuthorizer {
    allowed: Vec<u32>,
}

impl UidAuthorizer {
    pub fn new(allowed: Vec<u32>) -> Self {
        Self { allowed }
    }
}

impl Authorizer for UidAuthorizer {
    fn is_authorized(&self, caller: Caller, _permission: Permission) -> bool {
        caller.uid == 0 || self.allowed.contains(&caller.uid)
    }
}
