// Barcode Manager - Logging
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Log levels and domains.
//!
//! Levels and domains use the daemon's own names (`INFO`, `BT`, ...). They
//! are turned into `EnvFilter` directives on module targets, and the filter
//! sits behind a reload handle so `SetLogging` can change it at runtime.

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::models::{Error, Result};

const CRATE_TARGET: &str = "barcode_manager";

/// Accepted levels and their tracing equivalents.
const LEVELS: &[(&str, &str)] = &[
    ("ERR", "error"),
    ("WARN", "warn"),
    ("INFO", "info"),
    ("DEBUG", "debug"),
];

/// Domains and the module targets they cover.
const DOMAINS: &[(&str, &[&str])] = &[
    (
        "CORE",
        &["manager", "daemon", "policy", "activation", "storage"],
    ),
    ("HW", &["hotplug"]),
    ("DEVICE", &["device"]),
    ("BT", &["device::bluetooth", "dbus::bluez"]),
    ("SUSPEND", &["dbus::service"]),
    ("SETTINGS", &["dbus::settings", "dbus::secrets", "models"]),
    ("SHARING", &["services::firewall"]),
];

fn parse_level(level: &str) -> Result<&'static str> {
    LEVELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(level.trim()))
        .map(|(_, directive)| *directive)
        .ok_or_else(|| Error::InvalidLoggingLevel(level.to_string()))
}

/// Module targets for a comma separated domain list. `None` means all.
fn parse_domains(domains: &str) -> Result<Option<Vec<&'static str>>> {
    let mut targets = Vec::new();
    for domain in domains.split([',', ' ']).filter(|d| !d.is_empty()) {
        if domain.eq_ignore_ascii_case("ALL") {
            return Ok(None);
        }
        let (_, modules) = DOMAINS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(domain))
            .ok_or_else(|| Error::InvalidLoggingDomain(domain.to_string()))?;
        for module in modules.iter() {
            if !targets.contains(module) {
                targets.push(*module);
            }
        }
    }
    Ok(Some(targets))
}

/// `EnvFilter` directives for a level and a domain list. Errors from
/// disabled domains are still shown.
pub fn filter_directives(level: &str, domains: &str) -> Result<String> {
    let level = parse_level(level)?;
    let directives = match parse_domains(domains)? {
        None => format!("warn,{}={}", CRATE_TARGET, level),
        Some(targets) => {
            let mut out = format!("warn,{}=error", CRATE_TARGET);
            for target in targets {
                out.push_str(&format!(",{}::{}={}", CRATE_TARGET, target, level));
            }
            out
        }
    };
    Ok(directives)
}

/// Runtime handle on the installed log filter.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    level: String,
    domains: String,
}

impl LogControl {
    /// Install the global subscriber. `RUST_LOG` wins over the given level
    /// and domains when it is set.
    pub fn init(level: &str, domains: &str) -> Result<Self> {
        let directives = filter_directives(level, domains)?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
        let (filter, handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("logging already initialised: {}", e)))?;

        Ok(Self {
            handle,
            level: level.to_uppercase(),
            domains: domains.to_uppercase(),
        })
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn domains(&self) -> &str {
        &self.domains
    }

    /// Change level and domains. An empty argument keeps the current value.
    pub fn set_logging(&mut self, level: &str, domains: &str) -> Result<()> {
        let level = if level.is_empty() { self.level.clone() } else { level.to_uppercase() };
        let domains = if domains.is_empty() { self.domains.clone() } else { domains.to_uppercase() };

        let directives = filter_directives(&level, &domains)?;
        self.handle
            .reload(EnvFilter::new(&directives))
            .map_err(|e| Error::Internal(format!("failed to reload log filter: {}", e)))?;

        info!("Logging set to level {} for domains {}", level, domains);
        self.level = level;
        self.domains = domains;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_domains() {
        assert_eq!(
            filter_directives("debug", "ALL").expect("valid"),
            "warn,barcode_manager=debug"
        );
    }

    #[test]
    fn test_selected_domains() {
        let directives = filter_directives("INFO", "HW,BT").expect("valid");
        assert!(directives.starts_with("warn,barcode_manager=error"));
        assert!(directives.contains("barcode_manager::hotplug=info"));
        assert!(directives.contains("barcode_manager::device::bluetooth=info"));
        assert!(!directives.contains("barcode_manager::manager"));
    }

    #[test]
    fn test_duplicate_targets_listed_once() {
        let directives = filter_directives("WARN", "BT,BT").expect("valid");
        assert_eq!(directives.matches("dbus::bluez").count(), 1);
    }

    #[test]
    fn test_unknown_level_and_domain() {
        assert!(matches!(
            filter_directives("LOUD", "ALL"),
            Err(Error::InvalidLoggingLevel(_))
        ));
        assert!(matches!(
            filter_directives("INFO", "CORE,WIFI"),
            Err(Error::InvalidLoggingDomain(d)) if d == "WIFI"
        ));
    }
}
