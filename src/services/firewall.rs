// Barcode Manager - Packet Filter
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Packet-filter rules installed while a connection is shared.
//!
//! The iptables backend runs the commands on a worker task, one at a time
//! and in submission order, so the event loop never waits on a child
//! process.

use std::process::Command;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{Error, Result};

/// One rule: a table and the rule text without the action flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRule {
    pub table: String,
    pub rule: String,
}

impl ShareRule {
    pub fn new(table: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rule: rule.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Insert,
    Delete,
}

impl FilterAction {
    fn flag(self) -> &'static str {
        match self {
            Self::Insert => "--insert",
            Self::Delete => "--delete",
        }
    }
}

/// Something that can add and remove packet-filter rules.
pub trait PacketFilter {
    fn apply(&mut self, action: FilterAction, rule: &ShareRule) -> Result<()>;
}

/// Arguments passed to iptables for one rule change.
pub fn iptables_args(action: FilterAction, rule: &ShareRule) -> Vec<String> {
    let mut args = vec![
        "--table".to_string(),
        rule.table.clone(),
        action.flag().to_string(),
    ];
    args.extend(rule.rule.split_whitespace().map(str::to_string));
    args
}

/// Packet filter backed by the `iptables` binary.
pub struct IptablesFilter {
    tx: mpsc::UnboundedSender<(FilterAction, ShareRule)>,
}

impl IptablesFilter {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(binary: impl Into<String>) -> Self {
        let binary = binary.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<(FilterAction, ShareRule)>();

        tokio::spawn(async move {
            while let Some((action, rule)) = rx.recv().await {
                let bin = binary.clone();
                let args = iptables_args(action, &rule);
                let res = tokio::task::spawn_blocking(move || run(&bin, &args)).await;
                match res {
                    Ok(Ok(())) => debug!("iptables {:?} {} '{}'", action, rule.table, rule.rule),
                    Ok(Err(e)) => warn!("Failed to apply sharing rule '{}': {}", rule.rule, e),
                    Err(e) => warn!("iptables worker task failed: {}", e),
                }
            }
        });

        Self { tx }
    }
}

fn run(binary: &str, args: &[String]) -> Result<()> {
    let output = Command::new(binary).args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::command_failed(
            format!("{} {}", binary, args.join(" ")),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

impl PacketFilter for IptablesFilter {
    fn apply(&mut self, action: FilterAction, rule: &ShareRule) -> Result<()> {
        self.tx
            .send((action, rule.clone()))
            .map_err(|_| Error::Internal("packet filter worker is gone".to_string()))
    }
}
