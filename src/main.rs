// Barcode Manager - Main Entry Point
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! # Barcode Manager
//!
//! A device and connection manager daemon for bluetooth and HID barcode
//! scanners on Linux.
//!
//! This is the main entry point for the daemon.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

mod activation;
mod daemon;
mod dbus;
mod device;
mod hotplug;
mod logging;
mod manager;
mod models;
mod policy;
mod services;
mod storage;

use daemon::Daemon;
use logging::LogControl;
use models::{DaemonConfig, DEFAULT_CONFIG_FILE};

/// Human-readable application name.
pub const APP_NAME: &str = "Barcode Manager";

/// Application version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Print version information and exit.
fn print_version() {
    println!("{} {}", APP_NAME, VERSION);
    println!("Copyright (C) 2026 The Barcode Manager Authors");
    println!("License: MIT");
}

/// Print help information and exit.
fn print_help() {
    println!("Usage: {} [OPTIONS]", env::args().next().unwrap_or_else(|| "barcode-manager".to_string()));
    println!();
    println!("Device and connection manager for barcode scanners.");
    println!();
    println!("Options:");
    println!("  -h, --help              Show this help message and exit");
    println!("  -v, --version           Show version information and exit");
    println!("  -d, --debug             Enable debug logging");
    println!("  -n, --no-daemon         Stay in the foreground (always the case)");
    println!("  --config PATH           Configuration file (default {})", DEFAULT_CONFIG_FILE);
    println!("  --state-file PATH       State file overriding the configured one");
    println!("  --pid-file PATH         Write the process id to PATH");
    println!("  --log-level LEVEL       ERR, WARN, INFO or DEBUG");
    println!("  --log-domains LIST      Comma separated log domains, or ALL");
    println!();
    println!("Environment variables:");
    println!("  RUST_LOG                Set log filter (overrides --log-level)");
}

/// Command line options.
#[derive(Debug, Default)]
struct Options {
    debug: bool,
    config: Option<PathBuf>,
    state_file: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    log_level: Option<String>,
    log_domains: Option<String>,
}

/// What to do after parsing the command line.
enum Parsed {
    Run(Options),
    Exit(ExitCode),
}

fn parse_args(args: &[String]) -> Parsed {
    let mut options = Options::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Option<String> {
            let value = inline.clone().or_else(|| iter.next().cloned());
            if value.is_none() {
                eprintln!("Option '{}' needs a value.", name);
            }
            value
        };

        match name {
            "-h" | "--help" => {
                print_help();
                return Parsed::Exit(ExitCode::SUCCESS);
            }
            "-v" | "--version" => {
                print_version();
                return Parsed::Exit(ExitCode::SUCCESS);
            }
            "-d" | "--debug" => options.debug = true,
            "-n" | "--no-daemon" => {}
            "--config" => match value(name) {
                Some(v) => options.config = Some(PathBuf::from(v)),
                None => return Parsed::Exit(ExitCode::FAILURE),
            },
            "--state-file" => match value(name) {
                Some(v) => options.state_file = Some(PathBuf::from(v)),
                None => return Parsed::Exit(ExitCode::FAILURE),
            },
            "--pid-file" => match value(name) {
                Some(v) => options.pid_file = Some(PathBuf::from(v)),
                None => return Parsed::Exit(ExitCode::FAILURE),
            },
            "--log-level" => match value(name) {
                Some(v) => options.log_level = Some(v),
                None => return Parsed::Exit(ExitCode::FAILURE),
            },
            "--log-domains" => match value(name) {
                Some(v) => options.log_domains = Some(v),
                None => return Parsed::Exit(ExitCode::FAILURE),
            },
            _ => {
                eprintln!("Unknown option: {}", arg);
                eprintln!("Try '--help' for more information.");
                return Parsed::Exit(ExitCode::FAILURE);
            }
        }
    }
    Parsed::Run(options)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Parsed::Run(options) => options,
        Parsed::Exit(code) => return code,
    };

    let config_path = options
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = match DaemonConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {:?}: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(state_file) = options.state_file {
        config.main.state_file = state_file;
    }

    let level = match (&options.log_level, options.debug) {
        (Some(level), _) => level.clone(),
        (None, true) => "DEBUG".to_string(),
        (None, false) => config.logging.level.clone(),
    };
    let domains = options
        .log_domains
        .clone()
        .unwrap_or_else(|| config.logging.domains.clone());
    let logging = match LogControl::init(&level, &domains) {
        Ok(logging) => logging,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);
    tracing::debug!("Configuration: {:?}", config);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start the async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result: models::Result<()> = runtime.block_on(async move {
        let (daemon, channels) = Daemon::start(config, logging, options.pid_file).await?;
        daemon.run(channels).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_paths_and_levels() {
        let Parsed::Run(options) = parse_args(&args(&[
            "--config",
            "/tmp/bm.conf",
            "--state-file=/tmp/bm.state",
            "--log-level",
            "WARN",
            "-d",
            "--no-daemon",
        ])) else {
            panic!("expected options");
        };
        assert_eq!(options.config, Some(PathBuf::from("/tmp/bm.conf")));
        assert_eq!(options.state_file, Some(PathBuf::from("/tmp/bm.state")));
        assert_eq!(options.log_level.as_deref(), Some("WARN"));
        assert!(options.debug);
    }

    #[test]
    fn test_parse_rejects_unknown_and_missing_values() {
        assert!(matches!(parse_args(&args(&["--bogus"])), Parsed::Exit(_)));
        assert!(matches!(parse_args(&args(&["--pid-file"])), Parsed::Exit(_)));
        assert!(matches!(parse_args(&args(&["--help"])), Parsed::Exit(_)));
    }
}
