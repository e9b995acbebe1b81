// Barcode Manager - Hotplug Watcher
// Copyright (C) 2026 The Barcode Manager Authors
// SPDX-License-Identifier: MIT

//! Kernel device discovery through udev.
//!
//! [`UdevSource`] enumerates the devices present in the watched subsystems
//! and [`UdevMonitor`] follows the kernel's add, change and remove events
//! for them. Both describe devices as [`RawDevice`]s. [`HotplugWatcher`]
//! decides whether a raw device is usable, resolves its driver and index,
//! and hands it to the injected device creator.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceIdentity, HidrawVariant, SerialVariant, VariantKind};

/// A device as the kernel describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    /// Kernel name, e.g. `hidraw0`.
    pub name: String,
    pub subsystem: String,
    /// Canonical sysfs path; used as the UDI.
    pub syspath: PathBuf,
    pub driver: Option<String>,
    /// `DEVTYPE` udev property.
    pub devtype: Option<String>,
    /// Numeric `type` attribute, when present.
    pub type_attr: Option<i64>,
    /// Numeric `ifindex` attribute, when present.
    pub ifindex: Option<u32>,
    /// The kernel has not created the device node yet, which happens while
    /// the driver waits for firmware.
    pub firmware_missing: bool,
    pub parent: Option<Box<RawDevice>>,
}

impl RawDevice {
    pub fn new(name: impl Into<String>, subsystem: impl Into<String>, syspath: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            subsystem: subsystem.into(),
            syspath: syspath.into(),
            driver: None,
            devtype: None,
            type_attr: None,
            ifindex: None,
            firmware_missing: false,
            parent: None,
        }
    }

    pub fn udi(&self) -> String {
        self.syspath.to_string_lossy().to_string()
    }
}

/// Change reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added(RawDevice),
    Changed(RawDevice),
    Removed(RawDevice),
}

impl HotplugEvent {
    /// Event for a udev action, `None` for actions the watcher ignores.
    pub fn from_action(action: udev::EventType, raw: RawDevice) -> Option<Self> {
        match action {
            udev::EventType::Add => Some(Self::Added(raw)),
            udev::EventType::Change => Some(Self::Changed(raw)),
            udev::EventType::Remove => Some(Self::Removed(raw)),
            _ => None,
        }
    }
}

/// Devices present right now.
pub trait DeviceSource {
    fn enumerate(&self) -> Vec<RawDevice>;
}

// ============================================================================
// Udev
// ============================================================================

fn lossy(value: &OsStr) -> String {
    value.to_string_lossy().to_string()
}

/// Describe a udev device, following at most `depth` parents.
fn raw_device(device: &udev::Device, depth: usize) -> RawDevice {
    let mut raw = RawDevice::new(
        lossy(device.sysname()),
        device.subsystem().map(lossy).unwrap_or_default(),
        device.syspath(),
    );
    raw.driver = device.driver().map(lossy);
    raw.devtype = device.property_value("DEVTYPE").map(lossy);
    raw.type_attr = numeric_attribute(device, "type");
    raw.ifindex = numeric_attribute(device, "ifindex");

    if depth > 0 {
        if let Some(parent) = device.parent() {
            raw.parent = Some(Box::new(raw_device(&parent, depth - 1)));
        }
    }
    raw
}

/// Describe a device from the watched subsystems.
fn watched_device(device: &udev::Device) -> RawDevice {
    let mut raw = raw_device(device, 2);
    raw.firmware_missing = device.devnode().is_none();
    raw
}

fn numeric_attribute<T: std::str::FromStr>(device: &udev::Device, name: &str) -> Option<T> {
    device
        .attribute_value(name)?
        .to_str()?
        .trim()
        .parse()
        .ok()
}

/// Enumerates the watched subsystems.
#[derive(Debug, Clone)]
pub struct UdevSource {
    subsystems: Vec<String>,
}

impl UdevSource {
    pub fn new(subsystems: Vec<String>) -> Self {
        Self { subsystems }
    }

    fn scan(&self) -> io::Result<Vec<RawDevice>> {
        let mut devices = Vec::new();
        for subsystem in &self.subsystems {
            let mut enumerator = udev::Enumerator::new()?;
            enumerator.match_subsystem(subsystem)?;
            for device in enumerator.scan_devices()? {
                devices.push(watched_device(&device));
            }
        }
        devices.sort_by(|a, b| a.syspath.cmp(&b.syspath));
        Ok(devices)
    }
}

impl DeviceSource for UdevSource {
    fn enumerate(&self) -> Vec<RawDevice> {
        self.scan().unwrap_or_else(|e| {
            warn!("Failed to enumerate devices: {}", e);
            Vec::new()
        })
    }
}

/// Kernel uevents for the watched subsystems.
pub struct UdevMonitor {
    socket: AsyncFd<udev::MonitorSocket>,
}

impl UdevMonitor {
    pub fn open(subsystems: &[String]) -> io::Result<Self> {
        let mut builder = udev::MonitorBuilder::new()?;
        for subsystem in subsystems {
            builder = builder.match_subsystem(subsystem)?;
        }
        let socket = AsyncFd::new(builder.listen()?)?;
        Ok(Self { socket })
    }

    /// Next event the watcher cares about.
    pub async fn recv(&mut self) -> io::Result<HotplugEvent> {
        loop {
            let mut guard = self.socket.readable_mut().await?;
            match guard.get_inner_mut().iter().next() {
                Some(event) => {
                    let raw = watched_device(&event.device());
                    debug!("udev {:?} for {}", event.event_type(), raw.name);
                    if let Some(event) = HotplugEvent::from_action(event.event_type(), raw) {
                        return Ok(event);
                    }
                }
                None => guard.clear_ready(),
            }
        }
    }
}

// ============================================================================
// Watcher
// ============================================================================

/// Builds a device from a classified raw device. Returns `None` for hardware
/// that is not supported. The flag tells whether the daemon is asleep.
pub type DeviceCreator = Box<dyn Fn(DeviceIdentity, &RawDevice, bool) -> Option<Device>>;

/// Classifies raw devices and creates [`Device`]s from them.
pub struct HotplugWatcher {
    bridge_subsystem: String,
    creator: DeviceCreator,
}

impl HotplugWatcher {
    pub fn new(bridge_subsystem: impl Into<String>, creator: DeviceCreator) -> Self {
        Self {
            bridge_subsystem: bridge_subsystem.into(),
            creator,
        }
    }

    /// Driver of the device, its parent, or its grandparent when the parent
    /// sits on the bridge subsystem.
    pub fn resolve_driver(&self, raw: &RawDevice) -> Option<String> {
        if let Some(driver) = &raw.driver {
            return Some(driver.clone());
        }
        let parent = raw.parent.as_deref()?;
        if let Some(driver) = &parent.driver {
            return Some(driver.clone());
        }
        if parent.subsystem == self.bridge_subsystem {
            return parent.parent.as_deref()?.driver.clone();
        }
        None
    }

    /// Identity of a usable device, or `None` (with a log line) otherwise.
    pub fn classify(&self, raw: &RawDevice) -> Option<DeviceIdentity> {
        if let Some(kind) = raw.type_attr.filter(|t| *t != 0) {
            debug!("Ignoring {} with type {}", raw.name, kind);
            return None;
        }
        if raw.devtype.as_deref() == Some("wwan") {
            debug!("Ignoring {} with devtype 'wwan'", raw.name);
            return None;
        }
        if raw.name.is_empty() {
            debug!("Ignoring device without a name at {:?}", raw.syspath);
            return None;
        }

        let Some(driver) = self.resolve_driver(raw) else {
            warn!("{:?}: couldn't determine device driver; ignoring...", raw.syspath);
            return None;
        };
        let Some(ifindex) = raw.ifindex.or_else(|| trailing_index(&raw.name)) else {
            warn!("{:?}: couldn't determine device index; ignoring...", raw.syspath);
            return None;
        };

        debug!("device driver: {} for {:?}", driver, raw.syspath);
        Some(DeviceIdentity {
            udi: raw.udi(),
            iface: raw.name.clone(),
            driver,
            ifindex: Some(ifindex),
        })
    }

    /// Classify and create. The caller registers the result.
    pub fn device_added(&self, raw: &RawDevice, sleeping: bool) -> Option<Device> {
        let identity = self.classify(raw)?;
        let mut device = (self.creator)(identity, raw, sleeping)?;
        if let Err(e) = device.set_firmware_missing(raw.firmware_missing) {
            warn!("{}: failed to record missing firmware: {}", raw.name, e);
        }
        info!("Found new {} device '{}'", raw.subsystem, raw.name);
        Some(device)
    }

    /// Replay `device_added` for every device present in `source`.
    pub fn query_devices(&self, source: &dyn DeviceSource, sleeping: bool) -> Vec<Device> {
        source
            .enumerate()
            .iter()
            .filter_map(|raw| self.device_added(raw, sleeping))
            .collect()
    }
}

/// Numeric suffix of a kernel name, e.g. 3 for `hidraw3`.
fn trailing_index(name: &str) -> Option<u32> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

/// Creator for the kernel subsystems the daemon knows about.
pub fn default_creator() -> DeviceCreator {
    Box::new(|identity, raw, _sleeping| {
        let variant = match raw.subsystem.as_str() {
            "hidraw" => VariantKind::Hidraw(HidrawVariant::new(Path::new("/dev").join(&raw.name))),
            "tty" => VariantKind::Serial(SerialVariant::new()),
            other => {
                debug!("No device kind for subsystem '{}'", other);
                return None;
            }
        };
        Device::new(identity, variant)
    })
}
