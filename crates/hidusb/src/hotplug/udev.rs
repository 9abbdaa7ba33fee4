//! udev-backed device notifications (Linux)

use super::{DevicePathKey, EventSource, HotplugAction, HotplugEvent, HotplugService, wait_for_path};
use crate::error::{HidError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::ffi::OsStr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;
use tracing::{debug, warn};

const USB_SUBSYSTEM: &str = "usb";

/// Hotplug service on top of libudev
///
/// A udev context is created per call; contexts are not shareable across
/// threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdevHotplug;

fn monitor_error(e: impl std::fmt::Display) -> HidError {
    HidError::Monitor(e.to_string())
}

fn as_str(value: Option<&OsStr>) -> &str {
    value.and_then(OsStr::to_str).unwrap_or_default()
}

impl HotplugService for UdevHotplug {
    fn resolve_path(&self, key: &DevicePathKey) -> Option<String> {
        let context = match libudev::Context::new() {
            Ok(context) => context,
            Err(e) => {
                warn!("Failed to create udev context: {}", e);
                return None;
            }
        };

        let mut enumerator = libudev::Enumerator::new(&context).ok()?;
        enumerator.match_subsystem(USB_SUBSYSTEM).ok()?;
        let devices = match enumerator.scan_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to scan udev devices: {}", e);
                return None;
            }
        };

        for device in devices {
            let matched = key.matches(
                as_str(device.attribute_value("idVendor")),
                as_str(device.attribute_value("idProduct")),
                as_str(device.property_value("BUSNUM")),
                as_str(device.property_value("DEVNUM")),
            );
            if !matched {
                continue;
            }

            if let Some(path) = device.property_value("DEVPATH").and_then(OsStr::to_str) {
                debug!("Resolved device path {}", path);
                return Some(path.to_string());
            }
        }

        debug!(
            "No udev device for {}:{} at bus {} address {}",
            key.vendor_id, key.product_id, key.bus_number, key.device_address
        );
        None
    }

    fn wait_for_add(&self, path: &str, timeout_ms: u32) -> Result<()> {
        let context = libudev::Context::new().map_err(monitor_error)?;
        let mut monitor = libudev::Monitor::new(&context).map_err(monitor_error)?;
        monitor
            .match_subsystem(USB_SUBSYSTEM)
            .map_err(monitor_error)?;
        let socket = monitor.listen().map_err(monitor_error)?;

        let mut source = UdevEventSource { socket };
        wait_for_path(&mut source, path, timeout_ms)
    }
}

struct UdevEventSource {
    socket: libudev::MonitorSocket,
}

impl EventSource for UdevEventSource {
    fn wait_readable(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(timeout) => PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX),
        };

        // SAFETY: the socket outlives this borrow; it is owned by `self`.
        let fd = unsafe { BorrowedFd::borrow_raw(self.socket.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            // Re-check with whatever budget is left
            Err(Errno::EINTR) => Ok(true),
            Err(e) => Err(HidError::Io(e.into())),
        }
    }

    fn next_event(&mut self) -> Option<HotplugEvent> {
        let event = self.socket.receive_event()?;
        let action = match event.event_type() {
            libudev::EventType::Add => HotplugAction::Add,
            libudev::EventType::Remove => HotplugAction::Remove,
            libudev::EventType::Change => HotplugAction::Change,
            libudev::EventType::Unknown => HotplugAction::Other,
        };
        let path = as_str(event.device().property_value("DEVPATH")).to_string();
        Some(HotplugEvent { action, path })
    }
}
