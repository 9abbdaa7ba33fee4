//! Device reattachment detection
//!
//! After a session closed (typically because the device went away), callers
//! can wait for the same physical device to be plugged back in. "Same" means
//! same OS device path: the path is resolved once per open from the device's
//! vendor/product ID and bus location, and later compared against "add"
//! events from the OS notification service.

#[cfg(target_os = "linux")]
pub mod udev;

#[cfg(target_os = "linux")]
pub use udev::UdevHotplug;

use crate::error::{HidError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Textual identity of a device as the notification service reports it
///
/// Vendor/product are 4-digit lowercase hex, bus and address 3-digit decimal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePathKey {
    pub vendor_id: String,
    pub product_id: String,
    pub bus_number: String,
    pub device_address: String,
}

impl DevicePathKey {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, device_address: u8) -> Self {
        Self {
            vendor_id: format!("{:04x}", vendor_id),
            product_id: format!("{:04x}", product_id),
            bus_number: format!("{:03}", bus_number),
            device_address: format!("{:03}", device_address),
        }
    }

    /// Compare against attribute values read from the OS
    ///
    /// Hex IDs are compared case-insensitively.
    pub fn matches(
        &self,
        vendor_id: &str,
        product_id: &str,
        bus_number: &str,
        device_address: &str,
    ) -> bool {
        self.vendor_id.eq_ignore_ascii_case(vendor_id.trim())
            && self.product_id.eq_ignore_ascii_case(product_id.trim())
            && self.bus_number == bus_number.trim()
            && self.device_address == device_address.trim()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
    Change,
    Other,
}

/// One notification from the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    pub path: String,
}

impl HotplugEvent {
    pub fn add(path: impl Into<String>) -> Self {
        Self {
            action: HotplugAction::Add,
            path: path.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            action: HotplugAction::Remove,
            path: path.into(),
        }
    }
}

/// A stream of notifications that can be waited on
pub trait EventSource {
    /// Block until an event may be read or `timeout` elapses (`None` waits
    /// forever). Returns `false` on timeout.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> Result<bool>;

    /// Take the next pending event, if any
    fn next_event(&mut self) -> Option<HotplugEvent>;
}

/// OS device path lookup and reattachment wait
pub trait HotplugService: Send + Sync {
    /// Resolve the device path for a session's device, if the OS knows one
    fn resolve_path(&self, key: &DevicePathKey) -> Option<String>;

    /// Wait for an "add" event on `path`; `timeout_ms == 0` waits forever
    fn wait_for_add(&self, path: &str, timeout_ms: u32) -> Result<()>;
}

/// Wait on `source` until an "add" event for `path` arrives
///
/// The remaining budget shrinks by the wall-clock time of every iteration,
/// at least 1 ms each time. A poll that elapses without any event yields
/// [`HidError::NoEvent`]; a budget used up by unrelated events yields
/// [`HidError::ReattachTimeout`].
pub fn wait_for_path<S>(source: &mut S, path: &str, timeout_ms: u32) -> Result<()>
where
    S: EventSource + ?Sized,
{
    let forever = timeout_ms == 0;
    let mut remaining = Duration::from_millis(u64::from(timeout_ms));

    debug!(
        "Waiting for {} to reappear (timeout: {})",
        path,
        if forever {
            "none".to_string()
        } else {
            format!("{}ms", timeout_ms)
        }
    );

    loop {
        let started = Instant::now();

        if !source.wait_readable((!forever).then_some(remaining))? {
            debug!("No device event within {:?}", remaining);
            return Err(HidError::NoEvent);
        }

        if let Some(event) = source.next_event() {
            trace!("Device event {:?} on {}", event.action, event.path);
            if event.action == HotplugAction::Add && event.path == path {
                debug!("Device {} reattached", path);
                return Ok(());
            }
        }

        if !forever {
            let elapsed = started.elapsed().max(Duration::from_millis(1));
            remaining = remaining.saturating_sub(elapsed);
            if remaining.is_zero() {
                return Err(HidError::ReattachTimeout);
            }
        }
    }
}

/// Hotplug service for platforms without device notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHotplug;

impl HotplugService for NullHotplug {
    fn resolve_path(&self, _key: &DevicePathKey) -> Option<String> {
        None
    }

    fn wait_for_add(&self, _path: &str, _timeout_ms: u32) -> Result<()> {
        Err(HidError::Monitor(
            "device notifications are not supported on this platform".to_string(),
        ))
    }
}

/// The notification service of the running platform
pub fn platform_hotplug() -> Box<dyn HotplugService> {
    #[cfg(target_os = "linux")]
    {
        Box::new(UdevHotplug)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullHotplug)
    }
}
