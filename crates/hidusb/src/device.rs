//! HID device handle
//!
//! [`HidDevice`] is the entry point for callers: it enumerates HID interfaces,
//! holds at most one open session, and forwards reads, writes and feature
//! requests to it. Every operation that needs a session fails with
//! [`HidError::NotOpen`] when there is none.

use crate::error::{HidError, Result};
use crate::hotplug::{self, HotplugService};
use crate::settings::SessionSettings;
use crate::usb::backend::UsbBackend;
use crate::usb::directory::{self, DeviceRecord};
use crate::usb::libusb::{self, LibusbBackend};
use crate::usb::pipeline::InputQueue;
use crate::usb::session::{Session, SessionIdentity};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct HidDevice<B: UsbBackend = LibusbBackend> {
    backend: Arc<B>,
    hotplug: Box<dyn HotplugService>,
    settings: SessionSettings,
    /// Result of the last enumeration
    devices: Vec<DeviceRecord>,
    session: Option<Session<B::Handle>>,
    /// OS path of the last opened device; survives `close()`
    device_path: Option<String>,
}

impl HidDevice<LibusbBackend> {
    /// Create a device handle on the process-wide libusb backend
    pub fn new() -> Result<Self> {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Result<Self> {
        let backend = libusb::acquire()?;
        Self::with_backend(backend, hotplug::platform_hotplug(), settings)
    }
}

impl<B: UsbBackend> HidDevice<B> {
    pub fn with_backend(
        backend: Arc<B>,
        hotplug: Box<dyn HotplugService>,
        settings: SessionSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            backend,
            hotplug,
            settings,
            devices: Vec::new(),
            session: None,
            device_path: None,
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Enumerate HID interfaces, replacing the previous result
    ///
    /// A vendor or product ID of 0 matches any device.
    pub fn enumerate(&mut self, vendor_id: u16, product_id: u16) -> Result<&[DeviceRecord]> {
        self.devices.clear();
        self.devices = directory::enumerate(self.backend.as_ref(), vendor_id, product_id)?;
        Ok(&self.devices)
    }

    /// Records of the last enumeration
    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    /// Open the first matching interface
    ///
    /// With a serial number, the first record whose serial matches exactly is
    /// used; otherwise the first record found. When nothing matches, any
    /// current session is left untouched.
    pub fn open(&mut self, vendor_id: u16, product_id: u16, serial: Option<&str>) -> Result<()> {
        self.enumerate(vendor_id, product_id)?;

        let record = match serial {
            Some(serial) => self.devices.iter().find(|r| r.has_serial(serial)),
            None => self.devices.first(),
        }
        .cloned()
        .ok_or(HidError::NoDevice)?;

        self.open_device(&record)
    }

    /// Open a specific enumerated interface, closing any current session
    pub fn open_device(&mut self, record: &DeviceRecord) -> Result<()> {
        self.close();

        let session = Session::establish(&self.backend, record, &self.settings)?;

        self.device_path = self.hotplug.resolve_path(&session.identity().path_key);
        match &self.device_path {
            Some(path) => debug!("Device path: {}", path),
            None => debug!("No device path resolved, reattachment detection unavailable"),
        }

        self.session = Some(session);
        Ok(())
    }

    /// Close the session; does nothing if none is open
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.session.as_ref().map(Session::identity)
    }

    fn session(&self) -> Result<&Session<B::Handle>> {
        self.session.as_ref().ok_or(HidError::NotOpen)
    }

    /// Send an output report, or a feature report with `as_feature`
    ///
    /// `data[0]` is the report ID. Returns the number of bytes accepted,
    /// counting a stripped report ID 0.
    pub fn write(&self, data: &[u8], as_feature: bool) -> Result<usize> {
        self.session()?.write(data, as_feature)
    }

    /// Read one input report into `buf`
    ///
    /// `timeout_ms`: negative blocks, 0 polls, positive waits at most that
    /// long. Returns 0 when nothing arrived in time.
    ///
    /// A reader blocked here holds `&self`, so only new data or device loss
    /// ends a negative timeout. To close while a read is pending, read
    /// through [`HidDevice::input_reader`] on another thread.
    pub fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        self.session()?.input_queue().read(buf, timeout_ms)
    }

    /// Shared handle to the session's input queue
    ///
    /// Reads through the handle follow [`HidDevice::read_timeout`]. Closing
    /// the session shuts the queue down and blocked readers fail with
    /// `ReadError`.
    pub fn input_reader(&self) -> Result<Arc<InputQueue>> {
        Ok(self.session()?.input_queue().clone())
    }

    /// Blocking read of one input report
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_timeout(buf, -1)
    }

    /// Read one input report of at most `size` bytes
    pub fn read_report(&self, size: usize, timeout_ms: i32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let len = self.read_timeout(&mut buf, timeout_ms)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Read a feature report into `buf`; `buf[0]` selects the report ID
    ///
    /// A timeout of 0 waits without limit.
    pub fn get_feature_report(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let timeout = Duration::from_millis(u64::from(timeout_ms));
        self.session()?.get_feature_report(buf, timeout)
    }

    /// Read feature report `report_id` of at most `size` bytes, ID included
    pub fn read_feature(&self, report_id: u8, size: usize, timeout_ms: u32) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(HidError::InvalidArgs);
        }
        let mut buf = vec![0u8; size];
        buf[0] = report_id;
        let len = self.get_feature_report(&mut buf, timeout_ms)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Wait until the last opened device is plugged back in
    ///
    /// `timeout_ms == 0` waits forever.
    pub fn wait_for_reattach(&self, timeout_ms: u32) -> Result<()> {
        let path = self.device_path.as_deref().ok_or(HidError::NoDevicePath)?;
        info!("Waiting for {} to be reattached", path);
        self.hotplug.wait_for_add(path, timeout_ms)
    }

    /// OS device path resolved on the last open
    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    /// True while the input thread of the open session is running
    pub fn is_polling(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_polling)
    }

    /// Unread input reports
    pub fn queued_reports(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.input_queue().len())
    }

    /// (received, dropped) input report counters of the open session
    pub fn input_stats(&self) -> Option<(u64, u64)> {
        self.session.as_ref().map(|s| s.input_queue().stats())
    }
}

impl<B: UsbBackend> Drop for HidDevice<B> {
    fn drop(&mut self) {
        self.close();
    }
}
