//! Host-side USB HID sessions over libusb
//!
//! Talks to HID devices through raw USB instead of the operating system's HID
//! stack: enumerate HID interfaces, open one exclusively (detaching the kernel
//! driver for the duration), read input reports collected by a background
//! polling thread, write output and feature reports, read feature reports,
//! and wait for an unplugged device to come back.
//!
//! ```no_run
//! use hidusb::HidDevice;
//!
//! # fn main() -> hidusb::Result<()> {
//! let mut device = HidDevice::new()?;
//! device.open(0x046d, 0xc52b, None)?;
//! device.write(&[0x00, 0x01, 0x02], false)?;
//! let report = device.read_report(64, 1000)?;
//! println!("{:02x?}", report);
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod hotplug;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use device::HidDevice;
pub use error::{HidError, Result, error_string};
pub use hotplug::{DevicePathKey, HotplugService};
pub use settings::SessionSettings;
pub use usb::{DeviceRecord, SessionIdentity};
