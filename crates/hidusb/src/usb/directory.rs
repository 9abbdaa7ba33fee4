//! HID device directory
//!
//! Lists raw USB devices and reports every HID interface found on them.
//! Only devices whose class is defined per interface or vendor specific are
//! inspected; per-device failures are logged and skipped.

use crate::error::{HidError, Result};
use crate::usb::backend::{
    CLASS_HID, CLASS_PER_INTERFACE, CLASS_VENDOR_SPEC, DeviceSummary, UsbBackend, UsbHandle,
};
use tracing::{debug, trace};

/// One discovered HID-capable interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub release_number: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub bus_number: u8,
    pub device_address: u8,
    pub interface_number: u8,
    pub alt_setting: u8,
}

impl DeviceRecord {
    /// Exact serial comparison; a record without serial never matches
    pub fn has_serial(&self, serial: &str) -> bool {
        self.serial_number.as_deref() == Some(serial)
    }
}

/// String descriptors of one device, read best-effort
#[derive(Debug, Default, Clone)]
struct DeviceStrings {
    manufacturer: Option<String>,
    product: Option<String>,
    serial_number: Option<String>,
}

/// Enumerate HID interfaces, optionally filtered by vendor/product ID
///
/// A filter value of 0 matches any ID. Fails only if the device list itself
/// cannot be retrieved.
pub fn enumerate<B>(backend: &B, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceRecord>>
where
    B: UsbBackend + ?Sized,
{
    let devices = backend.devices().map_err(HidError::BackendUnavailable)?;
    let mut records = Vec::new();

    for device in &devices {
        let summary = match backend.describe(device) {
            Ok(summary) => summary,
            Err(e) => {
                debug!("Skipping device whose descriptors cannot be read: {}", e);
                continue;
            }
        };

        if !is_candidate_class(summary.class_code) {
            trace!(
                "Skipping device class {:#04x}: bus={}, addr={}",
                summary.class_code, summary.bus_number, summary.address
            );
            continue;
        }

        if !matches_filter(vendor_id, product_id, summary.vendor_id, summary.product_id) {
            continue;
        }

        let mut strings: Option<DeviceStrings> = None;
        for interface in summary.interfaces.iter().filter(|i| i.class_code == CLASS_HID) {
            let strings = strings.get_or_insert_with(|| read_strings(backend, device, &summary));

            debug!(
                "Found HID interface {} on bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                interface.number,
                summary.bus_number,
                summary.address,
                summary.vendor_id,
                summary.product_id
            );

            records.push(DeviceRecord {
                vendor_id: summary.vendor_id,
                product_id: summary.product_id,
                release_number: summary.release_number,
                serial_number: strings.serial_number.clone(),
                manufacturer: strings.manufacturer.clone(),
                product: strings.product.clone(),
                bus_number: summary.bus_number,
                device_address: summary.address,
                interface_number: interface.number,
                alt_setting: interface.alt_setting,
            });
        }
    }

    debug!("Enumerated {} HID interfaces", records.len());
    Ok(records)
}

/// Device classes that may carry HID interfaces
pub fn is_candidate_class(class_code: u8) -> bool {
    class_code == CLASS_PER_INTERFACE || class_code == CLASS_VENDOR_SPEC
}

/// Vendor/product filter with 0 as wildcard
pub fn matches_filter(filter_vid: u16, filter_pid: u16, vid: u16, pid: u16) -> bool {
    (filter_vid == 0 || filter_vid == vid) && (filter_pid == 0 || filter_pid == pid)
}

/// Open the device transiently to read its string descriptors
fn read_strings<B>(backend: &B, device: &B::Device, summary: &DeviceSummary) -> DeviceStrings
where
    B: UsbBackend + ?Sized,
{
    let handle = match backend.open(device) {
        Ok(handle) => handle,
        Err(e) => {
            debug!(
                "Cannot open bus={} addr={} for strings: {}",
                summary.bus_number, summary.address, e
            );
            return DeviceStrings::default();
        }
    };

    let read = |index: Option<u8>| index.and_then(|idx| handle.read_string_ascii(idx).ok());

    DeviceStrings {
        manufacturer: read(summary.manufacturer_index),
        product: read(summary.product_index),
        serial_number: read(summary.serial_index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        // Wildcards
        assert!(matches_filter(0, 0, 0x1234, 0x5678));
        assert!(matches_filter(0x1234, 0, 0x1234, 0x9999));
        assert!(matches_filter(0, 0x5678, 0xabcd, 0x5678));

        // Exact
        assert!(matches_filter(0x1234, 0x5678, 0x1234, 0x5678));
        assert!(!matches_filter(0x1234, 0x5678, 0x1234, 0x9999));
        assert!(!matches_filter(0x1234, 0, 0x9999, 0x5678));
    }

    #[test]
    fn test_candidate_classes() {
        assert!(is_candidate_class(0x00));
        assert!(is_candidate_class(0xff));
        assert!(!is_candidate_class(0x09)); // Hub
        assert!(!is_candidate_class(0x03)); // HID at device level is not inspected
    }

    #[test]
    fn test_serial_match_is_exact() {
        let record = DeviceRecord {
            vendor_id: 1,
            product_id: 2,
            release_number: 0x0100,
            serial_number: Some("AB12".to_string()),
            manufacturer: None,
            product: None,
            bus_number: 1,
            device_address: 4,
            interface_number: 0,
            alt_setting: 0,
        };
        assert!(record.has_serial("AB12"));
        assert!(!record.has_serial("ab12"));
        assert!(!DeviceRecord {
            serial_number: None,
            ..record
        }
        .has_serial(""));
    }
}
