//! HID report transfers
//!
//! Output and feature reports travel either over the control pipe (HID class
//! `SET_REPORT`/`GET_REPORT` requests) or over the interrupt OUT endpoint.
//! The first byte of every report buffer is the report ID.

use crate::error::{HidError, Result};
use crate::usb::backend::UsbHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// HID class request: GET_REPORT
pub const HID_GET_REPORT: u8 = 0x01;
/// HID class request: SET_REPORT
pub const HID_SET_REPORT: u8 = 0x09;

/// Host to device, class request, interface recipient
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
/// Device to host, class request, interface recipient
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xa1;

/// HID report types carried in the high byte of wValue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportType {
    Input = 0x01,
    Output = 0x02,
    Feature = 0x03,
}

impl ReportType {
    /// wValue for a report request: type in the high byte, ID in the low byte
    pub fn value(self, report_id: u8) -> u16 {
        (u16::from(self as u8) << 8) | u16::from(report_id)
    }
}

/// Where an output report goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPath {
    /// SET_REPORT on the control pipe
    Control,
    /// Interrupt OUT endpoint
    Interrupt(u8),
}

/// Pick the transmission path for an output report
///
/// Feature reports always use the control pipe, as do output reports on
/// interfaces without an interrupt OUT endpoint.
pub fn output_path(output_endpoint: Option<u8>, as_feature: bool) -> OutputPath {
    match output_endpoint {
        Some(endpoint) if !as_feature => OutputPath::Interrupt(endpoint),
        _ => OutputPath::Control,
    }
}

/// Send an output or feature report
///
/// Report ID 0 on an output report means the device uses a single unnumbered
/// report: the ID byte is not sent, and the returned count still includes it
/// so it matches the caller's buffer length.
pub fn write_report<H>(
    handle: &H,
    interface: u8,
    output_endpoint: Option<u8>,
    data: &[u8],
    as_feature: bool,
    timeout: Duration,
) -> Result<usize>
where
    H: UsbHandle + ?Sized,
{
    let Some(&report_id) = data.first() else {
        return Err(HidError::InvalidArgs);
    };

    let skip_report_id = report_id == 0 && !as_feature;
    let payload = if skip_report_id { &data[1..] } else { data };
    let adjust = usize::from(skip_report_id);

    let result = match output_path(output_endpoint, as_feature) {
        OutputPath::Control => {
            let report_type = if as_feature {
                ReportType::Feature
            } else {
                ReportType::Output
            };
            trace!(
                "SET_REPORT: type={:?}, id={:#04x}, interface={}, len={}",
                report_type,
                report_id,
                interface,
                payload.len()
            );
            handle
                .write_control(
                    REQUEST_TYPE_CLASS_OUT,
                    HID_SET_REPORT,
                    report_type.value(report_id),
                    u16::from(interface),
                    payload,
                    timeout,
                )
                // Control transfers either move the whole request or fail
                .map(|_| payload.len())
        }
        OutputPath::Interrupt(endpoint) => {
            trace!(
                "Interrupt OUT: endpoint={:#04x}, len={}",
                endpoint,
                payload.len()
            );
            handle.write_interrupt(endpoint, payload, timeout)
        }
    };

    match result {
        Ok(sent) => {
            debug!("Wrote report {:#04x}: {} bytes", report_id, sent + adjust);
            Ok(sent + adjust)
        }
        Err(e) => {
            warn!("Output report {:#04x} failed: {}", report_id, e);
            Err(HidError::Transport(e))
        }
    }
}

/// Read a feature report
///
/// `buf[0]` must hold the report ID on entry. The received report, ID
/// included, is written into `buf`. A timeout of 0 waits without limit.
pub fn get_feature_report<H>(
    handle: &H,
    interface: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize>
where
    H: UsbHandle + ?Sized,
{
    let Some(&report_id) = buf.first() else {
        return Err(HidError::InvalidArgs);
    };

    trace!(
        "GET_REPORT: feature id={:#04x}, interface={}, len={}",
        report_id,
        interface,
        buf.len()
    );

    match handle.read_control(
        REQUEST_TYPE_CLASS_IN,
        HID_GET_REPORT,
        ReportType::Feature.value(report_id),
        u16::from(interface),
        buf,
        timeout,
    ) {
        Ok(len) => {
            debug!("Read feature report {:#04x}: {} bytes", report_id, len);
            Ok(len)
        }
        Err(e) => {
            warn!("Feature report {:#04x} read failed: {}", report_id, e);
            Err(HidError::Transport(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_type_value() {
        assert_eq!(ReportType::Output.value(0), 0x0200);
        assert_eq!(ReportType::Output.value(0x05), 0x0205);
        assert_eq!(ReportType::Feature.value(0x05), 0x0305);
        assert_eq!(ReportType::Input.value(0x01), 0x0101);
    }

    #[test]
    fn test_request_type_direction() {
        // Bit 7 = 1 means IN (device to host)
        assert!((REQUEST_TYPE_CLASS_IN & 0x80) != 0);
        // Bit 7 = 0 means OUT (host to device)
        assert!((REQUEST_TYPE_CLASS_OUT & 0x80) == 0);
        // Class request to an interface
        assert_eq!(REQUEST_TYPE_CLASS_IN & 0x7f, REQUEST_TYPE_CLASS_OUT);
    }

    #[test]
    fn test_output_path_selection() {
        assert_eq!(output_path(Some(0x02), false), OutputPath::Interrupt(0x02));
        assert_eq!(output_path(None, false), OutputPath::Control);
        assert_eq!(output_path(Some(0x02), true), OutputPath::Control);
        assert_eq!(output_path(None, true), OutputPath::Control);
    }
}
