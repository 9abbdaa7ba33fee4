//! HID session error types
//!
//! Every error maps onto a stable negative code (`HidError::code`) so that
//! a calling layer which only transports integers can still recover the
//! human-readable text through [`error_string`].

use thiserror::Error;

/// Invalid arguments supplied to an operation
pub const HID_INVALID_ARGS: i32 = -1000;
/// No device matched the enumeration or serial filter
pub const HID_NO_DEVICE: i32 = -1001;
/// The operation requires an open session
pub const HID_NO_DEVICE_OPEN: i32 = -1002;
/// The input pipeline shut down while a reader was waiting
pub const HID_READ_ERROR: i32 = -1003;
/// No device path was resolved for reattachment matching
pub const HID_NO_DEVICE_PATH: i32 = -1004;
/// The device-notification monitor could not be created or filtered
pub const HID_MONITOR_ERROR: i32 = -1005;
/// Waiting for reattachment exhausted its budget
pub const HID_REATTACH_TIMEOUT: i32 = -1006;
/// The USB backend could not be initialized
pub const HID_NO_BACKEND: i32 = -1007;
/// The notification poll elapsed without any event
pub const HID_NO_EVENT: i32 = -1008;
/// The opened interface exposes no interrupt IN endpoint
pub const HID_NO_INPUT_ENDPOINT: i32 = -1009;
/// Operating system error outside the USB backend
pub const HID_OS_ERROR: i32 = -1010;

/// libusb's catch-all error code
const LIBUSB_ERROR_OTHER: i32 = -99;

/// Errors raised by the HID session manager
#[derive(Debug, Error)]
pub enum HidError {
    #[error("Invalid arguments supplied")]
    InvalidArgs,

    #[error("No matching HID device found")]
    NoDevice,

    #[error("No HID device open to perform requested operation")]
    NotOpen,

    #[error("Input pipeline shut down, device may have been removed")]
    ReadError,

    #[error("Interface {interface} has no interrupt IN endpoint")]
    NoInputEndpoint { interface: u8 },

    #[error("Device path for reattachment is not available")]
    NoDevicePath,

    #[error("Failed to set up device monitor: {0}")]
    Monitor(String),

    #[error("No device event received before the wait elapsed")]
    NoEvent,

    #[error("Waiting for device reattachment timed out")]
    ReattachTimeout,

    #[error("USB backend unavailable: {0}")]
    BackendUnavailable(rusb::Error),

    #[error("USB transfer error: {0}")]
    Transport(#[from] rusb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HidError {
    /// Stable negative code for this error
    ///
    /// Backend errors keep libusb's own numbering, library errors use the
    /// `-1000` range.
    pub fn code(&self) -> i32 {
        match self {
            HidError::InvalidArgs => HID_INVALID_ARGS,
            HidError::NoDevice => HID_NO_DEVICE,
            HidError::NotOpen => HID_NO_DEVICE_OPEN,
            HidError::ReadError => HID_READ_ERROR,
            HidError::NoInputEndpoint { .. } => HID_NO_INPUT_ENDPOINT,
            HidError::NoDevicePath => HID_NO_DEVICE_PATH,
            HidError::Monitor(_) => HID_MONITOR_ERROR,
            HidError::NoEvent => HID_NO_EVENT,
            HidError::ReattachTimeout => HID_REATTACH_TIMEOUT,
            HidError::BackendUnavailable(_) => HID_NO_BACKEND,
            HidError::Transport(e) => libusb_code(*e),
            HidError::Io(_) => HID_OS_ERROR,
        }
    }

    /// True for both reattachment timeout flavours
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HidError::NoEvent
                | HidError::ReattachTimeout
                | HidError::Transport(rusb::Error::Timeout)
        )
    }
}

/// libusb numeric code for a backend error
pub fn libusb_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => LIBUSB_ERROR_OTHER,
    }
}

/// Backend error for a raw libusb return code
pub fn from_libusb_code(code: i32) -> rusb::Error {
    match code {
        -1 => rusb::Error::Io,
        -2 => rusb::Error::InvalidParam,
        -3 => rusb::Error::Access,
        -4 => rusb::Error::NoDevice,
        -5 => rusb::Error::NotFound,
        -6 => rusb::Error::Busy,
        -7 => rusb::Error::Timeout,
        -8 => rusb::Error::Overflow,
        -9 => rusb::Error::Pipe,
        -10 => rusb::Error::Interrupted,
        -11 => rusb::Error::NoMem,
        -12 => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn libusb_text(code: i32) -> &'static str {
    match code {
        0 => "Success",
        -1 => "Input/Output Error",
        -2 => "Invalid parameter",
        -3 => "Access denied (insufficient permissions)",
        -4 => "No such device (it may have been disconnected)",
        -5 => "Entity not found",
        -6 => "Resource busy",
        -7 => "Operation timed out",
        -8 => "Overflow",
        -9 => "Pipe error",
        -10 => "System call interrupted (perhaps due to signal)",
        -11 => "Insufficient memory",
        -12 => "Operation not supported or unimplemented on this platform",
        _ => "Other error",
    }
}

/// Translate an error code into user-facing text
///
/// Codes in libusb's range render as `"libusb: <text>."`, library codes as
/// `"hid: <text>."`.
pub fn error_string(code: i32) -> String {
    if (LIBUSB_ERROR_OTHER..=0).contains(&code) {
        return format!("libusb: {}.", libusb_text(code));
    }

    let text = match code {
        HID_INVALID_ARGS => "Invalid arguments supplied",
        HID_NO_DEVICE => "No matching HID device found",
        HID_NO_DEVICE_OPEN => "No HID device open to perform requested operation",
        HID_READ_ERROR => "Generic HID read error occurred",
        HID_NO_DEVICE_PATH => "Udev or the device Udev path is not available",
        HID_MONITOR_ERROR => "Failed to create an Udev monitor",
        HID_REATTACH_TIMEOUT => "Waiting for Udev timed out",
        HID_NO_BACKEND => "Failed to initialize libusb-1.0",
        HID_NO_EVENT => "No Udev event received",
        HID_NO_INPUT_ENDPOINT => "HID interface has no interrupt IN endpoint",
        HID_OS_ERROR => "Operating system error",
        _ => "Unknown error",
    };
    format!("hid: {}.", text)
}

/// Type alias for HID results
pub type Result<T> = std::result::Result<T, HidError>;
