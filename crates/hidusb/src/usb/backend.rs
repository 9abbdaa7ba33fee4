//! Transfer backend seam
//!
//! The session logic talks to USB exclusively through these traits. The
//! production implementation lives in [`crate::usb::libusb`]; tests use
//! `test_utils::MockBackend` (feature `test-utils`).
//!
//! Descriptors cross the seam as owned snapshots so that nothing borrowed
//! from the backend outlives a device list.

use rusb::{Direction, TransferType};
use std::sync::Arc;
use std::time::Duration;

/// USB class code: class defined per interface
pub const CLASS_PER_INTERFACE: u8 = 0x00;
/// USB class code: Human Interface Device
pub const CLASS_HID: u8 = 0x03;
/// USB class code: vendor specific
pub const CLASS_VENDOR_SPEC: u8 = 0xff;

/// Snapshot of one endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSummary {
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl EndpointSummary {
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.transfer_type == TransferType::Interrupt
    }
}

/// Snapshot of one interface alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub number: u8,
    pub alt_setting: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointSummary>,
}

/// Snapshot of a listed device: device descriptor plus the interfaces of
/// its active configuration (or the first one if none is active)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub release_number: u16,
    pub class_code: u8,
    pub manufacturer_index: Option<u8>,
    pub product_index: Option<u8>,
    pub serial_index: Option<u8>,
    pub interfaces: Vec<InterfaceSummary>,
}

/// Outcome of one asynchronous transfer, as seen by a [`CompletionSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus<'a> {
    Completed(&'a [u8]),
    Cancelled,
    NoDevice,
    TimedOut,
    Stall,
    Overflow,
    Error,
}

/// Receiver of asynchronous transfer completions
///
/// Called from inside [`UsbBackend::handle_events`]. Implementations must not
/// call back into the backend.
pub trait CompletionSink: Send + Sync {
    /// Handle a completion; return `true` to keep the transfer polling
    fn on_complete(&self, status: TransferStatus<'_>) -> bool;

    /// The transfer could not be resubmitted after a completion
    fn on_resubmit_failed(&self, error: rusb::Error);
}

/// Deliver a completion to its sink and resubmit when the sink asks for it
///
/// Shared by every backend so the resubmission policy lives in one place.
pub fn dispatch_completion<F>(sink: &dyn CompletionSink, status: TransferStatus<'_>, resubmit: F)
where
    F: FnOnce() -> rusb::Result<()>,
{
    if sink.on_complete(status)
        && let Err(e) = resubmit()
    {
        sink.on_resubmit_failed(e);
    }
}

/// An allocated asynchronous interrupt-IN transfer
///
/// Dropping the transfer frees it; a backend must make sure a transfer is no
/// longer in flight before releasing its memory.
pub trait InterruptTransfer: Send + Sync + 'static {
    /// Submit (or resubmit) the transfer
    fn submit(&self) -> rusb::Result<()>;

    /// Request cancellation; completion arrives through the sink as
    /// [`TransferStatus::Cancelled`]
    fn cancel(&self) -> rusb::Result<()>;
}

/// An open device handle
pub trait UsbHandle: Send + Sync + 'static {
    type Transfer: InterruptTransfer;

    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool>;
    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()>;
    fn attach_kernel_driver(&self, interface: u8) -> rusb::Result<()>;
    fn claim_interface(&self, interface: u8) -> rusb::Result<()>;
    fn release_interface(&self, interface: u8) -> rusb::Result<()>;

    /// Read a string descriptor, ASCII only
    fn read_string_ascii(&self, index: u8) -> rusb::Result<String>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Allocate an interrupt-IN transfer of `length` bytes whose completions
    /// are delivered to `sink`
    fn interrupt_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        sink: Arc<dyn CompletionSink>,
    ) -> rusb::Result<Self::Transfer>;
}

/// A USB host stack
pub trait UsbBackend: Send + Sync + 'static {
    type Device: Send;
    type Handle: UsbHandle;

    /// List attached devices
    fn devices(&self) -> rusb::Result<Vec<Self::Device>>;

    /// Read descriptors of a listed device
    fn describe(&self, device: &Self::Device) -> rusb::Result<DeviceSummary>;

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle>;

    /// Process pending asynchronous events, blocking up to `timeout`
    ///
    /// Completion sinks run inside this call.
    fn handle_events(&self, timeout: Duration) -> rusb::Result<()>;
}
