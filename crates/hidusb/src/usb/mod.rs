//! USB subsystem
//!
//! Everything that talks to the device: the backend seam and its libusb
//! implementation, HID interface discovery, session lifecycle, the input
//! pipeline and the report transfers.

pub mod backend;
pub mod directory;
pub mod libusb;
pub mod pipeline;
pub mod report_queue;
pub mod session;
pub mod transfers;

// Re-export public types
pub use backend::{
    CompletionSink, DeviceSummary, EndpointSummary, InterfaceSummary, InterruptTransfer,
    TransferStatus, UsbBackend, UsbHandle,
};
pub use directory::DeviceRecord;
pub use libusb::LibusbBackend;
pub use pipeline::InputQueue;
pub use session::{Session, SessionIdentity};
