//! Open HID session
//!
//! A session owns one claimed interface of one device together with the input
//! pipeline polling it. Establishing a session either succeeds completely or
//! leaves nothing behind; closing it is best-effort and never fails.

use crate::error::{HidError, Result};
use crate::hotplug::DevicePathKey;
use crate::settings::SessionSettings;
use crate::usb::backend::{CLASS_HID, EndpointSummary, InterfaceSummary, UsbBackend, UsbHandle};
use crate::usb::directory::DeviceRecord;
use crate::usb::pipeline::{InputPipeline, InputQueue};
use crate::usb::transfers;
use rusb::Direction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What an open session knows about its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub interface: u8,
    /// Interrupt IN endpoint address
    pub input_endpoint: u8,
    pub max_packet_size: u16,
    /// Interrupt OUT endpoint, `None` forces SET_REPORT on the control pipe
    pub output_endpoint: Option<u8>,
    /// Key used to look up the OS device path for reattachment
    pub path_key: DevicePathKey,
    /// The kernel driver was detached on open and must be reattached on close
    pub detached_kernel_driver: bool,
}

/// Interrupt endpoints of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEndpoints {
    /// (address, max packet size)
    pub input: Option<(u8, u16)>,
    pub output: Option<u8>,
}

/// First interrupt endpoint in each direction
pub fn find_interrupt_endpoints(endpoints: &[EndpointSummary]) -> InterruptEndpoints {
    let mut found = InterruptEndpoints {
        input: None,
        output: None,
    };

    for endpoint in endpoints.iter().filter(|e| e.is_interrupt()) {
        match endpoint.direction() {
            Direction::In if found.input.is_none() => {
                found.input = Some((endpoint.address, endpoint.max_packet_size));
            }
            Direction::Out if found.output.is_none() => {
                found.output = Some(endpoint.address);
            }
            _ => {}
        }
    }

    found
}

pub struct Session<H: UsbHandle> {
    handle: Arc<H>,
    identity: SessionIdentity,
    pipeline: InputPipeline<H::Transfer>,
    output_timeout: Duration,
    closed: bool,
}

impl<H: UsbHandle> Session<H> {
    /// Open the interface described by `record`
    ///
    /// The record may be stale, so the physical device is looked up again by
    /// vendor/product and confirmed by exact bus, address and interface
    /// number. Any failure after the handle is opened rolls back the kernel
    /// driver detach and the interface claim before the error is returned.
    pub fn establish<B>(
        backend: &Arc<B>,
        record: &DeviceRecord,
        settings: &SessionSettings,
    ) -> Result<Self>
    where
        B: UsbBackend<Handle = H>,
    {
        let devices = backend.devices().map_err(HidError::BackendUnavailable)?;

        let mut target = None;
        for device in devices {
            let Ok(summary) = backend.describe(&device) else {
                continue;
            };
            if summary.vendor_id != record.vendor_id
                || summary.product_id != record.product_id
                || summary.bus_number != record.bus_number
                || summary.address != record.device_address
            {
                continue;
            }
            let interface = summary
                .interfaces
                .iter()
                .find(|i| i.number == record.interface_number && i.class_code == CLASS_HID)
                .cloned();
            if let Some(interface) = interface {
                target = Some((device, interface));
                break;
            }
        }

        let Some((device, interface)) = target else {
            debug!(
                "Device {:04x}:{:04x} interface {} no longer present at bus={}, addr={}",
                record.vendor_id,
                record.product_id,
                record.interface_number,
                record.bus_number,
                record.device_address
            );
            return Err(HidError::NoDevice);
        };

        let handle = Arc::new(backend.open(&device).map_err(|e| {
            warn!(
                "Failed to open device bus={}, addr={}: {}",
                record.bus_number, record.device_address, e
            );
            HidError::Transport(e)
        })?);

        let number = interface.number;
        let detached = detach_kernel_driver(handle.as_ref(), number)?;

        if let Err(e) = handle.claim_interface(number) {
            warn!("Failed to claim interface {}: {}", number, e);
            rollback(handle.as_ref(), number, false, detached);
            return Err(HidError::Transport(e));
        }

        match start_pipeline(backend, &handle, &interface, settings) {
            Ok((pipeline, endpoints)) => {
                let (input_endpoint, max_packet_size) = endpoints.input.unwrap_or_default();
                let identity = SessionIdentity {
                    vendor_id: record.vendor_id,
                    product_id: record.product_id,
                    bus_number: record.bus_number,
                    device_address: record.device_address,
                    interface: number,
                    input_endpoint,
                    max_packet_size,
                    output_endpoint: endpoints.output,
                    path_key: DevicePathKey::new(
                        record.vendor_id,
                        record.product_id,
                        record.bus_number,
                        record.device_address,
                    ),
                    detached_kernel_driver: detached,
                };

                info!(
                    "Opened {:04x}:{:04x} interface {} (in={:#04x}, out={:?})",
                    identity.vendor_id,
                    identity.product_id,
                    number,
                    input_endpoint,
                    identity.output_endpoint
                );

                Ok(Self {
                    handle,
                    identity,
                    pipeline,
                    output_timeout: settings.output_timeout(),
                    closed: false,
                })
            }
            Err(e) => {
                rollback(handle.as_ref(), number, true, detached);
                Err(e)
            }
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn input_queue(&self) -> &Arc<InputQueue> {
        self.pipeline.queue()
    }

    /// True while the input thread is alive
    pub fn is_polling(&self) -> bool {
        self.pipeline.is_running()
    }

    /// Send an output (or feature) report
    pub fn write(&self, data: &[u8], as_feature: bool) -> Result<usize> {
        transfers::write_report(
            self.handle.as_ref(),
            self.identity.interface,
            self.identity.output_endpoint,
            data,
            as_feature,
            self.output_timeout,
        )
    }

    /// Read a feature report; `buf[0]` selects the report ID
    pub fn get_feature_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        transfers::get_feature_report(self.handle.as_ref(), self.identity.interface, buf, timeout)
    }

    /// Stop the pipeline and hand the interface back to the system
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.pipeline.stop();

        let interface = self.identity.interface;
        if let Err(e) = self.handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if self.identity.detached_kernel_driver
            && let Err(e) = self.handle.attach_kernel_driver(interface)
        {
            warn!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        }

        info!(
            "Closed {:04x}:{:04x} interface {}",
            self.identity.vendor_id, self.identity.product_id, interface
        );
    }
}

impl<H: UsbHandle> Drop for Session<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Detach a bound kernel driver; returns whether one was detached
fn detach_kernel_driver<H: UsbHandle + ?Sized>(handle: &H, interface: u8) -> Result<bool> {
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface).map_err(|e| {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
                HidError::Transport(e)
            })?;
            Ok(true)
        }
        Ok(false) | Err(rusb::Error::NotSupported) => Ok(false),
        Err(e) => {
            warn!(
                "Failed to query kernel driver on interface {}: {}",
                interface, e
            );
            Err(HidError::Transport(e))
        }
    }
}

fn start_pipeline<B>(
    backend: &Arc<B>,
    handle: &Arc<B::Handle>,
    interface: &InterfaceSummary,
    settings: &SessionSettings,
) -> Result<(InputPipeline<<B::Handle as UsbHandle>::Transfer>, InterruptEndpoints)>
where
    B: UsbBackend,
{
    let endpoints = find_interrupt_endpoints(&interface.endpoints);
    let Some((endpoint, max_packet_size)) = endpoints.input else {
        warn!("Interface {} has no interrupt IN endpoint", interface.number);
        return Err(HidError::NoInputEndpoint {
            interface: interface.number,
        });
    };

    let pipeline = InputPipeline::start(
        backend.clone(),
        handle.clone(),
        endpoint,
        max_packet_size,
        settings,
    )?;
    Ok((pipeline, endpoints))
}

/// Undo a partially established session
fn rollback<H: UsbHandle + ?Sized>(handle: &H, interface: u8, claimed: bool, detached: bool) {
    if claimed && let Err(e) = handle.release_interface(interface) {
        warn!("Rollback: failed to release interface {}: {}", interface, e);
    }
    if detached && let Err(e) = handle.attach_kernel_driver(interface) {
        warn!(
            "Rollback: failed to reattach kernel driver to interface {}: {}",
            interface, e
        );
    }
}
