//! In-memory USB backend and scripted hotplug for tests
//!
//! `MockBackend` implements the backend traits without hardware: devices are
//! plain descriptor snapshots, input reports are queued with
//! [`MockBackend::push_input`] and delivered by `handle_events` to whatever
//! interrupt transfer is in flight, and every handle operation is recorded.

use crate::error::Result;
use crate::hotplug::{DevicePathKey, EventSource, HotplugEvent, HotplugService, wait_for_path};
use crate::usb::backend::{
    CLASS_HID, CLASS_PER_INTERFACE, CompletionSink, DeviceSummary, EndpointSummary,
    InterfaceSummary, InterruptTransfer, TransferStatus, UsbBackend, UsbHandle,
    dispatch_completion,
};
use rusb::TransferType;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub summary: DeviceSummary,
    pub strings: HashMap<u8, String>,
    /// `open` fails with `Access` when false
    pub openable: bool,
}

impl MockDevice {
    /// Device with one HID interface (number 0): interrupt IN 0x81 and
    /// interrupt OUT 0x02, 64 byte packets
    pub fn hid(vendor_id: u16, product_id: u16, bus_number: u8, address: u8) -> Self {
        Self {
            summary: DeviceSummary {
                bus_number,
                address,
                vendor_id,
                product_id,
                release_number: 0x0100,
                class_code: CLASS_PER_INTERFACE,
                manufacturer_index: None,
                product_index: None,
                serial_index: None,
                interfaces: vec![hid_interface(0, Some(0x81), Some(0x02))],
            },
            strings: HashMap::new(),
            openable: true,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.summary.serial_index = Some(3);
        self.strings.insert(3, serial.to_string());
        self
    }

    pub fn with_product(mut self, manufacturer: &str, product: &str) -> Self {
        self.summary.manufacturer_index = Some(1);
        self.summary.product_index = Some(2);
        self.strings.insert(1, manufacturer.to_string());
        self.strings.insert(2, product.to_string());
        self
    }

    pub fn with_class(mut self, class_code: u8) -> Self {
        self.summary.class_code = class_code;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<InterfaceSummary>) -> Self {
        self.summary.interfaces = interfaces;
        self
    }

    /// Drop the interrupt OUT endpoint of every interface
    pub fn without_output_endpoint(mut self) -> Self {
        for interface in &mut self.summary.interfaces {
            interface.endpoints.retain(|e| e.address & 0x80 != 0);
        }
        self
    }

    pub fn unopenable(mut self) -> Self {
        self.openable = false;
        self
    }
}

/// Interface snapshot with optional interrupt IN/OUT endpoints
pub fn hid_interface(number: u8, input: Option<u8>, output: Option<u8>) -> InterfaceSummary {
    interface(number, CLASS_HID, input, output)
}

pub fn interface(
    number: u8,
    class_code: u8,
    input: Option<u8>,
    output: Option<u8>,
) -> InterfaceSummary {
    let endpoints = input
        .into_iter()
        .chain(output)
        .map(|address| EndpointSummary {
            address,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 64,
        })
        .collect();

    InterfaceSummary {
        number,
        alt_setting: 0,
        class_code,
        endpoints,
    }
}

/// A recorded handle operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open { bus_number: u8, address: u8 },
    KernelDriverActive(u8),
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    ControlOut {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    ControlIn {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    },
    InterruptOut { endpoint: u8, data: Vec<u8> },
    InterruptIn { endpoint: u8, length: usize },
}

/// Errors to inject into handle operations
#[derive(Debug, Default, Clone)]
pub struct MockFailures {
    pub open: Option<rusb::Error>,
    pub kernel_driver_active: Option<rusb::Error>,
    pub detach: Option<rusb::Error>,
    pub claim: Option<rusb::Error>,
    pub submit: Option<rusb::Error>,
    pub control: Option<rusb::Error>,
    pub interrupt_out: Option<rusb::Error>,
    pub release: Option<rusb::Error>,
    pub attach: Option<rusb::Error>,
    /// Fails the device list itself
    pub devices: Option<rusb::Error>,
    /// Fails `describe` for the device at this index
    pub describe: Option<(usize, rusb::Error)>,
}

enum Pending {
    Report(Vec<u8>),
    Disconnect,
}

struct Inner {
    devices: Vec<MockDevice>,
    calls: Vec<MockCall>,
    failures: MockFailures,
    kernel_driver_attached: bool,
    disconnected: bool,
    pending: VecDeque<Pending>,
    transfers: Vec<Weak<TransferShared>>,
    feature_reports: HashMap<u8, Vec<u8>>,
    delivered: u64,
}

struct MockState {
    inner: Mutex<Inner>,
    wake: Condvar,
}

/// In-memory [`UsbBackend`]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockBackend {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            state: Arc::new(MockState {
                inner: Mutex::new(Inner {
                    devices,
                    calls: Vec::new(),
                    failures: MockFailures::default(),
                    kernel_driver_attached: false,
                    disconnected: false,
                    pending: VecDeque::new(),
                    transfers: Vec::new(),
                    feature_reports: HashMap::new(),
                    delivered: 0,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        lock(&self.state.inner).devices = devices;
    }

    pub fn set_failures(&self, failures: MockFailures) {
        lock(&self.state.inner).failures = failures;
    }

    /// Whether a kernel driver is bound to the interfaces
    pub fn set_kernel_driver_attached(&self, attached: bool) {
        lock(&self.state.inner).kernel_driver_attached = attached;
    }

    pub fn kernel_driver_attached(&self) -> bool {
        lock(&self.state.inner).kernel_driver_attached
    }

    /// Response to GET_REPORT(feature, `report_id`), ID byte included
    pub fn set_feature_report(&self, report_id: u8, report: Vec<u8>) {
        lock(&self.state.inner).feature_reports.insert(report_id, report);
    }

    /// Queue an input report for the next in-flight transfer
    pub fn push_input(&self, report: Vec<u8>) {
        let mut inner = lock(&self.state.inner);
        inner.pending.push_back(Pending::Report(report));
        self.state.wake.notify_all();
    }

    /// Simulate unplugging: the in-flight transfer completes with
    /// `NoDevice` and later submissions fail
    pub fn disconnect(&self) {
        let mut inner = lock(&self.state.inner);
        inner.pending.push_back(Pending::Disconnect);
        self.state.wake.notify_all();
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state.inner).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state.inner).calls.clear();
    }

    /// Transfers currently submitted and not yet completed
    pub fn outstanding_transfers(&self) -> usize {
        lock(&self.state.inner)
            .transfers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.submitted.load(Ordering::Acquire))
            .count()
    }

    /// Transfers allocated and not yet freed
    pub fn live_transfers(&self) -> usize {
        lock(&self.state.inner)
            .transfers
            .iter()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Number of completions delivered to sinks so far
    pub fn delivered(&self) -> u64 {
        lock(&self.state.inner).delivered
    }

    /// Wait until at least `count` completions have been delivered
    pub fn wait_delivered(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.delivered() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.delivered() >= count
    }
}

impl UsbBackend for MockBackend {
    type Device = usize;
    type Handle = MockHandle;

    fn devices(&self) -> rusb::Result<Vec<usize>> {
        let inner = lock(&self.state.inner);
        if let Some(e) = inner.failures.devices {
            return Err(e);
        }
        Ok((0..inner.devices.len()).collect())
    }

    fn describe(&self, device: &usize) -> rusb::Result<DeviceSummary> {
        let inner = lock(&self.state.inner);
        if let Some((index, e)) = inner.failures.describe
            && index == *device
        {
            return Err(e);
        }
        inner
            .devices
            .get(*device)
            .map(|d| d.summary.clone())
            .ok_or(rusb::Error::NoDevice)
    }

    fn open(&self, device: &usize) -> rusb::Result<MockHandle> {
        let mut inner = lock(&self.state.inner);
        let device = inner.devices.get(*device).cloned().ok_or(rusb::Error::NoDevice)?;
        inner.calls.push(MockCall::Open {
            bus_number: device.summary.bus_number,
            address: device.summary.address,
        });
        if !device.openable {
            return Err(rusb::Error::Access);
        }
        if let Some(e) = inner.failures.open {
            return Err(e);
        }
        Ok(MockHandle {
            state: self.state.clone(),
            strings: device.strings,
        })
    }

    fn handle_events(&self, timeout: Duration) -> rusb::Result<()> {
        let mut deliveries = Vec::new();
        {
            let inner = lock(&self.state.inner);
            let (mut inner, _) = self
                .state
                .wake
                .wait_timeout_while(inner, timeout, |inner| !has_work(inner))
                .unwrap_or_else(PoisonError::into_inner);

            let submitted: Vec<Arc<TransferShared>> = inner
                .transfers
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|t| t.submitted.load(Ordering::Acquire))
                .collect();

            for transfer in submitted {
                if transfer.cancel_requested.swap(false, Ordering::AcqRel) {
                    transfer.submitted.store(false, Ordering::Release);
                    deliveries.push((transfer, Delivery::Cancelled));
                    continue;
                }
                match inner.pending.pop_front() {
                    Some(Pending::Report(report)) => {
                        transfer.submitted.store(false, Ordering::Release);
                        deliveries.push((transfer, Delivery::Report(report)));
                    }
                    Some(Pending::Disconnect) => {
                        inner.disconnected = true;
                        transfer.submitted.store(false, Ordering::Release);
                        deliveries.push((transfer, Delivery::NoDevice));
                    }
                    None => {}
                }
            }
        }

        for (transfer, delivery) in deliveries {
            let resubmit = || transfer.submit();
            match &delivery {
                Delivery::Report(report) => {
                    let len = report.len().min(transfer.length);
                    dispatch_completion(
                        transfer.sink.as_ref(),
                        TransferStatus::Completed(&report[..len]),
                        resubmit,
                    );
                }
                Delivery::Cancelled => {
                    dispatch_completion(transfer.sink.as_ref(), TransferStatus::Cancelled, resubmit)
                }
                Delivery::NoDevice => {
                    dispatch_completion(transfer.sink.as_ref(), TransferStatus::NoDevice, resubmit)
                }
            }
            lock(&self.state.inner).delivered += 1;
        }

        Ok(())
    }
}

fn has_work(inner: &Inner) -> bool {
    inner.transfers.iter().filter_map(Weak::upgrade).any(|t| {
        t.submitted.load(Ordering::Acquire)
            && (t.cancel_requested.load(Ordering::Acquire) || !inner.pending.is_empty())
    })
}

enum Delivery {
    Report(Vec<u8>),
    Cancelled,
    NoDevice,
}

/// Handle returned by [`MockBackend::open`]
pub struct MockHandle {
    state: Arc<MockState>,
    strings: HashMap<u8, String>,
}

impl UsbHandle for MockHandle {
    type Transfer = MockTransfer;

    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::KernelDriverActive(interface));
        match inner.failures.kernel_driver_active {
            Some(e) => Err(e),
            None => Ok(inner.kernel_driver_attached),
        }
    }

    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::DetachKernelDriver(interface));
        if let Some(e) = inner.failures.detach {
            return Err(e);
        }
        inner.kernel_driver_attached = false;
        Ok(())
    }

    fn attach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::AttachKernelDriver(interface));
        if let Some(e) = inner.failures.attach {
            return Err(e);
        }
        inner.kernel_driver_attached = true;
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> rusb::Result<()> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::ClaimInterface(interface));
        match inner.failures.claim {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_interface(&self, interface: u8) -> rusb::Result<()> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::ReleaseInterface(interface));
        match inner.failures.release {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_string_ascii(&self, index: u8) -> rusb::Result<String> {
        self.strings.get(&index).cloned().ok_or(rusb::Error::NotFound)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::ControlOut {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        match inner.failures.control {
            Some(e) => Err(e),
            None => Ok(data.len()),
        }
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::ControlIn {
            request_type,
            request,
            value,
            index,
            length: buf.len(),
        });
        if let Some(e) = inner.failures.control {
            return Err(e);
        }

        let report_id = (value & 0xff) as u8;
        let report = inner.feature_reports.get(&report_id).ok_or(rusb::Error::Pipe)?;
        let len = report.len().min(buf.len());
        buf[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::InterruptOut {
            endpoint,
            data: data.to_vec(),
        });
        match inner.failures.interrupt_out {
            Some(e) => Err(e),
            None => Ok(data.len()),
        }
    }

    fn interrupt_in(
        &self,
        endpoint: u8,
        length: usize,
        _timeout: Duration,
        sink: Arc<dyn CompletionSink>,
    ) -> rusb::Result<MockTransfer> {
        let shared = Arc::new(TransferShared {
            state: self.state.clone(),
            length,
            sink,
            submitted: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        });

        let mut inner = lock(&self.state.inner);
        inner.calls.push(MockCall::InterruptIn { endpoint, length });
        inner.transfers.retain(|t| t.strong_count() > 0);
        inner.transfers.push(Arc::downgrade(&shared));

        Ok(MockTransfer { shared })
    }
}

struct TransferShared {
    state: Arc<MockState>,
    length: usize,
    sink: Arc<dyn CompletionSink>,
    submitted: AtomicBool,
    cancel_requested: AtomicBool,
}

impl TransferShared {
    fn submit(&self) -> rusb::Result<()> {
        let inner = lock(&self.state.inner);
        if inner.disconnected {
            return Err(rusb::Error::NoDevice);
        }
        if let Some(e) = inner.failures.submit {
            return Err(e);
        }
        if self.submitted.swap(true, Ordering::AcqRel) {
            return Err(rusb::Error::Busy);
        }
        self.state.wake.notify_all();
        Ok(())
    }
}

/// Interrupt-IN transfer of the mock backend
pub struct MockTransfer {
    shared: Arc<TransferShared>,
}

impl InterruptTransfer for MockTransfer {
    fn submit(&self) -> rusb::Result<()> {
        self.shared.submit()
    }

    fn cancel(&self) -> rusb::Result<()> {
        let _inner = lock(&self.shared.state.inner);
        if !self.shared.submitted.load(Ordering::Acquire) {
            return Err(rusb::Error::NotFound);
        }
        self.shared.cancel_requested.store(true, Ordering::Release);
        self.shared.state.wake.notify_all();
        Ok(())
    }
}

struct ScriptInner {
    paths: HashMap<DevicePathKey, String>,
    events: VecDeque<(Duration, HotplugEvent)>,
}

/// Hotplug service replaying scripted events
#[derive(Clone)]
pub struct ScriptedHotplug {
    inner: Arc<Mutex<ScriptInner>>,
}

impl Default for ScriptedHotplug {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptInner {
                paths: HashMap::new(),
                events: VecDeque::new(),
            })),
        }
    }
}

impl ScriptedHotplug {
    /// Resolve `key` to `path`
    pub fn with_path(self, key: DevicePathKey, path: &str) -> Self {
        lock(&self.inner).paths.insert(key, path.to_string());
        self
    }

    /// Deliver `event` `delay` after the previous one was read
    pub fn push_event(&self, delay: Duration, event: HotplugEvent) {
        lock(&self.inner).events.push_back((delay, event));
    }
}

impl HotplugService for ScriptedHotplug {
    fn resolve_path(&self, key: &DevicePathKey) -> Option<String> {
        lock(&self.inner).paths.get(key).cloned()
    }

    fn wait_for_add(&self, path: &str, timeout_ms: u32) -> Result<()> {
        let events = std::mem::take(&mut lock(&self.inner).events);
        let mut source = ScriptedSource { events };
        wait_for_path(&mut source, path, timeout_ms)
    }
}

struct ScriptedSource {
    events: VecDeque<(Duration, HotplugEvent)>,
}

impl EventSource for ScriptedSource {
    fn wait_readable(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let Some((delay, _)) = self.events.front_mut() else {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(false);
        };

        match timeout {
            Some(timeout) if *delay > timeout => {
                std::thread::sleep(timeout);
                *delay -= timeout;
                Ok(false)
            }
            _ => {
                std::thread::sleep(*delay);
                *delay = Duration::ZERO;
                Ok(true)
            }
        }
    }

    fn next_event(&mut self) -> Option<HotplugEvent> {
        self.events.pop_front().map(|(_, event)| event)
    }
}
