//! Session Integration Tests
//!
//! Drives `HidDevice` end to end against the in-memory backend:
//! - Enumeration and filtering
//! - Open/close lifecycle, rollback and kernel driver handling
//! - Input pipeline queueing and read timeouts
//! - Output and feature report framing
//! - Reattachment waits
//!
//! Run with: `cargo test -p hidusb --test session_tests`

use hidusb::hotplug::{DevicePathKey, HotplugEvent, NullHotplug};
use hidusb::test_utils::{
    MockBackend, MockCall, MockDevice, MockFailures, ScriptedHotplug, hid_interface, interface,
};
use hidusb::{HidDevice, HidError, SessionSettings};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const VID: u16 = 0x1234;
const PID: u16 = 0x5678;

fn open_device(backend: &Arc<MockBackend>) -> HidDevice<MockBackend> {
    let mut device = HidDevice::with_backend(
        backend.clone(),
        Box::new(NullHotplug),
        SessionSettings::default(),
    )
    .unwrap();
    device.open(VID, PID, None).unwrap();
    device
}

fn single_device() -> Arc<MockBackend> {
    Arc::new(MockBackend::new(vec![MockDevice::hid(VID, PID, 1, 7)]))
}

// ============================================================================
// Enumeration
// ============================================================================

#[test]
fn test_enumerate_wildcard_lists_all_hid_interfaces() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, 0x0001, 1, 2),
        MockDevice::hid(VID, 0x0002, 1, 3),
        // Vendor-specific device class is inspected
        MockDevice::hid(0xabcd, 0x0001, 2, 4).with_class(0xff),
        // Hub class is never inspected
        MockDevice::hid(0xabcd, 0x0002, 2, 5).with_class(0x09),
        // Mass storage interface is not HID
        MockDevice::hid(0xabcd, 0x0003, 2, 6)
            .with_interfaces(vec![interface(0, 0x08, Some(0x81), Some(0x02))]),
    ]));
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    let records = device.enumerate(0, 0).unwrap();
    let ids: Vec<(u16, u16)> = records.iter().map(|r| (r.vendor_id, r.product_id)).collect();
    assert_eq!(ids, vec![(VID, 0x0001), (VID, 0x0002), (0xabcd, 0x0001)]);
}

#[test]
fn test_enumerate_filters_are_exact() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, 0x0001, 1, 2),
        MockDevice::hid(VID, 0x0002, 1, 3),
        MockDevice::hid(0xabcd, 0x0001, 1, 4),
    ]));
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    assert_eq!(device.enumerate(VID, 0).unwrap().len(), 2);
    assert_eq!(device.enumerate(0, 0x0001).unwrap().len(), 2);

    let records = device.enumerate(VID, 0x0002).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].device_address, 3);

    assert!(device.enumerate(0x9999, 0).unwrap().is_empty());
    // Previous result is replaced, not appended to
    assert!(device.devices().is_empty());
}

#[test]
fn test_enumerate_one_record_per_hid_interface() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, PID, 1, 2).with_interfaces(vec![
            hid_interface(0, Some(0x81), None),
            interface(1, 0x0a, None, None),
            hid_interface(2, Some(0x83), Some(0x04)),
        ]),
    ]));
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    let interfaces: Vec<u8> = device
        .enumerate(0, 0)
        .unwrap()
        .iter()
        .map(|r| r.interface_number)
        .collect();
    assert_eq!(interfaces, vec![0, 2]);
}

#[test]
fn test_enumerate_reads_strings_best_effort() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, 0x0001, 1, 2)
            .with_serial("SN-0001")
            .with_product("Acme", "Widget"),
        MockDevice::hid(VID, 0x0002, 1, 3)
            .with_serial("SN-0002")
            .unopenable(),
    ]));
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    let records = device.enumerate(0, 0).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].serial_number.as_deref(), Some("SN-0001"));
    assert_eq!(records[0].manufacturer.as_deref(), Some("Acme"));
    assert_eq!(records[0].product.as_deref(), Some("Widget"));
    assert_eq!(records[0].release_number, 0x0100);

    // Listed without strings when it cannot be opened
    assert_eq!(records[1].serial_number, None);
    assert_eq!(records[1].product, None);
}

#[test]
fn test_enumerate_skips_device_without_descriptors() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, 0x0001, 1, 2),
        MockDevice::hid(VID, 0x0002, 1, 3),
    ]));
    backend.set_failures(MockFailures {
        describe: Some((0, rusb::Error::Io)),
        ..Default::default()
    });
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    let records = device.enumerate(0, 0).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].product_id, 0x0002);
    assert_eq!(records[0].device_address, 3);
}

#[test]
fn test_enumerate_device_list_failure_is_backend_unavailable() {
    let backend = single_device();
    backend.set_failures(MockFailures {
        devices: Some(rusb::Error::NoMem),
        ..Default::default()
    });
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    let err = device.enumerate(0, 0).unwrap_err();
    assert!(matches!(err, HidError::BackendUnavailable(rusb::Error::NoMem)));
    assert_eq!(err.code(), -1007);
    assert!(device.devices().is_empty());
    assert!(matches!(device.open(VID, PID, None), Err(HidError::BackendUnavailable(_))));
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn test_open_starts_one_thread_and_one_transfer() {
    let backend = single_device();
    let mut device = open_device(&backend);

    assert!(device.is_open());
    assert!(device.is_polling());
    assert_eq!(backend.outstanding_transfers(), 1);

    let identity = device.identity().unwrap().clone();
    assert_eq!(identity.interface, 0);
    assert_eq!(identity.input_endpoint, 0x81);
    assert_eq!(identity.max_packet_size, 64);
    assert_eq!(identity.output_endpoint, Some(0x02));
    assert!(!identity.detached_kernel_driver);
    assert!(backend.calls().contains(&MockCall::ClaimInterface(0)));

    device.close();

    assert!(!device.is_open());
    assert!(!device.is_polling());
    assert_eq!(backend.outstanding_transfers(), 0);
    assert!(backend.calls().contains(&MockCall::ReleaseInterface(0)));
}

#[test]
fn test_close_without_session_is_noop() {
    let backend = single_device();
    let mut device =
        HidDevice::with_backend(backend.clone(), Box::new(NullHotplug), SessionSettings::default())
            .unwrap();
    device.close();
    device.close();
    assert!(backend.calls().is_empty());
}

#[test]
fn test_open_replaces_existing_session() {
    let backend = single_device();
    let mut device = open_device(&backend);
    backend.clear_calls();

    device.open(VID, PID, None).unwrap();

    let calls = backend.calls();
    let release = calls.iter().position(|c| *c == MockCall::ReleaseInterface(0));
    let claim = calls.iter().position(|c| *c == MockCall::ClaimInterface(0));
    assert!(release.unwrap() < claim.unwrap());
    assert_eq!(backend.outstanding_transfers(), 1);
}

#[test]
fn test_kernel_driver_detached_and_reattached() {
    let backend = single_device();
    backend.set_kernel_driver_attached(true);

    let mut device = open_device(&backend);
    assert!(device.identity().unwrap().detached_kernel_driver);
    assert!(!backend.kernel_driver_attached());

    device.close();
    assert!(backend.kernel_driver_attached());
    assert!(backend.calls().contains(&MockCall::AttachKernelDriver(0)));
}

#[test]
fn test_close_completes_when_release_and_reattach_fail() {
    let backend = single_device();
    backend.set_kernel_driver_attached(true);
    let mut device = open_device(&backend);
    backend.set_failures(MockFailures {
        release: Some(rusb::Error::NoDevice),
        attach: Some(rusb::Error::NoDevice),
        ..Default::default()
    });

    device.close();

    assert!(!device.is_open());
    assert!(!device.is_polling());
    assert_eq!(backend.outstanding_transfers(), 0);
    let calls = backend.calls();
    assert!(calls.contains(&MockCall::ReleaseInterface(0)));
    assert!(calls.contains(&MockCall::AttachKernelDriver(0)));
    assert!(!backend.kernel_driver_attached());

    // A later open starts from a clean state
    backend.set_failures(MockFailures::default());
    device.open(VID, PID, None).unwrap();
    assert!(device.is_open());
}

#[test]
fn test_kernel_driver_query_not_supported_counts_as_none() {
    let backend = single_device();
    backend.set_failures(MockFailures {
        kernel_driver_active: Some(rusb::Error::NotSupported),
        ..Default::default()
    });

    let device = open_device(&backend);
    assert!(!device.identity().unwrap().detached_kernel_driver);
}

#[test]
fn test_claim_failure_rolls_back() {
    let backend = single_device();
    backend.set_kernel_driver_attached(true);
    backend.set_failures(MockFailures {
        claim: Some(rusb::Error::Busy),
        ..Default::default()
    });

    let mut device =
        HidDevice::with_backend(backend.clone(), Box::new(NullHotplug), SessionSettings::default())
            .unwrap();
    let err = device.open(VID, PID, None).unwrap_err();

    assert!(matches!(err, HidError::Transport(rusb::Error::Busy)));
    assert_eq!(err.code(), -6);
    assert!(!device.is_open());
    assert!(backend.kernel_driver_attached());
    assert_eq!(backend.outstanding_transfers(), 0);

    let calls = backend.calls();
    assert!(calls.contains(&MockCall::DetachKernelDriver(0)));
    assert!(calls.contains(&MockCall::AttachKernelDriver(0)));
    assert!(!calls.contains(&MockCall::ReleaseInterface(0)));
}

#[test]
fn test_submit_failure_rolls_back() {
    let backend = single_device();
    backend.set_failures(MockFailures {
        submit: Some(rusb::Error::Io),
        ..Default::default()
    });

    let mut device =
        HidDevice::with_backend(backend.clone(), Box::new(NullHotplug), SessionSettings::default())
            .unwrap();
    let err = device.open(VID, PID, None).unwrap_err();

    assert_eq!(err.code(), -1);
    assert!(!device.is_open());
    assert!(!device.is_polling());
    assert!(backend.calls().contains(&MockCall::ReleaseInterface(0)));
}

#[test]
fn test_missing_input_endpoint_fails_open() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, PID, 1, 7).with_interfaces(vec![hid_interface(0, None, Some(0x02))]),
    ]));

    let mut device =
        HidDevice::with_backend(backend.clone(), Box::new(NullHotplug), SessionSettings::default())
            .unwrap();
    let err = device.open(VID, PID, None).unwrap_err();

    assert!(matches!(err, HidError::NoInputEndpoint { interface: 0 }));
    assert!(backend.calls().contains(&MockCall::ReleaseInterface(0)));
}

#[test]
fn test_open_selects_by_exact_serial() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, PID, 1, 7).with_serial("A1"),
        MockDevice::hid(VID, PID, 1, 8).with_serial("B2"),
    ]));
    let mut device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    device.open(VID, PID, Some("B2")).unwrap();
    assert_eq!(device.identity().unwrap().device_address, 8);

    device.open(VID, PID, None).unwrap();
    assert_eq!(device.identity().unwrap().device_address, 7);

    assert!(matches!(
        device.open(VID, PID, Some("b2")),
        Err(HidError::NoDevice)
    ));
    assert!(device.is_open());
    assert_eq!(device.identity().unwrap().device_address, 7);
}

#[test]
fn test_open_stale_record_fails() {
    let backend = single_device();
    let mut device =
        HidDevice::with_backend(backend.clone(), Box::new(NullHotplug), SessionSettings::default())
            .unwrap();
    let record = device.enumerate(VID, PID).unwrap()[0].clone();

    // Device re-enumerated at a new address
    backend.set_devices(vec![MockDevice::hid(VID, PID, 1, 9)]);

    assert!(matches!(device.open_device(&record), Err(HidError::NoDevice)));
}

#[test]
fn test_operations_require_open_session() {
    let backend = single_device();
    let device =
        HidDevice::with_backend(backend, Box::new(NullHotplug), SessionSettings::default())
            .unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(device.read_timeout(&mut buf, 0), Err(HidError::NotOpen)));
    assert!(matches!(device.write(&[0, 1], false), Err(HidError::NotOpen)));
    assert!(matches!(device.read_feature(1, 8, 0), Err(HidError::NotOpen)));
    assert_eq!(HidError::NotOpen.code(), -1002);
}

// ============================================================================
// Input pipeline
// ============================================================================

#[test]
fn test_read_returns_reports_in_order() {
    let backend = single_device();
    let device = open_device(&backend);

    backend.push_input(vec![1, 2, 3]);
    backend.push_input(vec![4, 5]);

    assert_eq!(device.read_report(64, 1000).unwrap(), vec![1, 2, 3]);
    assert_eq!(device.read_report(64, 1000).unwrap(), vec![4, 5]);
}

#[test]
fn test_read_truncates_to_buffer() {
    let backend = single_device();
    let device = open_device(&backend);

    backend.push_input(vec![1, 2, 3, 4]);
    assert!(backend.wait_delivered(1, Duration::from_secs(2)));

    let mut buf = [0u8; 2];
    assert_eq!(device.read_timeout(&mut buf, 0).unwrap(), 2);
    assert_eq!(buf, [1, 2]);
    assert_eq!(device.read_timeout(&mut buf, 0).unwrap(), 0);
}

#[test]
fn test_queue_depth_bounded_drop_oldest() {
    let backend = single_device();
    let device = open_device(&backend);

    for i in 0..40u8 {
        backend.push_input(vec![i]);
    }
    assert!(backend.wait_delivered(40, Duration::from_secs(5)));

    assert_eq!(device.queued_reports(), 30);
    assert_eq!(device.input_stats(), Some((40, 10)));

    let first = device.read_report(8, 0).unwrap();
    assert_eq!(first, vec![10]);
}

#[test]
fn test_non_blocking_read_returns_immediately() {
    let backend = single_device();
    let device = open_device(&backend);

    let start = Instant::now();
    assert!(device.read_report(64, 0).unwrap().is_empty());
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_timed_read_waits_full_timeout() {
    let backend = single_device();
    let device = open_device(&backend);

    let start = Instant::now();
    assert!(device.read_report(64, 150).unwrap().is_empty());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(1500));
}

#[test]
fn test_disconnect_releases_blocked_reader() {
    let backend = single_device();
    let device = open_device(&backend);

    let unplug = backend.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        unplug.disconnect();
    });

    let mut buf = [0u8; 8];
    assert!(matches!(
        device.read_timeout(&mut buf, -1),
        Err(HidError::ReadError)
    ));
    handle.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while device.is_polling() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!device.is_polling());
    assert_eq!(backend.outstanding_transfers(), 0);
}

#[test]
fn test_close_releases_reader_on_other_thread() {
    let backend = single_device();
    let mut device = open_device(&backend);
    let reader = device.input_reader().unwrap();

    let handle = thread::spawn(move || {
        let mut buf = [0u8; 64];
        reader.read(&mut buf, -1)
    });
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    device.close();

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(HidError::ReadError)));
    assert!(matches!(device.input_reader(), Err(HidError::NotOpen)));
}

// ============================================================================
// Output and feature reports
// ============================================================================

#[test]
fn test_write_strips_zero_report_id() {
    let backend = single_device();
    let device = open_device(&backend);
    backend.clear_calls();

    assert_eq!(device.write(&[0x00, 0xaa, 0xbb], false).unwrap(), 3);
    assert_eq!(
        backend.calls(),
        vec![MockCall::InterruptOut {
            endpoint: 0x02,
            data: vec![0xaa, 0xbb],
        }]
    );
}

#[test]
fn test_write_keeps_nonzero_report_id() {
    let backend = single_device();
    let device = open_device(&backend);
    backend.clear_calls();

    assert_eq!(device.write(&[0x02, 0xaa], false).unwrap(), 2);
    assert_eq!(
        backend.calls(),
        vec![MockCall::InterruptOut {
            endpoint: 0x02,
            data: vec![0x02, 0xaa],
        }]
    );
}

#[test]
fn test_write_without_output_endpoint_uses_set_report() {
    let backend = Arc::new(MockBackend::new(vec![
        MockDevice::hid(VID, PID, 1, 7).without_output_endpoint(),
    ]));
    let device = open_device(&backend);
    assert_eq!(device.identity().unwrap().output_endpoint, None);
    backend.clear_calls();

    assert_eq!(device.write(&[0x00, 0xaa, 0xbb], false).unwrap(), 3);
    assert_eq!(
        backend.calls(),
        vec![MockCall::ControlOut {
            request_type: 0x21,
            request: 0x09,
            value: 0x0200,
            index: 0,
            data: vec![0xaa, 0xbb],
        }]
    );
}

#[test]
fn test_feature_write_always_uses_control() {
    let backend = single_device();
    let device = open_device(&backend);
    backend.clear_calls();

    assert_eq!(device.write(&[0x05, 0xaa], true).unwrap(), 2);
    assert_eq!(
        backend.calls(),
        vec![MockCall::ControlOut {
            request_type: 0x21,
            request: 0x09,
            value: 0x0305,
            index: 0,
            data: vec![0x05, 0xaa],
        }]
    );
}

#[test]
fn test_write_errors() {
    let backend = single_device();
    let device = open_device(&backend);

    assert!(matches!(device.write(&[], false), Err(HidError::InvalidArgs)));

    backend.set_failures(MockFailures {
        interrupt_out: Some(rusb::Error::Timeout),
        ..Default::default()
    });
    let err = device.write(&[0x01, 0x02], false).unwrap_err();
    assert_eq!(err.code(), -7);
    assert_eq!(hidusb::error_string(err.code()), "libusb: Operation timed out.");
}

#[test]
fn test_read_feature_report() {
    let backend = single_device();
    let device = open_device(&backend);
    backend.set_feature_report(0x05, vec![0x05, 0x10, 0x20, 0x30]);
    backend.clear_calls();

    let report = device.read_feature(0x05, 16, 0).unwrap();
    assert_eq!(report, vec![0x05, 0x10, 0x20, 0x30]);
    assert_eq!(
        backend.calls(),
        vec![MockCall::ControlIn {
            request_type: 0xa1,
            request: 0x01,
            value: 0x0305,
            index: 0,
            length: 16,
        }]
    );

    // Unknown report stalls
    let err = device.read_feature(0x06, 16, 0).unwrap_err();
    assert!(matches!(err, HidError::Transport(rusb::Error::Pipe)));
    assert!(matches!(device.read_feature(0x05, 0, 0), Err(HidError::InvalidArgs)));
}

// ============================================================================
// Reattachment
// ============================================================================

const DEVICE_PATH: &str = "/devices/pci0000:00/0000:00:14.0/usb1/1-2";

fn open_with_hotplug(
    backend: &Arc<MockBackend>,
    hotplug: ScriptedHotplug,
) -> HidDevice<MockBackend> {
    let mut device =
        HidDevice::with_backend(backend.clone(), Box::new(hotplug), SessionSettings::default())
            .unwrap();
    device.open(VID, PID, None).unwrap();
    device
}

#[test]
fn test_reattach_without_path_fails() {
    let backend = single_device();
    let device = open_device(&backend);
    assert_eq!(device.device_path(), None);
    assert!(matches!(
        device.wait_for_reattach(100),
        Err(HidError::NoDevicePath)
    ));
}

#[test]
fn test_reattach_succeeds_on_matching_add() {
    let backend = single_device();
    let hotplug =
        ScriptedHotplug::default().with_path(DevicePathKey::new(VID, PID, 1, 7), DEVICE_PATH);
    let mut device = open_with_hotplug(&backend, hotplug.clone());
    assert_eq!(device.device_path(), Some(DEVICE_PATH));

    device.close();
    // Path survives close
    assert_eq!(device.device_path(), Some(DEVICE_PATH));

    hotplug.push_event(Duration::from_millis(20), HotplugEvent::remove(DEVICE_PATH));
    hotplug.push_event(Duration::from_millis(20), HotplugEvent::add("/devices/other"));
    hotplug.push_event(Duration::from_millis(20), HotplugEvent::add(DEVICE_PATH));

    let start = Instant::now();
    device.wait_for_reattach(500).unwrap();
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[test]
fn test_reattach_times_out() {
    let backend = single_device();
    let hotplug =
        ScriptedHotplug::default().with_path(DevicePathKey::new(VID, PID, 1, 7), DEVICE_PATH);
    let mut device = open_with_hotplug(&backend, hotplug);
    device.close();

    let start = Instant::now();
    let err = device.wait_for_reattach(500).unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(2000));
}

#[test]
fn test_reattach_ignores_late_match() {
    let backend = single_device();
    let hotplug =
        ScriptedHotplug::default().with_path(DevicePathKey::new(VID, PID, 1, 7), DEVICE_PATH);
    let device = open_with_hotplug(&backend, hotplug.clone());

    hotplug.push_event(Duration::from_millis(400), HotplugEvent::add(DEVICE_PATH));

    let err = device.wait_for_reattach(100).unwrap_err();
    assert!(err.is_timeout());
}
