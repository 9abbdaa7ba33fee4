//! Input report pipeline
//!
//! Dedicated thread that keeps one asynchronous interrupt-IN transfer in
//! flight and drives the backend's event processing. Completions land in an
//! [`InputQueue`], from which callers read synchronously.
//!
//! ```text
//! Device ──interrupt IN──► backend ──completion──► InputQueue ──read()──► caller
//!                            ▲                        │
//!                            └──── resubmit ◄─────────┘
//! ```
//!
//! The thread lives exactly as long as the session: it is spawned on open and
//! joined on close. `start` returns only after the first transfer has been
//! submitted, so a close can never race ahead of the transfer it must cancel.

use crate::error::{HidError, Result};
use crate::settings::SessionSettings;
use crate::usb::backend::{CompletionSink, InterruptTransfer, TransferStatus, UsbBackend, UsbHandle};
use crate::usb::report_queue::ReportQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Input reports shared between the pipeline thread and readers
pub struct InputQueue {
    reports: Mutex<ReportQueue>,
    ready: Condvar,
    shutdown: AtomicBool,
}

impl InputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            reports: Mutex::new(ReportQueue::new(capacity)),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReportQueue> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Wake every blocked reader so it re-checks the shutdown flag
    pub fn wake_readers(&self) {
        let _reports = self.lock();
        self.ready.notify_all();
    }

    /// Number of unread reports
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// (received, dropped)
    pub fn stats(&self) -> (u64, u64) {
        self.lock().stats()
    }

    /// Dequeue the oldest report into `buf`
    ///
    /// `timeout_ms` follows the usual HID convention: negative blocks until a
    /// report arrives, `0` returns immediately, positive waits at most that
    /// many milliseconds. Returns `Ok(0)` when nothing arrived in time and
    /// [`HidError::ReadError`] when the pipeline shut down while waiting.
    /// Reports longer than `buf` are truncated and the excess discarded.
    pub fn read(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let mut reports = self.lock();

        if let Some(report) = reports.pop() {
            return Ok(copy_report(&report, buf));
        }
        if self.is_shut_down() {
            return Err(HidError::ReadError);
        }

        if timeout_ms == 0 {
            return Ok(0);
        } else if timeout_ms < 0 {
            reports = self
                .ready
                .wait_while(reports, |q| q.is_empty() && !self.is_shut_down())
                .unwrap_or_else(PoisonError::into_inner);
        } else {
            let timeout = Duration::from_millis(u64::from(timeout_ms.unsigned_abs()));
            let (guard, result) = self
                .ready
                .wait_timeout_while(reports, timeout, |q| {
                    q.is_empty() && !self.is_shut_down()
                })
                .unwrap_or_else(PoisonError::into_inner);
            reports = guard;
            if result.timed_out() && reports.is_empty() {
                return Ok(0);
            }
        }

        match reports.pop() {
            Some(report) => Ok(copy_report(&report, buf)),
            None => Err(HidError::ReadError),
        }
    }
}

fn copy_report(report: &[u8], buf: &mut [u8]) -> usize {
    let len = report.len().min(buf.len());
    buf[..len].copy_from_slice(&report[..len]);
    if len < report.len() {
        trace!("Truncated input report from {} to {} bytes", report.len(), len);
    }
    len
}

impl CompletionSink for InputQueue {
    fn on_complete(&self, status: TransferStatus<'_>) -> bool {
        match status {
            TransferStatus::Completed(data) => {
                let report = data.to_vec();
                let mut reports = self.lock();
                if reports.push(report) {
                    self.ready.notify_one();
                }
                true
            }
            TransferStatus::Cancelled | TransferStatus::NoDevice => {
                debug!("Input transfer ended: {:?}", status);
                self.shut_down();
                false
            }
            other => {
                trace!("Input transfer finished with {:?}, resubmitting", other);
                true
            }
        }
    }

    fn on_resubmit_failed(&self, error: rusb::Error) {
        warn!("Failed to resubmit input transfer: {}", error);
        self.shut_down();
    }
}

/// Running input pipeline of one session
pub struct InputPipeline<T: InterruptTransfer> {
    queue: Arc<InputQueue>,
    transfer: Arc<T>,
    thread: Option<JoinHandle<()>>,
}

impl<T: InterruptTransfer> InputPipeline<T> {
    /// Spawn the input thread and wait until its first transfer is in flight
    pub fn start<B>(
        backend: Arc<B>,
        handle: Arc<B::Handle>,
        endpoint: u8,
        max_packet_size: u16,
        settings: &SessionSettings,
    ) -> Result<Self>
    where
        B: UsbBackend,
        B::Handle: UsbHandle<Transfer = T>,
    {
        let queue = Arc::new(InputQueue::new(settings.max_queued_reports));
        let (ready_tx, ready_rx) = async_channel::bounded::<rusb::Result<Arc<T>>>(1);

        let thread_queue = queue.clone();
        let length = usize::from(max_packet_size);
        let input_timeout = settings.input_timeout();
        let poll = settings.event_poll();

        let thread = std::thread::Builder::new()
            .name("hid-input".to_string())
            .spawn(move || {
                let sink: Arc<dyn CompletionSink> = thread_queue.clone();
                let started = handle
                    .interrupt_in(endpoint, length, input_timeout, sink)
                    .map(Arc::new)
                    .and_then(|transfer| {
                        transfer.submit()?;
                        Ok(transfer)
                    });
                drop(handle);

                let transfer = match started {
                    Ok(transfer) => transfer,
                    Err(e) => {
                        let _ = ready_tx.send_blocking(Err(e));
                        return;
                    }
                };

                if ready_tx.send_blocking(Ok(transfer.clone())).is_err() {
                    thread_queue.shut_down();
                }

                run_event_loop(backend.as_ref(), &thread_queue, transfer.as_ref(), poll);
            })?;

        let transfer = match ready_rx.recv_blocking() {
            Ok(Ok(transfer)) => transfer,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(HidError::Transport(e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(HidError::Transport(rusb::Error::Other));
            }
        };

        info!(
            "Input pipeline running on endpoint {:#04x} ({} byte packets)",
            endpoint, max_packet_size
        );

        Ok(Self {
            queue,
            transfer,
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> &Arc<InputQueue> {
        &self.queue
    }

    /// True while the input thread has not exited
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal shutdown, cancel the transfer and join the input thread
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.queue.shut_down();
        if let Err(e) = self.transfer.cancel() {
            debug!("Cancel of input transfer returned: {}", e);
        }
        if thread.join().is_err() {
            warn!("Input thread panicked");
        }
        self.queue.wake_readers();
        debug!("Input pipeline stopped");
    }
}

impl<T: InterruptTransfer> Drop for InputPipeline<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the input thread after the first submission
fn run_event_loop<B, T>(backend: &B, queue: &InputQueue, transfer: &T, poll: Duration)
where
    B: UsbBackend + ?Sized,
    T: InterruptTransfer + ?Sized,
{
    debug!("Input thread event loop started");

    while !queue.is_shut_down() {
        match backend.handle_events(poll) {
            Ok(()) => {}
            Err(
                e @ (rusb::Error::Busy
                | rusb::Error::Timeout
                | rusb::Error::Overflow
                | rusb::Error::Interrupted),
            ) => {
                trace!("Transient event handling error: {}", e);
            }
            Err(e) => {
                warn!("Error handling USB events, stopping input pipeline: {}", e);
                break;
            }
        }
    }

    // Let a pending cancellation complete before the transfer is released
    if transfer.cancel().is_ok() {
        let _ = backend.handle_events(poll);
    }

    queue.shut_down();
    queue.wake_readers();
    debug!("Input thread event loop exited");
}
