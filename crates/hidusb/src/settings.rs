//! Session tuning knobs

use crate::error::{HidError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol constants used by an open session
///
/// Defaults match what HID devices expect from a libusb host: a 5 s
/// per-request timeout on the polling transfer and 1 s for output reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Maximum number of unread input reports kept (oldest dropped first)
    pub max_queued_reports: usize,
    /// Timeout of each asynchronous interrupt-IN request
    pub input_timeout_ms: u32,
    /// Timeout for output reports (control or interrupt)
    pub output_timeout_ms: u32,
    /// Upper bound of one event-processing call in the input thread
    pub event_poll_ms: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_queued_reports: 30,
            input_timeout_ms: 5000,
            output_timeout_ms: 1000,
            event_poll_ms: 100,
        }
    }
}

impl SessionSettings {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.input_timeout_ms))
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.output_timeout_ms))
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(u64::from(self.event_poll_ms.max(1)))
    }

    /// Reject settings a session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_queued_reports == 0 {
            return Err(HidError::InvalidArgs);
        }
        Ok(())
    }
}
