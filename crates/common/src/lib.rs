//! Common utilities for hidusb
//!
//! Shared pieces of the command-line front end: application error type,
//! tracing setup, and hex helpers for report bytes.

pub mod error;
pub mod hex;
pub mod logging;

pub use error::{Error, Result};
pub use hex::{format_hex, parse_hex, parse_hex_u16};
pub use logging::setup_logging;
