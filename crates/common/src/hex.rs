//! Hex helpers for report bytes and USB IDs

use crate::{Error, Result};
use std::fmt::Write;

/// Space-separated lowercase hex, e.g. `"00 aa bb"`
pub fn format_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Parse report bytes from hex tokens
///
/// Each token is either one byte (`aa`, `0xaa`) or a run of digit pairs
/// (`00aabb`). Separators `:` and `,` are accepted inside tokens.
pub fn parse_hex<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();

    for token in tokens {
        let token = token.as_ref();
        for part in token.split([':', ',']).filter(|p| !p.is_empty()) {
            let digits = strip_prefix(part);
            if digits.is_empty() {
                return Err(Error::Hex(format!("empty value in {:?}", token)));
            }
            if digits.len() <= 2 {
                bytes.push(parse_byte(digits, token)?);
                continue;
            }
            if digits.len() % 2 != 0 {
                return Err(Error::Hex(format!("odd number of digits in {:?}", token)));
            }
            for pair in digits.as_bytes().chunks(2) {
                let pair = std::str::from_utf8(pair)
                    .map_err(|_| Error::Hex(format!("invalid characters in {:?}", token)))?;
                bytes.push(parse_byte(pair, token)?);
            }
        }
    }

    Ok(bytes)
}

/// Parse a vendor or product ID such as `046d` or `0x046D`
pub fn parse_hex_u16(value: &str) -> Result<u16> {
    let digits = strip_prefix(value.trim());
    if digits.is_empty() || digits.len() > 4 {
        return Err(Error::Hex(format!("expected 1-4 hex digits, got {:?}", value)));
    }
    u16::from_str_radix(digits, 16).map_err(|e| Error::Hex(format!("{:?}: {}", value, e)))
}

fn strip_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn parse_byte(digits: &str, token: &str) -> Result<u8> {
    u8::from_str_radix(digits, 16).map_err(|e| Error::Hex(format!("{:?}: {}", token, e)))
}
