//! Status code extraction from host errors.

use crate::context::{ErrorCode, HostError};
use spanwise_core::{is_http_status, STATUS_FAILURE};

/// Best-effort HTTP status for a host error.
///
/// Checked in order: `code`, `status_code`, a leading three-digit number in
/// the message, then `HTTP <code>` or `status: <code>` inside the message.
/// Anything outside 100..=599 is ignored. Defaults to 500.
pub fn extract_status_code(error: &HostError) -> u16 {
    from_code(error.code.as_ref())
        .or_else(|| error.status_code.and_then(as_status))
        .or_else(|| leading_code(&error.message))
        .or_else(|| embedded_code(&error.message))
        .unwrap_or(STATUS_FAILURE)
}

fn as_status(code: i64) -> Option<u16> {
    is_http_status(code).then_some(code as u16)
}

fn from_code(code: Option<&ErrorCode>) -> Option<u16> {
    match code? {
        ErrorCode::Number(n) => as_status(*n),
        ErrorCode::Text(s) => s.trim().parse::<i64>().ok().and_then(as_status),
    }
}

fn three_digits(s: &str) -> Option<u16> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() != 3 {
        return None;
    }
    digits.parse::<i64>().ok().and_then(as_status)
}

fn leading_code(message: &str) -> Option<u16> {
    three_digits(message.trim_start())
}

fn embedded_code(message: &str) -> Option<u16> {
    let lower = message.to_ascii_lowercase();
    ["http ", "status: ", "status:"].iter().find_map(|marker| {
        lower
            .match_indices(marker)
            .find_map(|(i, _)| three_digits(lower[i + marker.len()..].trim_start()))
    })
}
