//! Error codes carried in [`Outcome::Error`].
//!
//! 0, 1 and 2 follow the warning/error/fatal convention. Codes from 100 up
//! are produced locally by this crate.

use std::time::Duration;

use linkrpc_frame::Outcome;

pub use linkrpc_frame::level::{ERROR, FATAL, WARNING};

pub const TIMED_OUT: i32 = 101;
pub const DISCONNECTED: i32 = 102;
pub const NOT_READY: i32 = 103;
pub const UNKNOWN_SERVICE: i32 = 104;
pub const AUTH_REQUIRED: i32 = 105;
pub const SIGNATURE_MISMATCH: i32 = 106;
pub const NOT_FOUND: i32 = 107;

pub fn timed_out(after: Duration) -> Outcome {
    Outcome::error(
        TIMED_OUT,
        format!("timed out after {} ms waiting for a reply", after.as_millis()),
    )
}

pub fn disconnected(reason: &str) -> Outcome {
    Outcome::error(DISCONNECTED, format!("disconnected: {reason}"))
}

pub fn is_timeout(outcome: &Outcome) -> bool {
    outcome.error_code() == Some(TIMED_OUT)
}

pub fn is_disconnect(outcome: &Outcome) -> bool {
    outcome.error_code() == Some(DISCONNECTED)
}
