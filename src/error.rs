//! Stable numeric error codes returned across the public API.
//!
//! Mirrors the teacher binding's convention of returning raw `i32` codes from
//! `Context::connect`/`load_cookie_from_file`, but gives the code set a real
//! `std::error::Error` impl instead of a bare integer.

use thiserror::Error;

/// A stable, numeric error code.
///
/// Variant order matches the wire encoding used for the `ERROR` command tail
/// (see `proto::Command::Error`); do not reorder.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    #[error("no error")]
    Ok = 0,
    #[error("protocol error")]
    Protocol = 1,
    #[error("timeout")]
    Timeout = 2,
    #[error("no authentication key")]
    AuthKey = 3,
    #[error("internal error")]
    Internal = 4,
    #[error("connection terminated")]
    ConnectionTerminated = 5,
    #[error("connection refused")]
    ConnectionRefused = 6,
    #[error("invalid argument")]
    Invalid = 7,
    #[error("invalid server")]
    InvalidServer = 8,
    #[error("no such entity")]
    NoEntity = 9,
    #[error("bad state")]
    BadState = 10,
    #[error("unsupported protocol version")]
    Version = 11,
    #[error("operation not supported")]
    NotSupported = 12,
    #[error("the process forked and the object is no longer usable in this process")]
    Forked = 13,
    #[error("unknown error code")]
    Unknown = 14,
    /// Sentinel; one past the last valid code.
    #[error("error code out of range")]
    Max = 15,
}

impl ErrorCode {
    /// Minimum protocol version this core will authenticate against.
    pub const MIN_PROTOCOL_VERSION: u32 = 8;

    /// Normalize a code that arrived over the wire in an `ERROR` reply.
    ///
    /// Per spec: a server-reported code of `OK` or `>= MAX` does not mean
    /// success over the wire (an `ERROR` command already implies failure),
    /// so it is folded into `Protocol` (was `OK`) or `Unknown` (was out of
    /// range) rather than trusted verbatim.
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => ErrorCode::Protocol,
            c if c >= ErrorCode::Max as u32 => ErrorCode::Unknown,
            c => {
                // Safe: c is in (0, Max) and the enum is a contiguous repr(u32).
                unsafe { std::mem::transmute(c) }
            }
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Ok
    }
}
