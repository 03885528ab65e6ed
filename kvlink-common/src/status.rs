//! # Status Codes
//!
//! Purpose: Define the numeric outcome taxonomy every round trip reports.
//!
//! ## Design Principles
//!
//! 1. **Stable Codes**: Values are part of the public surface; `OK` is `1`
//!    and every failure is negative.
//! 2. **Fixed Messages**: Each failure maps to one short human readable text
//!    so diagnostics read the same regardless of the call site.

use std::fmt;

/// Outcome code of a command round trip.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 1,
    Fail = -1,
    IoErr = -2,
    SysErr = -3,
    NetErr = -4,
    Timeout = -5,
    DataErr = -6,
    SysBusy = -7,
    ParamErr = -8,
    NotFound = -9,
    NetClose = -10,
    NetDelay = -11,
    AuthFail = -12,
}

impl Status {
    /// All codes in declaration order.
    pub const ALL: [Status; 13] = [
        Status::Ok,
        Status::Fail,
        Status::IoErr,
        Status::SysErr,
        Status::NetErr,
        Status::Timeout,
        Status::DataErr,
        Status::SysBusy,
        Status::ParamErr,
        Status::NotFound,
        Status::NetClose,
        Status::NetDelay,
        Status::AuthFail,
    ];

    /// Returns the numeric wire-independent code.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Converts a numeric code back into a status.
    pub fn from_code(code: i32) -> Option<Status> {
        Status::ALL.iter().copied().find(|status| status.code() == code)
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        self.code() > 0
    }

    /// Returns true for outcomes after which the connection can no longer be
    /// trusted to be in sync with the server.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Status::NetErr | Status::NetClose | Status::Timeout | Status::DataErr | Status::ParamErr
        )
    }

    /// Human readable text for the failure taxonomy.
    pub const fn message(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::SysErr => "system error",
            Status::NetErr => "network error",
            Status::DataErr => "protocol error",
            Status::Timeout => "response timeout",
            Status::NotFound => "element not found",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.message(), self.code())
    }
}
