//! Terminal status codes sent to clients and produced by workers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status code carried by the terminal reply of every client call.
///
/// Worker exit codes are folded onto the same space so that an exit
/// without any explicit report can become the group outcome directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    /// Bad arguments, unknown pool, permission problems
    UserError = 1,
    /// Transient system failure (spawn, I/O, worker crash)
    SystemError = 2,
    /// Worker exited with an unrecognized code
    UnexpectedError = 3,
    /// Pool or worker configuration is inconsistent
    ConfigError = 4,
    /// No disk space could be found after the allowed retries
    NoSpace = 28,
    /// The file was cleared while the request was pending
    Cleared = 192,
    /// The request was killed by its owner or an administrator
    Killed = 196,
    /// The daemon is initializing or shutting down
    NotActive = 197,
    /// The daemon has no resources left to start the work right now
    TemporarilyUnavailable = 198,
}

impl StatusCode {
    /// Numeric value on the wire
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Map a worker process exit code to a status.
    #[must_use]
    pub const fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::UserError,
            2 => Self::SystemError,
            4 => Self::ConfigError,
            28 => Self::NoSpace,
            192 => Self::Cleared,
            196 => Self::Killed,
            _ => Self::UnexpectedError,
        }
    }

    /// Severity rank used to fold sub-request outcomes into a group status.
    /// Higher wins.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Cleared => 1,
            Self::TemporarilyUnavailable => 2,
            Self::NotActive => 3,
            Self::UserError => 4,
            Self::UnexpectedError => 5,
            Self::SystemError => 6,
            Self::ConfigError => 7,
            Self::NoSpace => 8,
            Self::Killed => 9,
        }
    }

    /// Return the more severe of two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Outcomes that may be re-dispatched on the next sweep
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::SystemError | Self::UnexpectedError)
    }

    /// Outcomes that end a group without any further dispatch
    #[must_use]
    pub const fn is_final_failure(self) -> bool {
        matches!(
            self,
            Self::UserError | Self::ConfigError | Self::NoSpace | Self::Cleared | Self::Killed
        )
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::UserError,
            2 => Self::SystemError,
            3 => Self::UnexpectedError,
            4 => Self::ConfigError,
            28 => Self::NoSpace,
            192 => Self::Cleared,
            196 => Self::Killed,
            197 => Self::NotActive,
            198 => Self::TemporarilyUnavailable,
            other => return Err(other),
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::UserError => "USERR",
            Self::SystemError => "SYERR",
            Self::UnexpectedError => "UNERR",
            Self::ConfigError => "CONFERR",
            Self::NoSpace => "ENOSPC",
            Self::Cleared => "CLEARED",
            Self::Killed => "REQKILD",
            Self::NotActive => "ESTNACT",
            Self::TemporarilyUnavailable => "EAGAIN",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_prefers_higher_severity() {
        assert_eq!(StatusCode::Ok.worst(StatusCode::UserError), StatusCode::UserError);
        assert_eq!(StatusCode::Killed.worst(StatusCode::NoSpace), StatusCode::Killed);
        assert_eq!(StatusCode::SystemError.worst(StatusCode::Ok), StatusCode::SystemError);
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(StatusCode::from_exit_code(0), StatusCode::Ok);
        assert_eq!(StatusCode::from_exit_code(28), StatusCode::NoSpace);
        assert_eq!(StatusCode::from_exit_code(137), StatusCode::UnexpectedError);
        assert!(StatusCode::from_exit_code(2).is_retryable());
        assert!(!StatusCode::from_exit_code(1).is_retryable());
    }

    #[test]
    fn test_wire_value_round_trip() {
        for code in [StatusCode::Ok, StatusCode::NoSpace, StatusCode::NotActive] {
            assert_eq!(StatusCode::try_from(code.as_u32()), Ok(code));
        }
        assert_eq!(StatusCode::try_from(77), Err(77));
    }
}
