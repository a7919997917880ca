//! Error types for famops.

use std::fmt;

/// Error type for data-path operations.
///
/// Blocking operations surface these at the call site; nonblocking
/// operations can surface posting errors synchronously but runtime errors
/// only at the next fence or quiet. The engine never retries on its own.
#[derive(Debug)]
pub enum Error {
    /// Invalid engine configuration.
    InvalidConfig(String),
    /// Failure reported by the allocator interface.
    Allocator {
        /// Allocator call that failed.
        call: &'static str,
        /// Allocator-provided description.
        detail: String,
    },
    /// Transport failure, carrying the fabric's own description.
    Datapath {
        /// Fabric verb that failed.
        call: &'static str,
        /// Text from the fabric's `strerror`.
        detail: String,
    },
    /// The transport signalled a deadline expiry.
    Timeout {
        /// Fabric verb that timed out.
        call: &'static str,
    },
    /// Operation is declared but not supported.
    Unimplemented(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::Allocator { call, detail } => {
                write!(f, "Allocator {} failed: {}", call, detail)
            }
            Error::Datapath { call, detail } => write!(f, "{} failed: {}", call, detail),
            Error::Timeout { call } => write!(f, "{} timed out", call),
            Error::Unimplemented(op) => write!(f, "{} is not implemented", op),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for data-path operations.
pub type Result<T> = std::result::Result<T, Error>;
