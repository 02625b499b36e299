// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by every layer of the communication core.

use core::fmt;

/// Result type for Fitterbap operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error taxonomy shared across Framer, DataLink, Transport and PubSub.
///
/// Each layer only ever returns a subset of these; the enum is kept flat
/// rather than per-layer because callers crossing layer boundaries (e.g. a
/// port handler receiving a Transport-level error) need a single type to
/// match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument is out of range or malformed.
    ParameterInvalid,
    /// A payload exceeds the maximum size for its layer.
    TooBig,
    /// A fixed-size ring or buffer has no free slot.
    Full,
    /// An operation found nothing to act on (empty ring, empty queue).
    Empty,
    /// A blocking call exceeded its deadline.
    TimedOut,
    /// A lookup (topic, port, subscriber) found no match.
    NotFound,
    /// A create-if-absent call found an existing entry.
    AlreadyExists,
    /// The requested resource exists but cannot serve the request right now.
    Unavailable,
    /// An allocation (ring buffer, arena slot) could not be satisfied.
    NotEnoughMemory,
    /// A CRC or other integrity check failed.
    MessageIntegrity,
    /// Malformed wire data that is not simply a CRC failure (bad enum tag, etc).
    SyntaxError,
    /// The operation was aborted before completing.
    Aborted,
    /// An internal sequencing/state invariant was violated.
    Synchronization,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParameterInvalid => write!(f, "invalid parameter"),
            Error::TooBig => write!(f, "payload too big"),
            Error::Full => write!(f, "ring or buffer full"),
            Error::Empty => write!(f, "ring or buffer empty"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::NotFound => write!(f, "not found"),
            Error::AlreadyExists => write!(f, "already exists"),
            Error::Unavailable => write!(f, "unavailable"),
            Error::NotEnoughMemory => write!(f, "not enough memory"),
            Error::MessageIntegrity => write!(f, "message integrity check failed"),
            Error::SyntaxError => write!(f, "syntax error"),
            Error::Aborted => write!(f, "aborted"),
            Error::Synchronization => write!(f, "synchronization error"),
        }
    }
}

impl std::error::Error for Error {}

/// Logs a fatal internal-invariant violation and aborts the process.
///
/// Stands in for the platform `fatal(file, line, msg)` collaborator from
/// spec.md §7: on an embedded target this would reboot, on a hosted build
/// the closest honest equivalent is to log and panic.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("fatal: {}", format_args!($($arg)*));
        panic!("fitterbap: fatal internal error: {}", format_args!($($arg)*));
    }};
}
