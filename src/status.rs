//! Status codes for parameter service operations
//!
//! This module defines the status codes returned by fallible operations in
//! the worker, server and transport layers.

use std::fmt;

/// Status code returned by parameter service operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// A requested entry (timestamp, key, node, customer) was not found
    NotFound = 1,
    /// I/O error from the underlying transport
    IoError = 2,
    /// Inconsistent wire data or a broken sharding invariant
    Corruption = 3,
    /// Invalid argument provided (malformed batch shape, bad buffer size)
    InvalidArgument = 4,
    /// Invalid operation in the current state (e.g. no transport bound)
    InvalidOperation = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the entry was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::IoError
                | Status::Corruption
                | Status::InvalidArgument
                | Status::InvalidOperation
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_checks() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Ok.is_error());

        assert!(Status::NotFound.is_not_found());
        assert!(!Status::NotFound.is_error());

        assert!(Status::IoError.is_error());
        assert!(Status::Corruption.is_error());
        assert!(Status::InvalidArgument.is_error());
        assert!(Status::InvalidOperation.is_error());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::Ok), "Ok");
        assert_eq!(format!("{}", Status::Corruption), "Corruption");
        assert_eq!(format!("{}", Status::InvalidArgument), "InvalidArgument");
    }

    #[test]
    fn test_status_default() {
        assert_eq!(Status::default(), Status::Ok);
    }
}
