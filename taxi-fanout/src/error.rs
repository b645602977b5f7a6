//! Common error types for taxi-fanout.
//!
//! This module provides a centralized Error enum using thiserror. Variants
//! are grouped by [`ErrorKind`] so callers can tell a caller mistake
//! (validation), a malformed or stuck register transaction, and a failure
//! reported by a channel's bootloader apart.

use thiserror::Error;

use crate::bootloader::BootloaderError;
use crate::smc::i2c::Direction;

/// Main error type for taxi-fanout operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Channel index outside 0-7
    #[error("channel {0} is out of range (0-7)")]
    InvalidChannel(u32),

    /// Channel selection text could not be parsed
    #[error("invalid channel selection '{0}'")]
    InvalidChannelSpec(String),

    /// An operation was requested for no channels at all
    #[error("no channels selected")]
    EmptySelection,

    /// Firmware image rejected before touching hardware
    #[error("invalid firmware image: {0}")]
    InvalidFirmware(String),

    /// I2C payload length outside what the register block can carry
    #[error("invalid I2C {direction} payload length {len}")]
    InvalidPayload { direction: Direction, len: usize },

    /// Register transaction did not report completion in time
    #[error("I2C transaction timed out")]
    Timeout,

    /// Shared I2C bus could not be acquired
    #[error("I2C bus lock timeout")]
    BusLocked,

    /// Register file access errors
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Bootloader protocol errors
    #[error("Bootloader error: {0}")]
    Bootloader(#[from] BootloaderError),

    /// Flash read-back differs from the image that was written
    #[error("verify mismatch at offset {offset:#x}: wrote {expected:#04x}, read {actual:#04x}")]
    VerifyMismatch { offset: usize, expected: u8, actual: u8 },

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; detected before any hardware access
    Validation,
    /// Register transaction layer
    Transaction,
    /// Register file or board wiring
    Hardware,
    /// Channel-local bootloader exchange
    Protocol,
    /// Operating system I/O, including the serial port
    Io,
    /// Configuration loading
    Config,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidChannel(_)
            | Error::InvalidChannelSpec(_)
            | Error::EmptySelection
            | Error::InvalidFirmware(_) => ErrorKind::Validation,
            Error::InvalidPayload { .. } | Error::Timeout | Error::BusLocked => {
                ErrorKind::Transaction
            }
            Error::Hardware(_) => ErrorKind::Hardware,
            Error::Bootloader(_) | Error::VerifyMismatch { .. } => ErrorKind::Protocol,
            Error::Io(_) | Error::Serial(_) => ErrorKind::Io,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::InvalidChannel(9).kind(), ErrorKind::Validation);
        assert_eq!(Error::EmptySelection.kind(), ErrorKind::Validation);
        assert_eq!(
            Error::InvalidPayload { direction: Direction::Write, len: 4 }.kind(),
            ErrorKind::Transaction
        );
        assert_eq!(Error::Timeout.kind(), ErrorKind::Transaction);
        assert_eq!(
            Error::Bootloader(BootloaderError::Nack).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::VerifyMismatch { offset: 0, expected: 1, actual: 2 }.kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::InvalidChannel(8).to_string(),
            "channel 8 is out of range (0-7)"
        );
        assert_eq!(
            Error::InvalidPayload { direction: Direction::Read, len: 3 }.to_string(),
            "invalid I2C read payload length 3"
        );
    }
}
