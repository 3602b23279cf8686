//! Error types for sindri
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sindri
#[derive(Error, Debug)]
pub enum Error {
    /// Transport read/write/timeout failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// USB transfer error (raw)
    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// Device disappeared during enumeration or mid-transfer
    #[error("device gone: {0}")]
    DeviceGone(String),

    /// Unexpected response id, bad ack, or bootloader FAIL
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed partition information table
    #[error("PIT parse error: {0}")]
    PitParse(String),

    /// Malformed tar archive
    #[error("archive error: {0}")]
    ArchiveParse(String),

    /// Malformed or unsupported LZ4 frame
    #[error("LZ4 error: {0}")]
    Lz4Parse(String),

    /// No partition found for a source, or devices disagree on the mapping
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Invalid command-line combination
    #[error("usage error: {0}")]
    Usage(String),

    /// Another instance already holds the flash engine
    #[error("another instance is already running")]
    Lock,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Process exit code for this error kind. 0 is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Lock => 2,
            Error::Usage(_) => 5,
            _ => 1,
        }
    }
}

/// Exit code when no supported device is connected.
pub const EXIT_NO_DEVICES: i32 = 3;
/// Exit code when the inputs contain nothing flashable.
pub const EXIT_NO_FLASH_FILES: i32 = 4;
