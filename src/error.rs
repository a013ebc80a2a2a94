//! Error taxonomy for the diagnostic host.
//!
//! Every failure mode is a variant of [`DiagError`]; errors fail the one
//! offending command and never take the transport threads down with them.
//! The only terminal conditions are missing hardware and error frames seen
//! on the bus itself.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library.
pub type DiagResult<T> = Result<T, DiagError>;

#[derive(Debug, Error)]
pub enum DiagError {
    /// No CAN adapter is available. Terminal for the process.
    #[error("CAN hardware not found")]
    HardwareNotFound,

    /// A read or write on the channel failed.
    #[error("CAN channel I/O failure: {0}")]
    ChannelIo(String),

    /// The outbound command queue is saturated.
    #[error("transmit command queue full")]
    QueueFull,

    /// No response arrived within the command timeout.
    #[error("no response within {0:?}")]
    RxTimeout(Duration),

    /// ISO 15765-2 formatting violation (bad PCI, bad length, CF index
    /// mismatch, missing flow control).
    #[error("transport protocol violation: {0}")]
    Protocol(String),

    /// The remote end reported a receive overflow (FC flag 2).
    #[error("target reported receive overflow")]
    TargetOverflow,

    /// A `0x7F` negative response was parsed.
    #[error("negative response to SID 0x{sid:02X}, NRC 0x{code:02X}")]
    NegativeResponse { sid: u8, code: u8 },

    /// The response did not echo the expected header or had the wrong
    /// length.
    #[error("response validation failed: {0}")]
    Validation(String),

    /// A factory-side precondition failed; the command was never sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A user callback failed. Logged by the transport, never propagated.
    #[error("command callback failed: {0}")]
    Callback(String),
}

impl DiagError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        DiagError::Protocol(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        DiagError::InvalidArgument(msg.into())
    }
}
