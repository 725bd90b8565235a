//! # Server Error Handling
//!
//! Error types shared by every layer of the register-space server: the
//! address spaces, the frame codecs, the protocol dispatcher and the
//! transport listeners.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket and serial port failures, snapshot file access
//! - **Connection Errors**: bind failures, rejected or dropped sessions
//! - **Timeout Errors**: a frame that did not arrive completely in time
//!
//! ### Framing Errors
//! - **Frame Errors**: a header that fails the codec's legality check
//! - **CRC Errors**: checksum failures on the serial bus
//!
//! ### Protocol Validation Errors
//! - **Invalid Function**: function codes the dispatcher does not serve
//! - **Invalid Address**: ranges that overrun an address space
//! - **Invalid Data**: bad quantities, byte counts or coil values
//!
//! ### System Errors
//! - **Configuration Errors**: bad bind addresses, unopenable serial ports
//! - **Snapshot Errors**: a persisted data pool that is too short
//! - **Internal Errors**: poisoned locks and other states that should not occur
//!
//! ## Exception Mapping
//!
//! The dispatcher never lets an error escape to the transport loop. It asks
//! the error for its protocol exception code instead:
//!
//! ```rust
//! use voltage_datapool::ServerError;
//!
//! assert_eq!(ServerError::invalid_address(65535, 2, 65536).exception_code(), 0x02);
//! assert_eq!(ServerError::invalid_data("quantity 0").exception_code(), 0x03);
//! assert_eq!(ServerError::internal("lock poisoned").exception_code(), 0x04);
//! ```

use thiserror::Error;

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by the register-space server
///
/// Each variant carries enough context to produce a useful log line; the
/// dispatcher additionally maps every variant to a protocol exception code
/// through [`ServerError::exception_code`].
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    /// I/O related errors (network, serial, snapshot files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Failed to bind the listening socket
    /// - Session limit reached
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Raised when a frame has started arriving but is not complete within
    /// the configured frame timeout. Idle sessions never time out.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Frame boundary errors
    ///
    /// A header that failed the codec legality check, an oversized serial
    /// frame, or a frame too short to carry a station and function code.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure on the serial bus
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Function code not served by the dispatcher
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Range outside an address space
    ///
    /// `index` and `length` are expressed in the unit of the failing call
    /// (bytes for byte access, bits for bit access, protocol units for
    /// dispatcher validation).
    #[error("Invalid address: index={index}, length={length}, capacity={capacity}")]
    InvalidAddress { index: usize, length: usize, capacity: usize },

    /// Malformed or out-of-range request data
    ///
    /// # Examples
    /// - Coil value not 0x0000 or 0xFF00
    /// - Quantity of 0 or above the protocol maximum
    /// - Declared byte count disagreeing with the payload
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Server configuration issues
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persisted data pool does not have the expected size
    #[error("Snapshot error: expected {expected} bytes, got {actual}")]
    Snapshot { expected: usize, actual: usize },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ServerError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    ///
    /// # Arguments
    ///
    /// * `index` - First unit of the rejected range
    /// * `length` - Number of units requested
    /// * `capacity` - Size of the address space that rejected the range
    pub fn invalid_address(index: usize, length: usize, capacity: usize) -> Self {
        Self::InvalidAddress { index, length, capacity }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a snapshot size error
    pub fn snapshot(expected: usize, actual: usize) -> Self {
        Self::Snapshot { expected, actual }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Protocol exception code reported to the client for this error
    ///
    /// Validation failures map to the "bad request" codes 1 to 3; anything
    /// else is reported as a server device failure (code 4).
    pub fn exception_code(&self) -> u8 {
        match self {
            Self::InvalidFunction { .. } => 0x01,
            Self::InvalidAddress { .. } => 0x02,
            Self::InvalidData { .. } => 0x03,
            _ => 0x04,
        }
    }

    /// Check if the error is a network/transport issue
    ///
    /// Transport errors end the session they occurred on and nothing else.
    ///
    /// ```rust
    /// use voltage_datapool::ServerError;
    ///
    /// assert!(ServerError::connection("reset by peer").is_transport_error());
    /// assert!(!ServerError::invalid_address(0, 2, 1).is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(self,
            Self::Io { .. } |
            Self::Connection { .. } |
            Self::Timeout { .. }
        )
    }

    /// Check if the error is a framing issue
    ///
    /// Framing errors close a TCP session and drop a serial frame.
    pub fn is_framing_error(&self) -> bool {
        matches!(self, Self::Frame { .. } | Self::CrcMismatch { .. })
    }

    /// Check if the error is a protocol validation issue
    ///
    /// These are answered with an exception reply and the session stays open.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self,
            Self::InvalidFunction { .. } |
            Self::InvalidAddress { .. } |
            Self::InvalidData { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed duration is not known here; callers that know the configured
/// timeout build the error with [`ServerError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ServerError::timeout("read frame", 5000);
        assert!(err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = ServerError::crc_mismatch(0x1234, 0x5678);
        assert!(err.is_framing_error());
        assert!(!err.is_transport_error());

        let err = ServerError::invalid_data("quantity 0");
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_exception_codes() {
        assert_eq!(ServerError::invalid_function(0x2B).exception_code(), 1);
        assert_eq!(ServerError::invalid_address(0, 1, 0).exception_code(), 2);
        assert_eq!(ServerError::invalid_data("x").exception_code(), 3);
        assert_eq!(ServerError::internal("poisoned").exception_code(), 4);
        assert_eq!(ServerError::io("broken pipe").exception_code(), 4);
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = ServerError::snapshot(393216, 10);
        assert!(err.to_string().contains("393216"));
    }
}
