//! # Error Handling
//!
//! This module defines the single error type used throughout the serial server
//! and register simulator. Errors fall into four families, and each family is
//! handled differently by the server loop:
//!
//! ### Configuration Errors
//! - Unknown action names, contradictory overlay ranges, out-of-range sizes
//! - Fatal at startup: the server never processes a frame
//!
//! ### Frame Errors
//! - Malformed bytes, wrong length for the function code
//! - CRC (RTU) or LRC (ASCII) mismatches
//! - Logged at debug level and dropped; the client sees no response
//!
//! ### Protocol Errors
//! - Illegal function, address or value for a well-formed request
//! - Turned into a Modbus exception response via [`ModbusError::to_exception`]
//!
//! ### Transport Errors
//! - Serial port I/O failures
//! - Fatal to the owning server loop, which closes the port and stops
//!
//! ## Usage Examples
//!
//! ```rust
//! use voltage_modbus_sim::{ModbusError, ModbusResult};
//! use voltage_modbus_sim::protocol::ModbusException;
//!
//! fn classify(result: ModbusResult<Vec<u16>>) {
//!     match result {
//!         Ok(values) => println!("read {} registers", values.len()),
//!         Err(error) if error.is_frame_error() => println!("dropped: {}", error),
//!         Err(error) => match error.to_exception() {
//!             ModbusException::IllegalDataAddress => println!("bad address"),
//!             other => println!("exception {}", other),
//!         },
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;
use crate::register_bank::TableKind;

/// Result type alias for all server and simulator operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus server error types
///
/// Each variant carries enough context to produce a useful log line; the
/// `to_exception` mapping decides what, if anything, the client sees.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (serial port read/write failures)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors (port could not be opened, peer closed)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors that fit no narrower variant
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address/quantity combination outside protocol limits
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Data value not acceptable for the request
    ///
    /// # Examples
    /// - Coil value not 0x0000 or 0xFF00
    /// - Byte count that does not match the quantity
    /// - Quantity of zero or above the per-request maximum
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Address not present in the table block
    #[error("{table} address {address} not found")]
    NotFound { table: TableKind, address: u16 },

    /// Address present but outside the declared write ranges
    #[error("{table} address {address} is not writable")]
    NotWritable { table: TableKind, address: u16 },

    /// Address declared invalid by the overlay
    #[error("{table} address {address} is declared invalid")]
    InvalidCell { table: TableKind, address: u16 },

    /// Access does not match the declared cell type
    #[error("{table} address {address} does not match its declared type")]
    TypeMismatch { table: TableKind, address: u16 },

    /// CRC validation failure (RTU)
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// LRC validation failure (ASCII)
    #[error("LRC validation failed: expected={expected:02X}, actual={actual:02X}")]
    LrcMismatch { expected: u8, actual: u8 },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    ///
    /// # Examples
    /// - Unknown action name in the overlay
    /// - Table size above 65536
    /// - Range partially overlapping a multi-register value
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (poisoned locks and the like)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a not-found error for a table address
    pub fn not_found(table: TableKind, address: u16) -> Self {
        Self::NotFound { table, address }
    }

    /// Create a not-writable error for a table address
    pub fn not_writable(table: TableKind, address: u16) -> Self {
        Self::NotWritable { table, address }
    }

    /// Create an invalid-cell error for a table address
    pub fn invalid_cell(table: TableKind, address: u16) -> Self {
        Self::InvalidCell { table, address }
    }

    /// Create a type-mismatch error for a table address
    pub fn type_mismatch(table: TableKind, address: u16) -> Self {
        Self::TypeMismatch { table, address }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an LRC mismatch error
    pub fn lrc_mismatch(expected: u8, actual: u8) -> Self {
        Self::LrcMismatch { expected, actual }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Map the error onto the exception code reported to the client
    ///
    /// Store errors (missing, invalid, read-only or mistyped addresses) all
    /// surface as ILLEGAL_DATA_ADDRESS; value errors as ILLEGAL_DATA_VALUE.
    ///
    /// ```rust
    /// use voltage_modbus_sim::ModbusError;
    /// use voltage_modbus_sim::protocol::ModbusException;
    /// use voltage_modbus_sim::register_bank::TableKind;
    ///
    /// let err = ModbusError::not_writable(TableKind::HoldingRegisters, 19);
    /// assert_eq!(err.to_exception(), ModbusException::IllegalDataAddress);
    /// ```
    pub fn to_exception(&self) -> ModbusException {
        match self {
            Self::InvalidFunction { .. } => ModbusException::IllegalFunction,
            Self::InvalidAddress { .. }
            | Self::NotFound { .. }
            | Self::NotWritable { .. }
            | Self::InvalidCell { .. }
            | Self::TypeMismatch { .. } => ModbusException::IllegalDataAddress,
            Self::InvalidData { .. } => ModbusException::IllegalDataValue,
            _ => ModbusException::ServerDeviceFailure,
        }
    }

    /// Check if the error means a received frame must be silently dropped
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. } | Self::CrcMismatch { .. } | Self::LrcMismatch { .. }
        )
    }

    /// Check if the error is a serial transport issue
    ///
    /// ```rust
    /// use voltage_modbus_sim::ModbusError;
    ///
    /// assert!(ModbusError::io("port vanished").is_transport_error());
    /// assert!(!ModbusError::crc_mismatch(1, 2).is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is answered with an exception response
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::InvalidAddress { .. }
                | Self::InvalidData { .. }
                | Self::NotFound { .. }
                | Self::NotWritable { .. }
                | Self::InvalidCell { .. }
                | Self::TypeMismatch { .. }
        )
    }

    /// Check if the error stops the server (configuration or transport)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. }) || self.is_transport_error()
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed duration is not known here; callers that care build the
/// timeout error themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors (configuration documents)
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::timeout("read frame", 5000);
        assert!(err.is_transport_error());
        assert!(err.is_fatal());

        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        assert!(err.is_frame_error());
        assert!(!err.is_fatal());

        let err = ModbusError::configuration("unknown action 'explode'");
        assert!(err.is_fatal());
        assert!(!err.is_protocol_error());
    }

    #[test]
    fn test_exception_mapping() {
        let table = TableKind::HoldingRegisters;
        assert_eq!(
            ModbusError::invalid_function(0x2B).to_exception(),
            ModbusException::IllegalFunction
        );
        assert_eq!(
            ModbusError::not_found(table, 300).to_exception(),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(
            ModbusError::invalid_cell(table, 1).to_exception(),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(
            ModbusError::invalid_data("quantity 0").to_exception(),
            ModbusException::IllegalDataValue
        );
        assert_eq!(
            ModbusError::internal("lock poisoned").to_exception(),
            ModbusException::ServerDeviceFailure
        );
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = ModbusError::not_writable(TableKind::Coils, 19);
        assert_eq!(format!("{}", err), "coils address 19 is not writable");
    }
}
