//! Error types for the SDM630 poller
//!
//! A single error enum covers configuration, transport and poll-cycle
//! failures. Inside a poll cycle only [`ModbusError::ConnectFailed`] aborts
//! the cycle; other transport errors skip one batch, and
//! [`ModbusError::is_connection_lost`] tells the engine whether the link is
//! already gone.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// All errors produced by the poller.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Invalid setup: unit id, register definition, connection parameters, config file.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The connect step of a poll cycle failed; the cycle is aborted.
    #[error("Connect failed: {message}")]
    ConnectFailed { message: String },

    /// Could not establish or use the link.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The link dropped mid-transaction; the transport is now disconnected.
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// Operation exceeded its deadline.
    #[error("Timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Low-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected frame.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The device answered with a Modbus exception response.
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({description})")]
    Exception {
        function: u8,
        code: u8,
        description: &'static str,
    },

    /// Payload did not match what the request asked for.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Unrecognized word order tag in a register definition.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// A poll cycle was requested while the previous one is still running.
    #[error("Poll cycle already in progress")]
    CycleInProgress,
}

impl ModbusError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Build an exception error from the raw exception code.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function: function & 0x7F,
            code,
            description: crate::constants::exception_description(code),
        }
    }

    /// True when the failure left the transport without a usable link.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::Connection { .. } | Self::Io(_)
        )
    }

    /// True for errors that can only be fixed by changing the setup.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Decode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_strips_error_bit() {
        let err = ModbusError::exception(0x84, 0x02);
        match err {
            ModbusError::Exception {
                function,
                code,
                description,
            } => {
                assert_eq!(function, 0x04);
                assert_eq!(code, 0x02);
                assert_eq!(description, "Illegal Data Address");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_classification() {
        assert!(ModbusError::connection_lost("eof").is_connection_lost());
        assert!(ModbusError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .is_connection_lost());
        assert!(!ModbusError::timeout("read", 5000).is_connection_lost());
        assert!(ModbusError::configuration("bad unit id").is_configuration());
        assert!(ModbusError::decode("word order CD").is_configuration());
        assert!(!ModbusError::CycleInProgress.is_configuration());
    }

    #[test]
    fn test_display() {
        let err = ModbusError::timeout("read input registers", 5000);
        assert_eq!(
            err.to_string(),
            "Timeout: read input registers after 5000ms"
        );
    }
}
