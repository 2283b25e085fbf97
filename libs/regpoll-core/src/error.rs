//! Register engine error types

use crate::expr::ExprError;
use crate::interval::Address;
use std::io;
use thiserror::Error;

/// Result type for regpoll-core operations
pub type Result<T> = std::result::Result<T, RegisterError>;

/// Failure of a single protocol request
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure, including timeouts mapped to `TimedOut`
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Device answered with a Modbus exception
    #[error("Modbus exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    /// Malformed or mismatched frame
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }

    /// Connection reset, broken pipe, EOF and timeouts are worth a reconnect
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Register engine errors
#[derive(Debug, Error)]
pub enum RegisterError {
    /// Invalid register descriptor or mapping, fatal at load time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping or validation expression rejected at load time
    #[error("Expression error in '{source_text}': {error}")]
    Expression {
        source_text: String,
        error: ExprError,
    },

    /// Transient failures persisted through the whole retry budget
    #[error("Retries exhausted for {operation}: {source}")]
    TransportExhausted {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// Non-retryable transport failure
    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// Proposed write value rejected
    #[error("Validation failed for register {register}: {reason}")]
    Validation { register: String, reason: String },

    /// Write accepted but read-back never converged
    #[error(
        "Write to {address}[{quantity}] not confirmed: read back {last_read:?}, expected {expected:?}"
    )]
    StabilizationTimeout {
        address: Address,
        quantity: u16,
        expected: Vec<u16>,
        last_read: Vec<u16>,
    },

    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    #[error("Register {0} is not writable")]
    NotWritable(String),

    /// Writable, but not a single-word register
    #[error("Unsupported write to register {register}: {reason}")]
    UnsupportedWrite { register: String, reason: String },

    /// Word sequence could not be turned into a value
    #[error("Decode error: {0}")]
    Decode(String),
}

impl RegisterError {
    pub fn config(msg: impl Into<String>) -> Self {
        RegisterError::Config(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        RegisterError::Decode(msg.into())
    }

    pub fn validation(register: impl Into<String>, reason: impl Into<String>) -> Self {
        RegisterError::Validation {
            register: register.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_write(register: impl Into<String>, reason: impl Into<String>) -> Self {
        RegisterError::UnsupportedWrite {
            register: register.into(),
            reason: reason.into(),
        }
    }

    pub fn expression(source_text: impl Into<String>, error: ExprError) -> Self {
        RegisterError::Expression {
            source_text: source_text.into(),
            error,
        }
    }

    /// Errors that can only come from bad configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RegisterError::Config(_) | RegisterError::Expression { .. }
        )
    }

    /// The device took the write but its state could not be confirmed
    pub fn is_unconfirmed_write(&self) -> bool {
        matches!(self, RegisterError::StabilizationTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::TimedOut,
        ] {
            assert!(TransportError::Io(io::Error::from(kind)).is_transient());
        }

        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))
            .is_transient());
        assert!(!TransportError::Exception {
            function: 0x03,
            code: 0x02
        }
        .is_transient());
        assert!(!TransportError::protocol("bad frame").is_transient());
    }

    #[test]
    fn test_error_predicates() {
        assert!(RegisterError::config("bad").is_config());
        assert!(!RegisterError::UnknownRegister("x".into()).is_config());

        let unconfirmed = RegisterError::StabilizationTimeout {
            address: 10,
            quantity: 1,
            expected: vec![1],
            last_read: vec![0],
        };
        assert!(unconfirmed.is_unconfirmed_write());
        assert!(!RegisterError::validation("x", "too big").is_unconfirmed_write());
    }
}
