use std::io;

use thiserror::Error;

use crate::unit::UnitType;

/// Failures of the wire protocol, the data model and the transport
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected:#04x}, found {found:#04x}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unsupported unit type {0:#04x}")]
    UnsupportedUnitType(u8),

    #[error("unexpected unit {found:?}, expected {expected:?}")]
    UnexpectedUnit { expected: UnitType, found: UnitType },

    #[error("affinity {index} not offered by operator ({available} available)")]
    AffinityLookup { index: u8, available: usize },

    #[error("arity mismatch: expected {expected} parameters, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("remote answered {unit:?}: {message}")]
    RemoteProcessing { unit: UnitType, message: String },

    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{datums} datums do not split evenly into {count} items")]
    Truncation { datums: usize, count: usize },

    #[error("row count mismatch: {left} vs {right}")]
    RowCountMismatch { left: usize, right: usize },

    #[error("{0:?} is not implemented by this protocol variant")]
    Unsupported(UnitType),

    #[error("worker queue is full")]
    Overloaded,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // read/write deadlines surface as WouldBlock on unix, TimedOut on windows
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ProtocolError::Timeout(err.to_string())
            }
            io::ErrorKind::UnexpectedEof => {
                ProtocolError::MalformedFrame(format!("incomplete read: {err}"))
            }
            _ => ProtocolError::Connection(err),
        }
    }
}

impl ProtocolError {
    /// True for failures of the transport itself (connect, send, receive, deadlines)
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Connection(_) | ProtocolError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
