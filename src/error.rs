use thiserror::Error;

use crate::engine::Phase;

/// Failures raised by a transport binding.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    #[error("peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("notification stream closed")]
    NotificationsClosed,

    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// Coarse classification handed to a [`crate::progress::ProgressSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ProtocolViolation,
    NotInDfuMode,
    Format,
    ResponseTimeout,
    Cancelled,
    Busy,
    Config,
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("peripheral does not expose the Secure DFU service")]
    NotInDfuMode,

    #[error("service {0} not found")]
    ServiceNotFound(uuid::Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("invalid firmware package: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response while in {phase:?}")]
    ResponseTimeout { phase: Phase },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("a transfer is already in progress")]
    TransferInProgress,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DfuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::Transport(_) | DfuError::ServiceNotFound(_) | DfuError::CharacteristicNotFound(_) => {
                ErrorKind::Transport
            }
            DfuError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            DfuError::NotInDfuMode => ErrorKind::NotInDfuMode,
            DfuError::Format(_) | DfuError::Io(_) => ErrorKind::Format,
            DfuError::ResponseTimeout { .. } => ErrorKind::ResponseTimeout,
            DfuError::Cancelled => ErrorKind::Cancelled,
            DfuError::TransferInProgress => ErrorKind::Busy,
            DfuError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<zip::result::ZipError> for DfuError {
    fn from(e: zip::result::ZipError) -> Self {
        DfuError::Format(e.to_string())
    }
}

impl From<serde_json::Error> for DfuError {
    fn from(e: serde_json::Error) -> Self {
        DfuError::Format(format!("manifest: {}", e))
    }
}
