//! The error kinds from SPEC_FULL §7 that live above the wire codec:
//! frame I/O preconditions, connection teardown, and dispatch-level
//! timeouts/remote failures.

use mesh_core::{CryptoError, WireError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no connection available")]
    NoConnection,
    #[error("no config available")]
    NoConfig,
    #[error("no data available")]
    NoData,
    #[error("frame of {got} bytes exceeds the configured maximum of {max} bytes")]
    OversizeFrame { got: u64, max: u64 },
    #[error("stream closed mid-frame")]
    ShortFrame,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encryption failed: {0}")]
    Encryption(CryptoError),
    #[error("decryption failed: {0}")]
    Decryption(CryptoError),
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
    #[error("handshake protocol error: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
    #[error("remote reported a failure: {0}")]
    RemoteFailure(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("no provider registered for this service/area")]
    NoProvider,
}
