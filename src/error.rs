//! BACnet/SC Operation Status Codes
//!
//! Every public operation in the secure-connect stack reports its outcome
//! with the same small set of status codes, mirroring the shared return-code
//! convention used across the rest of this BACnet implementation. Contract
//! violations (bad parameter, wrong state) are returned synchronously from
//! the call site; operational failures (a hub dropping the connection, a
//! peer asserting an address collision) are reported asynchronously through
//! component events and never as call-site errors.

use thiserror::Error;

/// Result type for secure-connect operations.
pub type Result<T> = core::result::Result<T, ScError>;

/// Status codes shared by all secure-connect components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScError {
    /// A null-equivalent, zero, empty or oversize argument was passed.
    #[error("bad parameter")]
    BadParam,

    /// The operation is not valid in the component's current state,
    /// e.g. starting a started connector or sending while not connected.
    #[error("invalid operation in current state")]
    InvalidOperation,

    /// A fixed pool (nodes, connection slots, resolution entries) is full.
    #[error("no resources")]
    NoResources,

    /// No buffer space for the PDU.
    #[error("no buffers")]
    NoBuffers,

    /// A timed operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The remote peer closed the connection.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// The remote peer violated the protocol or negotiated incompatible
    /// parameters during the connect handshake.
    #[error("peer incompatible")]
    PeerIncompatible,

    /// The remote side asserted that our VMAC collides with another node.
    /// Recoverable by restarting with a freshly generated VMAC.
    #[error("duplicated VMAC")]
    DuplicatedVmac,

    /// Failure reported by the underlying WebSocket/TLS transport.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ScError {
    /// True for errors that terminate the component and require a stop or
    /// restart rather than an in-place retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScError::DuplicatedVmac)
    }
}
