//! Error types for DCE RPC

use crate::fault::FaultCode;
use crate::pdu::{ProviderReason, RejectReason, SyntaxId};
use msrpc_ndr::NdrError;
use thiserror::Error;

/// RPC error types
#[derive(Debug, Error)]
pub enum RpcError {
    /// Stub data could not be encoded or decoded
    #[error("NDR error: {0}")]
    Ndr(#[from] NdrError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer refused the presentation context for this interface
    #[error("interface {interface} not supported: {reason}")]
    UnsupportedInterface {
        interface: SyntaxId,
        reason: ProviderReason,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// No presentation context is established (never bound, closed, or torn
    /// down after a failed call)
    #[error("not bound")]
    NotBound,

    /// Fault PDU, or a non-zero status returned by the operation
    #[error("remote fault: {0}")]
    RemoteFault(FaultCode),

    /// The association was refused with a bind_nak
    #[error("bind rejected: {0}")]
    BindRejected(RejectReason),

    #[error("call ID mismatch: expected {expected}, got {got}")]
    CallIdMismatch { expected: u32, got: u32 },

    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("PDU too large: {size} bytes exceeds maximum {max}")]
    PduTooLarge { size: usize, max: usize },

    #[error("fragment received out of order")]
    FragmentOutOfOrder,

    #[error("fragment assembly failed: {0}")]
    FragmentAssembly(String),

    #[error("timeout")]
    Timeout,

    #[error("security error: {0}")]
    Security(String),
}

impl RpcError {
    /// Whether the connection was torn down by this error.
    ///
    /// Fatal errors leave the client closed; anything else failed the call
    /// only and the association is still usable. A security failure
    /// invalidates the security context, so it is fatal too.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Transport(_)
                | Self::ConnectionClosed
                | Self::CallIdMismatch { .. }
                | Self::InvalidPdu(_)
                | Self::InvalidMessageType(_)
                | Self::PduTooLarge { .. }
                | Self::FragmentOutOfOrder
                | Self::FragmentAssembly(_)
                | Self::Timeout
                | Self::Security(_)
        )
    }

    pub(crate) fn invalid_pdu(err: NdrError) -> Self {
        Self::InvalidPdu(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
