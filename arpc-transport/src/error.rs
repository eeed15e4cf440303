use arpc_proto::CodecError;
use thiserror::Error;

/// Broad failure classes surfaced at the RPC API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// The call failed but the failure is understood (remote error, element
    /// rejection, transport fault, timeout).
    Fail,
    /// The failure involves a packet or type the stack cannot interpret.
    Unknown,
}

/// Errors visible to RPC callers. Internal per-packet failures (decode
/// errors, duplicate arrivals, handler faults) are logged and dropped
/// instead of surfacing here.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    RemoteFail(String),
    #[error("rejected by element: {0}")]
    ElementReject(String),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("address resolution failed for {0:?}")]
    Resolve(String),
    #[error("unknown service {service} / method {method}")]
    UnknownMethod { service: u32, method: u32 },
    #[error("call timed out")]
    Timeout,
    #[error("call canceled")]
    Canceled,
    #[error("send window exhausted")]
    WindowExhausted,
    #[error("duplicate of an already-completed message")]
    Duplicate,
    #[error("transport is shut down")]
    Shutdown,
}

impl RpcError {
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            RpcError::UnknownPacketType(_) => RpcErrorKind::Unknown,
            RpcError::Codec(CodecError::UnknownPacketType(_)) => RpcErrorKind::Unknown,
            _ => RpcErrorKind::Fail,
        }
    }
}
