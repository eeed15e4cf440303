use thiserror::Error;

/// Errors from packet serialization, deserialization and registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("packet truncated")]
    Truncated,
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("packet type does not match codec")]
    TypeMismatch,
    #[error("declared length exceeds datagram")]
    BadLength,
    #[error("payload too large for a single datagram")]
    Oversize,
    #[error("packet type name {0:?} already registered")]
    DuplicateName(String),
    #[error("packet type id {0} already registered")]
    DuplicateId(u8),
    #[error("packet type id space exhausted")]
    IdSpaceExhausted,
}

/// Errors from the Symphony framing and two-segment encryption codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymphonyError {
    #[error("payload shorter than the Symphony header")]
    ShortData,
    #[error("offset-to-private {offset} outside [13, {len}]")]
    InvalidOffset { offset: u32, len: usize },
    #[error("encryption enabled but no key provisioned")]
    MissingKey,
    #[error("segment encryption failed")]
    EncryptFailed,
    #[error("segment decryption failed")]
    DecryptFailed,
    #[error("private segment version {0:#04x}, expected 0x01")]
    BadPrivateVersion(u8),
}
