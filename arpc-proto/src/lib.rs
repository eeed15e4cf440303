//! # aRPC Protocol
//!
//! Wire formats for the aRPC datagram transport: the built-in packet types,
//! their little-endian codecs, the packet-type registry, and the Symphony
//! payload framing with its two-segment AES-GCM codec.
//!
//! ## Layout
//!
//! - **Packets**: fixed-layout little-endian headers with zero-copy payload
//!   slices. A `DataPacket` carries one fragment of an RPC message; control
//!   packets (ACK, CC feedback, FC feedback) are small enough to always fit
//!   a single datagram.
//! - **Identity**: per-peer state everywhere in the stack is keyed by a
//!   packed 64-bit [`ConnectionKey`]; congestion control identifies single
//!   fragments by a [`PacketId`] derived from wire fields only, so both
//!   peers compute identical IDs without negotiation.
//! - **Symphony**: the application payload begins with a 13-byte header
//!   splitting it into a public and an optional private segment; both are
//!   independently sealed with AES-256-GCM when encryption is enabled.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod registry;
pub mod symphony;

pub use codec::{
    AckCodec, CcFeedbackCodec, DataCodec, ErrorCodec, FcFeedbackCodec, PacketCodec, peek_type_id,
};
pub use crypto::SymphonyCipher;
pub use error::{CodecError, SymphonyError};
pub use packet::{
    AckKind, AckPacket, CcFeedbackPacket, ConnectionKey, DataHeader, DataPacket, Endpoint,
    ErrorPacket, ExtensionPacket, FcFeedbackPacket, OwnedDataPacket, Packet, PacketId,
    PacketTypeId, RpcId, make_packet_id,
};
pub use registry::PacketRegistry;
pub use symphony::SymphonyHeader;
