use arpc_proto::codec::DATA_HEADER_LEN;
use arpc_proto::{DataHeader, DataPacket, Endpoint, ErrorPacket, PacketTypeId, RpcId};

use crate::error::RpcError;

/// Default ceiling for one UDP datagram; `chunk size = this - 29`.
pub const DEFAULT_MAX_UDP_PAYLOAD: usize = 1500;

/// Splits payloads into MTU-sized data packets.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    chunk_size: usize,
}

impl Fragmenter {
    pub fn new(max_udp_payload: usize) -> Self {
        Self {
            chunk_size: max_udp_payload.saturating_sub(DATA_HEADER_LEN).max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of fragments a payload of `len` bytes produces.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size).max(1)
    }

    /// Fragments a Request/Response payload into data packets sharing the
    /// RPCID and quintuple, with sequence numbers `0..total`. The packets
    /// borrow chunks of `payload`; nothing is copied.
    ///
    /// An empty payload still produces one empty fragment so the message
    /// exists on the wire.
    pub fn fragment<'a>(
        &self,
        packet_type: PacketTypeId,
        rpc_id: RpcId,
        payload: &'a [u8],
        src: Endpoint,
        dst: Endpoint,
    ) -> Result<Vec<DataPacket<'a>>, RpcError> {
        if !packet_type.is_data() {
            return Err(RpcError::UnknownPacketType(packet_type.0));
        }
        let total = self.fragment_count(payload.len());
        if total > u16::MAX as usize {
            return Err(RpcError::Codec(arpc_proto::CodecError::Oversize));
        }
        let header = DataHeader {
            packet_type,
            rpc_id,
            total_packets: total as u16,
            seq_number: 0,
            dst,
            src,
        };
        let mut packets = Vec::with_capacity(total);
        if payload.is_empty() {
            packets.push(DataPacket {
                header,
                payload: &[],
            });
            return Ok(packets);
        }
        for (seq, chunk) in payload.chunks(self.chunk_size).enumerate() {
            let mut header = header;
            header.seq_number = seq as u16;
            packets.push(DataPacket {
                header,
                payload: chunk,
            });
        }
        Ok(packets)
    }

    /// Builds the single-datagram error form used for
    /// `PacketTypeError`/`Unknown`. The message is truncated to fit one
    /// datagram.
    pub fn error_packet<'a>(&self, rpc_id: RpcId, message: &'a [u8]) -> ErrorPacket<'a> {
        let max_msg = self.chunk_size + DATA_HEADER_LEN - arpc_proto::codec::ERROR_HEADER_LEN;
        ErrorPacket {
            rpc_id,
            message: &message[..message.len().min(max_msg)],
        }
    }
}
