use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;
use crate::packet::{
    AckKind, AckPacket, CcFeedbackPacket, DataHeader, DataPacket, Endpoint, ErrorPacket,
    FcFeedbackPacket, Packet, PacketId, PacketTypeId, RpcId,
};

/// Fixed size of the [`DataPacket`] header, including the payload length
/// prefix. `MaxUDPPayloadSize - DATA_HEADER_LEN` is the fragmentation chunk
/// size.
pub const DATA_HEADER_LEN: usize = 29;
/// Fixed prefix of an [`ErrorPacket`] before the message bytes.
pub const ERROR_HEADER_LEN: usize = 13;
/// Fixed prefix of an [`AckPacket`] before the message bytes.
pub const ACK_HEADER_LEN: usize = 23;
/// Fixed prefix of a [`CcFeedbackPacket`] before the packet-ID array.
pub const CC_FEEDBACK_HEADER_LEN: usize = 17;
/// Exact wire size of an [`FcFeedbackPacket`].
pub const FC_FEEDBACK_LEN: usize = 9;

/// Serializer/deserializer for one packet type.
///
/// Deserialization is zero-copy: payload-bearing packets borrow slices of
/// the input datagram, and the caller must keep that buffer alive until the
/// packet (or anything reassembled from it) no longer references it.
pub trait PacketCodec: Send + Sync {
    /// Appends the wire form of `packet` to `out`. The caller typically
    /// hands in a cleared pooled buffer.
    fn serialize_into(&self, packet: &Packet<'_>, out: &mut Vec<u8>) -> Result<(), CodecError>;

    fn deserialize<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, CodecError>;

    /// Convenience wrapper allocating a fresh buffer.
    fn serialize(&self, packet: &Packet<'_>) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.serialize_into(packet, &mut out)?;
        Ok(out)
    }
}

/// Reads the leading packet-type byte of a datagram.
pub fn peek_type_id(data: &[u8]) -> Result<PacketTypeId, CodecError> {
    data.first()
        .map(|&b| PacketTypeId(b))
        .ok_or(CodecError::Truncated)
}

fn put_endpoint(out: &mut Vec<u8>, ep: Endpoint) {
    out.extend_from_slice(&ep.ip);
    out.extend_from_slice(&ep.port.to_le_bytes());
}

fn get_endpoint(data: &[u8], at: usize) -> Endpoint {
    let mut ip = [0u8; 4];
    ip.copy_from_slice(&data[at..at + 4]);
    Endpoint {
        ip,
        port: LittleEndian::read_u16(&data[at + 4..at + 6]),
    }
}

/// Codec for the Request/Response fragment form.
pub struct DataCodec;

impl PacketCodec for DataCodec {
    fn serialize_into(&self, packet: &Packet<'_>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Packet::Data(p) = packet else {
            return Err(CodecError::TypeMismatch);
        };
        if p.payload.len() > u32::MAX as usize {
            return Err(CodecError::Oversize);
        }
        out.reserve(DATA_HEADER_LEN + p.payload.len());
        out.push(p.header.packet_type.0);
        out.extend_from_slice(&p.header.rpc_id.0.to_le_bytes());
        out.extend_from_slice(&p.header.total_packets.to_le_bytes());
        out.extend_from_slice(&p.header.seq_number.to_le_bytes());
        put_endpoint(out, p.header.dst);
        put_endpoint(out, p.header.src);
        out.extend_from_slice(&(p.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(p.payload);
        Ok(())
    }

    fn deserialize<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, CodecError> {
        if data.len() < DATA_HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        let packet_type = PacketTypeId(data[0]);
        if !packet_type.is_data() {
            return Err(CodecError::TypeMismatch);
        }
        let payload_len = LittleEndian::read_u32(&data[25..29]) as usize;
        if data.len() < DATA_HEADER_LEN + payload_len {
            return Err(CodecError::BadLength);
        }
        Ok(Packet::Data(DataPacket {
            header: DataHeader {
                packet_type,
                rpc_id: RpcId(LittleEndian::read_u64(&data[1..9])),
                total_packets: LittleEndian::read_u16(&data[9..11]),
                seq_number: LittleEndian::read_u16(&data[11..13]),
                dst: get_endpoint(data, 13),
                src: get_endpoint(data, 19),
            },
            payload: &data[DATA_HEADER_LEN..DATA_HEADER_LEN + payload_len],
        }))
    }
}

/// Codec for single-datagram error reports.
pub struct ErrorCodec;

impl PacketCodec for ErrorCodec {
    fn serialize_into(&self, packet: &Packet<'_>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Packet::Error(p) = packet else {
            return Err(CodecError::TypeMismatch);
        };
        out.reserve(ERROR_HEADER_LEN + p.message.len());
        out.push(PacketTypeId::ERROR.0);
        out.extend_from_slice(&p.rpc_id.0.to_le_bytes());
        out.extend_from_slice(&(p.message.len() as u32).to_le_bytes());
        out.extend_from_slice(p.message);
        Ok(())
    }

    fn deserialize<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, CodecError> {
        if data.len() < ERROR_HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        if data[0] != PacketTypeId::ERROR.0 {
            return Err(CodecError::TypeMismatch);
        }
        let msg_len = LittleEndian::read_u32(&data[9..13]) as usize;
        if data.len() < ERROR_HEADER_LEN + msg_len {
            return Err(CodecError::BadLength);
        }
        Ok(Packet::Error(ErrorPacket {
            rpc_id: RpcId(LittleEndian::read_u64(&data[1..9])),
            message: &data[ERROR_HEADER_LEN..ERROR_HEADER_LEN + msg_len],
        }))
    }
}

/// Codec for message-level acknowledgments.
pub struct AckCodec;

impl PacketCodec for AckCodec {
    fn serialize_into(&self, packet: &Packet<'_>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Packet::Ack(p) = packet else {
            return Err(CodecError::TypeMismatch);
        };
        out.reserve(ACK_HEADER_LEN + p.message.len());
        out.push(PacketTypeId::ACK.0);
        out.extend_from_slice(&p.rpc_id.0.to_le_bytes());
        out.push(p.kind as u8);
        out.push(p.status);
        out.extend_from_slice(&p.timestamp_micros.to_le_bytes());
        out.extend_from_slice(&(p.message.len() as u32).to_le_bytes());
        out.extend_from_slice(p.message);
        Ok(())
    }

    fn deserialize<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, CodecError> {
        if data.len() < ACK_HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        if data[0] != PacketTypeId::ACK.0 {
            return Err(CodecError::TypeMismatch);
        }
        let kind = AckKind::from_wire(data[9]).ok_or(CodecError::TypeMismatch)?;
        let msg_len = LittleEndian::read_u32(&data[19..23]) as usize;
        if data.len() < ACK_HEADER_LEN + msg_len {
            return Err(CodecError::BadLength);
        }
        Ok(Packet::Ack(AckPacket {
            rpc_id: RpcId(LittleEndian::read_u64(&data[1..9])),
            kind,
            status: data[10],
            timestamp_micros: LittleEndian::read_u64(&data[11..19]),
            message: &data[ACK_HEADER_LEN..ACK_HEADER_LEN + msg_len],
        }))
    }
}

/// Codec for batched congestion feedback.
pub struct CcFeedbackCodec;

impl PacketCodec for CcFeedbackCodec {
    fn serialize_into(&self, packet: &Packet<'_>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Packet::CcFeedback(p) = packet else {
            return Err(CodecError::TypeMismatch);
        };
        out.reserve(CC_FEEDBACK_HEADER_LEN + 8 * p.packet_ids.len());
        out.push(PacketTypeId::CC_FEEDBACK.0);
        out.extend_from_slice(&p.acked_count.to_le_bytes());
        out.extend_from_slice(&p.acked_bytes.to_le_bytes());
        out.extend_from_slice(&(p.packet_ids.len() as u32).to_le_bytes());
        for id in &p.packet_ids {
            out.extend_from_slice(&id.0.to_le_bytes());
        }
        Ok(())
    }

    fn deserialize<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, CodecError> {
        if data.len() < CC_FEEDBACK_HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        if data[0] != PacketTypeId::CC_FEEDBACK.0 {
            return Err(CodecError::TypeMismatch);
        }
        let id_count = LittleEndian::read_u32(&data[13..17]) as usize;
        if data.len() < CC_FEEDBACK_HEADER_LEN + 8 * id_count {
            return Err(CodecError::BadLength);
        }
        let mut packet_ids = Vec::with_capacity(id_count);
        for i in 0..id_count {
            let at = CC_FEEDBACK_HEADER_LEN + 8 * i;
            packet_ids.push(PacketId(LittleEndian::read_u64(&data[at..at + 8])));
        }
        Ok(Packet::CcFeedback(CcFeedbackPacket {
            acked_count: LittleEndian::read_u32(&data[1..5]),
            acked_bytes: LittleEndian::read_u64(&data[5..13]),
            packet_ids,
        }))
    }
}

/// Codec for the fixed 9-byte window advertisement.
pub struct FcFeedbackCodec;

impl PacketCodec for FcFeedbackCodec {
    fn serialize_into(&self, packet: &Packet<'_>, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Packet::FcFeedback(p) = packet else {
            return Err(CodecError::TypeMismatch);
        };
        out.reserve(FC_FEEDBACK_LEN);
        out.push(PacketTypeId::FC_FEEDBACK.0);
        out.extend_from_slice(&p.send_window.to_le_bytes());
        Ok(())
    }

    fn deserialize<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, CodecError> {
        if data.len() < FC_FEEDBACK_LEN {
            return Err(CodecError::Truncated);
        }
        if data[0] != PacketTypeId::FC_FEEDBACK.0 {
            return Err(CodecError::TypeMismatch);
        }
        Ok(Packet::FcFeedback(FcFeedbackPacket {
            send_window: LittleEndian::read_u64(&data[1..9]),
        }))
    }
}
