use byteorder::{ByteOrder, LittleEndian};

use crate::error::SymphonyError;

/// Size of the Symphony framing header at the front of every RPC payload.
pub const SYMPHONY_HEADER_LEN: usize = 13;
/// Required first byte of a non-empty private segment.
pub const PRIVATE_SEGMENT_VERSION: u8 = 0x01;

/// The 13-byte framing header of an application payload:
/// `Version(1) · OffsetToPrivate(4) · ServiceID(4) · MethodID(4)`.
///
/// `offset_to_private` points at the start of the private segment;
/// `offset == len` means the payload carries no private segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymphonyHeader {
    pub version: u8,
    pub offset_to_private: u32,
    pub service_id: u32,
    pub method_id: u32,
}

impl SymphonyHeader {
    /// Parses the header and validates `13 <= offset <= payload length`.
    pub fn parse(payload: &[u8]) -> Result<Self, SymphonyError> {
        if payload.len() < SYMPHONY_HEADER_LEN {
            return Err(SymphonyError::ShortData);
        }
        let header = Self {
            version: payload[0],
            offset_to_private: LittleEndian::read_u32(&payload[1..5]),
            service_id: LittleEndian::read_u32(&payload[5..9]),
            method_id: LittleEndian::read_u32(&payload[9..13]),
        };
        let offset = header.offset_to_private as usize;
        if offset < SYMPHONY_HEADER_LEN || offset > payload.len() {
            return Err(SymphonyError::InvalidOffset {
                offset: header.offset_to_private,
                len: payload.len(),
            });
        }
        Ok(header)
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.version;
        LittleEndian::write_u32(&mut out[1..5], self.offset_to_private);
        LittleEndian::write_u32(&mut out[5..9], self.service_id);
        LittleEndian::write_u32(&mut out[9..13], self.method_id);
    }

    /// Builds a framed payload from segment contents. The private segment,
    /// when present, must already start with its version marker.
    pub fn frame(&self, public: &[u8], private: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; SYMPHONY_HEADER_LEN + public.len() + private.len()];
        let mut header = *self;
        header.offset_to_private = (SYMPHONY_HEADER_LEN + public.len()) as u32;
        header.write_to(&mut out[..SYMPHONY_HEADER_LEN]);
        out[SYMPHONY_HEADER_LEN..SYMPHONY_HEADER_LEN + public.len()].copy_from_slice(public);
        out[SYMPHONY_HEADER_LEN + public.len()..].copy_from_slice(private);
        out
    }
}

/// Splits a framed payload into its public and private segments.
pub fn split_segments(payload: &[u8]) -> Result<(&[u8], &[u8]), SymphonyError> {
    let header = SymphonyHeader::parse(payload)?;
    let offset = header.offset_to_private as usize;
    Ok((&payload[SYMPHONY_HEADER_LEN..offset], &payload[offset..]))
}

/// Overwrites the service and method IDs in a framed payload. Used by the
/// RPC client, which stamps the routing IDs after serializing the request.
pub fn set_service_method(
    payload: &mut [u8],
    service_id: u32,
    method_id: u32,
) -> Result<(), SymphonyError> {
    if payload.len() < SYMPHONY_HEADER_LEN {
        return Err(SymphonyError::ShortData);
    }
    LittleEndian::write_u32(&mut payload[5..9], service_id);
    LittleEndian::write_u32(&mut payload[9..13], method_id);
    Ok(())
}
