use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{
    AckCodec, CcFeedbackCodec, DataCodec, ErrorCodec, FcFeedbackCodec, PacketCodec,
};
use crate::error::CodecError;
use crate::packet::PacketTypeId;

/// Maps packet type IDs to their codecs.
///
/// The built-in types and the fixed-ID extensions (ACK, CC feedback, FC
/// feedback) are installed by [`PacketRegistry::new`]; further extensions
/// are assigned sequential IDs starting at [`PacketTypeId::FIRST_DYNAMIC`],
/// or a fixed ID via [`PacketRegistry::register_fixed`]. Re-registering a
/// name or an ID fails.
pub struct PacketRegistry {
    codecs: HashMap<u8, Arc<dyn PacketCodec>>,
    names: HashMap<String, PacketTypeId>,
    next_id: u8,
}

impl PacketRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            codecs: HashMap::new(),
            names: HashMap::new(),
            next_id: PacketTypeId::FIRST_DYNAMIC.0,
        };
        let data: Arc<dyn PacketCodec> = Arc::new(DataCodec);
        reg.install("request", PacketTypeId::REQUEST, data.clone());
        reg.install("response", PacketTypeId::RESPONSE, data);
        reg.install("error", PacketTypeId::ERROR, Arc::new(ErrorCodec));
        reg.install("ack", PacketTypeId::ACK, Arc::new(AckCodec));
        reg.install(
            "cc-feedback",
            PacketTypeId::CC_FEEDBACK,
            Arc::new(CcFeedbackCodec),
        );
        reg.install(
            "fc-feedback",
            PacketTypeId::FC_FEEDBACK,
            Arc::new(FcFeedbackCodec),
        );
        reg
    }

    fn install(&mut self, name: &str, id: PacketTypeId, codec: Arc<dyn PacketCodec>) {
        self.codecs.insert(id.0, codec);
        self.names.insert(name.to_string(), id);
    }

    /// Registers an extension codec under the next free ID.
    pub fn register(
        &mut self,
        name: &str,
        codec: Arc<dyn PacketCodec>,
    ) -> Result<PacketTypeId, CodecError> {
        if self.names.contains_key(name) {
            return Err(CodecError::DuplicateName(name.to_string()));
        }
        while self.codecs.contains_key(&self.next_id) {
            self.next_id = self
                .next_id
                .checked_add(1)
                .ok_or(CodecError::IdSpaceExhausted)?;
        }
        let id = PacketTypeId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.install(name, id, codec);
        Ok(id)
    }

    /// Registers an extension codec at a caller-chosen ID.
    pub fn register_fixed(
        &mut self,
        name: &str,
        id: PacketTypeId,
        codec: Arc<dyn PacketCodec>,
    ) -> Result<(), CodecError> {
        if self.names.contains_key(name) {
            return Err(CodecError::DuplicateName(name.to_string()));
        }
        if self.codecs.contains_key(&id.0) {
            return Err(CodecError::DuplicateId(id.0));
        }
        self.install(name, id, codec);
        Ok(())
    }

    pub fn codec(&self, id: PacketTypeId) -> Option<&Arc<dyn PacketCodec>> {
        self.codecs.get(&id.0)
    }

    pub fn type_id(&self, name: &str) -> Option<PacketTypeId> {
        self.names.get(name).copied()
    }

    /// Decodes one datagram by its leading type byte.
    pub fn deserialize<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<crate::packet::Packet<'a>, CodecError> {
        let type_id = crate::codec::peek_type_id(data)?;
        let codec = self
            .codec(type_id)
            .ok_or(CodecError::UnknownPacketType(type_id.0))?;
        codec.deserialize(data)
    }

    /// Serializes `packet` through the codec registered for its type.
    pub fn serialize_into(
        &self,
        packet: &crate::packet::Packet<'_>,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        let type_id = packet.type_id();
        let codec = self
            .codec(type_id)
            .ok_or(CodecError::UnknownPacketType(type_id.0))?;
        codec.serialize_into(packet, out)
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
