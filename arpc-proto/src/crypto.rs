use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::SymphonyError;
use crate::symphony::{PRIVATE_SEGMENT_VERSION, SYMPHONY_HEADER_LEN, SymphonyHeader};

/// Bytes of nonce prepended to each sealed segment.
pub const NONCE_LEN: usize = 12;
/// Bytes of authentication tag appended to each sealed segment.
pub const TAG_LEN: usize = 16;

/// Development-only public-segment key. Production deployments must
/// provision their own keys through configuration.
pub const DEV_PUBLIC_KEY: [u8; 32] = [
    0x5a, 0x1c, 0x84, 0x03, 0xf7, 0x29, 0xd0, 0x6e, 0x41, 0xbb, 0x2d, 0x97, 0x08, 0xc3, 0x5f,
    0xea, 0x76, 0x10, 0xa9, 0x3c, 0xd2, 0x88, 0x4b, 0xe5, 0x61, 0x0f, 0x9d, 0x37, 0xc0, 0x52,
    0xb4, 0x1e,
];
/// Development-only private-segment key.
pub const DEV_PRIVATE_KEY: [u8; 32] = [
    0x93, 0x60, 0x2f, 0xb8, 0x4d, 0xe1, 0x07, 0x7a, 0xc5, 0x39, 0x96, 0x12, 0xfe, 0x80, 0x24,
    0x6b, 0xd7, 0x0b, 0x58, 0xcc, 0x33, 0xaf, 0x71, 0x04, 0x9e, 0xe8, 0x45, 0xba, 0x16, 0xf2,
    0x8d, 0x50,
];

/// Two-segment AES-256-GCM codec over the Symphony public/private split.
///
/// The cipher contexts are owned by this value and passed explicitly to
/// every operation; there is no process-global cipher state. Each segment
/// is sealed as `Nonce(12) · Ciphertext · Tag(16)` with a fresh nonce, and
/// the framing header's offset is rewritten to point at the start of the
/// sealed private segment.
pub struct SymphonyCipher {
    public: Aes256Gcm,
    private: Aes256Gcm,
}

impl SymphonyCipher {
    pub fn new(public_key: &[u8; 32], private_key: &[u8; 32]) -> Self {
        Self {
            public: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(public_key)),
            private: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(private_key)),
        }
    }

    /// Builds a cipher from optionally-provisioned keys, failing when
    /// encryption is requested without both keys present.
    pub fn from_keys(
        public_key: Option<[u8; 32]>,
        private_key: Option<[u8; 32]>,
    ) -> Result<Self, SymphonyError> {
        match (public_key, private_key) {
            (Some(public), Some(private)) => Ok(Self::new(&public, &private)),
            _ => Err(SymphonyError::MissingKey),
        }
    }

    /// The hardcoded development key pair.
    pub fn dev() -> Self {
        Self::new(&DEV_PUBLIC_KEY, &DEV_PRIVATE_KEY)
    }

    /// Encrypts a Symphony-framed payload.
    ///
    /// The public segment is sealed with the public key and the private
    /// segment (version marker included) with the private key. A payload
    /// without a private segment stays without one.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, SymphonyError> {
        let mut header = SymphonyHeader::parse(payload)?;
        let offset = header.offset_to_private as usize;
        let public = &payload[SYMPHONY_HEADER_LEN..offset];
        let private = &payload[offset..];

        let sealed_public = seal(&self.public, public)?;
        let sealed_private = if private.is_empty() {
            Vec::new()
        } else {
            seal(&self.private, private)?
        };

        header.offset_to_private = (SYMPHONY_HEADER_LEN + sealed_public.len()) as u32;
        let mut out =
            Vec::with_capacity(SYMPHONY_HEADER_LEN + sealed_public.len() + sealed_private.len());
        out.resize(SYMPHONY_HEADER_LEN, 0);
        header.write_to(&mut out[..SYMPHONY_HEADER_LEN]);
        out.extend_from_slice(&sealed_public);
        out.extend_from_slice(&sealed_private);
        Ok(out)
    }

    /// Seals only a public-segment plaintext. Used by the proxy, which
    /// re-encrypts the public half after element processing while the
    /// private half passes through opaque.
    pub fn seal_public(&self, plaintext: &[u8]) -> Result<Vec<u8>, SymphonyError> {
        seal(&self.public, plaintext)
    }

    /// Opens a sealed public segment.
    pub fn open_public(&self, sealed: &[u8]) -> Result<Vec<u8>, SymphonyError> {
        open(&self.public, sealed)
    }

    /// Decrypts a payload produced by [`SymphonyCipher::encrypt`], restoring
    /// the original framing offset and verifying the private segment's
    /// version marker.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, SymphonyError> {
        let mut header = SymphonyHeader::parse(payload)?;
        let offset = header.offset_to_private as usize;
        let sealed_public = &payload[SYMPHONY_HEADER_LEN..offset];
        let sealed_private = &payload[offset..];

        let public = open(&self.public, sealed_public)?;
        let private = if sealed_private.is_empty() {
            Vec::new()
        } else {
            let private = open(&self.private, sealed_private)?;
            match private.first() {
                Some(&PRIVATE_SEGMENT_VERSION) => {}
                Some(&other) => return Err(SymphonyError::BadPrivateVersion(other)),
                None => return Err(SymphonyError::ShortData),
            }
            private
        };

        header.offset_to_private = (SYMPHONY_HEADER_LEN + public.len()) as u32;
        let mut out = Vec::with_capacity(SYMPHONY_HEADER_LEN + public.len() + private.len());
        out.resize(SYMPHONY_HEADER_LEN, 0);
        header.write_to(&mut out[..SYMPHONY_HEADER_LEN]);
        out.extend_from_slice(&public);
        out.extend_from_slice(&private);
        Ok(out)
    }
}

fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>, SymphonyError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| SymphonyError::EncryptFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(cipher: &Aes256Gcm, sealed: &[u8]) -> Result<Vec<u8>, SymphonyError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(SymphonyError::ShortData);
    }
    cipher
        .decrypt(Nonce::from_slice(&sealed[..NONCE_LEN]), &sealed[NONCE_LEN..])
        .map_err(|_| SymphonyError::DecryptFailed)
}
