//! The encrypted envelope record and its persisted blob codec.
//!
//! The store keeps envelopes as opaque blobs whose schema is owned by this
//! module: a leading format-version byte followed by the postcard encoding
//! of the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TesseraError};

pub const AES_256_GCM: &str = "aes-256-gcm";
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Blob format version. Bump when the record layout changes; decode rejects
/// versions it does not know.
const CODEC_VERSION: u8 = 1;

/// One encrypted content set of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Identifier of the content set this envelope belongs to; also the AAD
    /// under which the ciphertext was sealed.
    pub content_set_identifier: String,
    /// Fresh random IV for this encryption.
    pub iv: [u8; IV_LEN],
    /// GCM authentication tag, stored apart from the ciphertext body.
    pub auth_tag: [u8; TAG_LEN],
    /// Ciphertext without the tag.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// SHA-512 of the pre-encryption plaintext, hex.
    pub plaintext_hash: String,
    /// SHA-512 of the ciphertext body, hex.
    pub ciphertext_hash: String,
    /// Key record that sealed this envelope.
    pub key_id: Uuid,
    /// Always `aes-256-gcm`.
    pub algorithm: String,
    pub encrypted_at: DateTime<Utc>,
}

impl EncryptedEnvelope {
    /// Serialize to the versioned persisted form.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let body = postcard::to_allocvec(self)
            .map_err(|e| TesseraError::EnvelopeCodec(e.to_string()))?;
        let mut blob = Vec::with_capacity(1 + body.len());
        blob.push(CODEC_VERSION);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Parse the versioned persisted form.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        match blob.split_first() {
            Some((&CODEC_VERSION, body)) => postcard::from_bytes(body)
                .map_err(|e| TesseraError::EnvelopeCodec(e.to_string())),
            Some((&version, _)) => Err(TesseraError::EnvelopeCodec(format!(
                "unknown envelope format version {version}"
            ))),
            None => Err(TesseraError::EnvelopeCodec("empty envelope blob".into())),
        }
    }
}
