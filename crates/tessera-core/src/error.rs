use thiserror::Error;

use crate::authz::DenialReason;
use crate::model::DocumentStatus;

/// Error taxonomy for the core engine.
///
/// Integrity variants map one-to-one onto the verification stages of
/// envelope decryption; engine variants carry enough context to audit the
/// failure without exposing key material.
#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("approved assignment set is empty")]
    EmptyAssignmentSet,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(DenialReason),

    #[error("base document hash mismatch")]
    BaseDocumentTampered,

    #[error("ciphertext hash mismatch for content set {content_set}")]
    CiphertextIntegrity { content_set: String },

    #[error("AEAD authentication failed for content set {content_set}")]
    AeadAuthentication { content_set: String },

    #[error("plaintext hash mismatch for content set {content_set}")]
    PlaintextIntegrity { content_set: String },

    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("rng failure: {0}")]
    RngFailure(String),

    #[error("insufficient shares: threshold {threshold}, got {got}")]
    InsufficientShares { threshold: u8, got: usize },

    #[error("duplicate share indices")]
    DuplicateShareIndices,

    #[error("inconsistent share lengths")]
    InconsistentShareLength,

    #[error("invalid shamir parameters: threshold {threshold}, total {total}")]
    InvalidShareParameters { threshold: u8, total: u8 },

    #[error("hsm unavailable: {0}")]
    HsmUnavailable(String),

    #[error("unknown hsm key handle")]
    UnknownKeyHandle,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("envelope codec failure: {0}")]
    EnvelopeCodec(String),

    #[error("payload parse failure: {0}")]
    PayloadParse(String),
}

impl TesseraError {
    /// True for the per-set integrity family that a Tier 1 reconstruction
    /// degrades on instead of halting.
    pub fn is_set_integrity(&self) -> bool {
        matches!(
            self,
            TesseraError::CiphertextIntegrity { .. }
                | TesseraError::AeadAuthentication { .. }
                | TesseraError::PlaintextIntegrity { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
