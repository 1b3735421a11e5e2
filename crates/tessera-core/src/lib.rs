//! Tessera core: the cryptographic document lifecycle engine.
//!
//! An approved document is deconstructed into independently encrypted
//! content sets and an opaque marker skeleton; viewers get back a tailored
//! view in which everything they lack authorization for is a fixed-width
//! redaction marker. No single party, operators included, can assemble a
//! complete document on its own.

pub mod anchor;
pub mod audit;
pub mod authz;
pub mod context;
pub mod crypto;
pub mod deconstruct;
pub mod envelope;
pub mod error;
pub mod gf256;
pub mod hsm;
pub mod marker;
pub mod model;
pub mod reconstruct;
pub mod rotation;
pub mod shamir;
pub mod store;

use uuid::Uuid;

pub use context::CoreContext;
pub use deconstruct::DeconstructionOutcome;
pub use envelope::EncryptedEnvelope;
pub use error::{Result, TesseraError};
pub use hsm::{HsmProvider, KeyHandle, KeyMaterial, SoftHsm};
pub use model::{DocumentStatus, SecurityProfile, StorageTier};
pub use reconstruct::{ReconstructedView, ViewBlock};
pub use rotation::{DestructionOutcome, IntegrityReport, RotationOutcome};
pub use shamir::ShamirShare;

/// The transport-neutral operation surface. One instance per process,
/// shared across request-scoped tasks.
pub struct Tessera {
    ctx: CoreContext,
}

impl Tessera {
    pub fn new(ctx: CoreContext) -> Self {
        Tessera { ctx }
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    /// Split an approved document into markers and per-set envelopes.
    pub async fn deconstruct(
        &self,
        document_id: Uuid,
        session_id: Uuid,
    ) -> Result<DeconstructionOutcome> {
        deconstruct::deconstruct(&self.ctx, document_id, session_id).await
    }

    /// Assemble the viewer's tailored view.
    pub async fn reconstruct(
        &self,
        document_id: Uuid,
        viewer_id: Uuid,
        access_level_id: Uuid,
        organization_id: Uuid,
    ) -> Result<ReconstructedView> {
        reconstruct::reconstruct(&self.ctx, document_id, viewer_id, access_level_id, organization_id)
            .await
    }

    /// Recompute stored hashes without decrypting.
    pub async fn verify_integrity(&self, document_id: Uuid) -> Result<IntegrityReport> {
        rotation::verify_integrity(&self.ctx, document_id).await
    }

    /// Re-encrypt every content set under fresh keys.
    pub async fn rotate_keys(&self, document_id: Uuid) -> Result<RotationOutcome> {
        rotation::rotate_keys(&self.ctx, document_id).await
    }

    /// Cryptographically destroy the document. Terminal.
    pub async fn destroy(
        &self,
        document_id: Uuid,
        reason: &str,
        regulatory_clearance: bool,
    ) -> Result<DestructionOutcome> {
        rotation::destroy(&self.ctx, document_id, reason, regulatory_clearance).await
    }

    /// Destroy one content set; the rest of the document stays
    /// reconstructible.
    pub async fn destroy_content_set(
        &self,
        document_id: Uuid,
        content_set_identifier: &str,
        reason: &str,
        regulatory_basis: &str,
    ) -> Result<DestructionOutcome> {
        rotation::destroy_content_set(
            &self.ctx,
            document_id,
            content_set_identifier,
            reason,
            regulatory_basis,
        )
        .await
    }
}
