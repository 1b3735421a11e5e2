//! Persisted entities and the document lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::hsm::KeyHandle;

/// Document lifecycle. The core governs only the subset from `Approved`
/// onward; the intake/markup/review states belong to upstream collaborators
/// and are listed so status round-trips through storage unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Intake,
    IntakeFlagged,
    IntakeCleared,
    Markup,
    MarkupSubmitted,
    Review,
    ReviewEscalated,
    Approved,
    Deconstructing,
    Active,
    Destroying,
    Destroyed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentStatus::Intake => "intake",
            DocumentStatus::IntakeFlagged => "intake_flagged",
            DocumentStatus::IntakeCleared => "intake_cleared",
            DocumentStatus::Markup => "markup",
            DocumentStatus::MarkupSubmitted => "markup_submitted",
            DocumentStatus::Review => "review",
            DocumentStatus::ReviewEscalated => "review_escalated",
            DocumentStatus::Approved => "approved",
            DocumentStatus::Deconstructing => "deconstructing",
            DocumentStatus::Active => "active",
            DocumentStatus::Destroying => "destroying",
            DocumentStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

impl DocumentStatus {
    /// The transitions the core is allowed to perform. Everything else in
    /// the governed subset is forbidden; `Destroyed` is terminal.
    pub fn core_transition_allowed(from: DocumentStatus, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (from, to),
            (Approved, Deconstructing)
                | (Deconstructing, Active)
                | (Deconstructing, Approved)
                | (Active, Destroying)
                | (Destroying, Destroyed)
                | (Destroying, Active)
        )
    }

    pub fn ensure_core_transition(from: DocumentStatus, to: DocumentStatus) -> Result<()> {
        if Self::core_transition_allowed(from, to) {
            Ok(())
        } else {
            Err(TesseraError::InvalidStateTransition { from, to })
        }
    }
}

/// Document row. Identity is `(id, organization_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub status: DocumentStatus,
    pub previous_version_id: Option<Uuid>,
    pub legal_hold: bool,
    /// Destruction is refused until this instant has passed.
    pub effective_retention_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the approved assignment set handed over by the markup
/// collaborator. Offsets are both present (character range) or both absent
/// (whole block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedAssignment {
    pub content_set_identifier: String,
    pub block_id: String,
    pub start_offset: Option<u32>,
    pub end_offset: Option<u32>,
    pub selected_text: Option<String>,
    pub page_number: u32,
}

/// Opaque placeholder in the base document. Reveals position and identity
/// only; never length, type, or nature of the extracted content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionalMarker {
    pub marker_id: Uuid,
    /// Ordered, deduplicated set identifiers this marker's content belongs
    /// to. Never serialized into the base document.
    pub content_set_membership: Vec<String>,
    pub block_id: String,
    pub start_offset: Option<u32>,
    pub end_offset: Option<u32>,
    /// SHA-512 of the exact original extracted text, hex.
    pub content_hash: String,
    /// 1-based document order.
    pub sequence_position: u32,
    /// True when two or more coincident assignments collapsed into this
    /// marker.
    pub is_merged: bool,
}

/// Post-deconstruction artifact: the marker skeleton of the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseDocumentRecord {
    pub document_id: Uuid,
    /// Canonical serialization of the opaque marker list (see
    /// `marker::serialize_base`).
    pub content: String,
    /// SHA-512 of `content`, hex.
    pub content_hash: String,
    pub markers: Vec<PositionalMarker>,
    pub created_at: DateTime<Utc>,
}

/// Key record. Material never appears here; only the HSM handle does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content_set_identifier: String,
    pub organization_id: Uuid,
    pub hsm_key_handle: KeyHandle,
    pub algorithm: String,
    pub shamir_threshold: u8,
    pub shamir_total_shares: u8,
    pub is_active: bool,
    pub rotated_from_key_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

/// Share custody metadata. Share bytes are caller-owned after the split and
/// are never stored in this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyShareRecord {
    pub key_id: Uuid,
    pub share_index: u8,
    pub holder_id: String,
    pub distributed: bool,
    pub distributed_at: Option<DateTime<Utc>>,
}

/// One encrypted content set row: the envelope blob plus its storage
/// scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedContentSetRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content_set_identifier: String,
    #[serde(with = "serde_bytes")]
    pub envelope_blob: Vec<u8>,
    /// Physical location identifier, scoped by the tenant's storage tier.
    pub storage_location: String,
    pub key_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one reconstruction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionEventRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub viewer_id: Uuid,
    pub access_level_id: Uuid,
    pub content_sets_used: Vec<String>,
    pub content_sets_redacted: Vec<String>,
    pub marker_width: u8,
    pub reconstruction_hash: String,
    pub integrity_all_passed: bool,
    pub anchor_tx_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Deployment profile selecting storage separation and authorization
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Tier1,
    Tier2,
    Tier3,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Tier1 => "tier_1",
            StorageTier::Tier2 => "tier_2",
            StorageTier::Tier3 => "tier_3",
        }
    }
}

/// What a reconstruction does when one authorized content set fails
/// integrity while the rest verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Redact the failed sets, continue, record the degradation.
    ProceedWithRedaction,
    /// Abort the whole reconstruction on the first failed set.
    Halt,
}

impl From<StorageTier> for IntegrityPolicy {
    fn from(tier: StorageTier) -> Self {
        match tier {
            StorageTier::Tier1 => IntegrityPolicy::ProceedWithRedaction,
            StorageTier::Tier2 | StorageTier::Tier3 => IntegrityPolicy::Halt,
        }
    }
}

/// Which authorization provider the tenant runs. The composition root uses
/// this to construct the provider; engines only ever see the trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthzProviderKind {
    Conventional,
    ComposedProof,
}

pub const MARKER_WIDTH_MIN: u8 = 3;
pub const MARKER_WIDTH_MAX: u8 = 10;
pub const MARKER_WIDTH_DEFAULT: u8 = 3;

/// Per-tenant security profile (collaborator-supplied, validated here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub organization_id: Uuid,
    pub shamir_threshold: u8,
    pub shamir_total_shares: u8,
    pub storage_tier: StorageTier,
    pub marker_width: u8,
    pub export_permitted: bool,
    pub min_retention_days: u32,
    /// Opaque holder identifiers for share distribution, recorded as
    /// received. Length must equal `shamir_total_shares`.
    pub share_holder_ids: Vec<String>,
    pub authz_provider: AuthzProviderKind,
}

impl SecurityProfile {
    pub fn validate(&self) -> Result<()> {
        if !(MARKER_WIDTH_MIN..=MARKER_WIDTH_MAX).contains(&self.marker_width) {
            return Err(TesseraError::Precondition(format!(
                "marker width {} outside [{MARKER_WIDTH_MIN}, {MARKER_WIDTH_MAX}]",
                self.marker_width
            )));
        }
        if self.share_holder_ids.len() != self.shamir_total_shares as usize {
            return Err(TesseraError::Precondition(format!(
                "{} share holders configured for {} shares",
                self.share_holder_ids.len(),
                self.shamir_total_shares
            )));
        }
        Ok(())
    }

    pub fn integrity_policy(&self) -> IntegrityPolicy {
        self.storage_tier.into()
    }
}
