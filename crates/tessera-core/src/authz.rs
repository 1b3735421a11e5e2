//! Authorization boundary.
//!
//! The reconstruction engine consumes [`AuthorizationProvider`] and nothing
//! else; which concrete provider a tenant runs is composition-root
//! configuration. The conventional provider consults a grants table and
//! resolves the access level to its content sets (non-hierarchical union);
//! the composed-proof provider defers to an external verifier, with a
//! cached-decision fallback on Tier 2 and hard failure on Tier 3.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::model::StorageTier;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Reconstruct,
    Export,
}

#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub access_level_id: Uuid,
    pub organization_id: Uuid,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoGrant,
    Expired,
    Revoked,
    LevelInactive,
    ProofFailed,
    ProviderUnavailable,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenialReason::NoGrant => "no_grant",
            DenialReason::Expired => "expired",
            DenialReason::Revoked => "revoked",
            DenialReason::LevelInactive => "level_inactive",
            DenialReason::ProofFailed => "proof_failed",
            DenialReason::ProviderUnavailable => "provider_unavailable",
        };
        f.write_str(s)
    }
}

/// Pointer to one authorized encrypted content set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSetRef {
    pub content_set_id: Uuid,
    pub set_identifier: String,
    pub storage_ref: String,
    pub encrypted_hash: String,
}

#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub granted: bool,
    pub content_set_refs: Vec<ContentSetRef>,
    pub provider: &'static str,
    pub denial_reason: Option<DenialReason>,
    pub audit_metadata: serde_json::Value,
}

impl AccessDecision {
    fn denied(provider: &'static str, reason: DenialReason) -> Self {
        AccessDecision {
            granted: false,
            content_set_refs: Vec::new(),
            provider,
            denial_reason: Some(reason),
            audit_metadata: json!({ "denial_reason": reason.to_string() }),
        }
    }
}

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn authorize(&self, request: &AccessRequest) -> Result<AccessDecision>;
}

/// One row of the conventional grants table.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub access_level_id: Uuid,
    pub organization_id: Uuid,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A non-hierarchical set of content-set identifiers within one
/// organization.
#[derive(Debug, Clone)]
pub struct AccessLevel {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub active: bool,
    pub content_set_identifiers: Vec<String>,
}

/// Default provider: grants table plus level resolution.
pub struct GrantTableProvider {
    store: Arc<dyn DocumentStore>,
    grants: RwLock<Vec<AccessGrant>>,
    levels: RwLock<HashMap<Uuid, AccessLevel>>,
}

impl GrantTableProvider {
    pub const NAME: &'static str = "conventional";

    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        GrantTableProvider {
            store,
            grants: RwLock::new(Vec::new()),
            levels: RwLock::new(HashMap::new()),
        }
    }

    pub fn put_level(&self, level: AccessLevel) {
        self.levels.write().insert(level.id, level);
    }

    pub fn put_grant(&self, grant: AccessGrant) {
        self.grants.write().push(grant);
    }

    async fn resolve_refs(
        &self,
        document_id: Uuid,
        identifiers: &[String],
    ) -> Result<Vec<ContentSetRef>> {
        let mut refs = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            // a level may name sets the document never used; skip those
            match self.store.content_set(document_id, identifier).await {
                Ok(row) => {
                    let envelope = crate::envelope::EncryptedEnvelope::from_blob(&row.envelope_blob)?;
                    refs.push(ContentSetRef {
                        content_set_id: row.id,
                        set_identifier: row.content_set_identifier,
                        storage_ref: row.storage_location,
                        encrypted_hash: envelope.ciphertext_hash,
                    });
                }
                Err(TesseraError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(refs)
    }
}

#[async_trait]
impl AuthorizationProvider for GrantTableProvider {
    async fn authorize(&self, request: &AccessRequest) -> Result<AccessDecision> {
        let now = Utc::now();
        let grant = {
            let grants = self.grants.read();
            grants
                .iter()
                .find(|g| {
                    g.user_id == request.user_id
                        && g.document_id == request.document_id
                        && g.access_level_id == request.access_level_id
                        && g.organization_id == request.organization_id
                })
                .cloned()
        };

        let Some(grant) = grant else {
            return Ok(AccessDecision::denied(Self::NAME, DenialReason::NoGrant));
        };
        if grant.revoked {
            return Ok(AccessDecision::denied(Self::NAME, DenialReason::Revoked));
        }
        if grant.expires_at.is_some_and(|t| t <= now) {
            return Ok(AccessDecision::denied(Self::NAME, DenialReason::Expired));
        }

        let level = self.levels.read().get(&request.access_level_id).cloned();
        let Some(level) = level else {
            return Ok(AccessDecision::denied(Self::NAME, DenialReason::LevelInactive));
        };
        if !level.active || level.organization_id != request.organization_id {
            return Ok(AccessDecision::denied(Self::NAME, DenialReason::LevelInactive));
        }

        let refs = self
            .resolve_refs(request.document_id, &level.content_set_identifiers)
            .await?;
        Ok(AccessDecision {
            granted: true,
            content_set_refs: refs,
            provider: Self::NAME,
            denial_reason: None,
            audit_metadata: json!({
                "access_level_id": request.access_level_id,
                "sets": level.content_set_identifiers,
            }),
        })
    }
}

/// External verifier behind the composed-proof provider.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Verify the caller's proof bundle. `Ok(None)` means the proof was
    /// examined and rejected; `Err` means the verifier was unreachable.
    async fn verify(&self, request: &AccessRequest) -> Result<Option<Vec<ContentSetRef>>>;
}

/// Tier 2/3 provider: authorization by externally verified proof.
pub struct ComposedProofProvider {
    verifier: Arc<dyn ProofVerifier>,
    tier: StorageTier,
    cache: RwLock<HashMap<(Uuid, Uuid, Uuid), Vec<ContentSetRef>>>,
}

impl ComposedProofProvider {
    pub const NAME: &'static str = "composed_proof";

    pub fn new(verifier: Arc<dyn ProofVerifier>, tier: StorageTier) -> Self {
        ComposedProofProvider {
            verifier,
            tier,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(request: &AccessRequest) -> (Uuid, Uuid, Uuid) {
        (request.user_id, request.document_id, request.access_level_id)
    }
}

#[async_trait]
impl AuthorizationProvider for ComposedProofProvider {
    async fn authorize(&self, request: &AccessRequest) -> Result<AccessDecision> {
        match self.verifier.verify(request).await {
            Ok(Some(refs)) => {
                self.cache.write().insert(Self::cache_key(request), refs.clone());
                Ok(AccessDecision {
                    granted: true,
                    content_set_refs: refs,
                    provider: Self::NAME,
                    denial_reason: None,
                    audit_metadata: json!({ "verification": "proof" }),
                })
            }
            Ok(None) => Ok(AccessDecision::denied(Self::NAME, DenialReason::ProofFailed)),
            Err(_) if self.tier == StorageTier::Tier2 => {
                // verifier outage: fall back to the last verified decision
                let cached = self.cache.read().get(&Self::cache_key(request)).cloned();
                match cached {
                    Some(refs) => Ok(AccessDecision {
                        granted: true,
                        content_set_refs: refs,
                        provider: Self::NAME,
                        denial_reason: None,
                        audit_metadata: json!({ "verification": "cached_fallback" }),
                    }),
                    None => Ok(AccessDecision::denied(
                        Self::NAME,
                        DenialReason::ProviderUnavailable,
                    )),
                }
            }
            Err(_) => Ok(AccessDecision::denied(
                Self::NAME,
                DenialReason::ProviderUnavailable,
            )),
        }
    }
}
