//! Reconstruction engine: assemble a viewer-tailored rendition of the base
//! document in which every marker the viewer cannot read is replaced by the
//! uniform-width redaction marker.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::anchor::AnchorTransaction;
use crate::audit::{AuditCategory, AuditEvent};
use crate::authz::{AccessRequest, AccessType};
use crate::context::CoreContext;
use crate::crypto;
use crate::envelope::EncryptedEnvelope;
use crate::error::{Result, TesseraError};
use crate::marker::{self, PayloadEntry};
use crate::model::{DocumentStatus, IntegrityPolicy, ReconstructionEventRecord};

/// U+2588 FULL BLOCK, repeated by the tenant's marker width. Uniform for
/// the whole reconstruction, independent of what it hides.
pub const REDACTION_GLYPH: char = '\u{2588}';

#[derive(Debug, Clone, Serialize)]
pub struct ViewBlock {
    pub marker_id: Uuid,
    pub block_id: String,
    pub content: String,
    pub is_redacted: bool,
    pub accessed_via_set: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReconstructedView {
    pub document_id: Uuid,
    pub blocks: Vec<ViewBlock>,
    pub marker_width: u8,
    pub content_sets_used: Vec<String>,
    pub content_sets_redacted: Vec<String>,
    pub reconstruction_hash: String,
    pub integrity_all_passed: bool,
}

pub async fn reconstruct(
    ctx: &CoreContext,
    document_id: Uuid,
    viewer_id: Uuid,
    access_level_id: Uuid,
    organization_id: Uuid,
) -> Result<ReconstructedView> {
    let document = ctx.store.document(document_id).await?;
    if document.status != DocumentStatus::Active {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} is {}, expected active",
            document.status
        )));
    }
    let profile = ctx.store.security_profile(organization_id).await?;
    profile.validate()?;

    // 1. Authorization. The engine sees only the provider trait.
    let request = AccessRequest {
        user_id: viewer_id,
        document_id,
        access_level_id,
        organization_id,
        access_type: AccessType::Reconstruct,
    };
    let decision = ctx.authz.authorize(&request).await?;
    if !decision.granted {
        let reason = decision
            .denial_reason
            .unwrap_or(crate::authz::DenialReason::NoGrant);
        let _ = ctx
            .audit
            .append(AuditEvent::new(
                AuditCategory::Action,
                "reconstruction.denied",
                format!("reconstruction denied: {reason}"),
                Some(organization_id),
                Some(viewer_id),
                "document",
                document_id.to_string(),
                decision.audit_metadata.clone(),
            ))
            .await;
        // refused attempts are recorded too; no anchor submission
        let _ = ctx
            .store
            .append_reconstruction_event(ReconstructionEventRecord {
                id: Uuid::new_v4(),
                document_id,
                viewer_id,
                access_level_id,
                content_sets_used: Vec::new(),
                content_sets_redacted: Vec::new(),
                marker_width: profile.marker_width,
                reconstruction_hash: String::new(),
                integrity_all_passed: false,
                anchor_tx_id: None,
                occurred_at: Utc::now(),
            })
            .await;
        return Err(TesseraError::AuthorizationDenied(reason));
    }

    // 2. Base document integrity gates everything.
    let base = ctx.store.base_document(document_id).await?;
    if !crypto::digest_eq(&crypto::sha512_hex(base.content.as_bytes()), &base.content_hash) {
        audit_integrity_failure(ctx, document_id, organization_id, None, "base_document_hash").await;
        return Err(TesseraError::BaseDocumentTampered);
    }

    // 3. Decrypt what the viewer is authorized for; every set that fails a
    // check is left unverified.
    let policy = profile.integrity_policy();
    let mut verified: HashMap<String, HashMap<Uuid, PayloadEntry>> = HashMap::new();
    let mut unverified: BTreeSet<String> = BTreeSet::new();
    let authorized: Vec<String> = decision
        .content_set_refs
        .iter()
        .map(|r| r.set_identifier.clone())
        .collect();

    for set_identifier in &authorized {
        match load_set(ctx, document_id, set_identifier).await {
            Ok(entries) => {
                verified.insert(set_identifier.clone(), entries);
            }
            Err(err) if err.is_set_integrity() => {
                let stage = integrity_stage(&err);
                audit_integrity_failure(
                    ctx,
                    document_id,
                    organization_id,
                    Some(set_identifier.as_str()),
                    stage,
                )
                .await;
                if policy == IntegrityPolicy::Halt {
                    return Err(err);
                }
                unverified.insert(set_identifier.clone());
            }
            Err(TesseraError::NotFound { .. }) => {
                // the level names a set this document no longer stores
                warn!(%document_id, set = %set_identifier, "authorized content set missing");
            }
            Err(err) => return Err(err),
        }
    }

    // 4./5. Assemble the view in sequence order.
    let redaction = REDACTION_GLYPH
        .to_string()
        .repeat(profile.marker_width as usize);
    let mut markers = base.markers.clone();
    markers.sort_by_key(|m| m.sequence_position);

    let mut blocks = Vec::with_capacity(markers.len());
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut redacted_sets: BTreeSet<String> = BTreeSet::new();

    for marker in &markers {
        let mut resolved: Option<(String, String)> = None;
        for set_identifier in &marker.content_set_membership {
            let Some(entries) = verified.get(set_identifier) else {
                continue;
            };
            let Some(entry) = entries.get(&marker.marker_id) else {
                continue;
            };
            // tampered-after-decrypt content redacts rather than leaks
            if !crypto::digest_eq(
                &crypto::sha512_hex(entry.content.as_bytes()),
                &marker.content_hash,
            ) {
                continue;
            }
            resolved = Some((set_identifier.clone(), entry.content.clone()));
            break;
        }

        match resolved {
            Some((set_identifier, content)) => {
                used.insert(set_identifier.clone());
                blocks.push(ViewBlock {
                    marker_id: marker.marker_id,
                    block_id: marker.block_id.clone(),
                    content,
                    is_redacted: false,
                    accessed_via_set: Some(set_identifier),
                });
            }
            None => {
                redacted_sets.extend(marker.content_set_membership.iter().cloned());
                blocks.push(ViewBlock {
                    marker_id: marker.marker_id,
                    block_id: marker.block_id.clone(),
                    content: redaction.clone(),
                    is_redacted: true,
                    accessed_via_set: None,
                });
            }
        }
    }

    // 6. Hash of the serialized view.
    let serialized = serde_json::to_string(&blocks)
        .map_err(|e| TesseraError::PayloadParse(e.to_string()))?;
    let reconstruction_hash = crypto::sha512_hex(serialized.as_bytes());
    let integrity_all_passed = unverified.is_empty();

    let view = ReconstructedView {
        document_id,
        blocks,
        marker_width: profile.marker_width,
        content_sets_used: used.iter().cloned().collect(),
        content_sets_redacted: redacted_sets.iter().cloned().collect(),
        reconstruction_hash: reconstruction_hash.clone(),
        integrity_all_passed,
    };

    // 8. One audit event, one anchor action record; then the event row.
    let _ = ctx
        .audit
        .append(AuditEvent::new(
            AuditCategory::Action,
            "document.reconstructed",
            "tailored view assembled",
            Some(organization_id),
            Some(viewer_id),
            "document",
            document_id.to_string(),
            json!({
                "content_sets_used": &view.content_sets_used,
                "content_sets_redacted": &view.content_sets_redacted,
                "integrity_all_passed": integrity_all_passed,
            }),
        ))
        .await;

    let anchor_tx_id = match ctx
        .anchor
        .submit(AnchorTransaction::new("document_reconstruction").with_action(json!({
            "document_id": document_id,
            "viewer_id": viewer_id,
            "access_level_id": access_level_id,
            "reconstruction_hash": &reconstruction_hash,
            "content_sets_used": &view.content_sets_used,
            "content_sets_redacted": &view.content_sets_redacted,
            "integrity_all_passed": integrity_all_passed,
        })))
        .await
    {
        Ok(receipt) => Some(receipt.forward_tx_id),
        Err(err) => {
            warn!(%document_id, error = %err, "anchor sink unreachable, reconstruction stays served");
            None
        }
    };

    // 7. The append-only attempt record.
    ctx.store
        .append_reconstruction_event(ReconstructionEventRecord {
            id: Uuid::new_v4(),
            document_id,
            viewer_id,
            access_level_id,
            content_sets_used: view.content_sets_used.clone(),
            content_sets_redacted: view.content_sets_redacted.clone(),
            marker_width: profile.marker_width,
            reconstruction_hash,
            integrity_all_passed,
            anchor_tx_id,
            occurred_at: Utc::now(),
        })
        .await?;

    info!(
        %document_id,
        used = view.content_sets_used.len(),
        redacted = view.content_sets_redacted.len(),
        "reconstruction served"
    );
    Ok(view)
}

/// Load, verify and decrypt one content set; returns the marker-indexed
/// payload map. Key material never outlives this function.
async fn load_set(
    ctx: &CoreContext,
    document_id: Uuid,
    set_identifier: &str,
) -> Result<HashMap<Uuid, PayloadEntry>> {
    let row = ctx.store.content_set(document_id, set_identifier).await?;
    let envelope = EncryptedEnvelope::from_blob(&row.envelope_blob)?;

    // an envelope substituted from another content set claims the wrong
    // identity; reject before decrypting
    if envelope.content_set_identifier != set_identifier {
        return Err(TesseraError::AeadAuthentication {
            content_set: set_identifier.to_string(),
        });
    }

    // storage-level precheck before touching any key material
    if !crypto::digest_eq(
        &crypto::sha512_hex(&envelope.ciphertext),
        &envelope.ciphertext_hash,
    ) {
        return Err(TesseraError::CiphertextIntegrity {
            content_set: set_identifier.to_string(),
        });
    }

    let key = ctx.store.active_key(document_id, set_identifier).await?;
    let plaintext = {
        let material = ctx.hsm.key_material(&key.hsm_key_handle).await?;
        crypto::decrypt(&envelope, material.expose())?
    };

    let text = std::str::from_utf8(&plaintext)
        .map_err(|e| TesseraError::PayloadParse(e.to_string()))?;
    marker::parse_payload(text)
}

fn integrity_stage(err: &TesseraError) -> &'static str {
    match err {
        TesseraError::CiphertextIntegrity { .. } => "ciphertext_hash",
        TesseraError::AeadAuthentication { .. } => "aead_authentication",
        TesseraError::PlaintextIntegrity { .. } => "plaintext_hash",
        TesseraError::BaseDocumentTampered => "base_document_hash",
        _ => "unknown",
    }
}

async fn audit_integrity_failure(
    ctx: &CoreContext,
    document_id: Uuid,
    organization_id: Uuid,
    content_set: Option<&str>,
    stage: &str,
) {
    let _ = ctx
        .audit
        .append(AuditEvent::new(
            AuditCategory::Action,
            "reconstruction.integrity_failure",
            format!("integrity verification failed at {stage}"),
            Some(organization_id),
            None,
            "document",
            document_id.to_string(),
            json!({ "stage": stage, "content_set": content_set }),
        ))
        .await;
}
