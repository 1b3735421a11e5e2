//! Deconstruction engine: approved assignment set in, base document plus
//! per-set encrypted envelopes out, atomically.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::anchor::AnchorTransaction;
use crate::audit::{AuditCategory, AuditEvent};
use crate::context::CoreContext;
use crate::crypto;
use crate::envelope::AES_256_GCM;
use crate::error::{Result, TesseraError};
use crate::marker;
use crate::model::{
    BaseDocumentRecord, DocumentStatus, EncryptedContentSetRecord, EncryptionKeyRecord,
    KeyShareRecord,
};

/// Summary of a committed deconstruction.
#[derive(Debug, Clone)]
pub struct DeconstructionOutcome {
    pub document_id: Uuid,
    pub marker_count: usize,
    pub content_sets: Vec<String>,
    pub base_hash: String,
    pub anchor_tx_id: Option<String>,
}

pub async fn deconstruct(
    ctx: &CoreContext,
    document_id: Uuid,
    session_id: Uuid,
) -> Result<DeconstructionOutcome> {
    // Row lock first; everything below happens under it.
    let mut txn = ctx.store.begin(document_id).await?;
    let document = txn.document().clone();

    if document.status != DocumentStatus::Approved {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} is {}, expected approved",
            document.status
        )));
    }
    match ctx.store.approved_session(document_id).await? {
        Some(approved) if approved == session_id => {}
        _ => {
            return Err(TesseraError::Precondition(format!(
                "markup session {session_id} is not the approved session for {document_id}"
            )));
        }
    }
    let profile = ctx.store.security_profile(document.organization_id).await?;
    profile.validate()?;

    DocumentStatus::ensure_core_transition(document.status, DocumentStatus::Deconstructing)?;
    txn.set_status_now(DocumentStatus::Deconstructing).await?;

    // From here on every failure rolls back and rewinds the status.
    let outcome = match run(ctx, &mut txn, document_id, &profile).await {
        Ok(prepared) => {
            txn.set_status(DocumentStatus::Active);
            match txn.commit().await {
                Ok(()) => Ok(prepared),
                Err(err) => Err(err),
            }
        }
        Err(err) => {
            drop(txn);
            Err(err)
        }
    };

    match outcome {
        Ok(prepared) => {
            info!(%document_id, markers = prepared.marker_count, "deconstruction committed");
            let anchor_tx_id = publish(ctx, document_id, &profile, &prepared).await;
            Ok(DeconstructionOutcome {
                document_id,
                marker_count: prepared.marker_count,
                content_sets: prepared.content_sets,
                base_hash: prepared.base_hash,
                anchor_tx_id,
            })
        }
        Err(err) => {
            if let Err(reset) = ctx
                .store
                .reset_status(document_id, DocumentStatus::Deconstructing, DocumentStatus::Approved)
                .await
            {
                warn!(%document_id, error = %reset, "status rewind after failed deconstruction");
            }
            let _ = ctx
                .audit
                .append(AuditEvent::new(
                    AuditCategory::Action,
                    "document.deconstruction_failed",
                    err.to_string(),
                    Some(document.organization_id),
                    None,
                    "document",
                    document_id.to_string(),
                    json!({}),
                ))
                .await;
            Err(err)
        }
    }
}

struct Prepared {
    marker_count: usize,
    content_sets: Vec<String>,
    base_hash: String,
    set_hashes: Vec<serde_json::Value>,
    key_record_ids: Vec<Uuid>,
    storage_locations: Vec<String>,
}

async fn run(
    ctx: &CoreContext,
    txn: &mut Box<dyn crate::store::StoreTransaction>,
    document_id: Uuid,
    profile: &crate::model::SecurityProfile,
) -> Result<Prepared> {
    let assignments = ctx.store.approved_assignments(document_id).await?;
    if assignments.is_empty() {
        return Err(TesseraError::EmptyAssignmentSet);
    }

    let build = marker::build(&assignments)?;
    let base_content = marker::serialize_base(&build.markers)?;
    let base_hash = crypto::sha512_hex(base_content.as_bytes());
    let now = Utc::now();

    let mut set_hashes = Vec::with_capacity(build.payloads.len());
    let mut key_record_ids = Vec::with_capacity(build.payloads.len());
    let mut storage_locations = Vec::with_capacity(build.payloads.len());
    let mut content_sets = Vec::with_capacity(build.payloads.len());

    // BTreeMap iteration gives the ascending identifier order the protocol
    // requires.
    for (set_identifier, payload) in &build.payloads {
        let (handle, key_id) = ctx.hsm.generate_key().await?;
        let envelope = {
            // material lives exactly as long as this encryption
            let material = ctx.hsm.key_material(&handle).await?;
            crypto::encrypt(payload.as_bytes(), material.expose(), key_id, set_identifier)?
        };

        txn.upsert_key(EncryptionKeyRecord {
            id: key_id,
            document_id,
            content_set_identifier: set_identifier.clone(),
            organization_id: profile.organization_id,
            hsm_key_handle: handle.clone(),
            algorithm: AES_256_GCM.to_string(),
            shamir_threshold: profile.shamir_threshold,
            shamir_total_shares: profile.shamir_total_shares,
            is_active: true,
            rotated_from_key_id: None,
            created_at: now,
            rotated_at: None,
            destroyed_at: None,
        });

        let issued = ctx
            .hsm
            .split_key_to_shares(
                &handle,
                profile.shamir_threshold,
                profile.shamir_total_shares,
                &profile.share_holder_ids,
            )
            .await?;
        for share in &issued {
            txn.put_key_share(KeyShareRecord {
                key_id,
                share_index: share.share.index,
                holder_id: share.holder_id.clone(),
                distributed: false,
                distributed_at: None,
            });
        }
        // share bytes are caller-owned; dropping them here zeroizes

        let storage_location = format!(
            "{}/{}/{}",
            profile.storage_tier.as_str(),
            document_id,
            set_identifier
        );
        set_hashes.push(json!({
            "content_set": set_identifier,
            "plaintext_hash": envelope.plaintext_hash,
            "ciphertext_hash": envelope.ciphertext_hash,
        }));
        txn.upsert_content_set(EncryptedContentSetRecord {
            id: Uuid::new_v4(),
            document_id,
            content_set_identifier: set_identifier.clone(),
            envelope_blob: envelope.to_blob()?,
            storage_location: storage_location.clone(),
            key_id,
            created_at: now,
            updated_at: now,
        });

        key_record_ids.push(key_id);
        storage_locations.push(storage_location);
        content_sets.push(set_identifier.clone());
    }

    txn.put_base_document(BaseDocumentRecord {
        document_id,
        content: base_content,
        content_hash: base_hash.clone(),
        markers: build.markers.clone(),
        created_at: now,
    });

    Ok(Prepared {
        marker_count: build.markers.len(),
        content_sets,
        base_hash,
        set_hashes,
        key_record_ids,
        storage_locations,
    })
}

/// Post-commit side effects: one audit event, one anchor submission. Anchor
/// unreachability does not undo the committed deconstruction.
async fn publish(
    ctx: &CoreContext,
    document_id: Uuid,
    profile: &crate::model::SecurityProfile,
    prepared: &Prepared,
) -> Option<String> {
    let audit = AuditEvent::new(
        AuditCategory::Action,
        "document.deconstructed",
        "document deconstructed into encrypted content sets",
        Some(profile.organization_id),
        None,
        "document",
        document_id.to_string(),
        json!({
            "content_sets": &prepared.content_sets,
            "marker_count": prepared.marker_count,
        }),
    );
    if let Err(err) = ctx.audit.append(audit).await {
        warn!(%document_id, error = %err, "audit append after deconstruction");
    }

    let transaction = AnchorTransaction::new("document_deconstruction")
        .with_arrangement(json!({
            "document_id": document_id,
            "content_sets": &prepared.content_sets,
            "content_set_count": prepared.content_sets.len(),
            "storage_tier": profile.storage_tier.as_str(),
            "shamir_threshold": profile.shamir_threshold,
            "shamir_total_shares": profile.shamir_total_shares,
        }))
        .with_accrual(json!({
            "base_hash": &prepared.base_hash,
            "content_set_hashes": &prepared.set_hashes,
            "marker_count": prepared.marker_count,
            "key_record_ids": &prepared.key_record_ids,
            "storage_confirmations": &prepared.storage_locations,
        }));
    match ctx.anchor.submit(transaction).await {
        Ok(receipt) => Some(receipt.forward_tx_id),
        Err(err) => {
            warn!(%document_id, error = %err, "anchor sink unreachable, deconstruction stays committed");
            None
        }
    }
}
