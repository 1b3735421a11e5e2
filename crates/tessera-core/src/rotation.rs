//! Key rotation, verified destruction, and the read-only integrity sweep.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::anchor::AnchorTransaction;
use crate::audit::{AuditCategory, AuditEvent};
use crate::context::CoreContext;
use crate::crypto;
use crate::envelope::EncryptedEnvelope;
use crate::error::{Result, TesseraError};
use crate::hsm::KeyHandle;
use crate::model::{DocumentStatus, EncryptionKeyRecord};

#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub document_id: Uuid,
    pub rotated: Vec<RotatedKey>,
    pub anchor_tx_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RotatedKey {
    pub content_set_identifier: String,
    pub old_key_id: Uuid,
    pub new_key_id: Uuid,
}

/// Re-encrypt every content set under a fresh key. One transaction; the
/// plaintext hash of each envelope is invariant across the rotation.
pub async fn rotate_keys(ctx: &CoreContext, document_id: Uuid) -> Result<RotationOutcome> {
    let mut txn = ctx.store.begin(document_id).await?;
    let document = txn.document().clone();
    if document.status != DocumentStatus::Active {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} is {}, expected active",
            document.status
        )));
    }

    let rows = ctx.store.content_sets(document_id).await?;
    if rows.is_empty() {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} has no encrypted content sets to rotate"
        )));
    }

    let now = Utc::now();
    let mut rotated = Vec::with_capacity(rows.len());

    let result: Result<()> = async {
        for row in &rows {
            let old_key = ctx
                .store
                .active_key(document_id, &row.content_set_identifier)
                .await
                .map_err(|e| match e {
                    TesseraError::NotFound { .. } => TesseraError::Precondition(format!(
                        "no active key for content set {}",
                        row.content_set_identifier
                    )),
                    other => other,
                })?;
            let envelope = EncryptedEnvelope::from_blob(&row.envelope_blob)?;

            let (new_handle, new_key_id) = ctx.hsm.generate_key().await?;
            let new_envelope = {
                // both copies die with this block
                let old_material = ctx.hsm.key_material(&old_key.hsm_key_handle).await?;
                let new_material = ctx.hsm.key_material(&new_handle).await?;
                crypto::re_encrypt(
                    &envelope,
                    old_material.expose(),
                    new_material.expose(),
                    new_key_id,
                )?
            };

            let mut deactivated = old_key.clone();
            deactivated.is_active = false;
            deactivated.rotated_at = Some(now);
            txn.upsert_key(deactivated);

            txn.upsert_key(EncryptionKeyRecord {
                id: new_key_id,
                document_id,
                content_set_identifier: row.content_set_identifier.clone(),
                organization_id: old_key.organization_id,
                hsm_key_handle: new_handle,
                algorithm: old_key.algorithm.clone(),
                shamir_threshold: old_key.shamir_threshold,
                shamir_total_shares: old_key.shamir_total_shares,
                is_active: true,
                rotated_from_key_id: Some(old_key.id),
                created_at: now,
                rotated_at: None,
                destroyed_at: None,
            });

            let mut updated = row.clone();
            updated.envelope_blob = new_envelope.to_blob()?;
            updated.key_id = new_key_id;
            updated.updated_at = now;
            txn.upsert_content_set(updated);

            rotated.push(RotatedKey {
                content_set_identifier: row.content_set_identifier.clone(),
                old_key_id: old_key.id,
                new_key_id,
            });
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        drop(txn);
        let _ = ctx
            .audit
            .append(AuditEvent::new(
                AuditCategory::Action,
                "document.key_rotation_failed",
                err.to_string(),
                Some(document.organization_id),
                None,
                "document",
                document_id.to_string(),
                json!({}),
            ))
            .await;
        return Err(err);
    }

    txn.commit().await?;
    info!(%document_id, sets = rotated.len(), "key rotation committed");

    let _ = ctx
        .audit
        .append(AuditEvent::new(
            AuditCategory::Action,
            "document.keys_rotated",
            "all content-set keys rotated",
            Some(document.organization_id),
            None,
            "document",
            document_id.to_string(),
            json!({
                "rotations": rotated
                    .iter()
                    .map(|r| json!({
                        "content_set": &r.content_set_identifier,
                        "old_key_id": r.old_key_id,
                        "new_key_id": r.new_key_id,
                    }))
                    .collect::<Vec<_>>(),
            }),
        ))
        .await;

    let anchor_tx_id = match ctx
        .anchor
        .submit(AnchorTransaction::new("key_rotation").with_action(json!({
            "document_id": document_id,
            "rotated_sets": rotated.iter().map(|r| &r.content_set_identifier).collect::<Vec<_>>(),
        })))
        .await
    {
        Ok(receipt) => Some(receipt.forward_tx_id),
        Err(err) => {
            warn!(%document_id, error = %err, "anchor sink unreachable, rotation stays committed");
            None
        }
    };

    Ok(RotationOutcome {
        document_id,
        rotated,
        anchor_tx_id,
    })
}

#[derive(Debug, Clone)]
pub struct DestructionOutcome {
    pub document_id: Uuid,
    pub destroyed_content_sets: Vec<String>,
    pub destroyed_key_handles: usize,
    pub anchor_tx_id: Option<String>,
}

/// Cryptographic destruction of the whole document: envelopes, base
/// document, share metadata, HSM keys. The audit trail survives; nothing
/// else does.
pub async fn destroy(
    ctx: &CoreContext,
    document_id: Uuid,
    reason: &str,
    regulatory_clearance: bool,
) -> Result<DestructionOutcome> {
    if !regulatory_clearance {
        return Err(TesseraError::Precondition(
            "destruction requires explicit regulatory clearance".into(),
        ));
    }

    let mut txn = ctx.store.begin(document_id).await?;
    let document = txn.document().clone();
    if document.legal_hold {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} is under legal hold"
        )));
    }
    if let Some(until) = document.effective_retention_until {
        if until > Utc::now() {
            return Err(TesseraError::Precondition(format!(
                "retention for {document_id} runs until {until}"
            )));
        }
    }
    DocumentStatus::ensure_core_transition(document.status, DocumentStatus::Destroying)?;
    txn.set_status_now(DocumentStatus::Destroying).await?;

    let result: Result<(Vec<String>, Vec<KeyHandle>)> = async {
        let rows = ctx.store.content_sets(document_id).await?;
        let keys = ctx.store.keys_for_document(document_id).await?;
        let now = Utc::now();

        let sets: Vec<String> = rows
            .iter()
            .map(|r| r.content_set_identifier.clone())
            .collect();
        for set in &sets {
            txn.delete_content_set(set);
        }
        txn.delete_base_document();

        let key_ids: Vec<Uuid> = keys.iter().map(|k| k.id).collect();
        txn.delete_key_shares(&key_ids);

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            let mut record = key.clone();
            record.is_active = false;
            record.destroyed_at = Some(now);
            txn.upsert_key(record);
            handles.push(key.hsm_key_handle);
        }
        Ok((sets, handles))
    }
    .await;

    match result {
        Ok((sets, handles)) => {
            txn.set_status(DocumentStatus::Destroyed);
            txn.commit().await?;

            // HSM destruction is idempotent and best-effort on handles that
            // are already gone.
            for handle in &handles {
                if let Err(err) = ctx.hsm.destroy_key(handle).await {
                    warn!(%document_id, handle = %handle, error = %err, "hsm key destruction");
                }
            }
            info!(%document_id, sets = sets.len(), "document destroyed");

            let _ = ctx
                .audit
                .append(AuditEvent::new(
                    AuditCategory::Action,
                    "document.destroyed",
                    reason,
                    Some(document.organization_id),
                    None,
                    "document",
                    document_id.to_string(),
                    json!({
                        "content_sets": &sets,
                        "key_handles_destroyed": handles.len(),
                    }),
                ))
                .await;

            let anchor_tx_id = match ctx
                .anchor
                .submit(AnchorTransaction::new("document_destruction").with_action(json!({
                    "document_id": document_id,
                    "content_sets": &sets,
                    "reason": reason,
                })))
                .await
            {
                Ok(receipt) => Some(receipt.forward_tx_id),
                Err(err) => {
                    warn!(%document_id, error = %err, "anchor sink unreachable, destruction stays committed");
                    None
                }
            };

            Ok(DestructionOutcome {
                document_id,
                destroyed_content_sets: sets,
                destroyed_key_handles: handles.len(),
                anchor_tx_id,
            })
        }
        Err(err) => {
            drop(txn);
            if let Err(reset) = ctx
                .store
                .reset_status(document_id, DocumentStatus::Destroying, DocumentStatus::Active)
                .await
            {
                warn!(%document_id, error = %reset, "status rewind after failed destruction");
            }
            let _ = ctx
                .audit
                .append(AuditEvent::new(
                    AuditCategory::Action,
                    "document.destruction_failed",
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

/// Right-to-erasure: destroy exactly one content set; the document stays
/// active and its other sets remain reconstructible.
pub async fn destroy_content_set(
    ctx: &CoreContext,
    document_id: Uuid,
    content_set_identifier: &str,
    reason: &str,
    regulatory_basis: &str,
) -> Result<DestructionOutcome> {
    let mut txn = ctx.store.begin(document_id).await?;
    let document = txn.document().clone();
    if document.status != DocumentStatus::Active {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} is {}, expected active",
            document.status
        )));
    }
    if document.legal_hold {
        return Err(TesseraError::Precondition(format!(
            "document {document_id} is under legal hold"
        )));
    }

    // confirm the set exists before touching anything
    ctx.store
        .content_set(document_id, content_set_identifier)
        .await?;
    let keys: Vec<EncryptionKeyRecord> = ctx
        .store
        .keys_for_document(document_id)
        .await?
        .into_iter()
        .filter(|k| k.content_set_identifier == content_set_identifier)
        .collect();

    let now = Utc::now();
    txn.delete_content_set(content_set_identifier);
    let key_ids: Vec<Uuid> = keys.iter().map(|k| k.id).collect();
    txn.delete_key_shares(&key_ids);
    let mut handles = Vec::with_capacity(keys.len());
    for key in keys {
        let mut record = key.clone();
        record.is_active = false;
        record.destroyed_at = Some(now);
        txn.upsert_key(record);
        handles.push(key.hsm_key_handle);
    }
    txn.commit().await?;

    for handle in &handles {
        if let Err(err) = ctx.hsm.destroy_key(handle).await {
            warn!(%document_id, handle = %handle, error = %err, "hsm key destruction");
        }
    }
    info!(%document_id, set = %content_set_identifier, "content set destroyed");

    let _ = ctx
        .audit
        .append(AuditEvent::new(
            AuditCategory::Action,
            "content_set.destroyed",
            reason,
            Some(document.organization_id),
            None,
            "content_set",
            format!("{document_id}/{content_set_identifier}"),
            json!({ "regulatory_basis": regulatory_basis }),
        ))
        .await;

    let anchor_tx_id = match ctx
        .anchor
        .submit(
            AnchorTransaction::new("content_set_destruction").with_action(json!({
                "document_id": document_id,
                "content_set": content_set_identifier,
                "regulatory_basis": regulatory_basis,
            })),
        )
        .await
    {
        Ok(receipt) => Some(receipt.forward_tx_id),
        Err(err) => {
            warn!(%document_id, error = %err, "anchor sink unreachable, destruction stays committed");
            None
        }
    };

    Ok(DestructionOutcome {
        document_id,
        destroyed_content_sets: vec![content_set_identifier.to_string()],
        destroyed_key_handles: handles.len(),
        anchor_tx_id,
    })
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub document_id: Uuid,
    pub base_document_ok: bool,
    pub sets: Vec<SetIntegrity>,
    pub all_passed: bool,
}

#[derive(Debug, Clone)]
pub struct SetIntegrity {
    pub content_set_identifier: String,
    pub ciphertext_ok: bool,
}

/// Read-only sweep: recompute the base-document hash and every stored
/// ciphertext hash without decrypting anything.
pub async fn verify_integrity(ctx: &CoreContext, document_id: Uuid) -> Result<IntegrityReport> {
    let base = ctx.store.base_document(document_id).await?;
    let base_document_ok =
        crypto::digest_eq(&crypto::sha512_hex(base.content.as_bytes()), &base.content_hash);

    let mut sets = Vec::new();
    for row in ctx.store.content_sets(document_id).await? {
        let ciphertext_ok = match EncryptedEnvelope::from_blob(&row.envelope_blob) {
            Ok(envelope) => crypto::digest_eq(
                &crypto::sha512_hex(&envelope.ciphertext),
                &envelope.ciphertext_hash,
            ),
            Err(_) => false,
        };
        sets.push(SetIntegrity {
            content_set_identifier: row.content_set_identifier,
            ciphertext_ok,
        });
    }

    let all_passed = base_document_ok && sets.iter().all(|s| s.ciphertext_ok);
    Ok(IntegrityReport {
        document_id,
        base_document_ok,
        sets,
        all_passed,
    })
}
