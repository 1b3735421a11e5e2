//! Shared in-process stack for the end-to-end tests.

use std::sync::Arc;

use chrono::Utc;
use tessera_core::authz::{AccessGrant, AccessLevel, GrantTableProvider};
use tessera_core::anchor::MemoryAnchorSink;
use tessera_core::audit::MemoryAuditSink;
use tessera_core::model::{
    ApprovedAssignment, AuthzProviderKind, DocumentRecord, DocumentStatus, SecurityProfile,
    StorageTier,
};
use tessera_core::store::MemoryStore;
use tessera_core::{CoreContext, SoftHsm, Tessera};
use uuid::Uuid;

pub struct TestStack {
    pub tessera: Tessera,
    pub store: Arc<MemoryStore>,
    pub hsm: Arc<SoftHsm>,
    pub authz: Arc<GrantTableProvider>,
    pub audit: Arc<MemoryAuditSink>,
    pub anchor: Arc<MemoryAnchorSink>,
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub session_id: Uuid,
    pub viewer_id: Uuid,
}

pub fn stack_with_tier(tier: StorageTier) -> TestStack {
    let store = Arc::new(MemoryStore::new());
    let hsm = Arc::new(SoftHsm::new());
    let authz = Arc::new(GrantTableProvider::new(store.clone()));
    let audit = Arc::new(MemoryAuditSink::new());
    let anchor = Arc::new(MemoryAnchorSink::new());

    let ctx = CoreContext::new(
        store.clone(),
        hsm.clone(),
        authz.clone(),
        audit.clone(),
        anchor.clone(),
    );

    let organization_id = Uuid::new_v4();
    let document_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let now = Utc::now();

    store.insert_document(DocumentRecord {
        id: document_id,
        organization_id,
        status: DocumentStatus::Approved,
        previous_version_id: None,
        legal_hold: false,
        effective_retention_until: None,
        created_at: now,
        updated_at: now,
    });
    store.put_security_profile(SecurityProfile {
        organization_id,
        shamir_threshold: 2,
        shamir_total_shares: 3,
        storage_tier: tier,
        marker_width: 3,
        export_permitted: true,
        min_retention_days: 0,
        share_holder_ids: vec![
            "holder-alpha".into(),
            "holder-beta".into(),
            "holder-gamma".into(),
        ],
        authz_provider: AuthzProviderKind::Conventional,
    });

    TestStack {
        tessera: Tessera::new(ctx),
        store,
        hsm,
        authz,
        audit,
        anchor,
        organization_id,
        document_id,
        session_id,
        viewer_id: Uuid::new_v4(),
    }
}

pub fn stack() -> TestStack {
    stack_with_tier(StorageTier::Tier1)
}

pub fn assignment(
    set: &str,
    block: &str,
    text: &str,
    page: u32,
) -> ApprovedAssignment {
    ApprovedAssignment {
        content_set_identifier: set.to_string(),
        block_id: block.to_string(),
        start_offset: None,
        end_offset: None,
        selected_text: Some(text.to_string()),
        page_number: page,
    }
}

/// Scenario A fixture: three content sets, one sentence each.
pub fn seed_three_sets(stack: &TestStack) {
    stack.store.put_approved_assignments(
        stack.document_id,
        stack.session_id,
        vec![
            assignment("CS-PUBLIC", "block-1", "Public statement.", 1),
            assignment("CS-CONFIDENTIAL", "block-2", "Budget $4.2M.", 1),
            assignment("CS-SECRET", "block-3", "Agent Smith.", 1),
        ],
    );
}

/// Grant `viewer` an access level covering `sets` and return the level id.
pub fn grant_level(stack: &TestStack, viewer_id: Uuid, sets: &[&str]) -> Uuid {
    let level_id = Uuid::new_v4();
    stack.authz.put_level(AccessLevel {
        id: level_id,
        organization_id: stack.organization_id,
        active: true,
        content_set_identifiers: sets.iter().map(|s| s.to_string()).collect(),
    });
    stack.authz.put_grant(AccessGrant {
        user_id: viewer_id,
        document_id: stack.document_id,
        access_level_id: level_id,
        organization_id: stack.organization_id,
        revoked: false,
        expires_at: None,
    });
    level_id
}

pub fn contents(view: &tessera_core::ReconstructedView) -> Vec<&str> {
    view.blocks.iter().map(|b| b.content.as_str()).collect()
}

pub const REDACTED: &str = "\u{2588}\u{2588}\u{2588}";
