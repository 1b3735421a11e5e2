//! Persistence boundary.
//!
//! The core owns the schema (documents, keys, shares, content sets, base
//! documents, reconstruction events); [`DocumentStore`] is the surface the
//! engines consume. Mutations run through a staged [`StoreTransaction`]
//! opened under a per-document row lock: commit publishes every staged row
//! atomically, dropping the transaction discards them, so partial
//! persistence is never observable. Reads outside a transaction are
//! read-committed and take no exclusive locks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::model::{
    ApprovedAssignment, BaseDocumentRecord, DocumentRecord, DocumentStatus,
    EncryptedContentSetRecord, EncryptionKeyRecord, KeyShareRecord, ReconstructionEventRecord,
    SecurityProfile,
};

/// Read-committed queries plus transaction entry.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn document(&self, id: Uuid) -> Result<DocumentRecord>;
    async fn security_profile(&self, organization_id: Uuid) -> Result<SecurityProfile>;

    /// The approved markup session currently attached to the document, if
    /// any. Supplied by the markup collaborator.
    async fn approved_session(&self, document_id: Uuid) -> Result<Option<Uuid>>;
    async fn approved_assignments(&self, document_id: Uuid) -> Result<Vec<ApprovedAssignment>>;

    async fn base_document(&self, document_id: Uuid) -> Result<BaseDocumentRecord>;
    async fn content_set(
        &self,
        document_id: Uuid,
        content_set_identifier: &str,
    ) -> Result<EncryptedContentSetRecord>;
    async fn content_sets(&self, document_id: Uuid) -> Result<Vec<EncryptedContentSetRecord>>;

    /// The currently active key for one content set. Resolved at load time
    /// so readers tolerate in-flight rotations.
    async fn active_key(
        &self,
        document_id: Uuid,
        content_set_identifier: &str,
    ) -> Result<EncryptionKeyRecord>;
    async fn keys_for_document(&self, document_id: Uuid) -> Result<Vec<EncryptionKeyRecord>>;
    async fn key_shares_for_document(&self, document_id: Uuid) -> Result<Vec<KeyShareRecord>>;

    async fn append_reconstruction_event(&self, event: ReconstructionEventRecord) -> Result<()>;
    async fn reconstruction_events(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<ReconstructionEventRecord>>;

    /// Open a transaction holding the document's row lock. Concurrent
    /// transactions on the same document wait here.
    async fn begin(&self, document_id: Uuid) -> Result<Box<dyn StoreTransaction>>;

    /// Compare-and-set of the document status outside any transaction; used
    /// for the best-effort rewind after a rollback.
    async fn reset_status(
        &self,
        document_id: Uuid,
        expected: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<()>;
}

/// Staged mutations over one document. All writes land at `commit`;
/// dropping the transaction rolls everything back and releases the row
/// lock.
#[async_trait]
pub trait StoreTransaction: Send {
    /// The document as this transaction sees it (staged over committed).
    fn document(&self) -> &DocumentRecord;

    /// Publish a status change immediately, keeping the row lock. Used for
    /// the visible intermediate states (`deconstructing`, `destroying`)
    /// that survive a later rollback and are rewound best-effort.
    async fn set_status_now(&mut self, status: DocumentStatus) -> Result<()>;

    fn set_status(&mut self, status: DocumentStatus);
    fn upsert_key(&mut self, record: EncryptionKeyRecord);
    fn put_key_share(&mut self, record: KeyShareRecord);
    fn delete_key_shares(&mut self, key_ids: &[Uuid]);
    fn upsert_content_set(&mut self, record: EncryptedContentSetRecord);
    fn delete_content_set(&mut self, content_set_identifier: &str);
    fn put_base_document(&mut self, record: BaseDocumentRecord);
    fn delete_base_document(&mut self);

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    documents: HashMap<Uuid, DocumentRecord>,
    profiles: HashMap<Uuid, SecurityProfile>,
    approved_sessions: HashMap<Uuid, Uuid>,
    assignments: HashMap<Uuid, Vec<ApprovedAssignment>>,
    base_documents: HashMap<Uuid, BaseDocumentRecord>,
    content_sets: HashMap<(Uuid, String), EncryptedContentSetRecord>,
    keys: HashMap<Uuid, EncryptionKeyRecord>,
    key_shares: Vec<KeyShareRecord>,
    reconstruction_events: Vec<ReconstructionEventRecord>,
}

/// In-memory reference store.
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    row_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: Arc::new(RwLock::new(Tables::default())),
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    // Seeding surface for the composition root and tests; the engines only
    // ever see the trait.

    pub fn insert_document(&self, record: DocumentRecord) {
        self.tables.write().documents.insert(record.id, record);
    }

    pub fn put_security_profile(&self, profile: SecurityProfile) {
        self.tables
            .write()
            .profiles
            .insert(profile.organization_id, profile);
    }

    /// Attach an approved markup session and its assignment rows to a
    /// document, as the markup collaborator would.
    pub fn put_approved_assignments(
        &self,
        document_id: Uuid,
        session_id: Uuid,
        assignments: Vec<ApprovedAssignment>,
    ) {
        let mut tables = self.tables.write();
        tables.approved_sessions.insert(document_id, session_id);
        tables.assignments.insert(document_id, assignments);
    }

    /// Direct envelope-blob replacement, for tamper tests and operational
    /// repair tooling only.
    pub fn overwrite_content_set_blob(
        &self,
        document_id: Uuid,
        content_set_identifier: &str,
        blob: Vec<u8>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let key = (document_id, content_set_identifier.to_string());
        let record = tables.content_sets.get_mut(&key).ok_or(TesseraError::NotFound {
            entity: "encrypted content set",
            id: format!("{document_id}/{content_set_identifier}"),
        })?;
        record.envelope_blob = blob;
        Ok(())
    }

    /// Same, for the base document content (tamper tests).
    pub fn overwrite_base_content(&self, document_id: Uuid, content: String) -> Result<()> {
        let mut tables = self.tables.write();
        let record = tables
            .base_documents
            .get_mut(&document_id)
            .ok_or(TesseraError::NotFound {
                entity: "base document",
                id: document_id.to_string(),
            })?;
        record.content = content;
        Ok(())
    }

    async fn row_lock(&self, document_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        locks
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn document(&self, id: Uuid) -> Result<DocumentRecord> {
        self.tables
            .read()
            .documents
            .get(&id)
            .cloned()
            .ok_or(TesseraError::NotFound {
                entity: "document",
                id: id.to_string(),
            })
    }

    async fn security_profile(&self, organization_id: Uuid) -> Result<SecurityProfile> {
        self.tables
            .read()
            .profiles
            .get(&organization_id)
            .cloned()
            .ok_or(TesseraError::Precondition(format!(
                "no security profile for organization {organization_id}"
            )))
    }

    async fn approved_session(&self, document_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.tables.read().approved_sessions.get(&document_id).copied())
    }

    async fn approved_assignments(&self, document_id: Uuid) -> Result<Vec<ApprovedAssignment>> {
        Ok(self
            .tables
            .read()
            .assignments
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn base_document(&self, document_id: Uuid) -> Result<BaseDocumentRecord> {
        self.tables
            .read()
            .base_documents
            .get(&document_id)
            .cloned()
            .ok_or(TesseraError::NotFound {
                entity: "base document",
                id: document_id.to_string(),
            })
    }

    async fn content_set(
        &self,
        document_id: Uuid,
        content_set_identifier: &str,
    ) -> Result<EncryptedContentSetRecord> {
        self.tables
            .read()
            .content_sets
            .get(&(document_id, content_set_identifier.to_string()))
            .cloned()
            .ok_or(TesseraError::NotFound {
                entity: "encrypted content set",
                id: format!("{document_id}/{content_set_identifier}"),
            })
    }

    async fn content_sets(&self, document_id: Uuid) -> Result<Vec<EncryptedContentSetRecord>> {
        let tables = self.tables.read();
        let mut rows: Vec<EncryptedContentSetRecord> = tables
            .content_sets
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.content_set_identifier.cmp(&b.content_set_identifier));
        Ok(rows)
    }

    async fn active_key(
        &self,
        document_id: Uuid,
        content_set_identifier: &str,
    ) -> Result<EncryptionKeyRecord> {
        self.tables
            .read()
            .keys
            .values()
            .find(|k| {
                k.document_id == document_id
                    && k.content_set_identifier == content_set_identifier
                    && k.is_active
            })
            .cloned()
            .ok_or(TesseraError::NotFound {
                entity: "active encryption key",
                id: format!("{document_id}/{content_set_identifier}"),
            })
    }

    async fn keys_for_document(&self, document_id: Uuid) -> Result<Vec<EncryptionKeyRecord>> {
        let tables = self.tables.read();
        let mut rows: Vec<EncryptionKeyRecord> = tables
            .keys
            .values()
            .filter(|k| k.document_id == document_id)
            .cloned()
            .collect();
        rows.sort_by_key(|k| k.created_at);
        Ok(rows)
    }

    async fn key_shares_for_document(&self, document_id: Uuid) -> Result<Vec<KeyShareRecord>> {
        let tables = self.tables.read();
        let key_ids: HashSet<Uuid> = tables
            .keys
            .values()
            .filter(|k| k.document_id == document_id)
            .map(|k| k.id)
            .collect();
        Ok(tables
            .key_shares
            .iter()
            .filter(|s| key_ids.contains(&s.key_id))
            .cloned()
            .collect())
    }

    async fn append_reconstruction_event(&self, event: ReconstructionEventRecord) -> Result<()> {
        self.tables.write().reconstruction_events.push(event);
        Ok(())
    }

    async fn reconstruction_events(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<ReconstructionEventRecord>> {
        Ok(self
            .tables
            .read()
            .reconstruction_events
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn begin(&self, document_id: Uuid) -> Result<Box<dyn StoreTransaction>> {
        let lock = self.row_lock(document_id).await;
        let guard = lock.lock_owned().await;
        let document = self.document(document_id).await?;
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            _row_guard: guard,
            document,
            staged: Staged::default(),
        }))
    }

    async fn reset_status(
        &self,
        document_id: Uuid,
        expected: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let record = tables
            .documents
            .get_mut(&document_id)
            .ok_or(TesseraError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            })?;
        if record.status != expected {
            return Err(TesseraError::StorageConflict(format!(
                "status is {}, expected {expected}",
                record.status
            )));
        }
        record.status = to;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
struct Staged {
    status: Option<DocumentStatus>,
    key_upserts: Vec<EncryptionKeyRecord>,
    share_puts: Vec<KeyShareRecord>,
    share_deletes: HashSet<Uuid>,
    content_upserts: Vec<EncryptedContentSetRecord>,
    content_deletes: HashSet<String>,
    base_put: Option<BaseDocumentRecord>,
    base_delete: bool,
}

struct MemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    _row_guard: OwnedMutexGuard<()>,
    document: DocumentRecord,
    staged: Staged,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn document(&self) -> &DocumentRecord {
        &self.document
    }

    async fn set_status_now(&mut self, status: DocumentStatus) -> Result<()> {
        {
            let mut tables = self.tables.write();
            let record = tables
                .documents
                .get_mut(&self.document.id)
                .ok_or(TesseraError::NotFound {
                    entity: "document",
                    id: self.document.id.to_string(),
                })?;
            record.status = status;
            record.updated_at = Utc::now();
        }
        self.document.status = status;
        Ok(())
    }

    fn set_status(&mut self, status: DocumentStatus) {
        self.document.status = status;
        self.staged.status = Some(status);
    }

    fn upsert_key(&mut self, record: EncryptionKeyRecord) {
        self.staged.key_upserts.retain(|k| k.id != record.id);
        self.staged.key_upserts.push(record);
    }

    fn put_key_share(&mut self, record: KeyShareRecord) {
        self.staged.share_puts.push(record);
    }

    fn delete_key_shares(&mut self, key_ids: &[Uuid]) {
        self.staged.share_deletes.extend(key_ids.iter().copied());
    }

    fn upsert_content_set(&mut self, record: EncryptedContentSetRecord) {
        self.staged
            .content_upserts
            .retain(|r| r.content_set_identifier != record.content_set_identifier);
        self.staged.content_upserts.push(record);
    }

    fn delete_content_set(&mut self, content_set_identifier: &str) {
        self.staged
            .content_deletes
            .insert(content_set_identifier.to_string());
    }

    fn put_base_document(&mut self, record: BaseDocumentRecord) {
        self.staged.base_put = Some(record);
        self.staged.base_delete = false;
    }

    fn delete_base_document(&mut self) {
        self.staged.base_put = None;
        self.staged.base_delete = true;
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let document_id = self.document.id;
        let mut tables = self.tables.write();

        // validate the partial-unique invariant (one active key per
        // document/set) against the prospective table before mutating
        {
            let mut active_seen: HashSet<(Uuid, &str)> = HashSet::new();
            let staged_ids: HashSet<Uuid> = self.staged.key_upserts.iter().map(|k| k.id).collect();
            let prospective = tables
                .keys
                .values()
                .filter(|k| !staged_ids.contains(&k.id))
                .chain(self.staged.key_upserts.iter());
            for key in prospective.filter(|k| k.is_active) {
                let slot = (key.document_id, key.content_set_identifier.as_str());
                if !active_seen.insert(slot) {
                    return Err(TesseraError::StorageConflict(format!(
                        "more than one active key for {}/{}",
                        key.document_id, key.content_set_identifier
                    )));
                }
            }
        }
        for record in &self.staged.key_upserts {
            tables.keys.insert(record.id, record.clone());
        }

        if !self.staged.share_deletes.is_empty() {
            tables
                .key_shares
                .retain(|s| !self.staged.share_deletes.contains(&s.key_id));
        }
        tables.key_shares.extend(self.staged.share_puts.iter().cloned());

        for set in &self.staged.content_deletes {
            tables.content_sets.remove(&(document_id, set.clone()));
        }
        for record in &self.staged.content_upserts {
            tables.content_sets.insert(
                (document_id, record.content_set_identifier.clone()),
                record.clone(),
            );
        }

        if self.staged.base_delete {
            tables.base_documents.remove(&document_id);
        }
        if let Some(base) = &self.staged.base_put {
            tables.base_documents.insert(document_id, base.clone());
        }

        if let Some(status) = self.staged.status {
            if let Some(record) = tables.documents.get_mut(&document_id) {
                record.status = status;
                record.updated_at = Utc::now();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(status: DocumentStatus) -> DocumentRecord {
        let now = Utc::now();
        DocumentRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            status,
            previous_version_id: None,
            legal_hold: false,
            effective_retention_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn key_record(document_id: Uuid, set: &str, active: bool) -> EncryptionKeyRecord {
        EncryptionKeyRecord {
            id: Uuid::new_v4(),
            document_id,
            content_set_identifier: set.to_string(),
            organization_id: Uuid::new_v4(),
            hsm_key_handle: crate::hsm::KeyHandle::from_raw(format!("soft-hsm:v1:{}", Uuid::new_v4())),
            algorithm: "aes-256-gcm".into(),
            shamir_threshold: 2,
            shamir_total_shares: 3,
            is_active: active,
            rotated_from_key_id: None,
            created_at: Utc::now(),
            rotated_at: None,
            destroyed_at: None,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        let doc = document(DocumentStatus::Approved);
        let id = doc.id;
        store.insert_document(doc);

        {
            let mut txn = store.begin(id).await.unwrap();
            txn.set_status(DocumentStatus::Deconstructing);
            txn.upsert_key(key_record(id, "CS-A", true));
            // dropped without commit
        }

        assert_eq!(store.document(id).await.unwrap().status, DocumentStatus::Approved);
        assert!(store.keys_for_document(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_publishes_all_staged_rows() {
        let store = MemoryStore::new();
        let doc = document(DocumentStatus::Approved);
        let id = doc.id;
        store.insert_document(doc);

        let mut txn = store.begin(id).await.unwrap();
        txn.set_status(DocumentStatus::Active);
        txn.upsert_key(key_record(id, "CS-A", true));
        txn.commit().await.unwrap();

        assert_eq!(store.document(id).await.unwrap().status, DocumentStatus::Active);
        assert_eq!(store.keys_for_document(id).await.unwrap().len(), 1);
        assert!(store.active_key(id, "CS-A").await.is_ok());
    }

    #[tokio::test]
    async fn second_active_key_for_same_set_conflicts() {
        let store = MemoryStore::new();
        let doc = document(DocumentStatus::Active);
        let id = doc.id;
        store.insert_document(doc);

        let mut txn = store.begin(id).await.unwrap();
        txn.upsert_key(key_record(id, "CS-A", true));
        txn.commit().await.unwrap();

        let mut txn = store.begin(id).await.unwrap();
        txn.upsert_key(key_record(id, "CS-A", true));
        assert!(matches!(
            txn.commit().await.unwrap_err(),
            TesseraError::StorageConflict(_)
        ));
    }

    #[tokio::test]
    async fn row_lock_serializes_transactions() {
        let store = Arc::new(MemoryStore::new());
        let doc = document(DocumentStatus::Approved);
        let id = doc.id;
        store.insert_document(doc);

        let txn = store.begin(id).await.unwrap();
        let store2 = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            // blocks until the first transaction commits
            let txn2 = store2.begin(id).await.unwrap();
            txn2.commit().await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        txn.commit().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn reset_status_is_compare_and_set() {
        let store = MemoryStore::new();
        let doc = document(DocumentStatus::Deconstructing);
        let id = doc.id;
        store.insert_document(doc);

        store
            .reset_status(id, DocumentStatus::Deconstructing, DocumentStatus::Approved)
            .await
            .unwrap();
        assert_eq!(store.document(id).await.unwrap().status, DocumentStatus::Approved);

        assert!(store
            .reset_status(id, DocumentStatus::Deconstructing, DocumentStatus::Approved)
            .await
            .is_err());
    }
}
