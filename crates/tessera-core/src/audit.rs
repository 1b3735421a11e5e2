//! Audit sink interface and event shape.
//!
//! The sink guarantees append-only storage; the in-memory reference
//! implementation enforces that by construction, exposing no update or
//! delete surface at all. Events never carry secrets or key material.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::sha512_hex;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Arrangement,
    Accrual,
    Anticipation,
    Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub category: AuditCategory,
    pub event_type: String,
    pub description: String,
    pub org_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub target_type: String,
    pub target_id: String,
    pub metadata: Value,
    /// SHA-512 over the canonical serialization of every other field.
    pub event_hash: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        category: AuditCategory,
        event_type: impl Into<String>,
        description: impl Into<String>,
        org_id: Option<Uuid>,
        actor_id: Option<Uuid>,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
        metadata: Value,
    ) -> Self {
        let mut event = AuditEvent {
            category,
            event_type: event_type.into(),
            description: description.into(),
            org_id,
            actor_id,
            target_type: target_type.into(),
            target_id: target_id.into(),
            metadata,
            event_hash: String::new(),
            occurred_at: Utc::now(),
        };
        event.event_hash = event.compute_hash();
        event
    }

    fn compute_hash(&self) -> String {
        let mut hashable = self.clone();
        hashable.event_hash = String::new();
        // struct field order makes this serialization canonical
        let bytes = serde_json::to_vec(&hashable).unwrap_or_default();
        sha512_hex(&bytes)
    }

    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.event_hash
    }
}

/// Append-only event consumer.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
}

/// Reference sink: an in-memory append-only log.
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        MemoryAuditSink {
            events: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the log in append order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}
