//! Anchor-sink interface: opaque transactions handed to the blockchain
//! anchoring collaborator. Sink unreachability is a warning for the engines,
//! never a fault; retries are the sink's concern.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorTransaction {
    pub transaction_id: Uuid,
    pub transaction_type: String,
    pub arrangement: Option<Value>,
    pub accrual: Option<Value>,
    pub anticipation: Option<Value>,
    pub action: Option<Value>,
}

impl AnchorTransaction {
    pub fn new(transaction_type: impl Into<String>) -> Self {
        AnchorTransaction {
            transaction_id: Uuid::new_v4(),
            transaction_type: transaction_type.into(),
            arrangement: None,
            accrual: None,
            anticipation: None,
            action: None,
        }
    }

    pub fn with_arrangement(mut self, value: Value) -> Self {
        self.arrangement = Some(value);
        self
    }

    pub fn with_accrual(mut self, value: Value) -> Self {
        self.accrual = Some(value);
        self
    }

    pub fn with_action(mut self, value: Value) -> Self {
        self.action = Some(value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub forward_tx_id: String,
    pub external_tx_id: Option<String>,
}

#[async_trait]
pub trait AnchorSink: Send + Sync {
    async fn submit(&self, transaction: AnchorTransaction) -> Result<AnchorReceipt>;
}

/// Reference sink recording submissions in memory. Can be switched
/// unreachable to exercise the warning-only contract.
pub struct MemoryAnchorSink {
    transactions: RwLock<Vec<AnchorTransaction>>,
    reachable: RwLock<bool>,
}

impl MemoryAnchorSink {
    pub fn new() -> Self {
        MemoryAnchorSink {
            transactions: RwLock::new(Vec::new()),
            reachable: RwLock::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.write() = reachable;
    }

    pub fn transactions(&self) -> Vec<AnchorTransaction> {
        self.transactions.read().clone()
    }

    pub fn transactions_of_type(&self, transaction_type: &str) -> Vec<AnchorTransaction> {
        self.transactions
            .read()
            .iter()
            .filter(|t| t.transaction_type == transaction_type)
            .cloned()
            .collect()
    }
}

impl Default for MemoryAnchorSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnchorSink for MemoryAnchorSink {
    async fn submit(&self, transaction: AnchorTransaction) -> Result<AnchorReceipt> {
        if !*self.reachable.read() {
            return Err(TesseraError::StorageConflict("anchor sink unreachable".into()));
        }
        let forward_tx_id = format!("fwd-{}", transaction.transaction_id);
        self.transactions.write().push(transaction);
        Ok(AnchorReceipt {
            forward_tx_id,
            external_tx_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn submit_records_transaction() {
        let sink = MemoryAnchorSink::new();
        let tx = AnchorTransaction::new("document_deconstruction")
            .with_arrangement(json!({"content_sets": ["CS-PUBLIC"]}))
            .with_accrual(json!({"marker_count": 3}));
        let receipt = sink.submit(tx.clone()).await.unwrap();
        assert!(receipt.forward_tx_id.contains(&tx.transaction_id.to_string()));
        assert_eq!(sink.transactions().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_sink_errors() {
        let sink = MemoryAnchorSink::new();
        sink.set_reachable(false);
        let tx = AnchorTransaction::new("document_reconstruction");
        assert!(sink.submit(tx).await.is_err());
        assert!(sink.transactions().is_empty());
    }
}
