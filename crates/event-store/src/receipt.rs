//! Webhook receipts: the durable idempotency table for inbound callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{EventStoreError, Result};

/// Hex SHA-256 over `provider ":" body`.
///
/// The provider is part of the hash so that two rails posting byte-identical
/// bodies never collide.
pub fn payload_hash(provider: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Record of one authenticated inbound callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookReceipt {
    pub id: Uuid,
    pub provider: String,
    pub payload_hash: String,
    /// Order id the callback refers to.
    pub correlation_key: String,
    pub signature_valid: bool,
    /// Set only once the resulting order transition is durable.
    pub processed: bool,
    pub outcome: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookReceipt {
    /// A fresh, unprocessed receipt for a callback whose signature checked out.
    pub fn validated(
        provider: impl Into<String>,
        payload_hash: impl Into<String>,
        correlation_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            payload_hash: payload_hash.into(),
            correlation_key: correlation_key.into(),
            signature_valid: true,
            processed: false,
            outcome: None,
            received_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Result of an insert-if-absent on the receipt table.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Inserted(WebhookReceipt),
    /// A receipt with the same hash and correlation key was already stored.
    Existing(WebhookReceipt),
}

impl RecordOutcome {
    pub fn receipt(&self) -> &WebhookReceipt {
        match self {
            RecordOutcome::Inserted(r) | RecordOutcome::Existing(r) => r,
        }
    }
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Looks a receipt up by payload hash alone.
    async fn find(&self, payload_hash: &str) -> Result<Option<WebhookReceipt>>;

    /// Inserts the receipt unless one with the same `(payload_hash,
    /// correlation_key)` exists, in which case the stored one is returned.
    async fn record(&self, receipt: WebhookReceipt) -> Result<RecordOutcome>;

    /// Flags the receipt as processed. Returns false when no row matched.
    async fn mark_processed(
        &self,
        payload_hash: &str,
        correlation_key: &str,
        outcome: &str,
    ) -> Result<bool>;

    /// Deletes receipts received before `cutoff`.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Receipt table kept in memory, with an outage switch for tests.
#[derive(Clone, Default)]
pub struct InMemoryReceiptStore {
    receipts: Arc<RwLock<HashMap<(String, String), WebhookReceipt>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with [`EventStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.receipts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.receipts.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventStoreError::Unavailable(
                "receipt store offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ReceiptStore for InMemoryReceiptStore {
    async fn find(&self, payload_hash: &str) -> Result<Option<WebhookReceipt>> {
        self.check_available()?;
        let receipts = self.receipts.read().await;
        Ok(receipts
            .values()
            .find(|r| r.payload_hash == payload_hash)
            .cloned())
    }

    async fn record(&self, receipt: WebhookReceipt) -> Result<RecordOutcome> {
        self.check_available()?;
        let key = (
            receipt.payload_hash.clone(),
            receipt.correlation_key.clone(),
        );
        let mut receipts = self.receipts.write().await;
        if let Some(existing) = receipts.get(&key) {
            return Ok(RecordOutcome::Existing(existing.clone()));
        }
        receipts.insert(key, receipt.clone());
        Ok(RecordOutcome::Inserted(receipt))
    }

    async fn mark_processed(
        &self,
        payload_hash: &str,
        correlation_key: &str,
        outcome: &str,
    ) -> Result<bool> {
        self.check_available()?;
        let mut receipts = self.receipts.write().await;
        match receipts.get_mut(&(payload_hash.to_string(), correlation_key.to_string())) {
            Some(receipt) => {
                receipt.processed = true;
                receipt.outcome = Some(outcome.to_string());
                receipt.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut receipts = self.receipts.write().await;
        let before = receipts.len();
        receipts.retain(|_, r| r.received_at >= cutoff);
        Ok((before - receipts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn hash_depends_on_provider_and_body() {
        let body = br#"{"orderId":"1"}"#;
        let a = payload_hash("signed_callback", body);
        assert_eq!(a.len(), 64);
        assert_eq!(a, payload_hash("signed_callback", body));
        assert_ne!(a, payload_hash("redirect_capture", body));
        assert_ne!(a, payload_hash("signed_callback", br#"{"orderId":"2"}"#));
    }

    #[tokio::test]
    async fn record_is_insert_if_absent() {
        let store = InMemoryReceiptStore::new();
        let first = WebhookReceipt::validated("signed_callback", "h1", "order-1");

        let inserted = store.record(first.clone()).await.unwrap();
        assert!(matches!(inserted, RecordOutcome::Inserted(_)));

        let again = store
            .record(WebhookReceipt::validated("signed_callback", "h1", "order-1"))
            .await
            .unwrap();
        match again {
            RecordOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
            RecordOutcome::Inserted(_) => panic!("duplicate receipt inserted"),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn mark_processed_sets_outcome() {
        let store = InMemoryReceiptStore::new();
        store
            .record(WebhookReceipt::validated("signed_callback", "h1", "order-1"))
            .await
            .unwrap();

        assert!(
            store
                .mark_processed("h1", "order-1", "processed")
                .await
                .unwrap()
        );
        let found = store.find("h1").await.unwrap().unwrap();
        assert!(found.processed);
        assert_eq!(found.outcome.as_deref(), Some("processed"));
        assert!(found.processed_at.is_some());

        assert!(!store.mark_processed("h2", "order-1", "x").await.unwrap());
    }

    #[tokio::test]
    async fn purge_keeps_recent_receipts() {
        let store = InMemoryReceiptStore::new();
        let mut old = WebhookReceipt::validated("signed_callback", "old", "order-1");
        old.received_at = Utc::now() - Duration::hours(100);
        store.record(old).await.unwrap();
        store
            .record(WebhookReceipt::validated("signed_callback", "new", "order-1"))
            .await
            .unwrap();

        let purged = store
            .purge_older_than(Utc::now() - Duration::hours(72))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.find("old").await.unwrap().is_none());
        assert!(store.find("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn outage_switch_fails_every_call() {
        let store = InMemoryReceiptStore::new();
        store.set_unavailable(true);
        let err = store.find("h1").await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert!(store.find("h1").await.unwrap().is_none());
    }
}
