use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::Result;
use crate::receipt::{ReceiptStore, RecordOutcome, WebhookReceipt};

const RECEIPT_COLUMNS: &str = "id, provider, payload_hash, correlation_key, signature_valid, \
     processed, outcome, received_at, processed_at";

/// `webhook_receipts` table backed by PostgreSQL.
///
/// Insert-if-absent relies on the `unique_receipt_hash_correlation`
/// constraint, so concurrent deliveries of the same callback converge on a
/// single row.
#[derive(Clone)]
pub struct PostgresReceiptStore {
    pool: PgPool,
}

impl PostgresReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_receipt(row: PgRow) -> Result<WebhookReceipt> {
        Ok(WebhookReceipt {
            id: row.try_get("id")?,
            provider: row.try_get("provider")?,
            payload_hash: row.try_get("payload_hash")?,
            correlation_key: row.try_get("correlation_key")?,
            signature_valid: row.try_get("signature_valid")?,
            processed: row.try_get("processed")?,
            outcome: row.try_get("outcome")?,
            received_at: row.try_get("received_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

#[async_trait]
impl ReceiptStore for PostgresReceiptStore {
    async fn find(&self, payload_hash: &str) -> Result<Option<WebhookReceipt>> {
        let row = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM webhook_receipts WHERE payload_hash = $1 \
             ORDER BY processed DESC, received_at ASC LIMIT 1"
        ))
        .bind(payload_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_receipt).transpose()
    }

    #[tracing::instrument(skip(self, receipt), fields(hash = %receipt.payload_hash))]
    async fn record(&self, receipt: WebhookReceipt) -> Result<RecordOutcome> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_receipts ({RECEIPT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (payload_hash, correlation_key) DO NOTHING
            RETURNING {RECEIPT_COLUMNS}
            "#
        ))
        .bind(receipt.id)
        .bind(&receipt.provider)
        .bind(&receipt.payload_hash)
        .bind(&receipt.correlation_key)
        .bind(receipt.signature_valid)
        .bind(receipt.processed)
        .bind(&receipt.outcome)
        .bind(receipt.received_at)
        .bind(receipt.processed_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(RecordOutcome::Inserted(Self::row_to_receipt(row)?));
        }

        let existing = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM webhook_receipts \
             WHERE payload_hash = $1 AND correlation_key = $2"
        ))
        .bind(&receipt.payload_hash)
        .bind(&receipt.correlation_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecordOutcome::Existing(Self::row_to_receipt(existing)?))
    }

    async fn mark_processed(
        &self,
        payload_hash: &str,
        correlation_key: &str,
        outcome: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_receipts
            SET processed = TRUE, outcome = $3, processed_at = NOW()
            WHERE payload_hash = $1 AND correlation_key = $2
            "#,
        )
        .bind(payload_hash)
        .bind(correlation_key)
        .bind(outcome)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_receipts WHERE received_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
