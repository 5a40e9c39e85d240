//! Durable state for the order orchestrator.
//!
//! Two stores live here:
//! - [`EventStore`]: the append-only order event log. Appends carry an
//!   expected version, which makes every order transition a compare-and-swap.
//! - [`ReceiptStore`]: the webhook idempotency table, keyed by payload hash
//!   plus correlation key.
//!
//! Both come with an in-memory implementation for tests and local runs and
//! a PostgreSQL implementation for deployments.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod postgres_receipt;
pub mod receipt;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use postgres_receipt::PostgresReceiptStore;
pub use receipt::{InMemoryReceiptStore, ReceiptStore, RecordOutcome, WebhookReceipt, payload_hash};
pub use store::{AppendOptions, EventStore, EventStoreExt};
