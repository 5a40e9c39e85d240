use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// Event store kept in process memory.
///
/// Used by tests and by the server when no `DATABASE_URL` is configured.
/// The version check and the write happen under one write lock, which gives
/// the same first-writer-wins behaviour as the PostgreSQL unique constraint.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Number of stored events of `event_type` for one aggregate.
    pub async fn count_events(&self, aggregate_id: AggregateId, event_type: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.event_type == event_type)
            .count()
    }
}

fn current_version(events: &[EventEnvelope], aggregate_id: AggregateId) -> Version {
    events
        .iter()
        .filter(|e| e.aggregate_id == aggregate_id)
        .map(|e| e.version)
        .max()
        .unwrap_or(Version::initial())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_new_version = events[0].version;

        let mut store = self.events.write().await;
        let actual = current_version(&store, aggregate_id);

        if let Some(expected) = options.expected_version
            && actual != expected
        {
            metrics::counter!("event_store_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            });
        }

        // Same guarantee as the (aggregate_id, version) unique constraint.
        if first_new_version <= actual {
            metrics::counter!("event_store_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(actual),
                actual,
            });
        }

        let last_version = events.last().map(|e| e.version).unwrap_or(actual);
        store.extend(events);

        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        let mut events: Vec<_> = store
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let store = self.events.read().await;
        Ok(store
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max())
    }

    async fn find_aggregate_ids(
        &self,
        aggregate_type: &str,
        event_types: &[&str],
        excluding: &[&str],
    ) -> Result<Vec<AggregateId>> {
        let store = self.events.read().await;
        let of_type = |types: &[&str]| -> BTreeSet<AggregateId> {
            store
                .iter()
                .filter(|e| {
                    e.aggregate_type == aggregate_type && types.contains(&e.event_type.as_str())
                })
                .map(|e| e.aggregate_id)
                .collect()
        };
        let closed = of_type(excluding);
        Ok(of_type(event_types)
            .into_iter()
            .filter(|id| !closed.contains(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_event(aggregate_id: AggregateId, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({"test": true}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_returns_last_version() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let version = store
            .append(
                vec![
                    order_event(id, 1, "OrderPlaced"),
                    order_event(id, 2, "PaymentIntentCreated"),
                ],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        assert_eq!(version, Version::new(2));
        assert_eq!(store.get_events_for_aggregate(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(
                vec![order_event(id, 1, "OrderPlaced")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                vec![order_event(id, 1, "PaymentConfirmed")],
                AppendOptions::expect_new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { actual, .. }) if actual == Version::first()
        ));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn only_one_of_two_racing_writers_wins() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(
                vec![order_event(id, 1, "OrderPlaced")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let a = store.append(
            vec![order_event(id, 2, "PaymentConfirmed")],
            AppendOptions::expect_version(Version::first()),
        );
        let b = store.append(
            vec![order_event(id, 2, "PaymentConfirmed")],
            AppendOptions::expect_version(Version::first()),
        );
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(store.count_events(id, "PaymentConfirmed").await, 1);
    }

    #[tokio::test]
    async fn version_of_unknown_aggregate_is_none() {
        let store = InMemoryEventStore::new();
        assert!(
            store
                .get_aggregate_version(AggregateId::new())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn finds_aggregates_by_event_type() {
        let store = InMemoryEventStore::new();
        let with_intent = AggregateId::new();
        let without_intent = AggregateId::new();

        store
            .append(
                vec![
                    order_event(with_intent, 1, "OrderPlaced"),
                    order_event(with_intent, 2, "PaymentIntentCreated"),
                ],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![order_event(without_intent, 1, "OrderPlaced")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let ids = store
            .find_aggregate_ids("Order", &["PaymentIntentCreated", "PaymentConfirmed"], &[])
            .await
            .unwrap();
        assert_eq!(ids, vec![with_intent]);

        let none = store
            .find_aggregate_ids("Shipment", &["PaymentIntentCreated"], &[])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn excluded_event_types_drop_aggregates() {
        let store = InMemoryEventStore::new();
        let open = AggregateId::new();
        let closed = AggregateId::new();

        store
            .append(
                vec![order_event(open, 1, "OrderPlaced")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![
                    order_event(closed, 1, "OrderPlaced"),
                    order_event(closed, 2, "OrderCancelled"),
                ],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let ids = store
            .find_aggregate_ids("Order", &["OrderPlaced"], &["OrderCancelled", "OrderCompleted"])
            .await
            .unwrap();
        assert_eq!(ids, vec![open]);
    }
}
