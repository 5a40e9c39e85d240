use async_trait::async_trait;

use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Version};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Version the caller decided against. `None` skips the check, which
    /// only fixtures and benches should do.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Append-only event log with per-aggregate optimistic concurrency.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` atomically.
    ///
    /// Fails with [`EventStoreError::ConcurrencyConflict`] when
    /// `options.expected_version` does not match the stored version, in
    /// which case nothing is written.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// All events of one aggregate, oldest first.
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>>;

    /// Current version, or `None` if the aggregate has no events.
    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;

    /// Ids of aggregates of `aggregate_type` that recorded at least one
    /// event whose type is in `event_types` and none whose type is in
    /// `excluding`.
    async fn find_aggregate_ids(
        &self,
        aggregate_type: &str,
        event_types: &[&str],
        excluding: &[&str],
    ) -> Result<Vec<AggregateId>>;
}

#[async_trait]
pub trait EventStoreExt: EventStore {
    async fn append_event(&self, event: EventEnvelope, options: AppendOptions) -> Result<Version> {
        self.append(vec![event], options).await
    }

    async fn aggregate_exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.get_aggregate_version(aggregate_id).await?.is_some())
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Checks that a batch targets one aggregate with contiguous versions.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        if event.aggregate_id != first.aggregate_id || event.aggregate_type != first.aggregate_type
        {
            return Err(EventStoreError::InvalidAppend(
                "all events in a batch must belong to the same aggregate".to_string(),
            ));
        }
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "versions must be contiguous: expected {expected_version}, got {}",
                event.version
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(aggregate_id: AggregateId, version: i64) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .event_type("CartCleared")
            .version(Version::new(version))
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap()
    }

    #[test]
    fn rejects_empty_batches() {
        assert!(matches!(
            validate_events_for_append(&[]),
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[test]
    fn rejects_gaps_and_mixed_aggregates() {
        let id = AggregateId::new();
        assert!(validate_events_for_append(&[envelope(id, 1), envelope(id, 3)]).is_err());
        assert!(
            validate_events_for_append(&[envelope(id, 1), envelope(AggregateId::new(), 2)])
                .is_err()
        );
        assert!(validate_events_for_append(&[envelope(id, 4), envelope(id, 5)]).is_ok());
    }
}
