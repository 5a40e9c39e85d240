//! Command handling infrastructure.

use std::marker::PhantomData;

use common::AggregateId;
use event_store::{AppendOptions, EventEnvelope, EventStore, Version};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted.
    pub events: Vec<A::Event>,

    /// The new version of the aggregate after the command.
    pub new_version: Version,
}

impl<A: Aggregate> CommandResult<A> {
    /// True when this call wrote at least one event.
    pub fn changed(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Trait for commands that can be executed against an aggregate.
///
/// Commands represent an intention to perform an action. They may be rejected
/// if the aggregate's current state doesn't allow the action.
pub trait Command: Send + Sync {
    /// The type of aggregate this command targets.
    type Aggregate: Aggregate;

    /// Returns the ID of the aggregate this command targets.
    fn aggregate_id(&self) -> AggregateId;
}

/// Handler for executing commands against aggregates.
///
/// The handler is responsible for:
/// 1. Loading the aggregate by replaying its events
/// 2. Executing the command to produce events
/// 3. Appending the events with the loaded version as the expected version
///
/// Step 3 is the compare-and-swap: of two writers that loaded the same
/// version only one append succeeds, the other gets a concurrency conflict.
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
    DomainError: From<A::Error>,
{
    /// Creates a new command handler with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from the event store.
    ///
    /// If the aggregate doesn't exist, returns a default instance.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        let events = self.store.get_events_for_aggregate(aggregate_id).await?;

        let mut aggregate = A::default();
        for envelope in events {
            let event: A::Event = serde_json::from_value(envelope.payload)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        if aggregate.id().is_some() {
            Ok(Some(aggregate))
        } else {
            Ok(None)
        }
    }

    /// Executes a command and persists the resulting events.
    ///
    /// The command function receives the current aggregate state and returns
    /// either a list of events to apply, or an error. An empty list writes
    /// nothing and leaves the version unchanged.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = self.build_envelopes(aggregate_id, current_version, &events)?;

        let options = if current_version == Version::initial() {
            AppendOptions::expect_new()
        } else {
            AppendOptions::expect_version(current_version)
        };

        let new_version = self.store.append(envelopes, options).await?;

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }

    /// Executes a command, re-loading and re-deciding when another writer
    /// appended first.
    ///
    /// The retried decision sees the winner's events, so a losing duplicate
    /// confirmation turns into a no-op instead of a second transition.
    pub async fn execute_with_retry<F>(
        &self,
        aggregate_id: AggregateId,
        max_attempts: u32,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
    {
        let mut attempt = 1;
        loop {
            match self.execute(aggregate_id, &command_fn).await {
                Err(e) if e.is_concurrency_conflict() && attempt < max_attempts.max(1) => {
                    metrics::counter!("command_retries_total").increment(1);
                    tracing::debug!(%aggregate_id, attempt, "Concurrent append, retrying command");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Builds event envelopes from domain events.
    fn build_envelopes(
        &self,
        aggregate_id: AggregateId,
        current_version: Version,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>, DomainError> {
        let mut envelopes = Vec::with_capacity(events.len());
        let mut version = current_version;

        for event in events {
            version = version.next();
            let envelope = EventEnvelope::builder()
                .aggregate_id(aggregate_id)
                .aggregate_type(A::aggregate_type())
                .event_type(event.event_type())
                .version(version)
                .payload(event)?
                .build()?;
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::{AmountPolicy, Currency, Money};
    use crate::order::{
        ConfirmPayment, ConfirmationSource, LineItem, Order, OrderError, PlaceOrder,
        ShippingAddress, UserId,
    };
    use common::PaymentMethod;
    use event_store::{EventStoreExt, InMemoryEventStore};

    fn place_cmd() -> PlaceOrder {
        PlaceOrder::new(
            UserId::new(),
            vec![LineItem::new(
                "SKU-1",
                "Mug",
                1,
                Money::new(170_500, Currency::Vnd),
            )],
            ShippingAddress {
                recipient_name: "Tran Thi B".into(),
                phone: "0912345678".into(),
                street: "1 Le Loi".into(),
                ward: "Ward 1".into(),
                district: "District 3".into(),
                province: "Ho Chi Minh".into(),
                note: None,
            },
            PaymentMethod::SignedCallback,
        )
    }

    #[tokio::test]
    async fn test_execute_creates_aggregate() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Order> = CommandHandler::new(store);
        let cmd = place_cmd();

        let result = handler
            .execute(cmd.order_id, |order| order.place(&cmd))
            .await
            .unwrap();

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.new_version, Version::first());
        assert_eq!(result.aggregate.id(), Some(cmd.order_id));
        assert!(result.changed());
    }

    #[tokio::test]
    async fn test_execute_returns_error_on_rejected_command() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Order> = CommandHandler::new(store);

        let result = handler
            .execute(AggregateId::new(), |order| order.record_cart_cleared())
            .await;

        assert!(matches!(result, Err(DomainError::Order(OrderError::NotFound))));
    }

    #[tokio::test]
    async fn test_load_existing_returns_none_for_new() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Order> = CommandHandler::new(store);

        let result = handler.load_existing(AggregateId::new()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_empty_events_returns_without_persisting() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Order> = CommandHandler::new(store.clone());
        let cmd = place_cmd();
        handler
            .execute(cmd.order_id, |order| order.place(&cmd))
            .await
            .unwrap();
        handler
            .execute(cmd.order_id, |order| order.record_cart_cleared())
            .await
            .unwrap();

        let result = handler
            .execute(cmd.order_id, |order| order.record_cart_cleared())
            .await
            .unwrap();

        assert!(!result.changed());
        assert_eq!(result.new_version, Version::new(2));
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_confirmations_converge_with_retry() {
        let store = InMemoryEventStore::new();
        let handler = std::sync::Arc::new(CommandHandler::<_, Order>::new(store.clone()));
        let cmd = place_cmd();
        let order_id = cmd.order_id;
        handler
            .execute(order_id, |order| order.place(&cmd))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                let confirm = ConfirmPayment::new(
                    order_id,
                    "T-1",
                    Money::new(170_500, Currency::Vnd),
                    ConfirmationSource::Webhook,
                );
                let policy = AmountPolicy::default();
                handler
                    .execute_with_retry(order_id, 10, |order| {
                        order.confirm_payment(&confirm, &policy)
                    })
                    .await
                    .unwrap()
                    .changed()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(store.count_events(order_id, "PaymentConfirmed").await, 1);
        assert!(store.aggregate_exists(order_id).await.unwrap());
    }
}
