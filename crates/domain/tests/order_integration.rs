//! Integration tests for the Order aggregate.
//!
//! These tests drive the order lifecycle through the service and the
//! in-memory event store: persistence, replay, concurrency and the
//! transition guards.

use std::sync::Arc;

use common::{AggregateId, PaymentMethod};
use domain::{
    Aggregate, CancelOrder, CarrierStatus, ConfirmOutcome, ConfirmPayment, ConfirmationSource,
    Currency, DomainError, FailPayment, FlagKind, IntentStatus, LineItem, Money, Order,
    OrderError, OrderEvent, OrderService, OrderStatus, OverrideStatus, Parcel, PaymentIntent,
    PaymentStatus, PlaceOrder, RecordIntent, RecordShipment, ShippingAddress, ShippingDispatch,
    UserId,
};
use event_store::{EventStore, EventStoreError, InMemoryEventStore, Version};
use uuid::Uuid;

fn vnd(amount: i64) -> Money {
    Money::new(amount, Currency::Vnd)
}

fn create_service() -> (OrderService<InMemoryEventStore>, InMemoryEventStore) {
    let store = InMemoryEventStore::new();
    (OrderService::new(store.clone()), store)
}

fn place_cmd(method: PaymentMethod) -> PlaceOrder {
    PlaceOrder::new(
        UserId::new(),
        vec![
            LineItem::new("SKU-TEE", "T-shirt", 2, vnd(75_000)).with_weight(250),
            LineItem::new("SKU-CAP", "Cap", 1, vnd(20_500)),
        ],
        ShippingAddress {
            recipient_name: "Hoang E".into(),
            phone: "0944444444".into(),
            street: "20 Pasteur".into(),
            ward: "Ward 8".into(),
            district: "District 3".into(),
            province: "Ho Chi Minh".into(),
            note: None,
        },
        method,
    )
}

async fn placed(service: &OrderService<InMemoryEventStore>, method: PaymentMethod) -> AggregateId {
    let cmd = place_cmd(method);
    let order_id = cmd.order_id;
    service.place_order(cmd).await.unwrap();
    order_id
}

async fn open_intent(service: &OrderService<InMemoryEventStore>, order_id: AggregateId) -> Uuid {
    let order = service.get_order(order_id).await.unwrap().unwrap();
    let intent_id = Uuid::new_v4();
    service
        .record_intent(RecordIntent {
            order_id,
            intent_id,
            provider: order.payment_method().unwrap(),
            provider_reference: Some(format!("REF-{intent_id}")),
            amount: order.total(),
            idempotency_key: PaymentIntent::idempotency_key_for(
                order_id,
                order.next_intent_attempt(),
            ),
            approval_url: None,
        })
        .await
        .unwrap();
    intent_id
}

fn webhook(order_id: AggregateId, txn: &str, amount: i64) -> ConfirmPayment {
    ConfirmPayment::new(order_id, txn, vnd(amount), ConfirmationSource::Webhook)
}

fn dispatch(order: &Order, code: &str) -> RecordShipment {
    RecordShipment {
        order_id: order.id().unwrap(),
        dispatch: ShippingDispatch {
            shipment_code: code.into(),
            reference: order.id().unwrap().to_string(),
            cod_amount: if order.is_cod() {
                order.total()
            } else {
                Money::zero(Currency::Vnd)
            },
            parcel: Parcel::for_items(order.items()),
            carrier_status: CarrierStatus::ReadyToPick,
            created_at: chrono::Utc::now(),
        },
    }
}

mod order_lifecycle {
    use super::*;

    #[tokio::test]
    async fn prepaid_order_from_placement_to_delivery() {
        let (service, _) = create_service();
        let order_id = placed(&service, PaymentMethod::SignedCallback).await;
        let intent_id = open_intent(&service, order_id).await;

        let applied = service
            .confirm_payment(webhook(order_id, "4088114551", 170_500).for_intent(intent_id))
            .await
            .unwrap();
        assert_eq!(applied.outcome, ConfirmOutcome::Confirmed);
        assert_eq!(applied.order().status(), OrderStatus::PaymentConfirmed);

        service.record_cart_cleared(order_id).await.unwrap();
        service.record_stock_committed(order_id).await.unwrap();
        let order = service.get_order(order_id).await.unwrap().unwrap();
        let result = service
            .record_shipment(dispatch(&order, "GHN-100"))
            .await
            .unwrap();
        assert_eq!(result.aggregate.status(), OrderStatus::Processing);
        assert_eq!(
            result.aggregate.dispatch().unwrap().cod_amount,
            Money::zero(Currency::Vnd)
        );
        assert_eq!(result.aggregate.dispatch().unwrap().parcel.weight_grams, 700);

        service
            .update_carrier_status(order_id, CarrierStatus::PickedUp)
            .await
            .unwrap();
        let result = service
            .update_carrier_status(order_id, CarrierStatus::Delivered)
            .await
            .unwrap();

        let order = result.aggregate;
        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert_eq!(order.transaction_id(), Some("4088114551"));
        assert!(!order.needs_settlement());
    }

    #[tokio::test]
    async fn cod_order_ships_then_collects_cash() {
        let (service, _) = create_service();
        let order_id = placed(&service, PaymentMethod::Cod).await;
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Processing);

        let result = service
            .record_shipment(dispatch(&order, "GHN-200"))
            .await
            .unwrap();
        assert_eq!(result.aggregate.dispatch().unwrap().cod_amount, vnd(170_500));

        let applied = service
            .confirm_payment(ConfirmPayment::new(
                order_id,
                "COD-GHN-200",
                vnd(170_500),
                ConfirmationSource::Manual,
            ))
            .await
            .unwrap();
        assert_eq!(applied.outcome, ConfirmOutcome::Confirmed);
        assert_eq!(applied.order().status(), OrderStatus::Processing);
        assert_eq!(applied.order().payment_status(), PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn aggregate_reconstruction_from_events() {
        let (service, store) = create_service();
        let order_id = placed(&service, PaymentMethod::RedirectCapture).await;
        let intent_id = open_intent(&service, order_id).await;
        service
            .mark_outcome_unknown(order_id, intent_id, "capture timed out")
            .await
            .unwrap();

        let events = store.get_events_for_aggregate(order_id).await.unwrap();
        assert_eq!(events.len(), 3);

        let mut order = Order::default();
        for envelope in &events {
            let event: OrderEvent = serde_json::from_value(envelope.payload.clone()).unwrap();
            order.apply(event);
            order.set_version(envelope.version);
        }

        assert_eq!(order.version(), Version::new(3));
        assert_eq!(
            order.intent(intent_id).unwrap().status,
            IntentStatus::AwaitingCallback
        );
        assert_eq!(order.status(), OrderStatus::PendingPayment);
    }
}

mod idempotency {
    use super::*;

    #[tokio::test]
    async fn repeated_confirmation_writes_one_event() {
        let (service, store) = create_service();
        let order_id = placed(&service, PaymentMethod::SignedCallback).await;
        open_intent(&service, order_id).await;

        for _ in 0..5 {
            service
                .confirm_payment(webhook(order_id, "T-1", 170_500))
                .await
                .unwrap();
        }

        assert_eq!(store.count_events(order_id, "PaymentConfirmed").await, 1);
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.confirmed_intent_count(), 1);
    }

    #[tokio::test]
    async fn mismatch_leaves_order_pending_and_flags_once() {
        let (service, _) = create_service();
        let order_id = placed(&service, PaymentMethod::SignedCallback).await;
        open_intent(&service, order_id).await;

        for _ in 0..2 {
            let applied = service
                .confirm_payment(webhook(order_id, "T-1", 100_000))
                .await
                .unwrap();
            assert!(matches!(
                applied.outcome,
                ConfirmOutcome::AmountMismatch { .. }
            ));
        }

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::PendingPayment);
        assert_eq!(order.payment_status(), PaymentStatus::Pending);
        assert_eq!(order.flags().len(), 1);
        assert!(order.has_flag(FlagKind::AmountMismatch, "T-1"));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn concurrent_modifications_detected() {
        let (service, store) = create_service();
        let order_id = placed(&service, PaymentMethod::Cod).await;

        let handler = service.handler();
        let stale = handler.load(order_id).await.unwrap();
        assert_eq!(stale.version(), Version::first());

        service.record_cart_cleared(order_id).await.unwrap();

        // A writer still holding version 1 must lose.
        let envelope = event_store::EventEnvelope::builder()
            .aggregate_id(order_id)
            .aggregate_type("Order")
            .event_type("StockCommitted")
            .version(Version::new(2))
            .payload(&OrderEvent::stock_committed())
            .unwrap()
            .build()
            .unwrap();
        let err = store
            .append(
                vec![envelope],
                event_store::AppendOptions::expect_version(stale.version()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_webhook_and_poller_confirm_once() {
        let store = InMemoryEventStore::new();
        let service = Arc::new(OrderService::new(store.clone()));
        let order_id = placed(&service, PaymentMethod::SignedCallback).await;
        let intent_id = open_intent(&service, order_id).await;

        let sources = [
            ConfirmationSource::Webhook,
            ConfirmationSource::Reconciliation,
            ConfirmationSource::Webhook,
            ConfirmationSource::Reconciliation,
        ];
        let mut tasks = Vec::new();
        for source in sources {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service
                    .confirm_payment(
                        ConfirmPayment::new(order_id, "T-RACE", vnd(170_500), source)
                            .for_intent(intent_id),
                    )
                    .await
                    .unwrap()
                    .outcome
            }));
        }

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        let winners = outcomes
            .iter()
            .filter(|o| **o == ConfirmOutcome::Confirmed)
            .count();
        assert_eq!(winners, 1);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert_eq!(store.count_events(order_id, "PaymentConfirmed").await, 1);

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.confirmed_intent_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn override_racing_confirmation_never_skips_payment() {
        let store = InMemoryEventStore::new();
        let service = Arc::new(OrderService::new(store));
        let order_id = placed(&service, PaymentMethod::SignedCallback).await;
        open_intent(&service, order_id).await;

        let confirm = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .confirm_payment(webhook(order_id, "T-1", 170_500))
                    .await
            })
        };
        let override_to_failed = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .override_status(OverrideStatus {
                        order_id,
                        to: OrderStatus::PaymentFailed,
                        actor: "admin-1".into(),
                        reason: None,
                    })
                    .await
            })
        };
        let confirm = confirm.await.unwrap();
        let overridden = override_to_failed.await.unwrap();

        // Whichever landed second had to re-decide against the first.
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert_eq!(order.status(), OrderStatus::PaymentConfirmed);
        assert!(confirm.is_ok());
        if let Err(err) = overridden {
            assert!(matches!(
                err,
                DomainError::Order(OrderError::InvalidOverride { .. })
            ));
        }
    }
}

mod error_handling {
    use super::*;

    #[tokio::test]
    async fn cannot_cancel_after_pickup() {
        let (service, _) = create_service();
        let order_id = placed(&service, PaymentMethod::Cod).await;
        let order = service.get_order(order_id).await.unwrap().unwrap();
        service
            .record_shipment(dispatch(&order, "GHN-300"))
            .await
            .unwrap();
        service
            .update_carrier_status(order_id, CarrierStatus::InTransit)
            .await
            .unwrap();

        let err = service
            .cancel_order(CancelOrder::new(order_id, "admin-1", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::ShipmentAlreadyPickedUp)
        ));

        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Shipping);
    }

    #[tokio::test]
    async fn cannot_fail_a_paid_order() {
        let (service, _) = create_service();
        let order_id = placed(&service, PaymentMethod::SignedCallback).await;
        service
            .confirm_payment(webhook(order_id, "T-1", 170_500))
            .await
            .unwrap();

        let err = service
            .fail_payment(FailPayment::new(order_id, "late decline"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Order(OrderError::AlreadyPaid)));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (service, _) = create_service();
        let err = service
            .confirm_payment(webhook(AggregateId::new(), "T-1", 170_500))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Order(OrderError::NotFound)));
    }

    #[tokio::test]
    async fn second_shipment_is_rejected() {
        let (service, _) = create_service();
        let order_id = placed(&service, PaymentMethod::Cod).await;
        let order = service.get_order(order_id).await.unwrap().unwrap();
        service
            .record_shipment(dispatch(&order, "GHN-1"))
            .await
            .unwrap();

        let err = service
            .record_shipment(dispatch(&order, "GHN-2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::ShipmentExists { .. })
        ));
    }
}
