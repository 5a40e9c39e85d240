//! Domain layer of the order orchestrator.
//!
//! This crate provides:
//! - Aggregate and DomainEvent traits for event-sourced entities
//! - CommandHandler, whose conditional append is the per-order compare-and-swap
//! - The Order aggregate: status, payment status, payment intents, carrier
//!   shipment and reconciliation flags, with every transition guard
//! - Integer money with configurable exchange rates and amount tolerance

pub mod aggregate;
pub mod command;
pub mod error;
pub mod money;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::DomainError;
pub use money::{AmountPolicy, Currency, ExchangeRate, Money, MoneyError};
pub use order::{
    CancelOrder, CarrierStatus, ConfirmOutcome, ConfirmPayment, ConfirmationSource, FailPayment,
    FlagKind, IntentStatus, LineItem, Order, OrderError, OrderEvent, OrderService, OrderStatus,
    OverrideStatus, Parcel, PaymentApplied, PaymentIntent, PaymentStatus, PlaceOrder, ProductId,
    ReconciliationFlag, RecordIntent, RecordShipment, ShippingAddress, ShippingDispatch, UserId,
};
