//! Order payment and fulfilment orchestration.
//!
//! - [`OrderStateMachine`]: applies provider and admin events to an order
//!   and runs settlement (cart, stock, carrier shipment) exactly once
//! - [`CheckoutService`]: order placement, payment intents, synchronous
//!   capture with re-query on unknown outcomes
//! - [`WebhookIngestor`]: signed callbacks, de-duplicated through the
//!   receipt table
//! - [`ReconciliationPoller`]: periodic status queries for payments whose
//!   callback never arrived
//!
//! All of them share one [`OrderStateMachine`], so every path to a paid
//! order goes through the same conditional append.

pub mod checkout;
pub mod error;
pub mod reconciliation;
pub mod state_machine;
pub mod storefront;
pub mod webhook;

pub use checkout::{CaptureResult, CaptureStatus, Checkout, CheckoutService, OpenedPayment};
pub use error::{ErrorClass, OrchestratorError, Result};
pub use reconciliation::{PollerConfig, ReconciliationPoller, SweepReport};
pub use state_machine::{Applied, OrderStateMachine, Transition};
pub use storefront::{InMemoryStorefront, Storefront};
pub use webhook::{WebhookIngestor, WebhookOutcome};
