//! Storefront collaborator: the cart and the stock ledger.
//!
//! Both live outside the orchestrator. It only needs to clear the buyer's
//! cart and commit stock once an order is settled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::AggregateId;
use domain::{LineItem, UserId};

use crate::error::OrchestratorError;

#[async_trait]
pub trait Storefront: Send + Sync {
    /// Empties the buyer's cart for a settled order.
    async fn clear_cart(&self, user_id: UserId, order_id: AggregateId)
    -> Result<(), OrchestratorError>;

    /// Takes the ordered quantities out of stock.
    async fn commit_stock(
        &self,
        order_id: AggregateId,
        items: &[LineItem],
    ) -> Result<(), OrchestratorError>;
}

#[derive(Debug, Default)]
struct StorefrontState {
    cleared: Vec<(UserId, AggregateId)>,
    committed: HashSet<AggregateId>,
    stock: HashMap<String, i64>,
    clear_calls: usize,
    commit_calls: usize,
    unavailable: bool,
}

/// In-memory storefront for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorefront {
    state: Arc<RwLock<StorefrontState>>,
}

impl InMemoryStorefront {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stock(&self, product_id: &str, quantity: i64) {
        self.write().stock.insert(product_id.to_string(), quantity);
    }

    /// Stock left for a product. Unknown products start at zero.
    pub fn stock_of(&self, product_id: &str) -> i64 {
        self.read().stock.get(product_id).copied().unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    pub fn clear_cart_calls(&self) -> usize {
        self.read().clear_calls
    }

    pub fn commit_stock_calls(&self) -> usize {
        self.read().commit_calls
    }

    pub fn carts_cleared_for(&self, order_id: AggregateId) -> usize {
        self.read()
            .cleared
            .iter()
            .filter(|(_, id)| *id == order_id)
            .count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StorefrontState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StorefrontState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Storefront for InMemoryStorefront {
    async fn clear_cart(
        &self,
        user_id: UserId,
        order_id: AggregateId,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.write();
        state.clear_calls += 1;
        if state.unavailable {
            return Err(OrchestratorError::Storefront("cart service offline".into()));
        }
        state.cleared.push((user_id, order_id));
        Ok(())
    }

    async fn commit_stock(
        &self,
        order_id: AggregateId,
        items: &[LineItem],
    ) -> Result<(), OrchestratorError> {
        let mut state = self.write();
        state.commit_calls += 1;
        if state.unavailable {
            return Err(OrchestratorError::Storefront("stock service offline".into()));
        }
        if !state.committed.insert(order_id) {
            return Ok(());
        }
        for item in items {
            *state
                .stock
                .entry(item.product_id.as_str().to_string())
                .or_default() -= i64::from(item.quantity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Currency, Money};

    #[tokio::test]
    async fn commit_takes_quantities_out_once() {
        let storefront = InMemoryStorefront::new();
        storefront.set_stock("SKU-TEE", 10);
        let order_id = AggregateId::new();
        let items = vec![LineItem::new(
            "SKU-TEE",
            "T-shirt",
            2,
            Money::new(75_000, Currency::Vnd),
        )];

        storefront.commit_stock(order_id, &items).await.unwrap();
        storefront.commit_stock(order_id, &items).await.unwrap();

        assert_eq!(storefront.stock_of("SKU-TEE"), 8);
        assert_eq!(storefront.commit_stock_calls(), 2);
    }

    #[tokio::test]
    async fn outage_fails_calls() {
        let storefront = InMemoryStorefront::new();
        storefront.set_unavailable(true);

        let err = storefront
            .clear_cart(UserId::new(), AggregateId::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(storefront.clear_cart_calls(), 1);
    }
}
