use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use domain::CarrierStatus;

use super::{CarrierShipment, ShipmentRequest, ShippingCarrier};
use crate::error::ShippingError;

#[derive(Debug, Default)]
struct CarrierState {
    shipments: HashMap<String, CarrierShipment>,
    by_client_code: HashMap<String, String>,
    requests: Vec<ShipmentRequest>,
    next_id: u32,
    create_calls: usize,
    cancel_calls: usize,
    failing_creates: u32,
    create_times_out: bool,
    unavailable: bool,
}

/// In-memory carrier for tests and credential-less runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCarrier {
    state: Arc<RwLock<CarrierState>>,
}

impl InMemoryCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` create calls fail before reaching the carrier.
    pub fn fail_next_creates(&self, count: u32) {
        self.write().failing_creates = count;
    }

    /// Creates still happen, but the caller sees a timeout.
    pub fn set_create_times_out(&self, times_out: bool) {
        self.write().create_times_out = times_out;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.write().unavailable = unavailable;
    }

    /// Moves a shipment along, as the carrier's own events would.
    pub fn set_status(&self, shipment_code: &str, status: CarrierStatus) {
        if let Some(shipment) = self.write().shipments.get_mut(shipment_code) {
            shipment.status = status;
        }
    }

    pub fn create_calls(&self) -> usize {
        self.read().create_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.read().cancel_calls
    }

    pub fn shipment_count(&self) -> usize {
        self.read().shipments.len()
    }

    pub fn last_request(&self) -> Option<ShipmentRequest> {
        self.read().requests.last().cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CarrierState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CarrierState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ShippingCarrier for InMemoryCarrier {
    async fn create_order(&self, request: &ShipmentRequest) -> Result<CarrierShipment, ShippingError> {
        let mut state = self.write();
        state.create_calls += 1;
        if state.unavailable {
            return Err(ShippingError::Unavailable("sandbox offline".into()));
        }
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(ShippingError::Unavailable("sandbox overloaded".into()));
        }
        if state.by_client_code.contains_key(&request.client_order_code) {
            return Err(ShippingError::Rejected(format!(
                "client_order_code {} already exists",
                request.client_order_code
            )));
        }

        state.next_id += 1;
        let shipment = CarrierShipment {
            shipment_code: format!("GHN{:06}", state.next_id),
            client_order_code: request.client_order_code.clone(),
            status: CarrierStatus::ReadyToPick,
            created_at: Utc::now(),
        };
        state
            .by_client_code
            .insert(request.client_order_code.clone(), shipment.shipment_code.clone());
        state
            .shipments
            .insert(shipment.shipment_code.clone(), shipment.clone());
        state.requests.push(request.clone());

        if state.create_times_out {
            return Err(ShippingError::Timeout);
        }
        Ok(shipment)
    }

    async fn find_by_client_code(
        &self,
        client_order_code: &str,
    ) -> Result<Option<CarrierShipment>, ShippingError> {
        let state = self.read();
        if state.unavailable {
            return Err(ShippingError::Unavailable("sandbox offline".into()));
        }
        Ok(state
            .by_client_code
            .get(client_order_code)
            .and_then(|code| state.shipments.get(code))
            .cloned())
    }

    async fn detail(&self, shipment_code: &str) -> Result<CarrierShipment, ShippingError> {
        let state = self.read();
        if state.unavailable {
            return Err(ShippingError::Unavailable("sandbox offline".into()));
        }
        state
            .shipments
            .get(shipment_code)
            .cloned()
            .ok_or_else(|| ShippingError::NotFound(shipment_code.to_string()))
    }

    async fn cancel(&self, shipment_code: &str) -> Result<(), ShippingError> {
        let mut state = self.write();
        state.cancel_calls += 1;
        if state.unavailable {
            return Err(ShippingError::Unavailable("sandbox offline".into()));
        }
        let shipment = state
            .shipments
            .get_mut(shipment_code)
            .ok_or_else(|| ShippingError::NotFound(shipment_code.to_string()))?;
        if shipment.status.is_picked_up() {
            return Err(ShippingError::AlreadyPickedUp(shipment_code.to_string()));
        }
        shipment.status = CarrierStatus::Cancelled;
        Ok(())
    }
}
