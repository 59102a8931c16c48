//! # Inventory Service
//!
//! Stock reservations are accepted synchronously and carried out in the
//! background:
//!
//! ```text
//! inventory.reserve (action) ──► channel "inventory.reserve" ──► ReserveHandler
//!        │                                                          │
//!        └─► true                               products stock -= quantity
//!                                                                   │
//!                                                     event "inventory.reserved"
//! ```
//!
//! The handler dedupes on the message id, so a redelivered reservation that
//! already went through is acknowledged without touching stock again. The
//! `inventory.reserved` event fires only once the stock change succeeded.

pub mod error;

pub use error::InventoryError;

use crate::model::ReserveRequest;
use async_trait::async_trait;
use service_framework::action::{ActionDescriptor, GraphqlHint};
use service_framework::channel::{ChannelHandler, ChannelMessage, DeliveryContext};
use service_framework::store::EntityStore;
use service_framework::validator::{ParamRule, ParamSchema};
use service_framework::{ServiceError, ServiceSchema};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const SERVICE: &str = "inventory";
pub const RESERVE_TOPIC: &str = "inventory.reserve";
pub const RESERVED_EVENT: &str = "inventory.reserved";

/// Message ids remembered for deduplication.
const DEDUPE_WINDOW: usize = 10_000;

pub fn inventory_service(products: EntityStore, reserve_delay: Duration) -> ServiceSchema {
    ServiceSchema::new(SERVICE)
        .action(
            ActionDescriptor::deferred("reserve", RESERVE_TOPIC)
                .params(
                    ParamSchema::new()
                        .field("productId", ParamRule::string())
                        .field("quantity", ParamRule::number().integer().positive()),
                )
                .rest("POST /reserve")
                .graphql(GraphqlHint::Mutation(
                    "inventoryReserve(productId: String!, quantity: Int!): Boolean!".into(),
                )),
        )
        .channel(
            RESERVE_TOPIC,
            SERVICE,
            Arc::new(ReserveHandler::new(products, reserve_delay)),
        )
}

/// Applies reservations to product stock.
pub struct ReserveHandler {
    products: EntityStore,
    /// Simulated latency of the external reservation call.
    delay: Duration,
    processed: Mutex<Processed>,
}

#[derive(Default)]
struct Processed {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    in_flight: HashSet<Uuid>,
}

enum Claim {
    Claimed,
    Done,
    Busy,
}

impl Processed {
    fn claim(&mut self, id: Uuid) -> Claim {
        if self.ids.contains(&id) {
            Claim::Done
        } else if self.in_flight.insert(id) {
            Claim::Claimed
        } else {
            Claim::Busy
        }
    }

    fn settle(&mut self, id: Uuid, applied: bool) {
        self.in_flight.remove(&id);
        if applied && self.ids.insert(id) {
            self.order.push_back(id);
            if self.order.len() > DEDUPE_WINDOW {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }
}

impl ReserveHandler {
    pub fn new(products: EntityStore, delay: Duration) -> Self {
        Self {
            products,
            delay,
            processed: Mutex::new(Processed::default()),
        }
    }

    fn claim(&self, id: Uuid) -> Claim {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claim(id)
    }

    fn settle(&self, id: Uuid, applied: bool) {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle(id, applied);
    }

    async fn apply(&self, ctx: &DeliveryContext, request: &ReserveRequest) -> Result<(), ServiceError> {
        tokio::time::sleep(self.delay).await;
        self.products
            .adjust(
                &ctx.call,
                &request.product_id,
                "quantity",
                -request.quantity,
                "quantity",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelHandler for ReserveHandler {
    #[instrument(skip_all, fields(message_id = %message.id, attempt = message.attempt))]
    async fn handle(&self, ctx: DeliveryContext, message: ChannelMessage) -> Result<(), ServiceError> {
        let request: ReserveRequest = serde_json::from_value(Value::Object(message.payload))
            .map_err(InventoryError::from)?;

        match self.claim(message.id) {
            Claim::Done => {
                debug!("Reservation already applied");
                return Ok(());
            }
            Claim::Busy => return Err(InventoryError::InProgress(message.id).into()),
            Claim::Claimed => {}
        }
        let applied = self.apply(&ctx, &request).await;
        self.settle(message.id, applied.is_ok());
        applied?;

        info!(
            "Reserve {} pieces of the {} product in the inventory.",
            request.quantity, request.product_id
        );
        let payload = serde_json::to_value(&request).map_err(InventoryError::from)?;
        ctx.emit(RESERVED_EVENT, payload);
        Ok(())
    }
}
