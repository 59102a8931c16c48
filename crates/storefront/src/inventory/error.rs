use service_framework::{ServiceError, ValidationError};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Invalid reservation payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("Reservation {0} is already being applied")]
    InProgress(Uuid),
}

impl From<InventoryError> for ServiceError {
    fn from(e: InventoryError) -> Self {
        match e {
            // Never redelivered.
            InventoryError::InvalidPayload(source) => ValidationError::single(
                super::RESERVE_TOPIC,
                "local",
                "payload",
                "object",
                source.to_string(),
                Value::Null,
            )
            .into(),
            // Redelivered once the concurrent delivery settles.
            e @ InventoryError::InProgress(_) => ServiceError::Handler(e.to_string()),
        }
    }
}
