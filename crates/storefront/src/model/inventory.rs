use serde::{Deserialize, Serialize};

/// Body of an `inventory.reserve` message and of the `inventory.reserved` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub product_id: String,
    pub quantity: i64,
}
