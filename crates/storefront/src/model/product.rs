/// Represents a product in the catalog.
///
/// Products are stored as raw records by the products
/// [`EntityStore`](service_framework::EntityStore); this type is the typed
/// view of an entity as callers see it.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_framework::store::{Entity, Record};
use service_framework::validator::into_params;

/// Fields exposed by the products service.
pub const PRODUCT_FIELDS: [&str; 4] = ["id", "name", "quantity", "price"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub quantity: i64,
    #[serde(default)]
    pub price: f64,
}

impl TryFrom<Entity> for Product {
    type Error = serde_json::Error;

    fn try_from(entity: Entity) -> Result<Self, Self::Error> {
        serde_json::from_value(entity.into_value())
    }
}

impl TryFrom<Value> for Product {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

/// Payload for creating a new product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    pub price: f64,
}

impl ProductCreate {
    pub fn into_params(self) -> Result<Record, serde_json::Error> {
        serde_json::to_value(self).map(into_params)
    }
}

/// Inserted when the products collection starts out empty.
pub fn seed_products() -> Vec<Record> {
    [
        json!({ "name": "Samsung Galaxy S10 Plus", "quantity": 10, "price": 704 }),
        json!({ "name": "iPhone 11 Pro", "quantity": 25, "price": 999 }),
        json!({ "name": "Huawei P30 Pro", "quantity": 15, "price": 679 }),
    ]
    .into_iter()
    .map(into_params)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_from_entity() {
        let entity = Entity(into_params(json!({
            "id": "123",
            "name": "Awesome thing",
            "quantity": 25,
            "price": 999
        })));
        let product = Product::try_from(entity).unwrap();
        assert_eq!(product.quantity, 25);
        assert_eq!(product.price, 999.0);
    }

    #[test]
    fn test_create_omits_missing_quantity() {
        let params = ProductCreate {
            name: "Test product".into(),
            quantity: None,
            price: 100.0,
        }
        .into_params()
        .unwrap();
        assert!(!params.contains_key("quantity"));
    }
}
