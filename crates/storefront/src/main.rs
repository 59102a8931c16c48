//! # Storefront
//!
//! Demo node: starts every service, walks through a reservation and shuts
//! down gracefully.
//!
//! ```bash
//! RUST_LOG=info cargo run -p storefront
//! STOREFRONT_CONFIG=storefront.toml RUST_LOG=debug cargo run -p storefront
//! ```

use serde_json::json;
use service_framework::tracing::setup_tracing;
use service_framework::validator::into_params;
use service_framework::{CallContext, ServiceError};
use std::time::Duration;
use storefront::inventory::RESERVED_EVENT;
use storefront::lifecycle::{load_config, StorefrontSystem};
use storefront::model::Product;
use thiserror::Error;
use tracing::{error, info, Instrument};

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] service_framework::config::ConfigError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("unexpected response: {0}")]
    Response(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Setup tracing once for the entire application
    setup_tracing();

    let config = load_config()?;
    info!(node_id = %config.broker.node_id, "Starting storefront node");
    let system = StorefrontSystem::start(config).await?;
    let broker = &system.broker;

    let hello = broker
        .call("greeter.hello", Default::default(), CallContext::new())
        .await?;
    info!(%hello, "Greeter answered");

    let page = broker
        .call("products.list", into_params(json!({ "sort": "name" })), CallContext::new())
        .await?;
    let products: Vec<Product> = serde_json::from_value(page["rows"].clone())?;
    info!(count = products.len(), "Catalog loaded");

    if let Some(product) = products.first() {
        let mut events = broker.subscribe_events();

        let span = tracing::info_span!("reservation", product_id = %product.id);
        async {
            let accepted = broker
                .call(
                    "inventory.reserve",
                    into_params(json!({ "productId": product.id, "quantity": 2 })),
                    CallContext::new().with_caller("storefront-demo"),
                )
                .await?;
            info!(%accepted, "Reservation accepted");

            let reserved = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    match events.recv().await {
                        Ok(event) if event.name == RESERVED_EVENT => return Some(event),
                        Ok(_) => continue,
                        Err(_) => return None,
                    }
                }
            })
            .await;
            match reserved {
                Ok(Some(event)) => info!(payload = %event.payload, "Reservation completed"),
                _ => error!("Reservation did not complete in time"),
            }

            let after = broker
                .call("products.get", into_params(json!({ "id": product.id })), CallContext::new())
                .await?;
            let after = Product::try_from(after)?;
            info!(before = product.quantity, after = after.quantity, "Stock updated");
            Ok::<_, AppError>(())
        }
        .instrument(span)
        .await?;
    }

    info!(health = ?broker.health(), "Node health");

    // Shutdown system gracefully
    system.shutdown().await;

    info!("Application completed successfully");
    Ok(())
}
