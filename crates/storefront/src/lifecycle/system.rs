use super::config::StorefrontConfig;
use crate::greeter::{greeter_service, GreeterSettings};
use crate::inventory::inventory_service;
use crate::products::{products_service, ProductsSettings};
use service_framework::cache::{Cacher, MemoryCacher};
use service_framework::store::{EntityStore, MemoryStore, StoreAdapter};
use service_framework::{BrokerBuilder, ServiceBroker, ServiceError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The running storefront node: broker, products store and shared cache.
pub struct StorefrontSystem {
    pub broker: ServiceBroker,
    pub products: EntityStore,
    pub cacher: Arc<dyn Cacher>,
    store_handle: Option<JoinHandle<()>>,
}

impl StorefrontSystem {
    /// Starts every service over an in-memory products collection.
    pub async fn start(config: StorefrontConfig) -> Result<Self, ServiceError> {
        let (store, client) = MemoryStore::new("products", 64);
        let client = client.with_reconnect_policy(config.broker.store.reconnect_policy());
        let store_handle = tokio::spawn(store.run());

        let mut system = Self::with_adapter(config, Arc::new(client)).await?;
        system.store_handle = Some(store_handle);
        Ok(system)
    }

    /// Starts every service over the given products adapter.
    pub async fn with_adapter(
        config: StorefrontConfig,
        adapter: Arc<dyn StoreAdapter>,
    ) -> Result<Self, ServiceError> {
        info!(node_id = %config.broker.node_id, "Starting storefront");
        let cacher: Arc<dyn Cacher> = Arc::new(MemoryCacher::new());

        let products = products_service(
            adapter,
            cacher.clone(),
            &ProductsSettings {
                seed: config.products.seed,
                node_id: config.broker.node_id.clone(),
            },
        );
        let inventory = inventory_service(products.store.clone(), config.inventory.reserve_delay());

        let broker = BrokerBuilder::new(config.broker)
            .cacher(cacher.clone())
            .service(greeter_service(GreeterSettings::default()))
            .service(products.schema)
            .service(inventory)
            .start()
            .await?;

        Ok(Self {
            broker,
            products: products.store,
            cacher,
            store_handle: None,
        })
    }

    /// Drains channel deliveries, then stops the products store.
    pub async fn shutdown(self) {
        self.broker.shutdown().await;
        let health = self.broker.health();

        drop(self.broker);
        drop(self.products);
        if let Some(handle) = self.store_handle {
            // Clones of the store client held elsewhere would keep it alive.
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Products store task failed");
                }
            }
        }
        info!(?health, "Storefront stopped");
    }
}
