//! # System Lifecycle & Orchestration
//!
//! Wires the storefront services into one broker and tears them down again.
//!
//! ## Startup
//!
//! [`StorefrontSystem::start`] runs, in order:
//!
//! 1. **Store**: spawn the products collection task.
//! 2. **Services**: build the greeter, products and inventory definitions.
//!    Inventory gets the products [`EntityStore`](service_framework::EntityStore)
//!    so reservations go through the same non-negative check and cache
//!    invalidation as direct stock changes.
//! 3. **Broker**: register actions, seed the products collection, subscribe
//!    the `inventory.reserve` consumer.
//!
//! ## Graceful Shutdown
//!
//! 1. **Broker**: stop accepting channel messages and wait for in-flight
//!    reservations.
//! 2. **Store**: stop the products collection task.
//!
//! ## Configuration
//!
//! [`load_config`] layers defaults, the TOML file named by
//! `STOREFRONT_CONFIG` and environment overrides. See [`config`].

pub mod config;
pub mod system;

pub use config::*;
pub use system::*;

use service_framework::config::{ConfigError, ConfigLoader};

/// Loads the storefront configuration from `STOREFRONT_CONFIG` and the environment.
pub fn load_config() -> Result<StorefrontConfig, ConfigError> {
    let mut loader = ConfigLoader::new();
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        loader = loader.with_file(path);
    }
    loader.load()
}
