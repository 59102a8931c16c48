//! Storefront configuration: the broker settings plus per-service knobs.
//!
//! ```toml
//! [broker]
//! node_id = "storefront-1"
//! request_timeout_ms = 5000
//!
//! [broker.channels]
//! max_retries = 5
//!
//! [inventory]
//! reserve_delay_ms = 1000
//!
//! [products]
//! seed = true
//! ```

use serde::{Deserialize, Serialize};
use service_framework::config::{parse_bool, ApplyEnv, BrokerConfig, ConfigError, EnvLookup};
use std::time::Duration;

/// Environment variable naming the TOML file to load.
pub const CONFIG_PATH_ENV: &str = "STOREFRONT_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorefrontConfig {
    pub broker: BrokerConfig,
    pub inventory: InventoryConfig,
    pub products: ProductsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Simulated latency of the external reservation call.
    pub reserve_delay_ms: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            reserve_delay_ms: 1000,
        }
    }
}

impl InventoryConfig {
    pub fn reserve_delay(&self) -> Duration {
        Duration::from_millis(self.reserve_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductsConfig {
    pub seed: bool,
}

impl Default for ProductsConfig {
    fn default() -> Self {
        Self { seed: true }
    }
}

impl ApplyEnv for StorefrontConfig {
    fn apply_env(&mut self, env: EnvLookup<'_>) -> Result<(), ConfigError> {
        self.broker.apply_env(env)?;
        if let Some(val) = env("STOREFRONT_RESERVE_DELAY_MS") {
            self.inventory.reserve_delay_ms = val.parse().map_err(|_| {
                ConfigError::invalid_env_var("STOREFRONT_RESERVE_DELAY_MS", "expected milliseconds")
            })?;
        }
        if let Some(val) = env("STOREFRONT_SEED") {
            self.products.seed = parse_bool(&val)
                .ok_or_else(|| ConfigError::invalid_env_var("STOREFRONT_SEED", "expected bool"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_framework::config::ConfigLoader;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides_nested_sections() {
        let vars: HashMap<&str, &str> = [
            ("SERVICE_NODE_ID", "storefront-7"),
            ("STOREFRONT_RESERVE_DELAY_MS", "5"),
            ("STOREFRONT_SEED", "off"),
        ]
        .into_iter()
        .collect();
        let env = |name: &str| vars.get(name).map(|v| v.to_string());

        let config: StorefrontConfig = ConfigLoader::new().load_with_env(&env).unwrap();
        assert_eq!(config.broker.node_id, "storefront-7");
        assert_eq!(config.inventory.reserve_delay(), Duration::from_millis(5));
        assert!(!config.products.seed);
    }

    #[test]
    fn test_invalid_delay_is_rejected() {
        let env = |name: &str| (name == "STOREFRONT_RESERVE_DELAY_MS").then(|| "soon".to_string());
        let result: Result<StorefrontConfig, _> = ConfigLoader::new().load_with_env(&env);
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar { .. })));
    }
}
