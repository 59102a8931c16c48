//! # Tracing Setup
//!
//! Every component logs through `tracing` with structured fields. The spans
//! that matter when following a request:
//!
//! | Span | Fields | Opened by |
//! |------|--------|-----------|
//! | `action` | `name`, `request_id` | [`ActionRegistry::invoke`](crate::registry::ActionRegistry::invoke) |
//! | `channel.delivery` | `topic`, `message_id`, `attempt` | the channel consumer |
//! | `seed_once` | `collection` | [`Seeder::run`](crate::seeder::Seeder::run) |
//!
//! Operator-visible failures (cache invalidation, dead letters, failed start
//! hooks) are logged at `error` level.
//!
//! ```bash
//! RUST_LOG=info cargo run -p storefront     # lifecycle and mutations
//! RUST_LOG=debug cargo run -p storefront    # cache hits, store requests, deliveries
//! ```

use tracing_subscriber::EnvFilter;

/// Installs the global compact formatter, filtered by `RUST_LOG`.
///
/// Call once from `main`; a second call panics because the global default
/// is already set. Tests use [`try_setup_tracing`].
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

/// Like [`setup_tracing`], returning `false` if a subscriber is already set.
pub fn try_setup_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .compact()
        .try_init()
        .is_ok()
}
