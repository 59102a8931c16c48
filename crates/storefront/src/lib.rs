//! # Storefront
//!
//! A sample node built on `service_framework`: a product catalog with stock
//! tracking, background inventory reservations and a greeter.
//!
//! ## Services
//!
//! - **[greeter]**: stateless `hello` / `welcome` actions.
//! - **[products]**: CRUD over the products collection plus
//!   `increaseQuantity` / `decreaseQuantity`; seeds three phones into an empty
//!   collection.
//! - **[inventory]**: `inventory.reserve` acknowledges immediately and the
//!   `inventory.reserve` channel consumer decreases stock, then emits
//!   `inventory.reserved`.
//! - **[lifecycle]**: configuration and startup/shutdown of the whole node.
//!
//! ## Testing
//!
//! See [`service_framework::mock`] for the scripted store adapter used to
//! test seeding and store outages without a real backend.

pub mod greeter;
pub mod inventory;
pub mod lifecycle;
pub mod model;
pub mod products;
