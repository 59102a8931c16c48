//! Data shapes exchanged with the storefront services.

pub mod inventory;
pub mod product;

pub use inventory::*;
pub use product::*;
