//! Storage: the adapter boundary, an in-memory adapter and the entity store
//! wrapper that sits on top of any adapter.

pub mod adapter;
pub mod client;
pub mod entity;
pub mod memory;
pub mod message;

pub use adapter::{Filter, Record, ReconnectPolicy, StoreAdapter, ID_FIELD};
pub use client::StoreClient;
pub use entity::{
    Entity, EntityChangedEvent, EntityListener, EntityStore, Operation, StoreSettings,
};
pub use memory::MemoryStore;
pub use message::StoreRequest;
