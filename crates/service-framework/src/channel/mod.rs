//! Asynchronous publish/consume channels for deferred work.

pub mod message;
pub mod runtime;

pub use message::{
    ChannelHandler, ChannelMessage, DeadLetter, DeliveryContext, DeliveryOutcome, MessageState,
};
pub use runtime::{ChannelRuntime, DeliveryStatsSnapshot};
