//! Message bus — in-process inbound/outbound queues bridging channels and the agent loop.

pub mod queue;
pub mod types;

pub use queue::{AckResult, MessageBus};
pub use types::{CollectedEntry, InboundMessage, OutboundMessage};
