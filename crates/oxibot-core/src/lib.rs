//! Core types, message bus, session store, and configuration for Oxibot.
//!
//! This crate has no knowledge of channels, LLM providers, or tools — it is
//! the shared substrate every other crate in the workspace builds on.

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;

pub use bus::{MessageBus, InboundMessage, OutboundMessage};
pub use config::Config;
pub use session::SessionManager;
