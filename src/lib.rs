//! Alias Relay: privacy-preserving email alias relay.

pub mod address;
pub mod config;
pub mod directory;
pub mod error;
pub mod message_id;
pub mod outbound;
pub mod pipeline;
pub mod signature;
pub mod webhook;
