//! SMS Relay: message forwarding and delivery engine.

pub mod api;
pub mod channels;
pub mod config;
pub mod delivery;
pub mod error;
pub mod pipeline;
pub mod store;
