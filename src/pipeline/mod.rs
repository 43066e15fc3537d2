//! Forwarding pipeline.
//!
//! Every inbound message flows through:
//! 1. `RuleMatcher::select_rules()`: priority-ordered filter evaluation
//! 2. `DestinationResolver::resolve_destinations()`: enabled channels per rule
//! 3. `Dispatcher::dispatch()`: one concurrent provider call per destination
//! 4. `DeliveryTracker::record_outcome()`: status, retry scheduling
//!
//! Routing configuration is read through the `RoutingCache` snapshot.

pub mod cache;
pub mod filter;
pub mod matcher;
pub mod processor;
pub mod resolver;
pub mod template;
pub mod types;

pub use cache::RoutingCache;
pub use processor::{Pipeline, ProcessSummary};
