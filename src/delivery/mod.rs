//! Delivery bookkeeping: attempt state transitions and the retry worker
//! that drains the `delivery_attempts` queue.

pub mod tracker;
pub mod worker;

pub use tracker::{AttemptUpdate, Delivered, DeliveryTracker, DispatchOutcome};
pub use worker::{RetryWorker, spawn_retry_worker};
