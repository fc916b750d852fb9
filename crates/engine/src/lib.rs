//! Delayed-delivery pipeline: record store, status cache, delay queue,
//! scheduler and the notification service facade.

pub mod cache;
pub mod channel;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod store;
