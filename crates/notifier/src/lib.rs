//! Delivery side of the pipeline: the Telegram adapter and the dispatcher
//! workers draining the main queue.

pub mod dispatcher;
pub mod telegram;
