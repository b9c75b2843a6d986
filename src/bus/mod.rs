//! Real-time change bus: producer, fan-out service, subscriber client.

pub mod client;
pub mod errors;
pub mod event;
pub mod producer;
pub mod router;
pub mod service;

pub use client::BusClient;
pub use errors::{BusError, BusResult};
pub use event::ChangeBatch;
pub use producer::BroadcastProducer;
pub use router::{SubKey, SubscriptionRouter};
pub use service::{FanoutConfig, FanoutService};
