//! Configuration models for listeners, timing, transports and models.

pub mod broker;

pub use broker::{BrokerConfig, ModelConfig};
