//! # Time Broker
//!
//! A time-scheduled request broker for multi-model inference pipelines.
//!
//! Clients submit pipelines: ordered lists of steps, each naming a remote
//! model and a delay relative to the previous step, plus a total time budget
//! (`tloc`) and a final receiver. The broker resolves every step to an
//! absolute fire time, keeps all admitted pipelines in a concurrent schedule
//! tree keyed by their next fire time, and sends each step to its model as
//! soon as it is due. Model responses come back through the broker, which
//! forwards them to the pipeline's receiver.
//!
//! ## Key Features
//!
//! - **Budget-capped schedules**: step `i` fires at
//!   `admitted + min(delay_0 + .. + delay_i, tloc)`
//! - **Concurrent schedule tree**: lock-coupled inserts, cheap minimum lookup
//! - **Deduplicated wake protocol**: a node is watched by at most one task
//! - **Decaying poll interval**: watch tasks sleep a tenth of the remaining time
//! - **Pluggable transports**: newline-delimited JSON over TCP, or in-memory
//!   transports for tests
//!
//! ## Dispatcher
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use time_broker::core::{Dispatcher, DispatcherConfig, UuidMessageIds};
//! use time_broker::infra::{TcpModelTransport, TcpReceiverTransport};
//! use time_broker::runtime::{decode_submission, ModelRegistry, TokioSpawner};
//!
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::default(),
//!     Arc::new(TcpModelTransport::new(timeout)),
//!     Arc::new(TcpReceiverTransport::new(timeout)),
//!     Arc::new(UuidMessageIds),
//!     TokioSpawner::current(),
//! );
//!
//! let request = decode_submission(line, &registry)?;
//! dispatcher.admit(request).await?;
//! dispatcher.run().await?;
//! ```
//!
//! For complete scenarios, see `tests/dispatcher_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: pipelines, schedule tree, dispatcher.
pub mod core;
/// Configuration models for listeners, timing and the model registry.
pub mod config;
/// Builders to construct broker components from configuration.
pub mod builders;
/// Infrastructure adapters for outbound transports.
pub mod infra;
/// Runtime adapters: spawner, listeners, submission decoding, server.
pub mod runtime;
/// Shared utilities.
pub mod util;
