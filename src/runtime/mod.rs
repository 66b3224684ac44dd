//! Runtime adapters: tokio spawner, submission decoding, listeners and server.

pub mod api;
pub mod listener;
pub mod server;
pub mod tokio_spawner;

pub use api::{decode_submission, decode_submission_value, ModelRegistry};
pub use listener::{bind, serve_responses, serve_submissions};
pub use server::{bind_from_config, Broker};
pub use tokio_spawner::TokioSpawner;
