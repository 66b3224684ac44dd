//! Tokio runtime spawner implementation.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::core::Spawn;

/// Tokio-based spawner for watch tasks, step sends and connection handlers.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: Arc<Handle>,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` from a tokio runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Spawner bound to the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// When called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}
