//! Broker process wiring: bound listeners plus the dispatch loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::builders::{build_registry, build_tcp_dispatcher};
use crate::config::BrokerConfig;
use crate::core::{BrokerError, Dispatcher, Spawn};
use crate::runtime::api::ModelRegistry;
use crate::runtime::listener::{bind, serve_responses, serve_submissions};

/// A dispatcher with every configured listener bound, ready to serve.
pub struct Broker<S> {
    dispatcher: Dispatcher<S>,
    registry: Arc<ModelRegistry>,
    submissions: Vec<TcpListener>,
    responses: Vec<TcpListener>,
    max_line_bytes: usize,
}

impl<S> Broker<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Bind every submission and response address. Any failure is fatal.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Bind`] for the first address that cannot be bound.
    pub async fn bind(
        cfg: &BrokerConfig,
        dispatcher: Dispatcher<S>,
        registry: ModelRegistry,
    ) -> Result<Self, BrokerError> {
        let mut submissions = Vec::with_capacity(cfg.submission_addrs.len());
        for addr in &cfg.submission_addrs {
            submissions.push(bind(addr).await?);
        }
        let mut responses = Vec::with_capacity(cfg.response_addrs.len());
        for addr in &cfg.response_addrs {
            responses.push(bind(addr).await?);
        }
        Ok(Self {
            dispatcher,
            registry: Arc::new(registry),
            submissions,
            responses,
            max_line_bytes: cfg.max_line_bytes,
        })
    }

    /// The dispatcher behind this broker; call `shutdown` on it to stop.
    pub const fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Bound submission addresses, in configuration order.
    pub fn submission_addrs(&self) -> Vec<SocketAddr> {
        self.submissions
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Bound response addresses, in configuration order.
    pub fn response_addrs(&self) -> Vec<SocketAddr> {
        self.responses
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Spawn the accept loops and run the dispatch loop until shutdown.
    ///
    /// # Errors
    ///
    /// Whatever [`Dispatcher::run`] returns.
    pub async fn serve(self) -> Result<(), BrokerError> {
        let Self {
            dispatcher,
            registry,
            submissions,
            responses,
            max_line_bytes,
        } = self;

        for listener in submissions {
            tokio::spawn(serve_submissions(
                listener,
                dispatcher.clone(),
                Arc::clone(&registry),
                max_line_bytes,
            ));
        }
        for listener in responses {
            tokio::spawn(serve_responses(
                listener,
                dispatcher.clone(),
                max_line_bytes,
            ));
        }

        dispatcher.run().await
    }
}

/// Build the TCP dispatcher from `cfg`, bind every listener and serve until
/// the returned broker's dispatcher is shut down.
///
/// # Errors
///
/// [`BrokerError::Config`] for an invalid configuration, [`BrokerError::Bind`]
/// for an address that cannot be bound.
pub async fn bind_from_config<S>(cfg: &BrokerConfig, spawner: S) -> Result<Broker<S>, BrokerError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let dispatcher = build_tcp_dispatcher(cfg, spawner)?;
    let registry = build_registry(cfg);
    let broker = Broker::bind(cfg, dispatcher, registry).await?;
    info!(
        submissions = ?broker.submission_addrs(),
        responses = ?broker.response_addrs(),
        "broker listening"
    );
    Ok(broker)
}
