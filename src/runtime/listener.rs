//! TCP accept loops for submissions and model responses.
//!
//! Both listeners speak newline-delimited JSON. Every accepted connection is
//! handled on its own task; a malformed line drops that connection only.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::transport::ModelResponse;
use crate::core::{BrokerError, Dispatcher, Spawn};
use crate::infra::transport::read_json_lines;
use crate::runtime::api::{decode_submission_value, ModelRegistry};

/// Bind a listener on `addr`.
///
/// # Errors
///
/// [`BrokerError::Bind`] if the address cannot be bound.
pub async fn bind(addr: &str) -> Result<TcpListener, BrokerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BrokerError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    debug!(addr, "listener bound");
    Ok(listener)
}

/// Accept submission connections until the dispatcher shuts down. Each line
/// is decoded against `registry` and admitted; a line longer than
/// `max_line_bytes` drops its connection.
pub async fn serve_submissions<S>(
    listener: TcpListener,
    dispatcher: Dispatcher<S>,
    registry: Arc<ModelRegistry>,
    max_line_bytes: usize,
) where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let shutdown = dispatcher.shutdown_signal();
    accept_loop(listener, shutdown, "submission", move |stream, peer| {
        let dispatcher = dispatcher.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(handle_submissions(
            stream,
            peer,
            dispatcher,
            registry,
            max_line_bytes,
        ));
    })
    .await;
}

/// Accept model response connections until the dispatcher shuts down. Each
/// line is forwarded to its receiver and correlated.
pub async fn serve_responses<S>(
    listener: TcpListener,
    dispatcher: Dispatcher<S>,
    max_line_bytes: usize,
) where
    S: Send + Sync + Clone + 'static,
{
    let shutdown = dispatcher.shutdown_signal();
    accept_loop(listener, shutdown, "response", move |stream, peer| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(handle_responses(stream, peer, dispatcher, max_line_bytes));
    })
    .await;
}

async fn accept_loop<F>(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    kind: &'static str,
    mut on_accept: F,
) where
    F: FnMut(TcpStream, SocketAddr),
{
    let local = listener
        .local_addr()
        .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
    info!(kind, addr = %local, "accepting connections");

    loop {
        let stopped = *shutdown.borrow_and_update();
        if stopped {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(kind, %peer, "connection accepted");
                    on_accept(stream, peer);
                }
                Err(e) => warn!(kind, error = %e, "accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(kind, addr = %local, "listener stopped");
}

async fn handle_submissions<S>(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher<S>,
    registry: Arc<ModelRegistry>,
    max_line_bytes: usize,
) where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let result = read_json_lines(stream, max_line_bytes, |value: Value| {
        let dispatcher = dispatcher.clone();
        let registry = Arc::clone(&registry);
        async move {
            let request = decode_submission_value(value, &registry)?;
            dispatcher.admit(request).await.map(|_| ())
        }
    })
    .await;

    match result {
        Ok(count) => debug!(%peer, count, "submission connection closed"),
        Err(e) => warn!(%peer, error = %e, "dropping submission connection"),
    }
}

async fn handle_responses<S>(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher<S>,
    max_line_bytes: usize,
) where
    S: Send + Sync + Clone + 'static,
{
    let result = read_json_lines(stream, max_line_bytes, |response: ModelResponse| {
        let dispatcher = dispatcher.clone();
        async move {
            // A failed forward keeps the connection open.
            if let Err(e) = dispatcher.complete(response).await {
                debug!(%peer, error = %e, "response not forwarded");
            }
            Ok(())
        }
    })
    .await;

    match result {
        Ok(count) => debug!(%peer, count, "response connection closed"),
        Err(e) => warn!(%peer, error = %e, "dropping response connection"),
    }
}
