//! Builders to construct a dispatcher and model registry from configuration.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::core::{
    BrokerError, Dispatcher, MessageIdSource, ModelTransport, ReceiverTransport, UuidMessageIds,
};
use crate::infra::transport::{TcpModelTransport, TcpReceiverTransport};
use crate::runtime::api::ModelRegistry;

/// Build a dispatcher from configuration using the provided transport factories.
///
/// # Errors
///
/// [`BrokerError::Config`] if the configuration is invalid, otherwise the
/// first error a factory returns.
pub fn build_dispatcher<S, FM, FR>(
    cfg: &BrokerConfig,
    model_factory: FM,
    receiver_factory: FR,
    ids: Arc<dyn MessageIdSource>,
    spawner: S,
) -> Result<Dispatcher<S>, BrokerError>
where
    FM: FnOnce(&BrokerConfig) -> Result<Arc<dyn ModelTransport>, BrokerError>,
    FR: FnOnce(&BrokerConfig) -> Result<Arc<dyn ReceiverTransport>, BrokerError>,
{
    cfg.validate()
        .map_err(|e| BrokerError::Config(format!("config invalid: {e}")))?;

    let models = model_factory(cfg)?;
    let receivers = receiver_factory(cfg)?;
    Ok(Dispatcher::new(
        cfg.dispatcher_config(),
        models,
        receivers,
        ids,
        spawner,
    ))
}

/// Build a dispatcher speaking newline-delimited JSON over TCP, with random
/// message ids.
///
/// # Errors
///
/// [`BrokerError::Config`] if the configuration is invalid.
pub fn build_tcp_dispatcher<S>(cfg: &BrokerConfig, spawner: S) -> Result<Dispatcher<S>, BrokerError> {
    build_dispatcher(
        cfg,
        |cfg| {
            let transport = TcpModelTransport::new(cfg.connect_timeout())
                .with_retries(cfg.send_retries, cfg.retry_backoff());
            Ok(Arc::new(transport) as Arc<dyn ModelTransport>)
        },
        |cfg| Ok(Arc::new(TcpReceiverTransport::new(cfg.connect_timeout())) as Arc<dyn ReceiverTransport>),
        Arc::new(UuidMessageIds),
        spawner,
    )
}

/// Model registry holding every configured model and the default receiver.
pub fn build_registry(cfg: &BrokerConfig) -> ModelRegistry {
    ModelRegistry::from_config(cfg)
}
