//! Submission decoding and the model registry.
//!
//! A submission is one JSON object:
//!
//! ```json
//! {"embedding": {"delay": 0}, "svm": {"delay": 35, "endpoint": "10.0.0.7:7000"},
//!  "tloc": 60, "receiver": "10.0.0.9:9000", "payload": "question text"}
//! ```
//!
//! `tloc`, `receiver` and `payload` are reserved; every other key is a step, in
//! declaration order. Durations are milliseconds.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::BrokerConfig;
use crate::core::pipeline::{PipelineRequest, RemoteModel, StepRequest};
use crate::core::BrokerError;
use crate::util::serde::Endpoint;

/// Key holding the pipeline's total budget.
pub const BUDGET_KEY: &str = "tloc";
/// Key holding the final receiver.
pub const RECEIVER_KEY: &str = "receiver";
/// Key holding the payload shared by all steps.
pub const PAYLOAD_KEY: &str = "payload";

#[derive(Debug, Deserialize)]
struct StepEntry {
    delay: u64,
    #[serde(default)]
    endpoint: Option<Endpoint>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    attributes: HashMap<String, i64>,
}

/// Known models and the fallback receiver.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, RemoteModel>,
    default_receiver: Option<Endpoint>,
}

impl ModelRegistry {
    /// Empty registry: every step must carry its own endpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry built from the configured models.
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        let models = cfg
            .models
            .iter()
            .map(|(name, model)| {
                let remote = RemoteModel {
                    name: name.clone(),
                    endpoint: Endpoint::new(model.endpoint.clone()),
                    attributes: model.attributes.clone(),
                };
                (name.clone(), remote)
            })
            .collect();
        Self {
            models,
            default_receiver: cfg.default_receiver.clone().map(Endpoint::new),
        }
    }

    /// Register (or replace) a model.
    #[must_use]
    pub fn with_model(mut self, model: RemoteModel) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    /// Set the receiver used when a submission names none.
    #[must_use]
    pub fn with_default_receiver(mut self, receiver: impl Into<Endpoint>) -> Self {
        self.default_receiver = Some(receiver.into());
        self
    }

    /// Look up a model by name.
    pub fn get(&self, name: &str) -> Option<&RemoteModel> {
        self.models.get(name)
    }

    fn resolve(&self, name: &str, entry: &StepEntry) -> Result<RemoteModel, BrokerError> {
        let known = self.models.get(name);
        let endpoint = match (&entry.endpoint, known) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(model)) => model.endpoint.clone(),
            (None, None) => {
                return Err(BrokerError::Decode(format!(
                    "model `{name}` has no endpoint and is not registered"
                )))
            }
        };
        let mut attributes = known.map(|m| m.attributes.clone()).unwrap_or_default();
        attributes.extend(entry.attributes.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(RemoteModel {
            name: name.to_string(),
            endpoint,
            attributes,
        })
    }
}

/// Decode one submission line.
///
/// # Errors
///
/// [`BrokerError::Decode`] for invalid JSON, a missing or negative budget, a
/// missing receiver, a malformed step or an unresolvable model.
pub fn decode_submission(raw: &str, registry: &ModelRegistry) -> Result<PipelineRequest, BrokerError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| BrokerError::Decode(e.to_string()))?;
    decode_submission_value(value, registry)
}

/// Decode an already parsed submission. Steps keep declaration order.
///
/// # Errors
///
/// As [`decode_submission`].
pub fn decode_submission_value(
    value: Value,
    registry: &ModelRegistry,
) -> Result<PipelineRequest, BrokerError> {
    let Value::Object(mut fields) = value else {
        return Err(BrokerError::Decode("submission must be a JSON object".into()));
    };

    let budget = fields
        .shift_remove(BUDGET_KEY)
        .ok_or_else(|| BrokerError::Decode(format!("missing `{BUDGET_KEY}`")))?
        .as_u64()
        .ok_or_else(|| {
            BrokerError::Decode(format!("`{BUDGET_KEY}` must be a non-negative integer"))
        })?;

    let receiver = match fields.shift_remove(RECEIVER_KEY) {
        Some(Value::String(addr)) => Endpoint::new(addr),
        Some(other) => {
            return Err(BrokerError::Decode(format!(
                "`{RECEIVER_KEY}` must be a string, got {other}"
            )))
        }
        None => registry
            .default_receiver
            .clone()
            .ok_or_else(|| BrokerError::Decode(format!("missing `{RECEIVER_KEY}`")))?,
    };
    if receiver.is_empty() {
        return Err(BrokerError::Decode(format!("`{RECEIVER_KEY}` is empty")));
    }

    let shared_payload = fields.shift_remove(PAYLOAD_KEY).unwrap_or(Value::Null);
    let steps = decode_steps(fields, &shared_payload, registry)?;

    Ok(PipelineRequest {
        steps,
        receiver,
        budget: Duration::from_millis(budget),
    })
}

fn decode_steps(
    fields: Map<String, Value>,
    shared_payload: &Value,
    registry: &ModelRegistry,
) -> Result<Vec<StepRequest>, BrokerError> {
    fields
        .into_iter()
        .map(|(name, raw)| {
            let entry: StepEntry = serde_json::from_value(raw)
                .map_err(|e| BrokerError::Decode(format!("step `{name}`: {e}")))?;
            let remote = registry.resolve(&name, &entry)?;
            Ok(StepRequest {
                remote,
                payload: entry.payload.unwrap_or_else(|| shared_payload.clone()),
                delay: Duration::from_millis(entry.delay),
            })
        })
        .collect()
}
