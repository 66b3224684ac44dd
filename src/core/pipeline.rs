//! Pipeline submissions and their admitted, time-resolved schedules.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::BrokerError;
use crate::util::serde::{Endpoint, PipelineId};

/// Identity of a remote compute service ("model").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteModel {
    /// Model name as declared in the submission.
    pub name: String,
    /// Address the step is sent to.
    pub endpoint: Endpoint,
    /// Free-form numeric attributes forwarded from the model registry.
    #[serde(default)]
    pub attributes: HashMap<String, i64>,
}

impl RemoteModel {
    /// Create a model reference without attributes.
    pub fn new(name: impl Into<String>, endpoint: impl Into<Endpoint>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            attributes: HashMap::new(),
        }
    }
}

/// One step of a submission, before admission: the delay is still relative.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Target model.
    pub remote: RemoteModel,
    /// Opaque value forwarded to the model.
    pub payload: serde_json::Value,
    /// Delay relative to the previous step.
    pub delay: Duration,
}

/// A decoded client submission awaiting admission.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Steps in execution order.
    pub steps: Vec<StepRequest>,
    /// Destination for the pipeline's outputs.
    pub receiver: Endpoint,
    /// Window, relative to admission, within which every step must fire.
    pub budget: Duration,
}

impl PipelineRequest {
    /// Resolve relative delays into absolute fire times.
    ///
    /// Step `i` fires at `admitted_at + min(delay_0 + .. + delay_i, budget)`, so
    /// fire times never decrease along the sequence and never pass the budget.
    ///
    /// # Errors
    ///
    /// [`BrokerError::EmptyPipeline`] when the request has no steps.
    pub fn compute_fire_times(self, admitted_at: Instant) -> Result<PipelineSchedule, BrokerError> {
        let Self {
            steps,
            receiver,
            budget,
        } = self;
        if steps.is_empty() {
            return Err(BrokerError::EmptyPipeline);
        }

        let mut elapsed = Duration::ZERO;
        let steps = steps
            .into_iter()
            .map(|step| {
                elapsed = elapsed.saturating_add(step.delay);
                Step {
                    remote: step.remote,
                    payload: step.payload,
                    fire_at: admitted_at + elapsed.min(budget),
                }
            })
            .collect();

        Ok(PipelineSchedule {
            id: Uuid::new_v4(),
            steps,
            receiver,
            budget,
            admitted_at,
        })
    }
}

/// A step with its absolute fire time.
#[derive(Debug, Clone)]
pub struct Step {
    /// Target model.
    pub remote: RemoteModel,
    /// Opaque value forwarded to the model.
    pub payload: serde_json::Value,
    fire_at: Instant,
}

impl Step {
    /// Absolute time at which this step becomes due.
    pub const fn fire_at(&self) -> Instant {
        self.fire_at
    }
}

/// An admitted pipeline. Steps are consumed front to back, one per dispatch.
#[derive(Debug)]
pub struct PipelineSchedule {
    id: PipelineId,
    steps: VecDeque<Step>,
    receiver: Endpoint,
    budget: Duration,
    admitted_at: Instant,
}

impl PipelineSchedule {
    /// Remove and return the first step, plus whether further steps remain.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AlreadyEmpty`] once every step has been popped.
    pub fn pop_next_step(&mut self) -> Result<(Step, bool), BrokerError> {
        let step = self.steps.pop_front().ok_or(BrokerError::AlreadyEmpty)?;
        Ok((step, !self.steps.is_empty()))
    }

    /// Fire time of the current first step, `None` once exhausted.
    pub fn next_fire_time(&self) -> Option<Instant> {
        self.steps.front().map(Step::fire_at)
    }

    /// Pipeline identifier.
    pub const fn id(&self) -> PipelineId {
        self.id
    }

    /// Final receiver.
    pub const fn receiver(&self) -> &Endpoint {
        &self.receiver
    }

    /// Remaining steps, front first.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Number of undispatched steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True once every step has been dispatched.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Latest instant any step of this pipeline may fire.
    pub fn deadline(&self) -> Instant {
        self.admitted_at + self.budget
    }

    /// Instant the pipeline was admitted.
    pub const fn admitted_at(&self) -> Instant {
        self.admitted_at
    }
}
