//! End-to-end dispatcher scenarios on a paused clock.
//!
//! Transports are in-memory, so every dispatch is recorded with the virtual
//! instant it happened at.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use time_broker::core::{
    Admission, AuditAction, BrokerError, Completion, Dispatcher, DispatcherConfig,
    InMemoryAuditSink, ModelCall, ModelResponse, ModelTransport, PipelineRequest, RemoteModel,
    StepRequest,
};
use time_broker::infra::{InMemoryModelTransport, InMemoryReceiverTransport, SequentialMessageIds};
use time_broker::runtime::TokioSpawner;
use time_broker::util::Endpoint;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Harness {
    dispatcher: Dispatcher<TokioSpawner>,
    models: InMemoryModelTransport,
    receivers: InMemoryReceiverTransport,
}

/// Records like [`InMemoryModelTransport`], but sends to one model take a
/// while to complete.
struct SluggishModels {
    inner: InMemoryModelTransport,
    sluggish: &'static str,
    delay: Duration,
}

#[async_trait]
impl ModelTransport for SluggishModels {
    async fn send(&self, remote: &RemoteModel, call: &ModelCall) -> Result<(), BrokerError> {
        if remote.name == self.sluggish {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.send(remote, call).await
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    fn with_config(config: DispatcherConfig) -> Self {
        let models = InMemoryModelTransport::new();
        Self::build(config, Arc::new(models.clone()), models)
    }

    fn with_sluggish_model(name: &'static str, delay: Duration) -> Self {
        let models = InMemoryModelTransport::new();
        let sluggish = SluggishModels {
            inner: models.clone(),
            sluggish: name,
            delay,
        };
        Self::build(DispatcherConfig::default(), Arc::new(sluggish), models)
    }

    fn build(
        config: DispatcherConfig,
        transport: Arc<dyn ModelTransport>,
        models: InMemoryModelTransport,
    ) -> Self {
        let receivers = InMemoryReceiverTransport::new();
        let dispatcher = Dispatcher::new(
            config,
            transport,
            Arc::new(receivers.clone()),
            Arc::new(SequentialMessageIds::default()),
            TokioSpawner::current(),
        );
        Self {
            dispatcher,
            models,
            receivers,
        }
    }

    fn start(&self) -> JoinHandle<Result<(), BrokerError>> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    }

    fn dispatched_models(&self) -> Vec<String> {
        self.models
            .calls()
            .into_iter()
            .map(|c| c.remote.name)
            .collect()
    }
}

fn pipeline(steps: &[(&str, u64)], tloc_ms: u64) -> PipelineRequest {
    PipelineRequest {
        steps: steps
            .iter()
            .map(|(name, delay)| StepRequest {
                remote: RemoteModel::new(*name, format!("{name}.models:7000")),
                payload: json!({ "question": "what is a broker?" }),
                delay: Duration::from_millis(*delay),
            })
            .collect(),
        receiver: Endpoint::new("client:9000"),
        budget: Duration::from_millis(tloc_ms),
    }
}

fn scheduled(admission: Admission) -> time_broker::core::NodeRef {
    match admission {
        Admission::Scheduled(node) => node,
        Admission::Dropped => panic!("pipeline was dropped"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_steps_fire_at_budget_capped_times() {
    let harness = Harness::new();
    let runner = harness.start();
    let start = Instant::now();

    harness
        .dispatcher
        .admit(pipeline(
            &[("embedding", 0), ("svm", 35), ("bayes", 25), ("keysearch", 15)],
            60,
        ))
        .await
        .unwrap();
    harness.dispatcher.wait_idle().await;

    assert_eq!(
        harness.dispatched_models(),
        vec!["embedding", "svm", "bayes", "keysearch"]
    );
    let expected = [0u64, 35, 60, 60];
    for (call, offset) in harness.models.calls().iter().zip(expected) {
        let due = start + Duration::from_millis(offset);
        assert!(call.at >= due, "{} fired early", call.remote.name);
        assert!(
            call.at < due + Duration::from_millis(5),
            "{} fired late",
            call.remote.name
        );
    }

    let stats = harness.dispatcher.stats();
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.dispatched, 4);
    assert_eq!(stats.in_flight, 4);
    assert_eq!(stats.scheduled, 0);

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pipelines_interleave_by_fire_time() {
    let harness = Harness::new();
    let runner = harness.start();

    let (a, b) = tokio::join!(
        harness.dispatcher.admit(pipeline(&[("a-first", 0), ("a-second", 20)], 100)),
        harness.dispatcher.admit(pipeline(&[("b-only", 10)], 100)),
    );
    a.unwrap();
    b.unwrap();
    harness.dispatcher.wait_idle().await;

    assert_eq!(
        harness.dispatched_models(),
        vec!["a-first", "b-only", "a-second"]
    );

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_admits_notify_minimum_once() {
    let harness = Harness::new();

    let (late, early) = tokio::join!(
        harness.dispatcher.admit(pipeline(&[("late", 10)], 100)),
        harness.dispatcher.admit(pipeline(&[("early", 5)], 100)),
    );
    let late = scheduled(late.unwrap());
    let early = scheduled(early.unwrap());

    let leftmost = harness.dispatcher.tree().leftmost().unwrap();
    assert!(Arc::ptr_eq(&leftmost, &early));
    assert!(harness.dispatcher.is_notified(early.id()).await);

    let wakes = harness.dispatcher.drain_wakes().await;
    assert_eq!(wakes.iter().filter(|id| **id == early.id()).count(), 1);
    assert!(wakes.iter().all(|id| *id == early.id() || *id == late.id()));
    assert!(!harness.dispatcher.is_notified(early.id()).await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_notifications_are_deduplicated() {
    let harness = Harness::new();
    let node = scheduled(
        harness
            .dispatcher
            .admit(pipeline(&[("svm", 50)], 100))
            .await
            .unwrap(),
    );

    let attempts = futures::future::join_all(
        (0..16).map(|_| harness.dispatcher.notify_minimum()),
    )
    .await;
    assert!(attempts.iter().all(|r| matches!(r, Ok(false))));

    assert_eq!(harness.dispatcher.drain_wakes().await, vec![node.id()]);
    assert_eq!(harness.dispatcher.stats().wake_notifications, 1);

    // Once drained, the minimum can be notified again.
    assert!(harness.dispatcher.notify_minimum().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_notify_on_empty_tree_is_noop() {
    let harness = Harness::new();
    assert!(!harness.dispatcher.notify_minimum().await.unwrap());
    assert!(harness.dispatcher.drain_wakes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_pipeline_is_dropped() {
    let harness = Harness::new();

    let admission = harness.dispatcher.admit(pipeline(&[], 60)).await.unwrap();

    assert!(matches!(admission, Admission::Dropped));
    assert!(harness.dispatcher.tree().is_empty());
    assert!(harness.dispatcher.drain_wakes().await.is_empty());
    assert_eq!(harness.dispatcher.stats().dropped_empty, 1);
}

#[tokio::test(start_paused = true)]
async fn test_response_is_correlated_and_forwarded() {
    let harness = Harness::new();
    let runner = harness.start();

    harness
        .dispatcher
        .admit(pipeline(&[("svm", 5)], 60))
        .await
        .unwrap();
    harness.dispatcher.wait_idle().await;

    let call = harness.models.calls().remove(0).call;
    assert_eq!(call.model, "svm");
    assert_eq!(call.receiver, Endpoint::new("client:9000"));
    assert_eq!(harness.dispatcher.in_flight_len(), 1);

    let completion = harness
        .dispatcher
        .complete(ModelResponse {
            message_id: call.message_id,
            value: json!({ "label": "positive" }),
            receiver: call.receiver.clone(),
        })
        .await
        .unwrap();

    assert_eq!(completion, Completion::Correlated);
    assert_eq!(harness.dispatcher.in_flight_len(), 0);
    assert_eq!(
        harness.receivers.forwarded(),
        vec![(Endpoint::new("client:9000"), json!({ "label": "positive" }))]
    );
    assert_eq!(harness.dispatcher.stats().completed, 1);

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_response_still_forwarded() {
    let harness = Harness::new();

    let completion = harness
        .dispatcher
        .complete(ModelResponse {
            message_id: uuid::Uuid::new_v4(),
            value: json!("late answer"),
            receiver: Endpoint::new("client:9000"),
        })
        .await
        .unwrap();

    assert_eq!(completion, Completion::Unknown);
    assert_eq!(harness.receivers.forwarded().len(), 1);
    assert_eq!(harness.dispatcher.stats().unknown_responses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_dispatch_leaves_nothing_in_flight() {
    let harness = Harness::new();
    harness.models.fail_model("svm");
    let runner = harness.start();

    harness
        .dispatcher
        .admit(pipeline(&[("svm", 0), ("bayes", 10)], 60))
        .await
        .unwrap();
    harness.dispatcher.wait_idle().await;

    let stats = harness.dispatcher.stats();
    assert_eq!(stats.dispatch_failures, 1);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(harness.dispatched_models(), vec!["bayes"]);
    assert_eq!(harness.dispatcher.in_flight_len(), 1);

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_audit_trail_records_lifecycle() {
    let sink = Arc::new(Mutex::new(InMemoryAuditSink::new(16)));
    let harness = Harness::new();
    let dispatcher = harness.dispatcher.clone().with_audit(Box::new(Arc::clone(&sink)));
    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    dispatcher.admit(pipeline(&[], 10)).await.unwrap();
    dispatcher.admit(pipeline(&[("svm", 1)], 10)).await.unwrap();
    dispatcher.wait_idle().await;
    let call = harness.models.calls().remove(0).call;
    dispatcher
        .complete(ModelResponse {
            message_id: call.message_id,
            value: json!(1),
            receiver: call.receiver,
        })
        .await
        .unwrap();

    let actions: Vec<_> = sink.lock().events().iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::Drop,
            AuditAction::Admit,
            AuditAction::Dispatch,
            AuditAction::Complete
        ]
    );

    dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_pending_watches() {
    let harness = Harness::new();
    let runner = harness.start();

    harness
        .dispatcher
        .admit(pipeline(&[("slow", 10_000)], 20_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
    harness.dispatcher.wait_idle().await;

    assert!(harness.models.calls().is_empty());
    assert_eq!(harness.dispatcher.tree().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_dispatch_loop_rejected() {
    let harness = Harness::new();
    let runner = harness.start();
    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();

    assert!(matches!(
        harness.dispatcher.run().await,
        Err(BrokerError::AlreadyRunning)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sluggish_send_does_not_hold_back_other_pipelines() {
    let harness = Harness::with_sluggish_model("sluggish", Duration::from_secs(5));
    let runner = harness.start();
    let start = Instant::now();

    harness
        .dispatcher
        .admit(pipeline(&[("sluggish", 0), ("after-sluggish", 0)], 100))
        .await
        .unwrap();
    harness
        .dispatcher
        .admit(pipeline(&[("punctual", 10)], 100))
        .await
        .unwrap();
    harness.dispatcher.wait_idle().await;

    assert_eq!(
        harness.dispatched_models(),
        vec!["punctual", "sluggish", "after-sluggish"]
    );
    let calls = harness.models.calls();
    assert!(calls[0].at >= start + Duration::from_millis(10));
    assert!(
        calls[0].at < start + Duration::from_millis(15),
        "punctual step waited behind another pipeline's send"
    );
    assert!(calls[2].at >= calls[1].at);
    assert_eq!(harness.dispatcher.stats().dispatched, 3);

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_messages_expire_after_grace() {
    let harness = Harness::with_config(DispatcherConfig {
        response_grace: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(10),
        ..DispatcherConfig::default()
    });
    let runner = harness.start();

    harness
        .dispatcher
        .admit(pipeline(&[("svm", 0)], 50))
        .await
        .unwrap();
    harness.dispatcher.wait_idle().await;
    assert_eq!(harness.dispatcher.in_flight_len(), 1);

    // Deadline at 50ms plus 100ms of grace.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dispatcher.in_flight_len(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dispatcher.in_flight_len(), 0);
    assert_eq!(harness.dispatcher.stats().expired, 1);
    assert_eq!(harness.dispatcher.expire_in_flight(), 0);

    let call = harness.models.calls().remove(0).call;
    let completion = harness
        .dispatcher
        .complete(ModelResponse {
            message_id: call.message_id,
            value: json!("too late"),
            receiver: call.receiver,
        })
        .await
        .unwrap();
    assert_eq!(completion, Completion::Unknown);
    assert_eq!(harness.receivers.forwarded().len(), 1);

    harness.dispatcher.shutdown();
    runner.await.unwrap().unwrap();
}
