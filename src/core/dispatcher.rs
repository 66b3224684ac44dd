//! The dispatcher: ingestion, wake protocol, timed dispatch and response
//! correlation around a shared [`ScheduleTree`].
//!
//! A single dispatch loop drains a bounded wake queue. Every wake names the
//! node that was the tree's minimum when it was enqueued; the loop starts one
//! watch task per wake. A watch task polls with a decaying interval until
//! the node's key has passed, pops the due step, hands it to the model
//! transport and re-checks the minimum.
//!
//! A `notified` set, guarded together with the enqueue, keeps a node from
//! being queued twice while a watch for it is pending.
//!
//! Watch tasks never wait on a send. Due steps go into a per-pipeline outbox
//! drained in order by a single sender task, so a slow model delays only
//! the later steps of its own pipeline.
//!
//! In-flight entries outlive their pipeline's deadline by at most
//! [`DispatcherConfig::response_grace`]; the dispatch loop sweeps expired ones.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::audit::{build_audit_event, AuditAction, AuditSink};
use crate::core::pipeline::{PipelineRequest, Step};
use crate::core::schedule_tree::{NodeRef, Popped, ScheduleTree, TreeNode};
use crate::core::tracker::{TaskToken, TaskTracker};
use crate::core::transport::{
    MessageIdSource, ModelCall, ModelResponse, ModelTransport, ReceiverTransport,
};
use crate::core::BrokerError;
use crate::util::serde::{Endpoint, MessageId, PipelineId};

/// Abstraction for spawning broker tasks on a runtime.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Timing and queue settings for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Longest single sleep of a watch task.
    pub max_poll_interval: Duration,
    /// Shortest single sleep of a watch task; bounds dispatch lateness.
    pub min_poll_interval: Duration,
    /// Capacity of the wake queue.
    pub wake_queue_capacity: usize,
    /// How long past its pipeline's deadline a message may await a response.
    pub response_grace: Duration,
    /// Period of the in-flight expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(1),
            wake_queue_capacity: 10,
            response_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Sleep length for a watch task `remaining` away from its deadline: a tenth
/// of the remaining time, kept within `[min, max]` and never past the deadline.
pub fn poll_interval(remaining: Duration, min: Duration, max: Duration) -> Duration {
    (remaining / 10).max(min).min(max).min(remaining)
}

/// Point-in-time dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Pipelines inserted into the tree.
    pub admitted: u64,
    /// Submissions dropped for having no steps.
    pub dropped_empty: u64,
    /// Nodes enqueued on the wake queue.
    pub wake_notifications: u64,
    /// Steps handed to the model transport successfully.
    pub dispatched: u64,
    /// Steps the model transport failed to send.
    pub dispatch_failures: u64,
    /// Responses correlated with an in-flight message.
    pub completed: u64,
    /// Responses whose message id was not in flight.
    pub unknown_responses: u64,
    /// Responses that could not be forwarded to their receiver.
    pub forward_failures: u64,
    /// In-flight messages dropped after their response grace ran out.
    pub expired: u64,
    /// Nodes currently in the tree.
    pub scheduled: usize,
    /// Messages awaiting a response.
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    dropped_empty: AtomicU64,
    wake_notifications: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    completed: AtomicU64,
    unknown_responses: AtomicU64,
    forward_failures: AtomicU64,
    expired: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Result of [`Dispatcher::admit`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// The pipeline was inserted; the node holds it until its last step fires.
    Scheduled(NodeRef),
    /// The submission had no steps.
    Dropped,
}

/// Result of [`Dispatcher::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The message id was in flight and has been retired.
    Correlated,
    /// Duplicate or late response; nothing to retire.
    Unknown,
}

/// A queued wake. The token keeps the broker busy until its watch finishes.
struct Wake {
    node: NodeRef,
    token: TaskToken,
}

/// Bookkeeping for a message awaiting its response.
struct InFlight {
    node: Weak<TreeNode>,
    expires_at: Instant,
}

struct Shared {
    tree: ScheduleTree,
    notified: tokio::sync::Mutex<HashSet<PipelineId>>,
    wake_tx: mpsc::Sender<Wake>,
    wake_rx: Mutex<Option<mpsc::Receiver<Wake>>>,
    in_flight: Mutex<HashMap<MessageId, InFlight>>,
    /// Popped steps awaiting their sender, per pipeline. A present entry
    /// means a sender task is draining it.
    outboxes: Mutex<HashMap<PipelineId, VecDeque<Popped>>>,
    models: Arc<dyn ModelTransport>,
    receivers: Arc<dyn ReceiverTransport>,
    ids: Arc<dyn MessageIdSource>,
    config: DispatcherConfig,
    counters: Counters,
    tracker: Arc<TaskTracker>,
    shutdown: watch::Sender<bool>,
    audit: Mutex<Option<Box<dyn AuditSink>>>,
}

/// Time-scheduled dispatcher. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher<S> {
    shared: Arc<Shared>,
    spawner: S,
}

impl<S> Dispatcher<S> {
    /// Create a dispatcher around the given collaborators.
    pub fn new(
        config: DispatcherConfig,
        models: Arc<dyn ModelTransport>,
        receivers: Arc<dyn ReceiverTransport>,
        ids: Arc<dyn MessageIdSource>,
        spawner: S,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(config.wake_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                tree: ScheduleTree::new(),
                notified: tokio::sync::Mutex::new(HashSet::new()),
                wake_tx,
                wake_rx: Mutex::new(Some(wake_rx)),
                in_flight: Mutex::new(HashMap::new()),
                outboxes: Mutex::new(HashMap::new()),
                models,
                receivers,
                ids,
                config,
                counters: Counters::default(),
                tracker: TaskTracker::new(),
                shutdown,
                audit: Mutex::new(None),
            }),
            spawner,
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(self, audit: Box<dyn AuditSink>) -> Self {
        *self.shared.audit.lock() = Some(audit);
        self
    }

    /// The shared schedule tree.
    pub fn tree(&self) -> &ScheduleTree {
        &self.shared.tree
    }

    /// Number of messages awaiting a response.
    pub fn in_flight_len(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.shared.counters;
        DispatcherStats {
            admitted: c.admitted.load(Ordering::Relaxed),
            dropped_empty: c.dropped_empty.load(Ordering::Relaxed),
            wake_notifications: c.wake_notifications.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dispatch_failures: c.dispatch_failures.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            unknown_responses: c.unknown_responses.load(Ordering::Relaxed),
            forward_failures: c.forward_failures.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            scheduled: self.shared.tree.len(),
            in_flight: self.in_flight_len(),
        }
    }

    /// True while `pipeline` has a queued wake or a live watch task.
    pub async fn is_notified(&self, pipeline: PipelineId) -> bool {
        self.shared.notified.lock().await.contains(&pipeline)
    }

    /// Resolve once no wake, watch task or step send is outstanding.
    pub async fn wait_idle(&self) {
        self.shared.tracker.wait_idle().await;
    }

    /// Stop the dispatch loop and let pending watch tasks exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Receiver that flips to `true` on [`Dispatcher::shutdown`]. Accept loops
    /// select on it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Remove queued wakes without watching them, returning their pipelines in
    /// queue order. Only possible while the dispatch loop is not running.
    pub async fn drain_wakes(&self) -> Vec<PipelineId> {
        let drained: Vec<Wake> = {
            let mut guard = self.shared.wake_rx.lock();
            let Some(rx) = guard.as_mut() else {
                return Vec::new();
            };
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let mut notified = self.shared.notified.lock().await;
        drained
            .into_iter()
            .map(|wake| {
                notified.remove(&wake.node.id());
                wake.node.id()
            })
            .collect()
    }

    /// Forward a model's response to its receiver, then retire the in-flight
    /// message. An unknown message id is not an error.
    ///
    /// # Errors
    ///
    /// The receiver transport's error if forwarding failed; bookkeeping is
    /// done either way.
    pub async fn complete(&self, response: ModelResponse) -> Result<Completion, BrokerError> {
        let ModelResponse {
            message_id,
            value,
            receiver,
        } = response;
        let shared = &self.shared;

        let forwarded = shared.receivers.forward(&receiver, &value).await;
        if let Err(e) = &forwarded {
            bump(&shared.counters.forward_failures);
            warn!(%message_id, %receiver, error = %e, "failed to forward response");
        }

        let entry = shared.in_flight.lock().remove(&message_id);
        let completion = match entry {
            None => {
                bump(&shared.counters.unknown_responses);
                debug!(%message_id, "response for unknown message ignored");
                Completion::Unknown
            }
            Some(entry) => {
                let pipeline = entry.node.upgrade().map(|node| {
                    if node.is_exhausted() {
                        shared.tree.remove(&node);
                    }
                    node.id()
                });
                bump(&shared.counters.completed);
                info!(%message_id, %receiver, "response forwarded");
                shared.record(pipeline, AuditAction::Complete, Some(message_id.to_string()));
                Completion::Correlated
            }
        };

        forwarded.map(|()| completion)
    }

    /// Drop in-flight messages whose response grace has run out, returning
    /// how many were dropped. A response arriving later is still forwarded,
    /// as an unknown message.
    pub fn expire_in_flight(&self) -> usize {
        self.shared.expire_in_flight(Instant::now())
    }

    /// Enqueue the current leftmost node unless it already has a pending wake.
    /// Returns true if a wake was enqueued.
    ///
    /// # Errors
    ///
    /// [`BrokerError::WakeQueueClosed`] if the wake queue is gone.
    pub async fn notify_minimum(&self) -> Result<bool, BrokerError> {
        self.shared.notify_minimum().await
    }
}

impl<S> Dispatcher<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Admit a decoded submission: resolve fire times against now, insert it
    /// and wake the dispatch loop if the minimum changed. Empty submissions
    /// are dropped.
    ///
    /// # Errors
    ///
    /// [`BrokerError::WakeQueueClosed`] if the wake queue is gone.
    pub async fn admit(&self, request: PipelineRequest) -> Result<Admission, BrokerError> {
        let shared = &self.shared;
        let schedule = match request.compute_fire_times(Instant::now()) {
            Ok(schedule) => schedule,
            Err(BrokerError::EmptyPipeline) => {
                bump(&shared.counters.dropped_empty);
                debug!("dropping submission without steps");
                shared.record(None, AuditAction::Drop, None);
                return Ok(Admission::Dropped);
            }
            Err(e) => return Err(e),
        };

        let steps = schedule.len();
        let insertion = shared.tree.insert(schedule)?;
        let node = insertion.node;
        bump(&shared.counters.admitted);
        info!(pipeline = %node.id(), steps, "pipeline admitted");
        shared.record(Some(node.id()), AuditAction::Admit, None);

        if insertion.minimum_changed {
            shared.notify_minimum().await?;
        }
        Ok(Admission::Scheduled(node))
    }

    /// Run the dispatch loop until [`Dispatcher::shutdown`]: one watch task per
    /// wake, never blocking on any of them.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AlreadyRunning`] if another loop owns the wake queue.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let Some(mut wakes) = self.shared.wake_rx.lock().take() else {
            return Err(BrokerError::AlreadyRunning);
        };
        let mut shutdown = self.shared.shutdown.subscribe();
        let period = self.shared.config.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("dispatch loop started");

        loop {
            let stopped = *shutdown.borrow_and_update();
            if stopped {
                break;
            }
            tokio::select! {
                wake = wakes.recv() => match wake {
                    Some(wake) => self.spawn_watch(wake),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.shared.expire_in_flight(Instant::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("dispatch loop stopped");
        Ok(())
    }

    fn spawn_watch(&self, wake: Wake) {
        debug!(pipeline = %wake.node.id(), "starting watch");
        let shared = Arc::clone(&self.shared);
        let spawner = self.spawner.clone();
        self.spawner.spawn(watch_node(shared, spawner, wake));
    }
}

/// Wait until the node's key has passed, then pop and dispatch its due step.
async fn watch_node<S>(shared: Arc<Shared>, spawner: S, wake: Wake)
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let Wake { node, token } = wake;
    let shutdown = shared.shutdown.subscribe();
    let (min, max) = (
        shared.config.min_poll_interval,
        shared.config.max_poll_interval,
    );

    loop {
        let stopped = *shutdown.borrow();
        if stopped {
            return;
        }
        let remaining = node.key().saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(poll_interval(remaining, min, max)).await;
    }

    match shared.tree.pop_update(&node) {
        Ok(popped) => {
            debug!(pipeline = %node.id(), has_more = popped.has_more, "step due");
            post(&shared, &spawner, &node, popped);
        }
        Err(e) => warn!(pipeline = %node.id(), error = %e, "due node could not be popped"),
    }

    shared.notified.lock().await.remove(&node.id());
    if let Err(e) = shared.notify_minimum().await {
        warn!(error = %e, "failed to notify new minimum");
    }
    drop(token);
}

/// Queue a popped step behind any unsent steps of the same pipeline, starting
/// a sender task if none is draining that pipeline.
fn post<S>(shared: &Arc<Shared>, spawner: &S, node: &NodeRef, popped: Popped)
where
    S: Spawn,
{
    let start = match shared.outboxes.lock().entry(node.id()) {
        Entry::Occupied(mut queued) => {
            queued.get_mut().push_back(popped);
            false
        }
        Entry::Vacant(slot) => {
            slot.insert(VecDeque::from([popped]));
            true
        }
    };
    if start {
        let token = shared.tracker.token();
        spawner.spawn(drain_outbox(Arc::clone(shared), Arc::clone(node), token));
    }
}

/// Send the pipeline's queued steps one at a time until its outbox is empty.
async fn drain_outbox(shared: Arc<Shared>, node: NodeRef, token: TaskToken) {
    loop {
        let next = {
            let mut outboxes = shared.outboxes.lock();
            let Entry::Occupied(mut queued) = outboxes.entry(node.id()) else {
                break;
            };
            match queued.get_mut().pop_front() {
                Some(popped) => popped,
                None => {
                    queued.remove();
                    break;
                }
            }
        };
        shared.dispatch_step(&node, next.step, next.receiver).await;
    }
    drop(token);
}

impl Shared {
    async fn notify_minimum(&self) -> Result<bool, BrokerError> {
        let Some(leftmost) = self.tree.leftmost() else {
            return Ok(false);
        };
        let id = leftmost.id();

        let mut notified = self.notified.lock().await;
        if !notified.insert(id) {
            debug!(pipeline = %id, "minimum already notified");
            return Ok(false);
        }
        let wake = Wake {
            node: leftmost,
            token: self.tracker.token(),
        };
        if self.wake_tx.send(wake).await.is_err() {
            notified.remove(&id);
            return Err(BrokerError::WakeQueueClosed);
        }
        drop(notified);

        bump(&self.counters.wake_notifications);
        debug!(pipeline = %id, "wake enqueued");
        Ok(true)
    }

    async fn dispatch_step(&self, node: &NodeRef, step: Step, receiver: Endpoint) {
        let message_id = self.ids.next_id();
        let entry = InFlight {
            node: Arc::downgrade(node),
            expires_at: node.deadline() + self.config.response_grace,
        };
        self.in_flight.lock().insert(message_id, entry);

        let Step {
            remote, payload, ..
        } = step;
        let call = ModelCall {
            message_id,
            model: remote.name.clone(),
            payload,
            receiver,
        };

        match self.models.send(&remote, &call).await {
            Ok(()) => {
                bump(&self.counters.dispatched);
                info!(pipeline = %node.id(), model = %remote.name, %message_id, "step dispatched");
                self.record(Some(node.id()), AuditAction::Dispatch, Some(remote.name));
            }
            Err(e) => {
                self.in_flight.lock().remove(&message_id);
                bump(&self.counters.dispatch_failures);
                warn!(
                    pipeline = %node.id(),
                    model = %remote.name,
                    endpoint = %remote.endpoint,
                    error = %e,
                    "step dispatch failed"
                );
                self.record(Some(node.id()), AuditAction::DispatchFailed, Some(e.to_string()));
            }
        }
    }

    fn expire_in_flight(&self, now: Instant) -> usize {
        let expired = {
            let mut in_flight = self.in_flight.lock();
            let before = in_flight.len();
            in_flight.retain(|_, entry| entry.expires_at > now);
            before - in_flight.len()
        };
        if expired > 0 {
            self.counters
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!(expired, "in-flight messages expired");
        }
        expired
    }

    fn record(&self, pipeline: Option<PipelineId>, action: AuditAction, detail: Option<String>) {
        if let Some(sink) = self.audit.lock().as_mut() {
            sink.record(build_audit_event(pipeline, action, detail));
        }
    }
}
