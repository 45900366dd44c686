//! At-least-once task queue.
//!
//! [`TaskQueue`] carries generation and composition tasks from the
//! orchestrator to their consumers. A consumed [`Delivery`] must be settled:
//! [`Delivery::ack`] removes it for good, while [`Delivery::nack`] or simply
//! dropping it (a crashed consumer) puts it back for redelivery.
//!
//! Publishing is idempotent per key: a key whose task is still pending is
//! not enqueued twice. Publishing a key whose task is in flight is deferred:
//! the task is enqueued again once that delivery is acked, so a retry issued
//! before the previous attempt settles is never lost. Deferrals of one key
//! collapse into one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use foundry_core::hashing::generation_key;
use foundry_core::types::{DbId, Fingerprint};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Named queue a task is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTopic {
    Generation,
    Composition,
}

impl QueueTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Composition => "composition",
        }
    }
}

/// Generate one segment for one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub project_id: DbId,
    pub segment_id: DbId,
    pub fingerprint: Fingerprint,
}

impl GenerationTask {
    /// `"{segment_id}:{fingerprint}"`.
    pub fn idempotency_key(&self) -> String {
        generation_key(self.segment_id, &self.fingerprint)
    }
}

/// Assemble the final artifact of one render job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionTask {
    pub project_id: DbId,
    pub job_id: DbId,
}

impl CompositionTask {
    pub fn idempotency_key(&self) -> String {
        format!("composition:{}", self.job_id)
    }
}

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Generation(GenerationTask),
    Composition(CompositionTask),
}

impl Task {
    pub fn topic(&self) -> QueueTopic {
        match self {
            Self::Generation(_) => QueueTopic::Generation,
            Self::Composition(_) => QueueTopic::Composition,
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            Self::Generation(task) => task.idempotency_key(),
            Self::Composition(task) => task.idempotency_key(),
        }
    }
}

impl From<GenerationTask> for Task {
    fn from(task: GenerationTask) -> Self {
        Self::Generation(task)
    }
}

impl From<CompositionTask> for Task {
    fn from(task: CompositionTask) -> Self {
        Self::Composition(task)
    }
}

/// Result of [`TaskQueue::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued,
    /// A task with the same key is already pending.
    Duplicate,
    /// A task with the same key is in flight; it is enqueued again when that
    /// delivery is acked.
    Deferred,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task for topic '{actual}' published to '{expected}'")]
    TopicMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
}

/// Backend hook invoked exactly once per [`Delivery`].
pub trait Settle: Send + Sync {
    fn settle(&self, topic: QueueTopic, tag: u64, settlement: Settlement);
}

/// A task handed to a consumer. Settle it with [`ack`](Self::ack) or
/// [`nack`](Self::nack); dropping it unsettled requeues it.
pub struct Delivery {
    task: Task,
    tag: u64,
    attempt: u32,
    settler: Option<Arc<dyn Settle>>,
}

impl Delivery {
    pub fn new(task: Task, tag: u64, attempt: u32, settler: Arc<dyn Settle>) -> Self {
        Self {
            task,
            tag,
            attempt,
            settler: Some(settler),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// 1 for the first delivery of the task, incremented on each redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Remove the task from the queue for good.
    pub fn ack(mut self) {
        self.settle(Settlement::Ack);
    }

    /// Return the task to the queue for redelivery.
    pub fn nack(mut self) {
        self.settle(Settlement::Requeue);
    }

    fn settle(&mut self, settlement: Settlement) {
        if let Some(settler) = self.settler.take() {
            settler.settle(self.task.topic(), self.tag, settlement);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.settler.is_some() {
            tracing::warn!(
                topic = self.task.topic().as_str(),
                key = %self.task.idempotency_key(),
                "Delivery dropped without ack, requeueing"
            );
            self.settle(Settlement::Requeue);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("task", &self.task)
            .field("tag", &self.tag)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// The queue collaborator.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `task` unless `idempotency_key` is pending. A key in flight
    /// is re-enqueued after its delivery is acked.
    async fn publish(
        &self,
        topic: QueueTopic,
        task: Task,
        idempotency_key: &str,
    ) -> Result<PublishOutcome, QueueError>;

    /// Wait for the next task on `topic`.
    async fn consume(&self, topic: QueueTopic) -> Result<Delivery, QueueError>;
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

struct Envelope {
    task: Task,
    key: String,
    attempt: u32,
    /// Published again while in flight.
    rearm: Option<Task>,
}

impl Envelope {
    fn new(task: Task, key: String) -> Self {
        Self {
            task,
            key,
            attempt: 1,
            rearm: None,
        }
    }
}

#[derive(Default)]
struct TopicState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<u64, Envelope>,
    keys: HashSet<String>,
    published: u64,
    duplicates: u64,
    deferred: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    generation_ready: Notify,
    composition_ready: Notify,
}

#[derive(Default)]
struct QueueState {
    topics: HashMap<QueueTopic, TopicState>,
    last_tag: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, topic: QueueTopic) -> &Notify {
        match topic {
            QueueTopic::Generation => &self.generation_ready,
            QueueTopic::Composition => &self.composition_ready,
        }
    }
}

impl Settle for Shared {
    fn settle(&self, topic: QueueTopic, tag: u64, settlement: Settlement) {
        let requeued = {
            let mut state = self.lock();
            let topic_state = state.topics.entry(topic).or_default();
            let Some(mut envelope) = topic_state.in_flight.remove(&tag) else {
                return;
            };
            match (settlement, envelope.rearm.take()) {
                (Settlement::Ack, Some(task)) => {
                    tracing::debug!(
                        topic = topic.as_str(),
                        key = %envelope.key,
                        "Re-enqueueing task published while in flight"
                    );
                    topic_state.published += 1;
                    topic_state.ready.push_back(Envelope::new(task, envelope.key));
                    true
                }
                (Settlement::Ack, None) => {
                    topic_state.keys.remove(&envelope.key);
                    false
                }
                // The redelivery stands in for the deferred publish.
                (Settlement::Requeue, _) => {
                    envelope.attempt += 1;
                    topic_state.ready.push_back(envelope);
                    true
                }
            }
        };
        if requeued {
            self.notify(topic).notify_one();
        }
    }
}

/// Counters for one topic of a [`MemoryQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    /// Tasks accepted by `publish` since creation.
    pub published: u64,
    /// `publish` calls rejected as duplicates.
    pub duplicates: u64,
    /// `publish` calls deferred behind an in-flight delivery.
    pub deferred: u64,
}

/// In-process [`TaskQueue`]. Cloning yields another handle to the same
/// queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, topic: QueueTopic) -> QueueStats {
        let state = self.shared.lock();
        state
            .topics
            .get(&topic)
            .map(|t| QueueStats {
                ready: t.ready.len(),
                in_flight: t.in_flight.len(),
                published: t.published,
                duplicates: t.duplicates,
                deferred: t.deferred,
            })
            .unwrap_or_default()
    }

    /// Take the next ready task without waiting.
    pub fn try_consume(&self, topic: QueueTopic) -> Option<Delivery> {
        let (task, attempt, tag, more_ready) = {
            let mut state = self.shared.lock();
            state.last_tag += 1;
            let tag = state.last_tag;
            let topic_state = state.topics.entry(topic).or_default();
            let envelope = topic_state.ready.pop_front()?;
            let task = envelope.task.clone();
            let attempt = envelope.attempt;
            topic_state.in_flight.insert(tag, envelope);
            (task, attempt, tag, !topic_state.ready.is_empty())
        };
        // Notify stores at most one permit; pass the wakeup on.
        if more_ready {
            self.shared.notify(topic).notify_one();
        }
        let settler: Arc<dyn Settle> = self.shared.clone();
        Some(Delivery::new(task, tag, attempt, settler))
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(
        &self,
        topic: QueueTopic,
        task: Task,
        idempotency_key: &str,
    ) -> Result<PublishOutcome, QueueError> {
        if task.topic() != topic {
            return Err(QueueError::TopicMismatch {
                expected: topic.as_str(),
                actual: task.topic().as_str(),
            });
        }

        {
            let mut state = self.shared.lock();
            let topic_state = state.topics.entry(topic).or_default();
            if let Some(envelope) = topic_state
                .in_flight
                .values_mut()
                .find(|e| e.key == idempotency_key)
            {
                envelope.rearm = Some(task);
                topic_state.deferred += 1;
                tracing::debug!(
                    topic = topic.as_str(),
                    key = idempotency_key,
                    "Task in flight, deferring until acked"
                );
                return Ok(PublishOutcome::Deferred);
            }
            if !topic_state.keys.insert(idempotency_key.to_string()) {
                topic_state.duplicates += 1;
                tracing::debug!(
                    topic = topic.as_str(),
                    key = idempotency_key,
                    "Task already pending"
                );
                return Ok(PublishOutcome::Duplicate);
            }
            topic_state.published += 1;
            topic_state
                .ready
                .push_back(Envelope::new(task, idempotency_key.to_string()));
        }

        self.shared.notify(topic).notify_one();
        Ok(PublishOutcome::Enqueued)
    }

    async fn consume(&self, topic: QueueTopic) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.try_consume(topic) {
                return Ok(delivery);
            }
            self.shared.notify(topic).notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
