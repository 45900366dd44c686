//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`RenderEvent`]s. It is
//! shared via `Arc<EventBus>` between the orchestrator, the workers and
//! the composition stage. Delivery is at-least-once from the consumer's
//! point of view: a lagging receiver loses events and must reconcile from
//! the entity store, and the same fact may be published more than once.

use chrono::{DateTime, Utc};
use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, Fingerprint, OutputRef};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// RenderEvent
// ---------------------------------------------------------------------------

/// Topic an event is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    /// Per-segment generation progress.
    Segment,
    /// Render job lifecycle.
    Job,
}

impl EventTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segment => "segment",
            Self::Job => "job",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderEventKind {
    JobCreated {
        job_id: DbId,
        project_id: DbId,
        segments_total: i32,
        segments_dispatched: usize,
    },
    SegmentQueued {
        segment_id: DbId,
        fingerprint: Fingerprint,
        attempt: i32,
    },
    SegmentStarted {
        segment_id: DbId,
        fingerprint: Fingerprint,
        attempt: i32,
    },
    SegmentCompleted {
        segment_id: DbId,
        fingerprint: Fingerprint,
        attempt: i32,
        output_ref: OutputRef,
    },
    SegmentFailed {
        segment_id: DbId,
        fingerprint: Fingerprint,
        attempt: i32,
        code: ErrorCode,
        retryable: bool,
        message: String,
    },
    JobProgress {
        job_id: DbId,
        segments_completed: i32,
        segments_total: i32,
    },
    JobCompositing {
        job_id: DbId,
    },
    JobCompleted {
        job_id: DbId,
        final_output_ref: OutputRef,
    },
    JobFailed {
        job_id: DbId,
        code: Option<ErrorCode>,
        message: String,
    },
    JobCancelled {
        job_id: DbId,
    },
}

/// A timestamped [`RenderEventKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderEvent {
    #[serde(flatten)]
    pub kind: RenderEventKind,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl RenderEvent {
    pub fn new(kind: RenderEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Dot-separated event name, e.g. `"segment.completed"`.
    pub fn event_type(&self) -> &'static str {
        use RenderEventKind::*;
        match self.kind {
            JobCreated { .. } => "job.created",
            SegmentQueued { .. } => "segment.queued",
            SegmentStarted { .. } => "segment.started",
            SegmentCompleted { .. } => "segment.completed",
            SegmentFailed { .. } => "segment.failed",
            JobProgress { .. } => "job.progress",
            JobCompositing { .. } => "job.compositing",
            JobCompleted { .. } => "job.completed",
            JobFailed { .. } => "job.failed",
            JobCancelled { .. } => "job.cancelled",
        }
    }

    pub fn topic(&self) -> EventTopic {
        use RenderEventKind::*;
        match self.kind {
            SegmentQueued { .. }
            | SegmentStarted { .. }
            | SegmentCompleted { .. }
            | SegmentFailed { .. } => EventTopic::Segment,
            _ => EventTopic::Job,
        }
    }
}

impl From<RenderEventKind> for RenderEvent {
    fn from(kind: RenderEventKind) -> Self {
        Self::new(kind)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`RenderEvent`].
///
/// # Usage
///
/// ```rust
/// use foundry_events::bus::{EventBus, RenderEventKind};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(RenderEventKind::JobCancelled { job_id: 1 });
/// ```
pub struct EventBus {
    sender: broadcast::Sender<RenderEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: impl Into<RenderEvent>) {
        let event = event.into();
        tracing::trace!(event_type = event.event_type(), "Publishing render event");
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of one topic.
    pub fn subscribe_topic(&self, topic: EventTopic) -> TopicReceiver {
        TopicReceiver {
            topic,
            inner: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiver filtered to a single [`EventTopic`].
pub struct TopicReceiver {
    topic: EventTopic,
    inner: broadcast::Receiver<RenderEvent>,
}

impl TopicReceiver {
    /// Receive the next event of this topic, skipping all others.
    ///
    /// Errors are those of [`broadcast::Receiver::recv`].
    pub async fn recv(&mut self) -> Result<RenderEvent, broadcast::error::RecvError> {
        loop {
            let event = self.inner.recv().await?;
            if event.topic() == self.topic {
                return Ok(event);
            }
        }
    }

    pub fn topic(&self) -> EventTopic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn completed(segment_id: DbId) -> RenderEventKind {
        RenderEventKind::SegmentCompleted {
            segment_id,
            fingerprint: "fp".into(),
            attempt: 1,
            output_ref: "segments/1/1/fp.mp4".into(),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(completed(3));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.event_type(), "segment.completed");
        assert_eq!(e1.kind, e2.kind);
    }

    #[tokio::test]
    async fn topic_receiver_skips_other_topics() {
        let bus = EventBus::default();
        let mut jobs = bus.subscribe_topic(EventTopic::Job);

        bus.publish(completed(1));
        bus.publish(RenderEventKind::JobCompositing { job_id: 9 });

        let event = jobs.recv().await.unwrap();
        assert_matches!(event.kind, RenderEventKind::JobCompositing { job_id: 9 });
        assert_eq!(event.topic(), EventTopic::Job);
    }

    #[tokio::test]
    async fn slow_receiver_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for id in 0..5 {
            bus.publish(completed(id));
        }
        assert_matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        );
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(RenderEventKind::JobCancelled { job_id: 1 });
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = RenderEvent::new(RenderEventKind::SegmentFailed {
            segment_id: 4,
            fingerprint: "abc".into(),
            attempt: 2,
            code: ErrorCode::Timeout,
            retryable: true,
            message: "timed out".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "segment_failed");
        assert_eq!(json["code"], "TIMEOUT");
        assert!(json["timestamp"].is_string());
    }
}
