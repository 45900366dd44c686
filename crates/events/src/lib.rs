//! Messaging for the render engine.
//!
//! - [`bus`]: broadcast of [`RenderEvent`]s to any number of subscribers.
//! - [`queue`]: at-least-once delivery of generation and composition tasks.

pub mod bus;
pub mod queue;

pub use bus::{EventBus, EventTopic, RenderEvent, RenderEventKind, TopicReceiver};
pub use queue::{
    CompositionTask, Delivery, GenerationTask, MemoryQueue, PublishOutcome, QueueError,
    QueueStats, QueueTopic, Task, TaskQueue,
};
