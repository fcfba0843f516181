//! EventRelay queue ports and adapters
//!
//! This crate defines the transport-facing ports of the broker:
//! - QueueConsumer: pull-based consumer over the upstream notification queue
//! - TopicPublisher: outbound publisher for per-client topics
//!
//! Implementations: SQS consumer, SNS topic publisher, and an embedded
//! in-memory queue/publisher pair for the dev monolith and tests.

pub mod memory;
pub mod sns;
pub mod sqs;

use async_trait::async_trait;
use er_common::QueuedMessage;

pub use memory::{MemoryQueue, MemoryTopicPublisher};
pub use sns::SnsTopicPublisher;
pub use sqs::SqsQueueConsumer;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("SNS error: {0}")]
    Sns(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Unknown receipt handle: {0}")]
    UnknownReceipt(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Pull-based consumer over the upstream queue.
///
/// Messages stay invisible until acknowledged; `nack` makes a message
/// eligible for redelivery, optionally after a delay. Implementations
/// must tolerate `ack`/`nack` for receipts they no longer hold.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Stable identifier for logs and health reporting
    fn identifier(&self) -> &str;

    /// Fetch up to `max_messages` messages. An empty vec is not an error.
    async fn poll(&self, max_messages: usize) -> Result<Vec<QueuedMessage>>;

    /// Delete a message after successful handling
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return a message for redelivery after `delay_seconds` (transport default if None)
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Stop the consumer; subsequent polls return no messages
    async fn stop(&self);

    fn is_healthy(&self) -> bool;
}

/// Outbound publisher for per-client topics
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Publish a JSON body to the named topic, returning the broker message ID
    async fn publish(&self, topic_name: &str, body: serde_json::Value) -> Result<String>;
}
