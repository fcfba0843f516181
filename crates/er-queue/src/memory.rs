//! Embedded in-memory queue and topic publisher
//!
//! Used by the dev monolith and by tests. The queue mimics the visibility
//! semantics of SQS: polled messages move to an in-flight set until they
//! are acked (deleted) or nacked (returned to the ready queue). The
//! publisher records everything it publishes and can be told to fail,
//! globally or per topic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use er_common::QueuedMessage;
use parking_lot::Mutex;

use crate::{QueueConsumer, QueueError, Result, TopicPublisher};

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<QueuedMessage>,
    in_flight: HashMap<String, QueuedMessage>,
}

pub struct MemoryQueue {
    identifier: String,
    state: Mutex<MemoryQueueState>,
    running: AtomicBool,
    sequence: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
}

impl MemoryQueue {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: Mutex::new(MemoryQueueState::default()),
            running: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
        }
    }

    /// Enqueue a raw message body, returning its broker message ID
    pub fn push(&self, body: impl Into<String>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let message_id = format!("mem-{seq}");
        let message = QueuedMessage {
            body: body.into(),
            receipt_handle: format!("receipt-{seq}"),
            broker_message_id: Some(message_id.clone()),
            queue_identifier: self.identifier.clone(),
        };
        self.state.lock().ready.push_back(message);
        message_id
    }

    /// True when no message is ready or in flight
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.ready.is_empty() && state.in_flight.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> u64 {
        self.nacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn poll(&self, max_messages: usize) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock();
        let take = max_messages.min(state.ready.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(message) = state.ready.pop_front() {
                state
                    .in_flight
                    .insert(message.receipt_handle.clone(), message.clone());
                batch.push(message);
            }
        }
        Ok(batch)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let removed = self.state.lock().in_flight.remove(receipt_handle);
        match removed {
            Some(_) => {
                self.acks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt_handle.to_string())),
        }
    }

    async fn nack(&self, receipt_handle: &str, _delay_seconds: Option<u32>) -> Result<()> {
        let mut state = self.state.lock();
        match state.in_flight.remove(receipt_handle) {
            Some(message) => {
                state.ready.push_back(message);
                self.nacks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt_handle.to_string())),
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Records published messages instead of sending them anywhere
#[derive(Default)]
pub struct MemoryTopicPublisher {
    published: Mutex<Vec<(String, serde_json::Value)>>,
    fail_all: AtomicBool,
    fail_topics: Mutex<HashSet<String>>,
    sequence: AtomicU64,
}

impl MemoryTopicPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, as (topic_name, body) pairs
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic_name: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .filter(|(topic, _)| topic == topic_name)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Make every publish fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Make publishes to one topic fail while others succeed
    pub fn fail_topic(&self, topic_name: impl Into<String>) {
        self.fail_topics.lock().insert(topic_name.into());
    }
}

#[async_trait]
impl TopicPublisher for MemoryTopicPublisher {
    async fn publish(&self, topic_name: &str, body: serde_json::Value) -> Result<String> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_topics.lock().contains(topic_name) {
            return Err(QueueError::PublishRejected(format!(
                "injected failure for {topic_name}"
            )));
        }

        self.published
            .lock()
            .push((topic_name.to_string(), body));
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(format!("pub-{seq}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_moves_messages_in_flight_until_acked() {
        let queue = MemoryQueue::new("test-queue");
        queue.push(r#"{"event":"login"}"#);
        queue.push(r#"{"event":"delete"}"#);

        let batch = queue.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.ready_len(), 0);
        assert!(!queue.is_empty());

        for message in &batch {
            queue.ack(&message.receipt_handle).await.unwrap();
        }
        assert!(queue.is_empty());
        assert_eq!(queue.ack_count(), 2);
    }

    #[tokio::test]
    async fn nack_returns_message_to_ready() {
        let queue = MemoryQueue::new("test-queue");
        queue.push("{}");

        let batch = queue.poll(1).await.unwrap();
        queue.nack(&batch[0].receipt_handle, None).await.unwrap();

        assert_eq!(queue.ready_len(), 1);
        assert_eq!(queue.nack_count(), 1);
    }

    #[tokio::test]
    async fn stopped_queue_returns_no_messages() {
        let queue = MemoryQueue::new("test-queue");
        queue.push("{}");
        queue.stop().await;

        assert!(queue.poll(10).await.unwrap().is_empty());
        assert!(!queue.is_healthy());
    }

    #[tokio::test]
    async fn publisher_records_and_injects_failures() {
        let publisher = MemoryTopicPublisher::new();
        publisher
            .publish("er-event-C1", serde_json::json!({"event": "delete"}))
            .await
            .unwrap();

        publisher.fail_topic("er-event-C2");
        let err = publisher
            .publish("er-event-C2", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PublishRejected(_)));

        assert_eq!(publisher.published().len(), 1);
        assert_eq!(publisher.published_to("er-event-C1").len(), 1);
    }
}
