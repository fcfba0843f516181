//! SQS queue consumer
//!
//! Long-polls an SQS queue and maps receive/delete/change-visibility onto
//! the QueueConsumer port. ACK deletes the message; NACK shortens its
//! visibility timeout so the queue redelivers it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use er_common::QueuedMessage;
use tracing::{debug, warn};

use crate::{QueueConsumer, QueueError, Result};

/// How long a poll waits for messages before returning empty
const WAIT_TIME_SECONDS: i32 = 10;

/// A consumer is considered stalled when no poll succeeded for this long
const HEALTHY_POLL_WINDOW_MS: i64 = 60_000;

pub struct SqsQueueConsumer {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    running: AtomicBool,
    last_poll_ms: AtomicI64,
}

impl SqsQueueConsumer {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self {
            client,
            queue_url,
            running: AtomicBool::new(true),
            last_poll_ms: AtomicI64::new(0),
        }
    }

    fn epoch_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn identifier(&self) -> &str {
        &self.queue_url
    }

    async fn poll(&self, max_messages: usize) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        // SQS caps a single receive at 10 messages
        let max = (max_messages.min(10)) as i32;

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .wait_time_seconds(WAIT_TIME_SECONDS)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        self.last_poll_ms.store(Self::epoch_ms(), Ordering::SeqCst);

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let receipt_handle = match m.receipt_handle {
                    Some(handle) => handle,
                    None => {
                        warn!(queue = %self.queue_url, "received message without receipt handle, skipping");
                        return None;
                    }
                };
                Some(QueuedMessage {
                    body: m.body.unwrap_or_default(),
                    receipt_handle,
                    broker_message_id: m.message_id,
                    queue_identifier: self.queue_url.clone(),
                })
            })
            .collect::<Vec<_>>();

        if !messages.is_empty() {
            debug!(queue = %self.queue_url, count = messages.len(), "received messages");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        // Visibility 0 makes the message immediately eligible for redelivery
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.unwrap_or(0) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let last = self.last_poll_ms.load(Ordering::SeqCst);
        last == 0 || Self::epoch_ms() - last < HEALTHY_POLL_WINDOW_MS
    }
}
