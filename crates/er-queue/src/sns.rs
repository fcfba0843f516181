//! SNS topic publisher
//!
//! Resolves logical topic names against a configured ARN prefix and
//! publishes JSON bodies. Topic provisioning is an operational concern;
//! a publish to a missing topic surfaces as a transient error and the
//! incoming message is redelivered.

use async_trait::async_trait;
use tracing::debug;

use crate::{QueueError, Result, TopicPublisher};

pub struct SnsTopicPublisher {
    client: aws_sdk_sns::Client,
    /// Prepended to the topic name to form the full topic ARN,
    /// e.g. `arn:aws:sns:us-east-1:123456789012:`
    topic_arn_prefix: String,
}

impl SnsTopicPublisher {
    pub fn new(client: aws_sdk_sns::Client, topic_arn_prefix: String) -> Self {
        Self {
            client,
            topic_arn_prefix,
        }
    }
}

#[async_trait]
impl TopicPublisher for SnsTopicPublisher {
    async fn publish(&self, topic_name: &str, body: serde_json::Value) -> Result<String> {
        let topic_arn = format!("{}{}", self.topic_arn_prefix, topic_name);

        let output = self
            .client
            .publish()
            .topic_arn(&topic_arn)
            .message(body.to_string())
            .send()
            .await
            .map_err(|e| QueueError::Sns(e.to_string()))?;

        let message_id = output.message_id.unwrap_or_default();
        debug!(topic = %topic_name, message_id = %message_id, "published to topic");
        Ok(message_id)
    }
}
