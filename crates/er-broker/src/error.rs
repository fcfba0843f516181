//! Broker Error Types

use std::time::Duration;

use thiserror::Error;

use crate::processor::ProcessorState;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: ProcessorState,
    },

    #[error("cache startup failed: {0}")]
    CacheStartup(#[source] anyhow::Error),

    #[error("datastore error: {0}")]
    Datastore(#[source] anyhow::Error),

    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: er_queue::QueueError,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
