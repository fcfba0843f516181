//! EventRelay Notification Broker
//!
//! This crate provides the core notification processing pipeline:
//! - Codec: parses raw queue payloads into typed service notifications
//! - NotificationProcessor: consumer loop, dispatch, login persistence,
//!   and per-client fan-out with the subscription-capability join
//! - BrokerMetrics: counters and histograms for the processing pipeline
//! - ReportLog: in-memory structured error reports for alerting surfaces

pub mod codec;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod report;

pub use codec::{decode, EventKind, ServiceNotification};
pub use error::BrokerError;
pub use metrics::BrokerMetrics;
pub use processor::{NotificationProcessor, ProcessorState};
pub use report::{Report, ReportCategory, ReportLog, ReportSeverity};

pub type Result<T> = std::result::Result<T, BrokerError>;
