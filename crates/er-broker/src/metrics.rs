//! Broker metrics
//!
//! Counters and histograms for the processing pipeline, labeled by event
//! type where the cardinality is bounded. Exposition happens in the
//! binary; this module only owns the registry.

use std::sync::Mutex;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::codec::EventKind;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventTypeLabels {
    pub event_type: String,
}

impl From<EventKind> for EventTypeLabels {
    fn from(kind: EventKind) -> Self {
        Self {
            event_type: kind.label().to_string(),
        }
    }
}

pub struct BrokerMetrics {
    pub registry: Mutex<Registry>,
    /// Handled notifications by event type
    notifications_total: Family<EventTypeLabels, Counter>,
    /// Messages dropped as unwanted or undecodable
    dropped_total: Counter,
    /// Handler failures by event type (message left for redelivery)
    handler_errors_total: Family<EventTypeLabels, Counter>,
    /// Successful topic publishes
    publishes_total: Counter,
    /// Delay between the notified change and broker receipt
    queue_delay_seconds: Histogram,
    /// End-to-end handler duration by event type
    processing_duration_seconds: Family<EventTypeLabels, Histogram>,
    /// Delay between subscription-change creation and fan-out completion
    subscription_event_delay_seconds: Histogram,
}

/// Queue and subscription delays span sub-second to many minutes
const DELAY_BUCKETS: [f64; 11] = [
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
];

/// Handler durations are dominated by datastore and publish round-trips
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl BrokerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let notifications_total = Family::<EventTypeLabels, Counter>::default();
        registry.register(
            "relay_notifications",
            "Handled service notifications by event type",
            notifications_total.clone(),
        );

        let dropped_total = Counter::default();
        registry.register(
            "relay_dropped_messages",
            "Messages dropped as unwanted or undecodable",
            dropped_total.clone(),
        );

        let handler_errors_total = Family::<EventTypeLabels, Counter>::default();
        registry.register(
            "relay_handler_errors",
            "Handler failures leaving the message for redelivery",
            handler_errors_total.clone(),
        );

        let publishes_total = Counter::default();
        registry.register(
            "relay_publishes",
            "Successful publishes to per-client topics",
            publishes_total.clone(),
        );

        let queue_delay_seconds = Histogram::new(DELAY_BUCKETS.into_iter());
        registry.register(
            "relay_queue_delay_seconds",
            "Delay between the notified change and broker receipt",
            queue_delay_seconds.clone(),
        );

        let processing_duration_seconds =
            Family::<EventTypeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.into_iter())
            });
        registry.register(
            "relay_processing_duration_seconds",
            "Handler duration by event type",
            processing_duration_seconds.clone(),
        );

        let subscription_event_delay_seconds = Histogram::new(DELAY_BUCKETS.into_iter());
        registry.register(
            "relay_subscription_event_delay_seconds",
            "Delay between subscription-change creation and fan-out completion",
            subscription_event_delay_seconds.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            notifications_total,
            dropped_total,
            handler_errors_total,
            publishes_total,
            queue_delay_seconds,
            processing_duration_seconds,
            subscription_event_delay_seconds,
        }
    }

    pub fn record_notification(&self, kind: EventKind) {
        self.notifications_total.get_or_create(&kind.into()).inc();
    }

    pub fn record_drop(&self) {
        self.dropped_total.inc();
    }

    pub fn record_handler_error(&self, kind: EventKind) {
        self.handler_errors_total.get_or_create(&kind.into()).inc();
    }

    pub fn record_publish(&self) {
        self.publishes_total.inc();
    }

    pub fn record_queue_delay(&self, seconds: f64) {
        self.queue_delay_seconds.observe(seconds);
    }

    pub fn record_processing(&self, kind: EventKind, seconds: f64) {
        self.processing_duration_seconds
            .get_or_create(&kind.into())
            .observe(seconds);
    }

    pub fn record_subscription_delay(&self, seconds: f64) {
        self.subscription_event_delay_seconds.observe(seconds);
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
