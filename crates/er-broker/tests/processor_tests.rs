//! Notification Processor Integration Tests
//!
//! Exercises the full consumer loop against the in-memory ports: decode,
//! dispatch, login persistence, fan-out, ack/nack behavior, and the
//! processor state machine.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use er_broker::{BrokerMetrics, NotificationProcessor, ProcessorState, ReportLog};
use er_cache::{SnapshotFetcher, StaticSnapshotFetcher, UpdatingCache};
use er_common::{now_ms, BrokerConfig, CapabilityMap, WebhookMap};
use er_queue::{MemoryQueue, MemoryTopicPublisher};
use er_store::MemoryLoginStore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const TOPIC_PREFIX: &str = "er-event-";

fn capability_snapshot(entries: &[(&str, &[&str])]) -> CapabilityMap {
    entries
        .iter()
        .map(|(client_id, caps)| {
            (
                (*client_id).to_string(),
                caps.iter().map(|c| (*c).to_string()).collect::<BTreeSet<_>>(),
            )
        })
        .collect()
}

async fn wait_for(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Harness {
    queue: Arc<MemoryQueue>,
    publisher: Arc<MemoryTopicPublisher>,
    store: Arc<MemoryLoginStore>,
    reports: Arc<ReportLog>,
    processor: Arc<NotificationProcessor>,
    handle: JoinHandle<er_broker::Result<()>>,
}

impl Harness {
    async fn start(snapshot: CapabilityMap) -> Self {
        let queue = Arc::new(MemoryQueue::new("test-queue"));
        let publisher = Arc::new(MemoryTopicPublisher::new());
        let store = Arc::new(MemoryLoginStore::new());
        let reports = Arc::new(ReportLog::default());

        let capabilities = Arc::new(UpdatingCache::new(
            "capabilities",
            Arc::new(StaticSnapshotFetcher::new(snapshot)),
            Duration::from_secs(3600),
        ));
        let webhooks = Arc::new(UpdatingCache::new(
            "webhooks",
            Arc::new(StaticSnapshotFetcher::new(WebhookMap::new())),
            Duration::from_secs(3600),
        ));

        let processor = Arc::new(NotificationProcessor::new(
            BrokerConfig {
                batch_size: 10,
                topic_prefix: TOPIC_PREFIX.to_string(),
                operation_timeout: Duration::from_secs(5),
            },
            queue.clone(),
            publisher.clone(),
            store.clone(),
            capabilities,
            webhooks,
            Arc::new(BrokerMetrics::new()),
            reports.clone(),
        ));

        let handle = tokio::spawn(processor.clone().start());
        {
            let processor = processor.clone();
            wait_for(move || processor.state() == ProcessorState::Running).await;
        }

        Self {
            queue,
            publisher,
            store,
            reports,
            processor,
            handle,
        }
    }

    /// Wait until every pushed message has been acked or is back in flight
    async fn drained(&self) {
        let queue = self.queue.clone();
        wait_for(move || queue.is_empty()).await;
    }

    async fn shutdown(self) {
        self.processor.stop().await.expect("stop failed");
        let result = timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("processor did not drain");
        result.expect("processor task panicked").expect("processor errored");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn login_with_client_id_is_recorded_without_publishes() {
    let harness = Harness::start(CapabilityMap::new()).await;

    harness
        .queue
        .push(r#"{"event":"login","uid":"U1","clientId":"C1","ts":1700000000}"#);
    harness.drained().await;

    assert_eq!(harness.store.login_count("U1"), 1);
    assert!(harness.publisher.published().is_empty());
    assert_eq!(harness.queue.ack_count(), 1);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn login_without_client_id_is_dropped() {
    let harness = Harness::start(CapabilityMap::new()).await;

    harness
        .queue
        .push(r#"{"event":"login","uid":"U1","ts":1700000000}"#);
    harness.drained().await;

    assert_eq!(harness.store.login_count("U1"), 0);
    assert!(harness.publisher.published().is_empty());
    assert_eq!(harness.queue.ack_count(), 1);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_logins_collapse_to_one_record() {
    let harness = Harness::start(CapabilityMap::new()).await;

    for _ in 0..3 {
        harness
            .queue
            .push(r#"{"event":"login","uid":"U1","clientId":"C1","ts":1700000000}"#);
    }
    harness.drained().await;

    assert_eq!(harness.store.login_count("U1"), 1);
    assert_eq!(harness.queue.ack_count(), 3);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_fans_out_to_every_logged_in_client() {
    let harness = Harness::start(CapabilityMap::new()).await;
    harness.store.seed("U1", &["C1", "C2"]);

    let before = now_ms();
    harness
        .queue
        .push(r#"{"event":"delete","uid":"U1","ts":1700000000}"#);
    harness.drained().await;
    let after = now_ms();

    let published = harness.publisher.published();
    let mut topics: Vec<&str> = published.iter().map(|(topic, _)| topic.as_str()).collect();
    topics.sort();
    assert_eq!(topics, vec!["er-event-C1", "er-event-C2"]);

    for (_, body) in &published {
        assert_eq!(body["event"], "delete");
        assert_eq!(body["uid"], "U1");
        assert_eq!(body["changeTime"], 1_700_000_000_000_i64);
        let timestamp = body["timestamp"].as_i64().unwrap();
        assert!((before..=after).contains(&timestamp));
        assert!(body.get("isActive").is_none());
        assert!(body.get("capabilities").is_none());
    }
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn profile_and_password_events_fan_out_with_their_labels() {
    let harness = Harness::start(CapabilityMap::new()).await;
    harness.store.seed("U1", &["C1"]);

    harness
        .queue
        .push(r#"{"event":"primaryEmailChanged","uid":"U1","ts":1700000000}"#);
    harness
        .queue
        .push(r#"{"event":"reset","uid":"U1","timestamp":1700000000500}"#);
    harness.drained().await;

    let bodies = harness.publisher.published_to("er-event-C1");
    let mut events: Vec<String> = bodies
        .iter()
        .map(|body| body["event"].as_str().unwrap().to_string())
        .collect();
    events.sort();
    assert_eq!(events, vec!["password", "profile"]);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_update_reaches_matching_logged_in_clients_only() {
    let snapshot = capability_snapshot(&[
        ("C1", &["capA", "capB"]),
        ("C2", &["capB"]),
        ("C3", &["capC"]),
    ]);
    let harness = Harness::start(snapshot).await;
    harness.store.seed("U1", &["C1", "C2", "C3"]);

    harness.queue.push(
        r#"{"event":"subscription:update","uid":"U1","eventCreatedAt":1700000000,
            "isActive":true,"productCapabilities":["capB","capD"]}"#,
    );
    harness.drained().await;

    let published = harness.publisher.published();
    let mut topics: Vec<&str> = published.iter().map(|(topic, _)| topic.as_str()).collect();
    topics.sort();
    assert_eq!(topics, vec!["er-event-C1", "er-event-C2"]);

    for (_, body) in &published {
        assert_eq!(body["event"], "subscription");
        assert_eq!(body["uid"], "U1");
        assert_eq!(body["isActive"], true);
        assert_eq!(body["changeTime"], 1_700_000_000_000_i64);
        assert_eq!(body["capabilities"], serde_json::json!(["capB"]));
    }

    // Publish timestamps are non-decreasing within the handler
    let timestamps: Vec<i64> = published
        .iter()
        .map(|(_, body)| body["timestamp"].as_i64().unwrap())
        .collect();
    assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_update_without_matching_login_publishes_nothing() {
    let snapshot = capability_snapshot(&[("C1", &["capB"]), ("C2", &["capX"])]);
    let harness = Harness::start(snapshot).await;
    harness.store.seed("U1", &["C2"]);

    harness.queue.push(
        r#"{"event":"subscription:update","uid":"U1","eventCreatedAt":1700000000,
            "isActive":true,"productCapabilities":["capB","capD"]}"#,
    );
    harness.drained().await;

    assert!(harness.publisher.published().is_empty());
    assert_eq!(harness.queue.ack_count(), 1);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_event_is_dropped_without_side_effects() {
    let harness = Harness::start(CapabilityMap::new()).await;

    harness.queue.push(r#"{"event":"helloWorld","uid":"U1"}"#);
    harness.drained().await;

    assert!(harness.publisher.published().is_empty());
    assert_eq!(harness.store.login_count("U1"), 0);
    assert_eq!(harness.queue.ack_count(), 1);
    assert_eq!(harness.queue.nack_count(), 0);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publish_leaves_message_for_redelivery() {
    let harness = Harness::start(CapabilityMap::new()).await;
    harness.store.seed("U1", &["C1", "C2"]);
    harness.publisher.fail_topic("er-event-C2");

    harness
        .queue
        .push(r#"{"event":"delete","uid":"U1","ts":1700000000}"#);

    let queue = harness.queue.clone();
    wait_for(move || queue.nack_count() >= 1).await;

    assert_eq!(harness.queue.ack_count(), 0);
    assert!(!harness.reports.is_empty());
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn datastore_failure_leaves_message_for_redelivery() {
    let harness = Harness::start(CapabilityMap::new()).await;
    harness.store.set_failing(true);

    harness
        .queue
        .push(r#"{"event":"delete","uid":"U1","ts":1700000000}"#);

    let queue = harness.queue.clone();
    wait_for(move || queue.nack_count() >= 1).await;

    assert_eq!(harness.queue.ack_count(), 0);
    assert!(!harness.reports.is_empty());
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn start_is_only_valid_once() {
    let harness = Harness::start(CapabilityMap::new()).await;

    let err = harness.processor.clone().start().await.unwrap_err();
    assert!(err.to_string().contains("start"));
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_invalid_before_start() {
    let queue = Arc::new(MemoryQueue::new("test-queue"));
    let publisher = Arc::new(MemoryTopicPublisher::new());
    let store = Arc::new(MemoryLoginStore::new());
    let capabilities = Arc::new(UpdatingCache::new(
        "capabilities",
        Arc::new(StaticSnapshotFetcher::new(CapabilityMap::new())),
        Duration::from_secs(3600),
    ));
    let webhooks = Arc::new(UpdatingCache::new(
        "webhooks",
        Arc::new(StaticSnapshotFetcher::new(WebhookMap::new())),
        Duration::from_secs(3600),
    ));

    let processor = NotificationProcessor::new(
        BrokerConfig::default(),
        queue,
        publisher,
        store,
        capabilities,
        webhooks,
        Arc::new(BrokerMetrics::new()),
        Arc::new(ReportLog::default()),
    );

    assert_eq!(processor.state(), ProcessorState::Idle);
    assert!(processor.stop().await.is_err());
}

struct FailingFetcher;

#[async_trait::async_trait]
impl SnapshotFetcher<CapabilityMap> for FailingFetcher {
    async fn fetch(&self) -> anyhow::Result<CapabilityMap> {
        anyhow::bail!("catalog unreachable")
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_initial_cache_refresh_is_fatal() {
    let queue = Arc::new(MemoryQueue::new("test-queue"));
    let publisher = Arc::new(MemoryTopicPublisher::new());
    let store = Arc::new(MemoryLoginStore::new());
    let capabilities = Arc::new(UpdatingCache::new(
        "capabilities",
        Arc::new(FailingFetcher),
        Duration::from_secs(3600),
    ));
    let webhooks = Arc::new(UpdatingCache::new(
        "webhooks",
        Arc::new(StaticSnapshotFetcher::new(WebhookMap::new())),
        Duration::from_secs(3600),
    ));

    let processor = Arc::new(NotificationProcessor::new(
        BrokerConfig::default(),
        queue,
        publisher,
        store,
        capabilities,
        webhooks,
        Arc::new(BrokerMetrics::new()),
        Arc::new(ReportLog::default()),
    ));

    let err = processor.clone().start().await.unwrap_err();
    assert!(err.to_string().contains("cache startup failed"));
    assert_eq!(processor.state(), ProcessorState::Stopped);
}
