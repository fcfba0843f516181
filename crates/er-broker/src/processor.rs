//! NotificationProcessor - consumer loop, dispatch, and fan-out
//!
//! Pulls batches from the upstream queue, decodes each message, and
//! dispatches by event kind: logins are persisted, everything else fans
//! out to the per-client topics of the clients the user has logged into.
//! Subscription changes additionally join against the capability snapshot
//! so a client only hears about capabilities it serves.
//!
//! Delivery contract: at-least-once. A handler error leaves the message
//! unacknowledged and the upstream queue redelivers it after the
//! visibility timeout; downstream consumers must be idempotent.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use er_cache::UpdatingCache;
use er_common::{now_ms, BrokerConfig, CapabilityMap, OutboundMessage, QueuedMessage, WebhookMap};
use er_queue::{QueueConsumer, TopicPublisher};
use er_store::LoginStore;

use crate::codec::{
    decode, AccountEvent, EventKind, LoginNotification, ServiceNotification,
    SubscriptionUpdateNotification,
};
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::report::{ReportCategory, ReportLog, ReportSeverity};
use crate::Result;

/// Processor lifecycle. `start()` is valid only in Idle, `stop()` only in
/// Running; Stopping drains in-flight handlers before reaching Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessorState::Idle => "idle",
            ProcessorState::Running => "running",
            ProcessorState::Stopping => "stopping",
            ProcessorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct NotificationProcessor {
    config: BrokerConfig,
    consumer: Arc<dyn QueueConsumer>,
    publisher: Arc<dyn TopicPublisher>,
    store: Arc<dyn LoginStore>,
    capabilities: Arc<UpdatingCache<CapabilityMap>>,
    /// Not read by the processor itself; kept running for the downstream
    /// webhook delivery worker.
    webhooks: Arc<UpdatingCache<WebhookMap>>,
    metrics: Arc<BrokerMetrics>,
    reports: Arc<ReportLog>,
    state: Mutex<ProcessorState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NotificationProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BrokerConfig,
        consumer: Arc<dyn QueueConsumer>,
        publisher: Arc<dyn TopicPublisher>,
        store: Arc<dyn LoginStore>,
        capabilities: Arc<UpdatingCache<CapabilityMap>>,
        webhooks: Arc<UpdatingCache<WebhookMap>>,
        metrics: Arc<BrokerMetrics>,
        reports: Arc<ReportLog>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            consumer,
            publisher,
            store,
            capabilities,
            webhooks,
            metrics,
            reports,
            state: Mutex::new(ProcessorState::Idle),
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    /// Start the caches and run the consumer loop until `stop()`.
    ///
    /// Both caches complete their initial refresh before the first poll,
    /// so no subscription event can observe missing routing data. An
    /// initial refresh failure is returned as an error; the broker is
    /// unsafe to run without catalog data and the caller should exit.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.transition(ProcessorState::Idle, ProcessorState::Running, "start")?;

        // Subscribe before the caches start so a stop() issued during
        // startup is not lost
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Without routing data the broker is unsafe to run
        if let Err(e) = self.capabilities.start().await {
            *self.state.lock() = ProcessorState::Stopped;
            return Err(BrokerError::CacheStartup(e));
        }
        if let Err(e) = self.webhooks.start().await {
            self.capabilities.stop();
            *self.state.lock() = ProcessorState::Stopped;
            return Err(BrokerError::CacheStartup(e));
        }

        info!(
            queue = %self.consumer.identifier(),
            batch_size = self.config.batch_size,
            topic_prefix = %self.config.topic_prefix,
            "notification processor started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("consumer loop draining");
                    break;
                }
                result = self.consumer.poll(self.config.batch_size) => {
                    match result {
                        Ok(batch) if !batch.is_empty() => {
                            self.handle_batch(batch).await;
                        }
                        Ok(_) => {
                            // No messages, brief pause
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                        Err(e) => {
                            error!(error = %e, queue = %self.consumer.identifier(), "error polling upstream queue");
                            self.reports.report(
                                ReportCategory::Consumer,
                                ReportSeverity::Error,
                                format!("poll failed: {e}"),
                                "NotificationProcessor",
                            );
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        *self.state.lock() = ProcessorState::Stopped;
        info!("notification processor stopped");
        Ok(())
    }

    /// Signal the consumer loop to drain and halt, and stop both caches.
    /// In-flight handlers run to completion before the loop exits.
    pub async fn stop(&self) -> Result<()> {
        self.transition(ProcessorState::Running, ProcessorState::Stopping, "stop")?;

        let _ = self.shutdown_tx.send(());
        self.consumer.stop().await;
        self.capabilities.stop();
        self.webhooks.stop();
        Ok(())
    }

    fn transition(
        &self,
        from: ProcessorState,
        to: ProcessorState,
        operation: &'static str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(BrokerError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// All messages in a batch are handled concurrently
    async fn handle_batch(&self, batch: Vec<QueuedMessage>) {
        join_all(batch.into_iter().map(|message| self.handle_message(message))).await;
    }

    async fn handle_message(&self, message: QueuedMessage) {
        let Some(notification) = decode(&message.body) else {
            // Redelivery cannot repair these, so delete rather than retry
            self.metrics.record_drop();
            if let Err(e) = self.consumer.ack(&message.receipt_handle).await {
                warn!(error = %e, "failed to delete dropped message");
            }
            return;
        };

        match self.dispatch(&notification).await {
            Ok(()) => {
                if let Err(e) = self.consumer.ack(&message.receipt_handle).await {
                    warn!(error = %e, "ack failed; upstream will redeliver");
                }
            }
            Err(e) => {
                let kind = notification.kind();
                self.metrics.record_handler_error(kind);
                self.reports.report(
                    category_for(&e),
                    ReportSeverity::Error,
                    e.to_string(),
                    "NotificationProcessor",
                );
                error!(
                    error = %e,
                    event_type = kind.label(),
                    uid = %notification.uid(),
                    "handler failed; leaving message for redelivery"
                );
                if let Err(nack_err) = self.consumer.nack(&message.receipt_handle, None).await {
                    warn!(error = %nack_err, "nack failed");
                }
            }
        }
    }

    async fn dispatch(&self, notification: &ServiceNotification) -> Result<()> {
        let started = Instant::now();
        let kind = notification.kind();

        let queue_delay_ms = now_ms().saturating_sub(notification.change_time_ms());
        self.metrics.record_queue_delay(queue_delay_ms as f64 / 1000.0);
        self.metrics.record_notification(kind);

        let result = match notification {
            ServiceNotification::Login(login) => self.handle_login(login).await,
            ServiceNotification::SubscriptionUpdate(update) => {
                self.handle_subscription(update).await
            }
            ServiceNotification::Delete(event)
            | ServiceNotification::ProfileChange(event)
            | ServiceNotification::PasswordChange(event) => self.fan_out(kind, event).await,
        };

        self.metrics
            .record_processing(kind, started.elapsed().as_secs_f64());

        if let ServiceNotification::SubscriptionUpdate(update) = notification {
            let event_delay_ms = now_ms().saturating_sub(update.change_time_ms());
            self.metrics
                .record_subscription_delay(event_delay_ms as f64 / 1000.0);
        }

        result
    }

    async fn handle_login(&self, login: &LoginNotification) -> Result<()> {
        let Some(client_id) = login.client_id.as_deref() else {
            debug!(uid = %login.uid, "login without clientId; nothing to record");
            return Ok(());
        };

        self.store_login_timed(&login.uid, client_id).await?;
        debug!(uid = %login.uid, client_id = %client_id, "login recorded");
        Ok(())
    }

    /// Fan a subscription change out to the logged-in clients whose
    /// capability set intersects the changed product capabilities.
    async fn handle_subscription(&self, update: &SubscriptionUpdateNotification) -> Result<()> {
        let snapshot = self.capabilities.snapshot();
        let user_clients = self.fetch_client_ids_timed(&update.uid).await?;

        let targets =
            subscription_targets(&snapshot, &user_clients, &update.product_capabilities);
        if targets.is_empty() {
            debug!(uid = %update.uid, "no logged-in client serves the changed capabilities");
            return Ok(());
        }

        let change_time = update.change_time_ms();
        let publishes = targets.into_iter().map(|(client_id, capabilities)| {
            let topic = format!("{}{}", self.config.topic_prefix, client_id);
            let body = OutboundMessage {
                event: EventKind::Subscription.label().to_string(),
                uid: update.uid.clone(),
                change_time,
                timestamp: now_ms(),
                is_active: Some(update.is_active),
                capabilities: Some(capabilities),
            };
            async move { self.publish_timed(&topic, body).await }
        });

        first_error(join_all(publishes).await)
    }

    /// Fan an account-level event out to every client the user has logged into
    async fn fan_out(&self, kind: EventKind, event: &AccountEvent) -> Result<()> {
        let user_clients = self.fetch_client_ids_timed(&event.uid).await?;
        if user_clients.is_empty() {
            debug!(uid = %event.uid, event_type = kind.label(), "user has no logged-in clients");
            return Ok(());
        }

        let publishes = user_clients.into_iter().map(|client_id| {
            let topic = format!("{}{}", self.config.topic_prefix, client_id);
            let body = OutboundMessage {
                event: kind.label().to_string(),
                uid: event.uid.clone(),
                change_time: event.change_time_ms,
                timestamp: now_ms(),
                is_active: None,
                capabilities: None,
            };
            async move { self.publish_timed(&topic, body).await }
        });

        first_error(join_all(publishes).await)
    }

    async fn store_login_timed(&self, uid: &str, client_id: &str) -> Result<()> {
        match timeout(
            self.config.operation_timeout,
            self.store.store_login(uid, client_id),
        )
        .await
        {
            Ok(result) => result.map_err(BrokerError::Datastore),
            Err(_) => Err(BrokerError::Timeout {
                operation: "storeLogin",
                after: self.config.operation_timeout,
            }),
        }
    }

    async fn fetch_client_ids_timed(&self, uid: &str) -> Result<Vec<String>> {
        match timeout(
            self.config.operation_timeout,
            self.store.fetch_client_ids(uid),
        )
        .await
        {
            Ok(result) => result.map_err(BrokerError::Datastore),
            Err(_) => Err(BrokerError::Timeout {
                operation: "fetchClientIds",
                after: self.config.operation_timeout,
            }),
        }
    }

    async fn publish_timed(&self, topic: &str, body: OutboundMessage) -> Result<String> {
        let payload = serde_json::to_value(&body)?;
        match timeout(
            self.config.operation_timeout,
            self.publisher.publish(topic, payload),
        )
        .await
        {
            Ok(Ok(message_id)) => {
                self.metrics.record_publish();
                debug!(topic = %topic, message_id = %message_id, "published");
                Ok(message_id)
            }
            Ok(Err(source)) => Err(BrokerError::Publish {
                topic: topic.to_string(),
                source,
            }),
            Err(_) => Err(BrokerError::Timeout {
                operation: "publish",
                after: self.config.operation_timeout,
            }),
        }
    }
}

/// Per-client capability lists for a subscription change.
///
/// Iterates `product_capabilities` in order, so each client's list is
/// ordered by first occurrence in the input; a capability repeated in the
/// input is repeated in the output. Only clients the user has logged into
/// survive.
fn subscription_targets(
    snapshot: &CapabilityMap,
    user_clients: &[String],
    product_capabilities: &[String],
) -> Vec<(String, Vec<String>)> {
    let mut notify: std::collections::BTreeMap<&str, Vec<String>> =
        std::collections::BTreeMap::new();
    for capability in product_capabilities {
        for (client_id, capabilities) in snapshot {
            if capabilities.contains(capability) {
                notify
                    .entry(client_id.as_str())
                    .or_default()
                    .push(capability.clone());
            }
        }
    }

    let logged_in: HashSet<&str> = user_clients.iter().map(String::as_str).collect();
    notify
        .into_iter()
        .filter(|(client_id, _)| logged_in.contains(client_id))
        .map(|(client_id, capabilities)| (client_id.to_string(), capabilities))
        .collect()
}

/// All publishes are attempted; the handler fails if any failed
fn first_error(results: Vec<Result<String>>) -> Result<()> {
    for result in results {
        result?;
    }
    Ok(())
}

fn category_for(error: &BrokerError) -> ReportCategory {
    match error {
        BrokerError::Datastore(_) => ReportCategory::Datastore,
        BrokerError::Publish { .. } => ReportCategory::Publish,
        BrokerError::Serialization(_) => ReportCategory::Codec,
        BrokerError::CacheStartup(_) => ReportCategory::CacheRefresh,
        BrokerError::Timeout { operation, .. } => {
            if *operation == "publish" {
                ReportCategory::Publish
            } else {
                ReportCategory::Datastore
            }
        }
        BrokerError::InvalidState { .. } => ReportCategory::Consumer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn snapshot(entries: &[(&str, &[&str])]) -> CapabilityMap {
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

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn targets_intersect_logins_and_capabilities() {
        let snapshot = snapshot(&[
            ("C1", &["capA", "capB"]),
            ("C2", &["capB"]),
            ("C3", &["capC"]),
        ]);
        let user_clients = strings(&["C1", "C2", "C3"]);

        let targets =
            subscription_targets(&snapshot, &user_clients, &strings(&["capB", "capD"]));

        assert_eq!(
            targets,
            vec![
                ("C1".to_string(), strings(&["capB"])),
                ("C2".to_string(), strings(&["capB"])),
            ]
        );
    }

    #[test]
    fn targets_exclude_clients_without_login() {
        let snapshot = snapshot(&[("C1", &["capB"]), ("C2", &["capX"])]);
        let user_clients = strings(&["C2"]);

        let targets =
            subscription_targets(&snapshot, &user_clients, &strings(&["capB", "capD"]));
        assert!(targets.is_empty());
    }

    #[test]
    fn capability_order_follows_input_first_occurrence() {
        let snapshot = snapshot(&[("C1", &["capA", "capB", "capC"])]);
        let user_clients = strings(&["C1"]);

        let targets = subscription_targets(
            &snapshot,
            &user_clients,
            &strings(&["capC", "capA", "capB"]),
        );
        assert_eq!(targets[0].1, strings(&["capC", "capA", "capB"]));
    }

    #[test]
    fn repeated_input_capability_is_not_deduped() {
        let snapshot = snapshot(&[("C1", &["capA"])]);
        let user_clients = strings(&["C1"]);

        let targets =
            subscription_targets(&snapshot, &user_clients, &strings(&["capA", "capA"]));
        assert_eq!(targets[0].1, strings(&["capA", "capA"]));
    }
}
