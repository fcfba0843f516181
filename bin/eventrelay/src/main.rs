//! EventRelay Broker
//!
//! Consumes service notifications from the upstream queue and fans them
//! out to per-client topics. Runs the capability and webhook catalog
//! caches alongside the processor and serves a small operational HTTP
//! surface (health, metrics, recent error reports).
//!
//! `--embedded` swaps the SQS/SNS/Postgres adapters for in-memory ones
//! and accepts messages over `POST /messages` for local development.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use er_broker::{BrokerMetrics, NotificationProcessor, ReportLog};
use er_cache::{
    CapabilityCatalogFetcher, StaticSnapshotFetcher, UpdatingCache, WebhookCatalogFetcher,
};
use er_common::{BrokerConfig, CapabilityMap, DatastoreConfig, Webhook, WebhookMap};
use er_queue::{
    MemoryQueue, MemoryTopicPublisher, QueueConsumer, SnsTopicPublisher, SqsQueueConsumer,
    TopicPublisher,
};
use er_store::{LoginStore, MemoryLoginStore, PgLoginStore};

/// EventRelay service notification broker
#[derive(Parser, Debug)]
#[command(name = "eventrelay")]
#[command(about = "EventRelay - service notification broker")]
struct Args {
    /// Upstream SQS queue URL
    #[arg(long, env = "ER_QUEUE_URL", default_value = "http://localhost:4566/000000000000/er-notifications")]
    queue_url: String,

    /// Prefix prepended to a client ID to form the outbound topic name
    #[arg(long, env = "ER_TOPIC_PREFIX", default_value = "er-event-")]
    topic_prefix: String,

    /// SNS topic ARN prefix, e.g. arn:aws:sns:us-east-1:123456789012:
    #[arg(long, env = "ER_TOPIC_ARN_PREFIX", default_value = "")]
    topic_arn_prefix: String,

    /// Max messages per poll; all are handled concurrently
    #[arg(long, env = "ER_BATCH_SIZE", default_value = "10")]
    batch_size: usize,

    /// Per-operation timeout for datastore calls and publishes, seconds
    #[arg(long, env = "ER_OPERATION_TIMEOUT_SECS", default_value = "10")]
    operation_timeout_secs: u64,

    /// Capability catalog URL
    #[arg(long, env = "ER_CAPABILITY_CATALOG_URL", default_value = "http://localhost:8090/v1/capabilities")]
    capability_catalog_url: String,

    /// Webhook catalog URL
    #[arg(long, env = "ER_WEBHOOK_CATALOG_URL", default_value = "http://localhost:8090/v1/webhooks")]
    webhook_catalog_url: String,

    /// Capability cache refresh interval, seconds
    #[arg(long, env = "ER_CAPABILITY_REFRESH_SECS", default_value = "60")]
    capability_refresh_secs: u64,

    /// Webhook cache refresh interval, seconds
    #[arg(long, env = "ER_WEBHOOK_REFRESH_SECS", default_value = "60")]
    webhook_refresh_secs: u64,

    #[arg(long, env = "ER_DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "ER_DB_PORT", default_value = "5432")]
    db_port: u16,

    #[arg(long, env = "ER_DB_USER", default_value = "eventrelay")]
    db_user: String,

    #[arg(long, env = "ER_DB_PASSWORD", default_value = "eventrelay")]
    db_password: String,

    #[arg(long, env = "ER_DB_NAME", default_value = "eventrelay")]
    db_name: String,

    #[arg(long, env = "ER_DB_MAX_CONNECTIONS", default_value = "10")]
    db_max_connections: u32,

    /// Operational HTTP port (health, metrics, reports)
    #[arg(long, env = "ER_HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Run on in-memory queue, publisher, store, and catalogs
    #[arg(long, env = "ER_EMBEDDED", default_value = "false")]
    embedded: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CacheLabels {
    cache: String,
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<BrokerMetrics>,
    reports: Arc<ReportLog>,
    capabilities: Arc<UpdatingCache<CapabilityMap>>,
    webhooks: Arc<UpdatingCache<WebhookMap>>,
    processor: Arc<NotificationProcessor>,
    cache_refreshes: Family<CacheLabels, Gauge>,
    cache_failures: Family<CacheLabels, Gauge>,
    embedded_queue: Option<Arc<MemoryQueue>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    info!(embedded = args.embedded, "Starting EventRelay broker");

    let metrics = Arc::new(BrokerMetrics::new());
    let reports = Arc::new(ReportLog::default());

    // Cache refresh counters are collected at scrape time
    let cache_refreshes = Family::<CacheLabels, Gauge>::default();
    let cache_failures = Family::<CacheLabels, Gauge>::default();
    {
        let mut registry = metrics.registry.lock().unwrap();
        registry.register(
            "relay_cache_refreshes",
            "Completed catalog cache refreshes",
            cache_refreshes.clone(),
        );
        registry.register(
            "relay_cache_refresh_failures",
            "Failed catalog cache refreshes",
            cache_failures.clone(),
        );
    }

    let (capabilities, webhooks) = build_caches(&args)?;

    let mut embedded_queue = None;
    let (consumer, publisher, store): (
        Arc<dyn QueueConsumer>,
        Arc<dyn TopicPublisher>,
        Arc<dyn LoginStore>,
    ) = if args.embedded {
        info!("Embedded mode: in-memory queue, publisher, and login store");
        let queue = Arc::new(MemoryQueue::new("embedded-queue"));
        embedded_queue = Some(queue.clone());
        (
            queue,
            Arc::new(MemoryTopicPublisher::new()),
            Arc::new(MemoryLoginStore::new()),
        )
    } else {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let sqs_client = aws_sdk_sqs::Client::new(&aws_config);
        let sns_client = aws_sdk_sns::Client::new(&aws_config);

        let datastore = DatastoreConfig {
            host: args.db_host.clone(),
            port: args.db_port,
            username: args.db_user.clone(),
            password: args.db_password.clone(),
            database: args.db_name.clone(),
            max_connections: args.db_max_connections,
        };
        let pool = PgPoolOptions::new()
            .max_connections(datastore.max_connections)
            .connect(&datastore.connect_url())
            .await?;
        let store = PgLoginStore::new(pool);
        store.init_schema().await?;
        info!(host = %datastore.host, database = %datastore.database, "Login store ready");

        (
            Arc::new(SqsQueueConsumer::new(sqs_client, args.queue_url.clone())),
            Arc::new(SnsTopicPublisher::new(
                sns_client,
                args.topic_arn_prefix.clone(),
            )),
            Arc::new(store),
        )
    };

    let broker_config = BrokerConfig {
        batch_size: args.batch_size,
        topic_prefix: args.topic_prefix.clone(),
        operation_timeout: Duration::from_secs(args.operation_timeout_secs),
    };

    let processor = Arc::new(NotificationProcessor::new(
        broker_config,
        consumer,
        publisher,
        store,
        capabilities.clone(),
        webhooks.clone(),
        metrics.clone(),
        reports.clone(),
    ));

    // The processor runs the caches' initial refresh before its first poll;
    // a failure there surfaces below as a fatal startup error.
    let mut processor_task = tokio::spawn({
        let processor = processor.clone();
        async move { processor.start().await }
    });

    let state = AppState {
        metrics,
        reports,
        capabilities,
        webhooks,
        processor: processor.clone(),
        cache_refreshes,
        cache_failures,
        embedded_queue,
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/reports", get(reports_handler))
        .route("/messages", post(publish_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", args.http_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(port = args.http_port, "Operational HTTP server listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("EventRelay broker started. Press Ctrl+C to shutdown.");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received...");
            if let Err(e) = processor.stop().await {
                warn!(error = %e, "stop rejected");
            }
            match tokio::time::timeout(Duration::from_secs(30), &mut processor_task).await {
                Ok(Ok(Ok(()))) => info!("Processor drained"),
                Ok(Ok(Err(e))) => error!(error = %e, "Processor exited with error"),
                Ok(Err(e)) => error!(error = %e, "Processor task failed"),
                Err(_) => warn!("Processor drain timed out"),
            }
        }
        result = &mut processor_task => {
            server_task.abort();
            return match result {
                Ok(Ok(())) => Ok(()),
                // Fatal startup, e.g. an initial catalog refresh failure
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow::anyhow!("processor task panicked: {e}")),
            };
        }
    }

    server_task.abort();
    info!("EventRelay broker shutdown complete");
    Ok(())
}

fn build_caches(
    args: &Args,
) -> Result<(
    Arc<UpdatingCache<CapabilityMap>>,
    Arc<UpdatingCache<WebhookMap>>,
)> {
    if args.embedded {
        // A demo client so subscription fan-out is exercisable locally
        let mut capabilities = CapabilityMap::new();
        capabilities.insert(
            "demo-rp".to_string(),
            ["demo".to_string()].into_iter().collect(),
        );
        let mut webhooks = WebhookMap::new();
        webhooks.insert(
            "demo-rp".to_string(),
            Webhook {
                url: "http://localhost:9091/webhook".to_string(),
                enabled: true,
            },
        );

        return Ok((
            Arc::new(UpdatingCache::new(
                "capabilities",
                Arc::new(StaticSnapshotFetcher::new(capabilities)),
                Duration::from_secs(args.capability_refresh_secs),
            )),
            Arc::new(UpdatingCache::new(
                "webhooks",
                Arc::new(StaticSnapshotFetcher::new(webhooks)),
                Duration::from_secs(args.webhook_refresh_secs),
            )),
        ));
    }

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()?;

    Ok((
        Arc::new(UpdatingCache::new(
            "capabilities",
            Arc::new(CapabilityCatalogFetcher::new(
                http.clone(),
                args.capability_catalog_url.clone(),
            )),
            Duration::from_secs(args.capability_refresh_secs),
        )),
        Arc::new(UpdatingCache::new(
            "webhooks",
            Arc::new(WebhookCatalogFetcher::new(
                http,
                args.webhook_catalog_url.clone(),
            )),
            Duration::from_secs(args.webhook_refresh_secs),
        )),
    ))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "state": state.processor.state().to_string(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Refresh the cache gauges before encoding
    for (name, cache_stats) in [
        ("capabilities", state.capabilities.stats()),
        ("webhooks", state.webhooks.stats()),
    ] {
        let labels = CacheLabels {
            cache: name.to_string(),
        };
        state
            .cache_refreshes
            .get_or_create(&labels)
            .set(cache_stats.refreshes as i64);
        state
            .cache_failures
            .get_or_create(&labels)
            .set(cache_stats.failures as i64);
    }

    let mut buf = String::new();
    {
        let registry = state.metrics.registry.lock().unwrap();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buf, &registry) {
            error!(error = %e, "Failed to encode metrics");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        buf,
    )
        .into_response()
}

async fn reports_handler(State(state): State<AppState>) -> Json<Vec<er_broker::Report>> {
    Json(state.reports.recent(100))
}

/// Accepts raw notification payloads in embedded mode
async fn publish_message(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match &state.embedded_queue {
        Some(queue) => {
            let message_id = queue.push(body.to_string());
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "messageId": message_id })),
            )
                .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            "message injection is only available in embedded mode",
        )
            .into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
