use kameo::prelude::*;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_persistence::actors::DeadLetterActor;
use event_persistence::config::AppConfig;
use event_persistence::domain::inventory;
use event_persistence::event_sourcing::{create_schema, ScyllaEventStore};
use event_persistence::forwarding::{
    DefaultEnvelopeMapper, ForwarderCoordinator, ScyllaCheckpointStore, ScyllaDeadLetterStore, PublishPipeline,
};
use event_persistence::messaging::RedpandaClient;
use event_persistence::metrics::{self, Metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,event_persistence=debug"))
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!("🚀 Starting event forwarder");
    tracing::info!(?config, "Configuration loaded");

    // === 1. ScyllaDB session and schema ===
    tracing::info!(nodes = ?config.scylla_nodes, "Connecting to ScyllaDB...");
    let session: Session = SessionBuilder::new()
        .known_nodes(&config.scylla_nodes)
        .build()
        .await?;
    create_schema(&session, &config.keyspace, config.replication_factor).await?;
    let session = Arc::new(session);

    let store = Arc::new(ScyllaEventStore::new(session.clone(), config.event_store_config()));

    // === 2. Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let result = actix_web::rt::System::new().block_on(metrics::start_metrics_server(metrics_registry, metrics_port));
        if let Err(e) = result {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 3. Redpanda client (with circuit breaker) and DLQ ===
    let redpanda = Arc::new(RedpandaClient::new(&config.kafka_brokers, Some(metrics.clone()))?);
    let dlq = DeadLetterActor::spawn(DeadLetterActor::new(
        Arc::new(ScyllaDeadLetterStore::new(session.clone())),
        Some(metrics.clone()),
    ));

    let pipeline = PublishPipeline::new(redpanda)
        .with_mapper(Arc::new(DefaultEnvelopeMapper::new(config.topic_prefix.clone())))
        .with_upcasters(inventory::upcasters())
        .with_error_sink(Arc::new(dlq))
        .with_metrics(metrics.clone());

    // === 4. One forwarder per shard ===
    let coordinator = ForwarderCoordinator::start(
        store,
        Arc::new(ScyllaCheckpointStore::new(session.clone())),
        Arc::new(pipeline),
        config.forwarder_config(),
        config.shards.clone(),
        Some(metrics.clone()),
    );

    tracing::info!("✅ Forwarding {} shard(s), press Ctrl+C to stop", coordinator.shard_count());
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested");

    let mut failed = 0;
    for result in coordinator.shutdown().await {
        match result {
            Ok(report) => tracing::info!(
                shard = report.shard,
                forwarded = report.forwarded,
                dead_lettered = report.dead_lettered,
                interrupted = report.interrupted,
                checkpoint = ?report.position,
                "Shard report"
            ),
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "Shard ended with error");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} forwarder shard(s) failed");
    }
    tracing::info!("👋 Event forwarder stopped");
    Ok(())
}
