use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engine::pipeline::fetcher::DomainFetcher;
use engine::pipeline::processor::{JobProcessor, ProcessorSettings};
use engine::providers::ProviderRegistry;
use engine::store::postgres::PgStore;
use engine::{config, providers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // OTLP export is optional: only wired up when an endpoint is configured.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "brandscope-engine"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("failed to install OpenTelemetry tracer");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "engine=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;

    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    tracing::info!("Connecting to Redis...");
    let redis_client = redis::Client::open(cfg.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;

    let http = providers::build_http_client()?;
    let registry = Arc::new(ProviderRegistry::from_config(&cfg, &http));
    if registry.is_empty() {
        tracing::warn!("no LLM providers configured; workers will fail audits until keys are set");
    } else {
        tracing::info!(
            providers = ?registry.available().iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            "provider registry ready"
        );
    }

    let fetcher =
        Arc::new(DomainFetcher::new(Duration::from_secs(cfg.domain_fetch_timeout_secs))?);
    let settings = ProcessorSettings::from_config(&cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(cfg.worker_count);
    for n in 0..cfg.worker_count {
        let processor = JobProcessor::new(
            db.clone(),
            registry.clone(),
            fetcher.clone(),
            redis_conn.clone(),
            settings.clone(),
            format!("worker-{n}"),
        );
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { processor.run_worker(rx).await }));
    }
    tracing::info!(workers = cfg.worker_count, "audit engine running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; letting in-flight audits finish");
    let _ = shutdown_tx.send(true);

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!("worker join failed: {e}");
        }
    }
    tracing::info!("all workers stopped");
    Ok(())
}
