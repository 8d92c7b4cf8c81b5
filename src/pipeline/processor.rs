//! Top-level audit state machine.
//!
//! A worker claims one pending audit at a time and drives it through
//! `processing → analyzing → scoring → populating → completed`, with
//! heartbeats while in flight, cancellation observed at phase boundaries,
//! and every failure path funneled into a terminal `failed` with a readable
//! message.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::EngineError;
use crate::models::audit::{AuditRow, AuditStatus};
use crate::pipeline::analyzer::ResponseAnalyzer;
use crate::pipeline::dashboard::DashboardPopulator;
use crate::pipeline::fetcher::DomainFetcher;
use crate::pipeline::generator::QueryGenerator;
use crate::pipeline::orchestrator::LlmOrchestrator;
use crate::pipeline::progress::ProgressPublisher;
use crate::pipeline::recommender::RecommendationExtractor;
use crate::pipeline::scorer::AggregateScorer;
use crate::pipeline::CancelFlag;
use crate::providers::{ProviderId, ProviderRegistry};
use crate::store::postgres::PgStore;

/// Idle delay between claim attempts when the queue is empty.
const CLAIM_IDLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
}

/// Knobs the processor needs from the full config.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub orchestrator_concurrency: usize,
    pub analyzer_concurrency: usize,
    pub default_query_count: usize,
    pub heartbeat_interval: Duration,
}

impl ProcessorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            orchestrator_concurrency: cfg.orchestrator_concurrency,
            analyzer_concurrency: cfg.analyzer_concurrency,
            default_query_count: cfg.default_query_count,
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
        }
    }
}

pub struct JobProcessor {
    store: PgStore,
    registry: Arc<ProviderRegistry>,
    fetcher: Arc<DomainFetcher>,
    redis: ConnectionManager,
    settings: ProcessorSettings,
    worker_id: String,
}

impl JobProcessor {
    pub fn new(
        store: PgStore,
        registry: Arc<ProviderRegistry>,
        fetcher: Arc<DomainFetcher>,
        redis: ConnectionManager,
        settings: ProcessorSettings,
        worker_id: String,
    ) -> Self {
        Self { store, registry, fetcher, redis, settings, worker_id }
    }

    /// Worker loop: claim, process, repeat. Stops claiming when shutdown is
    /// signalled; an in-flight audit finishes first.
    pub async fn run_worker(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let claimed = match self.store.claim_pending_audit(&self.worker_id).await {
                Ok(c) => c,
                Err(e) => {
                    error!(worker = %self.worker_id, "claim failed: {e}");
                    None
                }
            };
            match claimed {
                Some(audit) => self.process_audit(audit).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(CLAIM_IDLE) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }

    /// Drive one claimed audit to a terminal state. Never returns an error:
    /// every failure ends in `failed` with a message on the row.
    pub async fn process_audit(&self, audit: AuditRow) {
        let audit_id = audit.id;
        info!(%audit_id, worker = %self.worker_id, "audit claimed");

        let progress = Arc::new(ProgressPublisher::new(self.redis.clone(), audit_id));
        let heartbeat = self.spawn_heartbeat(audit_id);

        let result = self.drive(&audit, progress.clone()).await;
        heartbeat.abort();

        match result {
            Ok(Outcome::Completed) => info!(%audit_id, "audit completed"),
            Ok(Outcome::Cancelled) => info!(%audit_id, "audit cancelled"),
            Err(e) => {
                let message = e.user_message();
                error!(%audit_id, "audit failed: {message}");
                if let Err(persist) = self.store.mark_failed(audit_id, &message).await {
                    error!(%audit_id, "could not record failure: {persist}");
                }
            }
        }
    }

    fn spawn_heartbeat(&self, audit_id: Uuid) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; claim already stamped one
            loop {
                ticker.tick().await;
                if let Err(e) = store.touch_heartbeat(audit_id).await {
                    warn!(%audit_id, "heartbeat write failed: {e}");
                }
            }
        })
    }

    async fn drive(
        &self,
        audit: &AuditRow,
        progress: Arc<ProgressPublisher>,
    ) -> Result<Outcome, EngineError> {
        let audit_id = audit.id;

        // Resolve providers requested for this audit against the registry.
        let requested: Vec<ProviderId> =
            audit.providers.0.iter().filter_map(|p| ProviderId::parse(p)).collect();
        if requested.is_empty() && !audit.providers.0.is_empty() {
            return Err(EngineError::Fatal(format!(
                "unknown provider ids requested: {}",
                audit.providers.0.join(", ")
            )));
        }
        let providers: Vec<ProviderId> =
            if requested.is_empty() { self.registry.available() } else { requested };
        if providers.iter().all(|p| self.registry.get(*p).is_none()) {
            return Err(EngineError::Fatal(format!(
                "none of the requested providers are configured: {}",
                audit.providers.0.join(", ")
            )));
        }
        let backend = self
            .registry
            .primary()
            .ok_or_else(|| EngineError::Fatal("no provider configured for analysis".to_string()))?;

        let profile = self
            .store
            .get_company(audit.company_id)
            .await?
            .ok_or_else(|| EngineError::Fatal(format!("company {} not found", audit.company_id)))?;
        profile.validate().map_err(EngineError::Fatal)?;

        let cancel = Arc::new(CancelFlag::new(audit_id));

        // ── processing: generation + fan-out ────────────────────
        let target = if audit.query_count > 0 {
            audit.query_count as usize
        } else {
            self.settings.default_query_count
        };
        let generator = QueryGenerator::new(backend.clone(), target);
        let generated = generator.generate(&profile).await?;
        self.store.insert_queries(audit_id, &generated).await?;
        let queries = self.store.list_queries(audit_id).await?;
        info!(%audit_id, generated = generated.len(), persisted = queries.len(), "queries ready");
        progress.publish("processing", 0, queries.len() * providers.len()).await;

        if let Some(outcome) = self.checkpoint(audit_id, &cancel).await? {
            return Ok(outcome);
        }

        let orchestrator =
            LlmOrchestrator::new(self.store.clone(), self.registry.clone(), self.settings.orchestrator_concurrency);
        orchestrator.run(audit_id, &queries, &providers, progress.clone(), cancel.clone()).await?;

        // ── analyzing ───────────────────────────────────────────
        if let Some(outcome) =
            self.advance(audit_id, AuditStatus::Processing, AuditStatus::Analyzing).await?
        {
            return Ok(outcome);
        }
        let analyzer = ResponseAnalyzer::new(
            self.store.clone(),
            backend.clone(),
            self.fetcher.clone(),
            self.settings.analyzer_concurrency,
        );
        analyzer.run(audit_id, &profile, progress.clone(), cancel.clone()).await?;

        // ── scoring ─────────────────────────────────────────────
        if let Some(outcome) =
            self.advance(audit_id, AuditStatus::Analyzing, AuditStatus::Scoring).await?
        {
            return Ok(outcome);
        }
        let scorer = AggregateScorer::new(self.store.clone());
        let scores = scorer.run(audit_id).await?;

        // ── populating ──────────────────────────────────────────
        if let Some(outcome) =
            self.advance(audit_id, AuditStatus::Scoring, AuditStatus::Populating).await?
        {
            return Ok(outcome);
        }
        let extractor = RecommendationExtractor::new(self.store.clone(), backend.clone());
        let recommendations = extractor.run(audit_id, &profile.name).await?;

        let populator = DashboardPopulator::new(self.store.clone(), backend.clone());
        populator.run(audit_id, &profile, &scores, &recommendations).await?;
        progress.dashboard_ready().await;

        // ── completed ───────────────────────────────────────────
        let finalized =
            self.store.finalize_completed(audit_id, scores.overall, scores.visibility).await?;
        if !finalized {
            // Raced with an external transition; surface what actually happened.
            return self.resolve_race(audit_id).await;
        }
        Ok(Outcome::Completed)
    }

    /// Phase boundary: CAS the status forward. `Some(outcome)` means the
    /// audit left the normal path (cancellation) and processing must stop.
    async fn advance(
        &self,
        audit_id: Uuid,
        from: AuditStatus,
        to: AuditStatus,
    ) -> Result<Option<Outcome>, EngineError> {
        if self.store.transition_status(audit_id, from, to).await? {
            debug!(%audit_id, %from, %to, "phase transition");
            return Ok(None);
        }
        self.resolve_race(audit_id).await.map(Some)
    }

    /// Lightweight boundary check where no status change is due yet.
    async fn checkpoint(
        &self,
        audit_id: Uuid,
        cancel: &Arc<CancelFlag>,
    ) -> Result<Option<Outcome>, EngineError> {
        cancel.refresh(&self.store).await;
        if !cancel.is_set() {
            return Ok(None);
        }
        self.resolve_race(audit_id).await.map(Some)
    }

    /// The expected CAS failed or a cancel flag fired: read the actual
    /// status and settle the audit accordingly.
    async fn resolve_race(&self, audit_id: Uuid) -> Result<Outcome, EngineError> {
        match self.store.audit_status(audit_id).await? {
            Some(AuditStatus::CancelRequested) => {
                self.store.mark_cancelled(audit_id).await?;
                Ok(Outcome::Cancelled)
            }
            Some(AuditStatus::Cancelled) => Ok(Outcome::Cancelled),
            Some(AuditStatus::Failed) => {
                Err(EngineError::Fatal("audit was failed externally".to_string()))
            }
            other => Err(EngineError::Fatal(format!(
                "audit left the expected lifecycle (status: {})",
                other.map(|s| s.as_str().to_string()).unwrap_or_else(|| "missing".to_string())
            ))),
        }
    }
}
