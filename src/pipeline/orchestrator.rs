//! Provider fan-out: one task per (query, provider) cell behind a global
//! semaphore. Every cell persists exactly one response row, error cells
//! included, with independent single-row writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::query::QueryRow;
use crate::models::response::NewResponse;
use crate::pipeline::progress::ProgressPublisher;
use crate::pipeline::CancelFlag;
use crate::providers::{pricing, CompletionRequest, ProviderId, ProviderRegistry};

/// Publish progress (and re-check cancellation) every this many cells.
const PROGRESS_EVERY: usize = 8;

/// Ceiling for a single cell including the caller's retries.
const CELL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Default, Clone, Copy)]
pub struct FanOutReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub launched: usize,
}

pub struct LlmOrchestrator {
    store: crate::store::postgres::PgStore,
    registry: Arc<ProviderRegistry>,
    concurrency: usize,
}

impl LlmOrchestrator {
    pub fn new(
        store: crate::store::postgres::PgStore,
        registry: Arc<ProviderRegistry>,
        concurrency: usize,
    ) -> Self {
        Self { store, registry, concurrency: concurrency.max(1) }
    }

    /// Fan the queries out to every provider. No ordering across cells; the
    /// semaphore bounds both in-flight calls and queued memory. Acquiring
    /// the permit before spawning keeps launches paced, which is also where
    /// cancellation is observed between task starts.
    pub async fn run(
        &self,
        audit_id: Uuid,
        queries: &[QueryRow],
        providers: &[ProviderId],
        progress: Arc<ProgressPublisher>,
        cancel: Arc<CancelFlag>,
    ) -> Result<FanOutReport, EngineError> {
        let total = queries.len() * providers.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let completed = Arc::new(AtomicUsize::new(0));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(total);
        let mut launched = 0usize;

        info!(%audit_id, queries = queries.len(), providers = providers.len(), total, "starting provider fan-out");

        'outer: for query in queries {
            for provider in providers {
                if cancel.is_set() {
                    debug!(%audit_id, "cancellation observed, stopping fan-out launches");
                    break 'outer;
                }
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break 'outer;
                };
                launched += 1;

                let store = self.store.clone();
                let caller = self.registry.get(*provider);
                let provider = *provider;
                let query_id = query.id;
                let query_text = query.text.clone();
                let progress = progress.clone();
                let cancel = cancel.clone();
                let completed = completed.clone();
                let succeeded = succeeded.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;

                    let row = match caller {
                        None => NewResponse {
                            audit_id,
                            query_id,
                            provider: provider.as_str().to_string(),
                            response_text: String::new(),
                            latency_ms: 0,
                            input_tokens: 0,
                            output_tokens: 0,
                            cost_usd: None,
                            error: Some("permanent: provider not configured".to_string()),
                        },
                        Some(caller) => {
                            let request =
                                CompletionRequest::text(query_text).with_timeout(CELL_TIMEOUT);
                            match caller.call(&request).await {
                                Ok(completion) => {
                                    succeeded.fetch_add(1, Ordering::SeqCst);
                                    NewResponse {
                                        audit_id,
                                        query_id,
                                        provider: provider.as_str().to_string(),
                                        response_text: completion.text,
                                        latency_ms: completion.latency_ms as i64,
                                        input_tokens: completion.input_tokens as i32,
                                        output_tokens: completion.output_tokens as i32,
                                        cost_usd: Some(pricing::estimate_cost(
                                            provider,
                                            None,
                                            completion.input_tokens,
                                            completion.output_tokens,
                                        )),
                                        error: None,
                                    }
                                }
                                Err(e) => {
                                    debug!(%audit_id, %provider, "cell failed: {e}");
                                    NewResponse {
                                        audit_id,
                                        query_id,
                                        provider: provider.as_str().to_string(),
                                        response_text: String::new(),
                                        latency_ms: 0,
                                        input_tokens: 0,
                                        output_tokens: 0,
                                        cost_usd: None,
                                        error: Some(e.row_label()),
                                    }
                                }
                            }
                        }
                    };

                    if let Err(e) = store.insert_response(&row).await {
                        warn!(%audit_id, provider = %row.provider, "response persist failed: {e}");
                    }

                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if done % PROGRESS_EVERY == 0 || done == total {
                        progress.publish("processing", done, total).await;
                        cancel.refresh(&store).await;
                    }
                }));
            }
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(%audit_id, "fan-out task panicked: {e}");
            }
        }

        let done = completed.load(Ordering::SeqCst);
        let ok = succeeded.load(Ordering::SeqCst);
        let report =
            FanOutReport { total, succeeded: ok, failed: done.saturating_sub(ok), launched };
        info!(%audit_id, total, launched = report.launched, succeeded = report.succeeded, failed = report.failed, "provider fan-out complete");
        Ok(report)
    }
}
