use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::analysis::{CompetitorMention, NewAnalysis};
use crate::models::audit::{AuditRow, AuditStatus};
use crate::models::company::{CompanyMetadata, CompanyProfile};
use crate::models::dashboard::DashboardRecord;
use crate::models::query::{GeneratedQuery, QueryRow};
use crate::models::response::{AnalyzableResponse, NewResponse};
use crate::models::scores::AggregateScores;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn dec(v: f64, dp: u32) -> Decimal {
    Decimal::from_f64(v).unwrap_or_default().round_dp(dp)
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Audit lifecycle --

    /// Ingress used by the API collaborator (and tests): persist a pending
    /// audit for a worker to claim.
    pub async fn submit_audit(
        &self,
        company_id: Uuid,
        user_id: Uuid,
        providers: &[String],
        query_count: i32,
    ) -> anyhow::Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO audits (company_id, user_id, status, providers, query_count)
               VALUES ($1, $2, 'pending', $3, $4)
               RETURNING id"#,
        )
        .bind(company_id)
        .bind(user_id)
        .bind(Json(providers))
        .bind(query_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically claim the oldest pending audit. `SKIP LOCKED` keeps
    /// competing workers from ever holding the same audit.
    pub async fn claim_pending_audit(&self, worker_id: &str) -> anyhow::Result<Option<AuditRow>> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"UPDATE audits
               SET status = 'processing', started_at = NOW(), heartbeat_at = NOW(), worker_id = $1
               WHERE id = (
                   SELECT id FROM audits
                   WHERE status = 'pending'
                   ORDER BY created_at ASC
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, company_id, user_id, status, providers, query_count, created_at,
                         started_at, completed_at, processing_time_ms, overall_score,
                         brand_mention_rate, error_message, heartbeat_at, worker_id"#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_audit(&self, audit_id: Uuid) -> anyhow::Result<Option<AuditRow>> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"SELECT id, company_id, user_id, status, providers, query_count, created_at,
                      started_at, completed_at, processing_time_ms, overall_score,
                      brand_mention_rate, error_message, heartbeat_at, worker_id
               FROM audits WHERE id = $1"#,
        )
        .bind(audit_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn audit_status(&self, audit_id: Uuid) -> anyhow::Result<Option<AuditStatus>> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM audits WHERE id = $1")
            .bind(audit_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.as_deref().and_then(AuditStatus::parse))
    }

    /// Compare-and-set status transition. Returns false when the audit was
    /// not in `from` (raced with cancellation or another transition).
    pub async fn transition_status(
        &self,
        audit_id: Uuid,
        from: AuditStatus,
        to: AuditStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE audits SET status = $3 WHERE id = $1 AND status = $2")
            .bind(audit_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// External cancellation signal; observed by the processor at the next
    /// phase boundary or fan-out checkpoint.
    pub async fn request_cancel(&self, audit_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE audits SET status = 'cancel_requested'
               WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(audit_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(&self, audit_id: Uuid, message: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE audits
               SET status = 'failed',
                   error_message = $2,
                   completed_at = NOW(),
                   processing_time_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
               WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(audit_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_cancelled(&self, audit_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE audits
               SET status = 'cancelled',
                   completed_at = NOW(),
                   processing_time_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
               WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(audit_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal success write: timestamps, duration, and the two headline
    /// numbers denormalized onto the audit row.
    pub async fn finalize_completed(
        &self,
        audit_id: Uuid,
        overall_score: Decimal,
        brand_mention_rate: Decimal,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE audits
               SET status = 'completed',
                   completed_at = NOW(),
                   processing_time_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT,
                   overall_score = $2,
                   brand_mention_rate = $3
               WHERE id = $1 AND status IN ('populating', 'cancel_requested')"#,
        )
        .bind(audit_id)
        .bind(overall_score)
        .bind(brand_mention_rate)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_heartbeat(&self, audit_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE audits SET heartbeat_at = NOW()
               WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(audit_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Company --

    pub async fn get_company(&self, company_id: Uuid) -> anyhow::Result<Option<CompanyProfile>> {
        let row = sqlx::query_as::<_, CompanyRow>(
            r#"SELECT id, name, domain, industry, sub_industry, description,
                      original_description, final_description, value_props, audiences,
                      competitors, products, pain_points, geographies, metadata
               FROM companies WHERE id = $1"#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CompanyRow::into_profile))
    }

    // -- Queries --

    /// Batch-persist generated queries. The unique index on
    /// `(audit_id, lower(text))` makes re-runs and near-duplicates a no-op.
    pub async fn insert_queries(
        &self,
        audit_id: Uuid,
        queries: &[GeneratedQuery],
    ) -> anyhow::Result<u64> {
        let mut inserted = 0;
        for q in queries {
            let result = sqlx::query(
                r#"INSERT INTO audit_queries (audit_id, text, category, intent, priority)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (audit_id, lower(text)) DO NOTHING"#,
            )
            .bind(audit_id)
            .bind(q.text.trim())
            .bind(q.category.as_str())
            .bind(&q.intent)
            .bind(dec(q.priority, 2))
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn list_queries(&self, audit_id: Uuid) -> anyhow::Result<Vec<QueryRow>> {
        let rows = sqlx::query_as::<_, QueryRow>(
            r#"SELECT id, audit_id, text, category, intent, priority
               FROM audit_queries WHERE audit_id = $1 ORDER BY created_at ASC, id ASC"#,
        )
        .bind(audit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Responses --

    /// Independent single-cell write; the orchestrator calls this from every
    /// fan-out task, including for failed cells.
    pub async fn insert_response(&self, r: &NewResponse) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_responses
                   (audit_id, query_id, provider, response_text, latency_ms,
                    input_tokens, output_tokens, cost_usd, error)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (audit_id, query_id, provider) DO UPDATE
                   SET response_text = EXCLUDED.response_text,
                       latency_ms    = EXCLUDED.latency_ms,
                       input_tokens  = EXCLUDED.input_tokens,
                       output_tokens = EXCLUDED.output_tokens,
                       cost_usd      = EXCLUDED.cost_usd,
                       error         = EXCLUDED.error"#,
        )
        .bind(r.audit_id)
        .bind(r.query_id)
        .bind(&r.provider)
        .bind(&r.response_text)
        .bind(r.latency_ms)
        .bind(r.input_tokens)
        .bind(r.output_tokens)
        .bind(r.cost_usd)
        .bind(&r.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Responses worth analyzing: non-error cells with actual text.
    pub async fn list_analyzable_responses(
        &self,
        audit_id: Uuid,
    ) -> anyhow::Result<Vec<AnalyzableResponse>> {
        let rows = sqlx::query_as::<_, AnalyzableResponse>(
            r#"SELECT r.id, r.audit_id, r.provider, r.response_text, q.category
               FROM audit_responses r
               JOIN audit_queries q ON q.id = r.query_id
               WHERE r.audit_id = $1 AND r.error IS NULL AND r.response_text <> ''
               ORDER BY r.created_at ASC, r.id ASC"#,
        )
        .bind(audit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Analyses --

    pub async fn insert_analysis(&self, a: &NewAnalysis) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_analyses
                   (audit_id, response_id, brand_mentioned, first_mention_pos, brand_mentions,
                    sentiment, sentiment_score, competitors, geo_score, sov_score,
                    context_completeness, recommendation_score, recommendations, error)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
               ON CONFLICT (response_id) DO UPDATE
                   SET brand_mentioned      = EXCLUDED.brand_mentioned,
                       first_mention_pos    = EXCLUDED.first_mention_pos,
                       brand_mentions       = EXCLUDED.brand_mentions,
                       sentiment            = EXCLUDED.sentiment,
                       sentiment_score      = EXCLUDED.sentiment_score,
                       competitors          = EXCLUDED.competitors,
                       geo_score            = EXCLUDED.geo_score,
                       sov_score            = EXCLUDED.sov_score,
                       context_completeness = EXCLUDED.context_completeness,
                       recommendation_score = EXCLUDED.recommendation_score,
                       recommendations      = EXCLUDED.recommendations,
                       error                = EXCLUDED.error"#,
        )
        .bind(a.audit_id)
        .bind(a.response_id)
        .bind(a.brand_mentioned)
        .bind(a.first_mention_pos)
        .bind(a.brand_mentions)
        .bind(a.sentiment.as_str())
        .bind(dec(a.sentiment_score, 3))
        .bind(Json(&a.competitors))
        .bind(dec(a.geo_score, 2))
        .bind(dec(a.sov_score, 2))
        .bind(dec(a.context_completeness, 2))
        .bind(dec(a.recommendation_score, 2))
        .bind(Json(&a.recommendations))
        .bind(&a.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Everything the aggregate scorer needs, one row per analysis.
    pub async fn load_analysis_cells(&self, audit_id: Uuid) -> anyhow::Result<Vec<AnalysisCellRow>> {
        let rows = sqlx::query_as::<_, AnalysisCellRow>(
            r#"SELECT r.provider, q.category, a.brand_mentioned, a.sentiment_score,
                      a.geo_score, a.sov_score, a.context_completeness,
                      a.recommendation_score, a.competitors, a.error
               FROM audit_analyses a
               JOIN audit_responses r ON r.id = a.response_id
               JOIN audit_queries q ON q.id = r.query_id
               WHERE a.audit_id = $1"#,
        )
        .bind(audit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Analyzed response texts grouped later by category; feeds the
    /// recommendation extractor.
    pub async fn list_analyzed_texts(&self, audit_id: Uuid) -> anyhow::Result<Vec<CategoryText>> {
        let rows = sqlx::query_as::<_, CategoryText>(
            r#"SELECT q.category, r.response_text
               FROM audit_analyses a
               JOIN audit_responses r ON r.id = a.response_id
               JOIN audit_queries q ON q.id = r.query_id
               WHERE a.audit_id = $1 AND a.error IS NULL AND r.response_text <> ''
               ORDER BY r.created_at ASC, r.id ASC"#,
        )
        .bind(audit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Aggregates & dashboard --

    /// Single atomic write of the per-audit roll-up.
    pub async fn upsert_aggregates(
        &self,
        audit_id: Uuid,
        scores: &AggregateScores,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_aggregates
                   (audit_id, overall, geo, sov, recommendation, sentiment, visibility,
                    context_completeness, provider_breakdown, category_breakdown,
                    competitor_mentions)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (audit_id) DO UPDATE
                   SET overall              = EXCLUDED.overall,
                       geo                  = EXCLUDED.geo,
                       sov                  = EXCLUDED.sov,
                       recommendation       = EXCLUDED.recommendation,
                       sentiment            = EXCLUDED.sentiment,
                       visibility           = EXCLUDED.visibility,
                       context_completeness = EXCLUDED.context_completeness,
                       provider_breakdown   = EXCLUDED.provider_breakdown,
                       category_breakdown   = EXCLUDED.category_breakdown,
                       competitor_mentions  = EXCLUDED.competitor_mentions"#,
        )
        .bind(audit_id)
        .bind(scores.overall)
        .bind(scores.geo)
        .bind(scores.sov)
        .bind(scores.recommendation)
        .bind(scores.sentiment)
        .bind(scores.visibility)
        .bind(scores.context_completeness)
        .bind(Json(&scores.providers))
        .bind(Json(&scores.categories))
        .bind(Json(&scores.competitor_mentions))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent dashboard write: a prior record is overwritten wholesale.
    pub async fn upsert_dashboard(&self, record: &DashboardRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_dashboard (audit_id, payload, executive_summary, generated_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (audit_id) DO UPDATE
                   SET payload           = EXCLUDED.payload,
                       executive_summary = EXCLUDED.executive_summary,
                       generated_at      = EXCLUDED.generated_at"#,
        )
        .bind(record.audit_id)
        .bind(Json(record))
        .bind(&record.executive_summary)
        .bind(record.generated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// -- Row shapes --

#[derive(Debug, sqlx::FromRow)]
struct CompanyRow {
    id: Uuid,
    name: String,
    domain: Option<String>,
    industry: Option<String>,
    sub_industry: Option<String>,
    description: Option<String>,
    original_description: Option<String>,
    final_description: Option<String>,
    value_props: Option<Json<Vec<String>>>,
    audiences: Option<Json<Vec<String>>>,
    competitors: Option<Json<Vec<String>>>,
    products: Option<Json<Vec<String>>>,
    pain_points: Option<Json<Vec<String>>>,
    geographies: Option<Json<Vec<String>>>,
    metadata: Option<Json<CompanyMetadata>>,
}

impl CompanyRow {
    fn into_profile(self) -> CompanyProfile {
        fn unwrap(v: Option<Json<Vec<String>>>) -> Vec<String> {
            v.map(|j| j.0).unwrap_or_default()
        }
        CompanyProfile {
            id: self.id,
            name: self.name,
            domain: self.domain,
            industry: self.industry,
            sub_industry: self.sub_industry,
            description: self.description,
            original_description: self.original_description,
            final_description: self.final_description,
            value_props: unwrap(self.value_props),
            audiences: unwrap(self.audiences),
            competitors: unwrap(self.competitors),
            products: unwrap(self.products),
            pain_points: unwrap(self.pain_points),
            geographies: unwrap(self.geographies),
            metadata: self.metadata.map(|j| j.0).unwrap_or_default(),
        }
    }
}

/// One analysis joined with its response's provider and query's category.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisCellRow {
    pub provider: String,
    pub category: String,
    pub brand_mentioned: bool,
    pub sentiment_score: Decimal,
    pub geo_score: Decimal,
    pub sov_score: Decimal,
    pub context_completeness: Decimal,
    pub recommendation_score: Decimal,
    pub competitors: Json<Vec<CompetitorMention>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CategoryText {
    pub category: String,
    pub response_text: String,
}
