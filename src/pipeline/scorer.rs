//! Per-audit roll-up: weighted overall score plus per-provider and
//! per-category breakdowns, computed over non-errored analyses and written
//! in one atomic upsert.

use std::collections::BTreeMap;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::analysis::CompetitorMention;
use crate::models::scores::{AggregateScores, ScoreBreakdown};
use crate::store::postgres::{AnalysisCellRow, PgStore};

const W_GEO: f64 = 0.30;
const W_SOV: f64 = 0.25;
const W_RECOMMENDATION: f64 = 0.20;
const W_SENTIMENT: f64 = 0.15;
const W_VISIBILITY: f64 = 0.10;

/// One analysis with its provider and category, as the formulas consume it.
#[derive(Debug, Clone)]
pub struct AnalyzedCell {
    pub provider: String,
    pub category: String,
    pub errored: bool,
    pub brand_mentioned: bool,
    pub sentiment_score: f64,
    pub geo: f64,
    pub sov: f64,
    pub completeness: f64,
    pub recommendation: f64,
    pub competitors: Vec<CompetitorMention>,
}

impl From<AnalysisCellRow> for AnalyzedCell {
    fn from(row: AnalysisCellRow) -> Self {
        fn f(d: Decimal) -> f64 {
            d.to_f64().unwrap_or(0.0)
        }
        Self {
            provider: row.provider,
            category: row.category,
            errored: row.error.is_some(),
            brand_mentioned: row.brand_mentioned,
            sentiment_score: f(row.sentiment_score),
            geo: f(row.geo_score),
            sov: f(row.sov_score),
            completeness: f(row.context_completeness),
            recommendation: f(row.recommendation_score),
            competitors: row.competitors.0,
        }
    }
}

/// `overall = 0.30·GEO + 0.25·SOV + 0.20·rec + 0.15·sentiment₁₀₀ + 0.10·visibility`.
pub fn overall_score(
    geo: f64,
    sov: f64,
    recommendation: f64,
    sentiment_100: f64,
    visibility: f64,
) -> f64 {
    W_GEO * geo
        + W_SOV * sov
        + W_RECOMMENDATION * recommendation
        + W_SENTIMENT * sentiment_100
        + W_VISIBILITY * visibility
}

fn dec2(v: f64) -> Decimal {
    let mut d = Decimal::from_f64(v).unwrap_or_default().round_dp(2);
    d.rescale(2);
    d
}

/// Roll up one subset of cells. Errored analyses are excluded from every
/// mean and from the visibility denominator; an empty subset scores zero
/// across the board rather than NaN.
fn breakdown(cells: &[&AnalyzedCell]) -> ScoreBreakdown {
    let usable: Vec<&&AnalyzedCell> = cells.iter().filter(|c| !c.errored).collect();
    let n = usable.len();
    if n == 0 {
        return ScoreBreakdown {
            overall: Decimal::ZERO,
            geo: Decimal::ZERO,
            sov: Decimal::ZERO,
            recommendation: Decimal::ZERO,
            sentiment: Decimal::ZERO,
            visibility: Decimal::ZERO,
            context_completeness: Decimal::ZERO,
            analyzed: 0,
        };
    }

    let count = n as f64;
    let geo = usable.iter().map(|c| c.geo).sum::<f64>() / count;
    let sov = usable.iter().map(|c| c.sov).sum::<f64>() / count;
    let recommendation = usable.iter().map(|c| c.recommendation).sum::<f64>() / count;
    let completeness = usable.iter().map(|c| c.completeness).sum::<f64>() / count;
    let sentiment_mean = usable.iter().map(|c| c.sentiment_score).sum::<f64>() / count;
    let sentiment_100 = 50.0 * (sentiment_mean + 1.0);
    let visibility =
        100.0 * usable.iter().filter(|c| c.brand_mentioned).count() as f64 / count;

    ScoreBreakdown {
        overall: dec2(overall_score(geo, sov, recommendation, sentiment_100, visibility)),
        geo: dec2(geo),
        sov: dec2(sov),
        recommendation: dec2(recommendation),
        sentiment: dec2(sentiment_100),
        visibility: dec2(visibility),
        context_completeness: dec2(completeness),
        analyzed: n as i64,
    }
}

/// Aggregate every cell of an audit into the persisted roll-up.
pub fn aggregate(cells: &[AnalyzedCell]) -> AggregateScores {
    let all: Vec<&AnalyzedCell> = cells.iter().collect();
    let top = breakdown(&all);

    let mut by_provider: BTreeMap<String, Vec<&AnalyzedCell>> = BTreeMap::new();
    let mut by_category: BTreeMap<String, Vec<&AnalyzedCell>> = BTreeMap::new();
    for cell in cells {
        by_provider.entry(cell.provider.clone()).or_default().push(cell);
        by_category.entry(cell.category.clone()).or_default().push(cell);
    }

    let mut competitor_mentions: BTreeMap<String, i64> = BTreeMap::new();
    for cell in cells.iter().filter(|c| !c.errored) {
        for mention in &cell.competitors {
            *competitor_mentions.entry(mention.name.clone()).or_insert(0) += mention.mentions;
        }
    }

    AggregateScores {
        overall: top.overall,
        geo: top.geo,
        sov: top.sov,
        recommendation: top.recommendation,
        sentiment: top.sentiment,
        visibility: top.visibility,
        context_completeness: top.context_completeness,
        providers: by_provider.into_iter().map(|(k, v)| (k, breakdown(&v))).collect(),
        categories: by_category.into_iter().map(|(k, v)| (k, breakdown(&v))).collect(),
        competitor_mentions,
    }
}

pub struct AggregateScorer {
    store: PgStore,
}

impl AggregateScorer {
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }

    pub async fn run(&self, audit_id: Uuid) -> Result<AggregateScores, EngineError> {
        let cells: Vec<AnalyzedCell> = self
            .store
            .load_analysis_cells(audit_id)
            .await?
            .into_iter()
            .map(AnalyzedCell::from)
            .collect();
        let scores = aggregate(&cells);
        self.store.upsert_aggregates(audit_id, &scores).await?;
        info!(%audit_id, overall = %scores.overall, analyzed = cells.iter().filter(|c| !c.errored).count(), "aggregate scores written");
        Ok(scores)
    }
}
