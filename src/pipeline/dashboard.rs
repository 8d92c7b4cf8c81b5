//! Dashboard population: the final, UI-ready record.
//!
//! `build_record` is a pure function of its inputs so a re-run over the same
//! stored data produces a byte-identical payload. Only the executive summary
//! comes from one last LLM call, with a deterministic fallback when the
//! model reply is unusable.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::company::CompanyProfile;
use crate::models::dashboard::{
    CompetitorLandscape, CompetitorShare, DashboardRecord, Insight, PriorityBands,
    RankedRecommendation,
};
use crate::models::scores::AggregateScores;
use crate::pipeline::parse_json_reply;
use crate::providers::{CompletionBackend, CompletionRequest};

/// Recommendations surfaced on the dashboard.
const TOP_K_RECOMMENDATIONS: usize = 10;
const HIGH_PRIORITY: f64 = 0.7;
const MEDIUM_PRIORITY: f64 = 0.4;
const TOP_COMPETITORS: usize = 5;

pub struct DashboardPopulator {
    store: crate::store::postgres::PgStore,
    backend: Arc<dyn CompletionBackend>,
}

impl DashboardPopulator {
    pub fn new(store: crate::store::postgres::PgStore, backend: Arc<dyn CompletionBackend>) -> Self {
        Self { store, backend }
    }

    /// Build and persist the record. Any error here fails the audit; the
    /// dashboard is the audit's deliverable, not optional background work.
    pub async fn run(
        &self,
        audit_id: Uuid,
        profile: &CompanyProfile,
        scores: &AggregateScores,
        recommendations: &[RankedRecommendation],
    ) -> Result<DashboardRecord, EngineError> {
        let summary = self.executive_summary(profile, scores).await;
        let record = build_record(audit_id, scores, recommendations, summary, Utc::now());
        self.store.upsert_dashboard(&record).await?;
        info!(%audit_id, "dashboard record written");
        Ok(record)
    }

    async fn executive_summary(&self, profile: &CompanyProfile, scores: &AggregateScores) -> String {
        let request = CompletionRequest::json(build_summary_prompt(profile, scores));
        match self.backend.complete(&request).await {
            Ok(completion) => match parse_json_reply::<SummaryReply>(&completion.text) {
                Ok(reply) if !reply.summary.trim().is_empty() => reply.summary.trim().to_string(),
                _ => {
                    warn!(company = %profile.name, "summary reply unusable, using fallback");
                    fallback_summary(&profile.name, scores)
                }
            },
            Err(e) => {
                warn!(company = %profile.name, "summary call failed, using fallback: {e}");
                fallback_summary(&profile.name, scores)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
}

fn build_summary_prompt(profile: &CompanyProfile, scores: &AggregateScores) -> String {
    format!(
        "Write a 3-4 sentence executive summary of an AI-visibility audit for \"{name}\".\n\
         Overall score: {overall}/100. Visibility (share of AI answers mentioning the brand): \
         {visibility}%. Share of voice vs competitors: {sov}/100. Content optimization (GEO): \
         {geo}/100. Recommendation strength: {recommendation}/100. Sentiment: {sentiment}/100.\n\
         Top competitors by mentions: {competitors}.\n\
         Address a CMO; lead with the headline result, then the biggest risk and the biggest \
         opportunity. Return a JSON object: {{\"summary\": \"...\"}}",
        name = profile.name,
        overall = scores.overall,
        visibility = scores.visibility,
        sov = scores.sov,
        geo = scores.geo,
        recommendation = scores.recommendation,
        sentiment = scores.sentiment,
        competitors = scores
            .competitor_mentions
            .iter()
            .map(|(n, c)| format!("{n} ({c})"))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Deterministic summary when the model's one is unusable.
fn fallback_summary(name: &str, scores: &AggregateScores) -> String {
    format!(
        "{name} scored {overall}/100 for AI visibility. The brand appears in {visibility}% of \
         AI assistant answers, holds a {sov}/100 share of voice against competitors, and its \
         content scores {geo}/100 for generative-engine optimization.",
        overall = scores.overall,
        visibility = scores.visibility,
        sov = scores.sov,
        geo = scores.geo,
    )
}

/// Assemble the record. Pure: identical inputs give identical output.
pub fn build_record(
    audit_id: Uuid,
    scores: &AggregateScores,
    recommendations: &[RankedRecommendation],
    executive_summary: String,
    generated_at: DateTime<Utc>,
) -> DashboardRecord {
    DashboardRecord {
        audit_id,
        scores: scores.clone(),
        top_insights: build_insights(scores),
        recommendations: priority_bands(recommendations),
        competitor_landscape: competitor_landscape(&scores.competitor_mentions),
        executive_summary,
        generated_at,
    }
}

/// Headline observations derived from the aggregates.
fn build_insights(scores: &AggregateScores) -> Vec<Insight> {
    let mut insights = vec![
        Insight {
            title: "Brand visibility".to_string(),
            detail: format!("The brand appears in {}% of analyzed AI answers.", scores.visibility),
        },
        Insight {
            title: "Share of voice".to_string(),
            detail: format!("Share of voice against competitors is {}/100.", scores.sov),
        },
        Insight {
            title: "Content optimization".to_string(),
            detail: format!("Answers citing brand content score {}/100 for GEO.", scores.geo),
        },
    ];

    if let Some((category, best)) = scores
        .categories
        .iter()
        .filter(|(_, b)| b.analyzed > 0)
        .max_by_key(|(_, b)| b.overall)
    {
        insights.push(Insight {
            title: "Strongest journey stage".to_string(),
            detail: format!("{category} answers score highest overall ({}).", best.overall),
        });
    }
    if let Some((provider, worst)) = scores
        .providers
        .iter()
        .filter(|(_, b)| b.analyzed > 0)
        .min_by_key(|(_, b)| b.overall)
    {
        insights.push(Insight {
            title: "Weakest provider".to_string(),
            detail: format!("{provider} answers score lowest overall ({}).", worst.overall),
        });
    }
    insights
}

/// Top-K recommendations split into the UI's three priority bands.
fn priority_bands(recommendations: &[RankedRecommendation]) -> PriorityBands {
    let mut bands = PriorityBands::default();
    for rec in recommendations.iter().take(TOP_K_RECOMMENDATIONS) {
        if rec.priority >= HIGH_PRIORITY {
            bands.high.push(rec.clone());
        } else if rec.priority >= MEDIUM_PRIORITY {
            bands.medium.push(rec.clone());
        } else {
            bands.low.push(rec.clone());
        }
    }
    bands
}

/// Mention totals plus the top five competitors by share.
fn competitor_landscape(mentions: &BTreeMap<String, i64>) -> CompetitorLandscape {
    let total: i64 = mentions.values().sum();
    let mut ranked: Vec<(&String, &i64)> = mentions.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let top = ranked
        .into_iter()
        .take(TOP_COMPETITORS)
        .map(|(name, &count)| CompetitorShare {
            name: name.clone(),
            mentions: count,
            share: if total > 0 {
                let mut share = Decimal::from_f64(100.0 * count as f64 / total as f64)
                    .unwrap_or_default()
                    .round_dp(2);
                share.rescale(2);
                share
            } else {
                Decimal::ZERO
            },
        })
        .collect();

    CompetitorLandscape { totals: mentions.clone(), top }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dashboard::RecommendationKind;
    use crate::models::scores::ScoreBreakdown;

    fn zero_breakdown() -> ScoreBreakdown {
        ScoreBreakdown {
            overall: Decimal::ZERO,
            geo: Decimal::ZERO,
            sov: Decimal::ZERO,
            recommendation: Decimal::ZERO,
            sentiment: Decimal::ZERO,
            visibility: Decimal::ZERO,
            context_completeness: Decimal::ZERO,
            analyzed: 0,
        }
    }

    fn scores() -> AggregateScores {
        let mut breakdown = zero_breakdown();
        breakdown.analyzed = 4;
        breakdown.overall = Decimal::from(62);
        AggregateScores {
            overall: Decimal::from(62),
            geo: Decimal::from(55),
            sov: Decimal::from(48),
            recommendation: Decimal::from(70),
            sentiment: Decimal::from(64),
            visibility: Decimal::from(81),
            context_completeness: Decimal::from(52),
            providers: BTreeMap::from([("openai".to_string(), breakdown.clone())]),
            categories: BTreeMap::from([("most_aware".to_string(), breakdown)]),
            competitor_mentions: BTreeMap::from([
                ("Globex".to_string(), 12i64),
                ("Initech".to_string(), 4i64),
                ("Umbrella".to_string(), 4i64),
            ]),
        }
    }

    fn rec(text: &str, priority: f64) -> RankedRecommendation {
        RankedRecommendation {
            text: text.into(),
            kind: RecommendationKind::Recommendation,
            category: "most_aware".into(),
            priority,
        }
    }

    #[test]
    fn record_is_byte_identical_for_identical_inputs() {
        let at: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().unwrap();
        let recs = vec![rec("a", 0.9), rec("b", 0.5), rec("c", 0.1)];
        let one = build_record(Uuid::nil(), &scores(), &recs, "summary".into(), at);
        let two = build_record(Uuid::nil(), &scores(), &recs, "summary".into(), at);
        assert_eq!(
            serde_json::to_vec(&one).unwrap(),
            serde_json::to_vec(&two).unwrap(),
            "rebuilding from identical inputs must be byte-equal"
        );
    }

    #[test]
    fn bands_split_on_priority_thresholds() {
        let recs = vec![rec("h", 0.7), rec("m", 0.69), rec("m2", 0.4), rec("l", 0.39)];
        let bands = priority_bands(&recs);
        assert_eq!(bands.high.len(), 1);
        assert_eq!(bands.medium.len(), 2);
        assert_eq!(bands.low.len(), 1);
    }

    #[test]
    fn bands_keep_only_top_k() {
        let recs: Vec<RankedRecommendation> =
            (0..15).map(|i| rec(&format!("r{i}"), 0.9)).collect();
        let bands = priority_bands(&recs);
        assert_eq!(bands.high.len(), TOP_K_RECOMMENDATIONS);
    }

    #[test]
    fn landscape_ranks_by_share_with_stable_ties() {
        let landscape = competitor_landscape(&scores().competitor_mentions);
        assert_eq!(landscape.top.len(), 3);
        assert_eq!(landscape.top[0].name, "Globex");
        assert_eq!(landscape.top[0].share.to_string(), "60.00");
        // Tie between Initech and Umbrella breaks alphabetically.
        assert_eq!(landscape.top[1].name, "Initech");
        assert_eq!(landscape.top[2].name, "Umbrella");
    }

    #[test]
    fn landscape_handles_no_mentions() {
        let landscape = competitor_landscape(&BTreeMap::new());
        assert!(landscape.top.is_empty());
        assert!(landscape.totals.is_empty());
    }

    #[test]
    fn insights_cover_visibility_and_extremes() {
        let insights = build_insights(&scores());
        assert!(insights.iter().any(|i| i.detail.contains("81%")));
        assert!(insights.iter().any(|i| i.title == "Strongest journey stage"));
        assert!(insights.iter().any(|i| i.title == "Weakest provider"));
    }

    #[test]
    fn fallback_summary_is_deterministic() {
        let s1 = fallback_summary("Acme", &scores());
        let s2 = fallback_summary("Acme", &scores());
        assert_eq!(s1, s2);
        assert!(s1.contains("62/100"));
    }
}
