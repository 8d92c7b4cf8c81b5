use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::scores::AggregateScores;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Recommendation,
    CompetitiveGap,
    ContentOpportunity,
}

/// One extracted, ranked recommendation as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRecommendation {
    pub text: String,
    pub kind: RecommendationKind,
    pub category: String,
    /// LLM-provided priority in [0, 1]; higher surfaces first.
    pub priority: f64,
}

/// Recommendations grouped into the three priority bands the UI renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityBands {
    pub high: Vec<RankedRecommendation>,
    pub medium: Vec<RankedRecommendation>,
    pub low: Vec<RankedRecommendation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorShare {
    pub name: String,
    pub mentions: i64,
    /// Share of all competitor mentions, 0–100 with two fractional digits.
    pub share: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorLandscape {
    pub totals: BTreeMap<String, i64>,
    /// Top five competitors by share of mentions.
    pub top: Vec<CompetitorShare>,
}

/// UI-ready denormalized snapshot. One per audit, rewritten idempotently:
/// identical inputs serialize to byte-identical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardRecord {
    pub audit_id: Uuid,
    pub scores: AggregateScores,
    pub top_insights: Vec<Insight>,
    pub recommendations: PriorityBands,
    pub competitor_landscape: CompetitorLandscape,
    pub executive_summary: String,
    pub generated_at: DateTime<Utc>,
}
