use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The weighted roll-up formulas applied to any subset of analyses.
/// All fields are 0–100, rounded to two fractional digits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub overall: Decimal,
    pub geo: Decimal,
    pub sov: Decimal,
    pub recommendation: Decimal,
    pub sentiment: Decimal,
    pub visibility: Decimal,
    pub context_completeness: Decimal,
    /// Number of successfully analyzed responses the means were taken over.
    pub analyzed: i64,
}

/// Per-audit aggregate scores. Breakdown maps are ordered so the persisted
/// JSON is stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateScores {
    pub overall: Decimal,
    pub geo: Decimal,
    pub sov: Decimal,
    pub recommendation: Decimal,
    pub sentiment: Decimal,
    pub visibility: Decimal,
    pub context_completeness: Decimal,
    pub providers: BTreeMap<String, ScoreBreakdown>,
    pub categories: BTreeMap<String, ScoreBreakdown>,
    /// Total mention counts per competitor across all analyzed responses.
    pub competitor_mentions: BTreeMap<String, i64>,
}
