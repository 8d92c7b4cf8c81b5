use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    pub fn parse(s: &str) -> Option<Sentiment> {
        match s.trim().to_lowercase().as_str() {
            "positive" => Some(Sentiment::Positive),
            "neutral" | "mixed" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorMention {
    pub name: String,
    /// Character offset of the first mention, when the name appears in the
    /// text; LLM-surfaced competitors without a verbatim hit are dropped
    /// upstream, so this is always present for persisted mentions.
    pub position: Option<i64>,
    pub mentions: i64,
}

/// Result of analyzing one response. All score fields are 0–100 except
/// `sentiment_score` which is signed in [-1, 1]. An errored analysis keeps
/// the scores at zero and records what went wrong.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub audit_id: Uuid,
    pub response_id: Uuid,
    pub brand_mentioned: bool,
    pub first_mention_pos: Option<i64>,
    pub brand_mentions: i64,
    pub sentiment: Sentiment,
    pub sentiment_score: f64,
    pub competitors: Vec<CompetitorMention>,
    pub geo_score: f64,
    pub sov_score: f64,
    pub context_completeness: f64,
    pub recommendation_score: f64,
    pub recommendations: Vec<String>,
    pub error: Option<String>,
}

impl NewAnalysis {
    pub fn errored(audit_id: Uuid, response_id: Uuid, error: String) -> Self {
        Self {
            audit_id,
            response_id,
            brand_mentioned: false,
            first_mention_pos: None,
            brand_mentions: 0,
            sentiment: Sentiment::Neutral,
            sentiment_score: 0.0,
            competitors: vec![],
            geo_score: 0.0,
            sov_score: 0.0,
            context_completeness: 0.0,
            recommendation_score: 0.0,
            recommendations: vec![],
            error: Some(error),
        }
    }

    /// Clamp every score into its documented range before persistence.
    pub fn clamped(mut self) -> Self {
        self.sentiment_score = self.sentiment_score.clamp(-1.0, 1.0);
        self.geo_score = self.geo_score.clamp(0.0, 100.0);
        self.sov_score = self.sov_score.clamp(0.0, 100.0);
        self.context_completeness = self.context_completeness.clamp(0.0, 100.0);
        self.recommendation_score = self.recommendation_score.clamp(0.0, 100.0);
        self
    }
}
