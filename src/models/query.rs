use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The six buyer-journey stages every generated query is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyerJourneyCategory {
    ProblemUnaware,
    ProblemAware,
    SolutionAware,
    ProductAware,
    MostAware,
    BrandDefense,
}

impl BuyerJourneyCategory {
    pub const ALL: [BuyerJourneyCategory; 6] = [
        BuyerJourneyCategory::ProblemUnaware,
        BuyerJourneyCategory::ProblemAware,
        BuyerJourneyCategory::SolutionAware,
        BuyerJourneyCategory::ProductAware,
        BuyerJourneyCategory::MostAware,
        BuyerJourneyCategory::BrandDefense,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuyerJourneyCategory::ProblemUnaware => "problem_unaware",
            BuyerJourneyCategory::ProblemAware => "problem_aware",
            BuyerJourneyCategory::SolutionAware => "solution_aware",
            BuyerJourneyCategory::ProductAware => "product_aware",
            BuyerJourneyCategory::MostAware => "most_aware",
            BuyerJourneyCategory::BrandDefense => "brand_defense",
        }
    }

    /// Lenient parse for model output: trims, lowercases, and accepts
    /// spaces or dashes for underscores.
    pub fn parse(s: &str) -> Option<BuyerJourneyCategory> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "problem_unaware" => Some(BuyerJourneyCategory::ProblemUnaware),
            "problem_aware" => Some(BuyerJourneyCategory::ProblemAware),
            "solution_aware" => Some(BuyerJourneyCategory::SolutionAware),
            "product_aware" => Some(BuyerJourneyCategory::ProductAware),
            "most_aware" => Some(BuyerJourneyCategory::MostAware),
            "brand_defense" => Some(BuyerJourneyCategory::BrandDefense),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuyerJourneyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated query before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub text: String,
    pub category: BuyerJourneyCategory,
    pub intent: Option<String>,
    /// Priority score in [0, 1].
    pub priority: f64,
}

impl GeneratedQuery {
    /// Dedupe key: lowercased, trimmed text.
    pub fn dedupe_key(&self) -> String {
        self.text.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueryRow {
    pub id: Uuid,
    pub audit_id: Uuid,
    pub text: String,
    pub category: String,
    pub intent: Option<String>,
    pub priority: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_is_lenient() {
        assert_eq!(BuyerJourneyCategory::parse("Problem Aware"), Some(BuyerJourneyCategory::ProblemAware));
        assert_eq!(BuyerJourneyCategory::parse("  brand-defense "), Some(BuyerJourneyCategory::BrandDefense));
        assert_eq!(BuyerJourneyCategory::parse("MOST_AWARE"), Some(BuyerJourneyCategory::MostAware));
        assert_eq!(BuyerJourneyCategory::parse("awareness"), None);
    }

    #[test]
    fn dedupe_key_folds_case_and_whitespace() {
        let q = GeneratedQuery {
            text: "  Best DevOps Tools?  ".into(),
            category: BuyerJourneyCategory::SolutionAware,
            intent: None,
            priority: 0.5,
        };
        assert_eq!(q.dedupe_key(), "best devops tools?");
    }
}
