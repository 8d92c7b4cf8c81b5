//! Scenario-level checks over the scoring and dashboard cores: the same
//! functions the audit phases call, driven with full-audit-sized inputs.

use chrono::{DateTime, Utc};
use engine::models::analysis::CompetitorMention;
use engine::models::dashboard::{RankedRecommendation, RecommendationKind};
use engine::pipeline::dashboard::build_record;
use engine::pipeline::scorer::{aggregate, AnalyzedCell};
use rust_decimal::Decimal;
use uuid::Uuid;

const PROVIDERS: [&str; 4] = ["openai", "anthropic", "google", "perplexity"];
const CATEGORIES: [&str; 6] = [
    "problem_unaware",
    "problem_aware",
    "solution_aware",
    "product_aware",
    "most_aware",
    "brand_defense",
];

fn cell(provider: &str, category: &str, i: usize) -> AnalyzedCell {
    AnalyzedCell {
        provider: provider.into(),
        category: category.into(),
        errored: false,
        brand_mentioned: i % 3 != 0,
        sentiment_score: if i % 3 == 0 { -0.2 } else { 0.6 },
        geo: 40.0 + (i % 5) as f64 * 10.0,
        sov: 30.0 + (i % 4) as f64 * 15.0,
        completeness: 55.0,
        recommendation: 50.0 + (i % 2) as f64 * 20.0,
        competitors: if i % 4 == 0 {
            vec![CompetitorMention { name: "Globex".into(), position: Some(10), mentions: 1 }]
        } else {
            vec![]
        },
    }
}

/// 48 queries × 4 providers, every cell analyzed.
fn happy_path_cells() -> Vec<AnalyzedCell> {
    let mut cells = Vec::new();
    let mut i = 0;
    for q in 0..48 {
        for provider in PROVIDERS {
            cells.push(cell(provider, CATEGORIES[q % 6], i));
            i += 1;
        }
    }
    cells
}

#[test]
fn happy_path_audit_scores_are_well_formed() {
    let cells = happy_path_cells();
    assert_eq!(cells.len(), 192);

    let scores = aggregate(&cells);

    let hundred = Decimal::from(100);
    for (label, value) in [
        ("overall", scores.overall),
        ("geo", scores.geo),
        ("sov", scores.sov),
        ("recommendation", scores.recommendation),
        ("sentiment", scores.sentiment),
        ("visibility", scores.visibility),
        ("context_completeness", scores.context_completeness),
    ] {
        assert!(value >= Decimal::ZERO && value <= hundred, "{label} out of range: {value}");
    }

    assert_eq!(scores.providers.len(), 4);
    assert_eq!(scores.categories.len(), 6);
    for (provider, breakdown) in &scores.providers {
        assert_eq!(breakdown.analyzed, 48, "{provider} should have 48 analyzed cells");
    }
    for (category, breakdown) in &scores.categories {
        assert_eq!(breakdown.analyzed, 32, "{category} should have 32 analyzed cells");
    }
    assert!(scores.competitor_mentions["Globex"] > 0);
}

#[test]
fn provider_outage_leaves_other_providers_standing() {
    // One of four providers 503s for every call: its 48 cells never reach
    // analysis, so the scorer sees 144 cells from three providers.
    let cells: Vec<AnalyzedCell> =
        happy_path_cells().into_iter().filter(|c| c.provider != "google").collect();
    assert_eq!(cells.len(), 144);

    let scores = aggregate(&cells);
    assert_eq!(scores.providers.len(), 3);
    assert!(!scores.providers.contains_key("google"));
    assert!(scores.overall > Decimal::ZERO);
}

#[test]
fn all_cells_errored_still_produces_computable_scores() {
    let cells: Vec<AnalyzedCell> = happy_path_cells()
        .into_iter()
        .map(|mut c| {
            c.errored = true;
            c
        })
        .collect();
    let scores = aggregate(&cells);
    // Zero-denominator cases collapse to zero, never NaN.
    assert_eq!(scores.overall, Decimal::ZERO);
    assert_eq!(scores.visibility, Decimal::ZERO);
    assert_eq!(scores.sov, Decimal::ZERO);
}

#[test]
fn dashboard_rebuild_is_idempotent_for_a_full_audit() {
    let scores = aggregate(&happy_path_cells());
    let recommendations: Vec<RankedRecommendation> = (0..12)
        .map(|i| RankedRecommendation {
            text: format!("recommendation {i}"),
            kind: RecommendationKind::Recommendation,
            category: CATEGORIES[i % 6].into(),
            priority: 1.0 - i as f64 * 0.05,
        })
        .collect();
    let at: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().unwrap();
    let audit_id = Uuid::nil();

    let first = build_record(audit_id, &scores, &recommendations, "summary text".into(), at);
    let second = build_record(audit_id, &scores, &recommendations, "summary text".into(), at);

    assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());

    // Top-K bound and band integrity.
    let shown = first.recommendations.high.len()
        + first.recommendations.medium.len()
        + first.recommendations.low.len();
    assert_eq!(shown, 10);
}

#[test]
fn competitor_landscape_tracks_mention_totals() {
    let mut cells = happy_path_cells();
    cells[0].competitors = vec![
        CompetitorMention { name: "Globex".into(), position: Some(0), mentions: 3 },
        CompetitorMention { name: "Initech".into(), position: Some(50), mentions: 2 },
    ];
    let scores = aggregate(&cells);
    let record = build_record(
        Uuid::nil(),
        &scores,
        &[],
        "s".into(),
        "2025-06-01T12:00:00Z".parse().unwrap(),
    );

    let landscape = &record.competitor_landscape;
    assert_eq!(landscape.totals, scores.competitor_mentions);
    assert!(!landscape.top.is_empty());
    assert_eq!(landscape.top[0].name, "Globex");

    let total: i64 = landscape.totals.values().sum();
    let mut share_sum = Decimal::ZERO;
    for c in &landscape.top {
        share_sum += c.share;
        assert!(c.mentions <= total);
    }
    assert!(share_sum <= Decimal::from(101), "shares cannot exceed 100% (rounding aside)");
}

#[test]
fn aggregate_output_serializes_with_stable_key_order() {
    let scores = aggregate(&happy_path_cells());
    let a = serde_json::to_string(&scores).unwrap();
    let b = serde_json::to_string(&aggregate(&happy_path_cells())).unwrap();
    assert_eq!(a, b);

    // BTreeMap ordering puts providers in lexical order in the JSON.
    let anthropic_pos = a.find("anthropic").unwrap();
    let google_pos = a.find("google").unwrap();
    let openai_pos = a.find("openai").unwrap();
    let perplexity_pos = a.find("perplexity").unwrap();
    assert!(anthropic_pos < google_pos && google_pos < openai_pos && openai_pos < perplexity_pos);
}
