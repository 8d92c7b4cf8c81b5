//! Per-category recommendation extraction.
//!
//! Each buyer-journey category gets one batched LLM call over its analyzed
//! responses; malformed or empty replies for a category degrade to nothing
//! extracted, never to a failed audit. Results are merged, deduplicated by
//! normalized text, and ranked by the model-provided priority.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::dashboard::{RankedRecommendation, RecommendationKind};
use crate::pipeline::parse_json_reply;
use crate::providers::{CompletionBackend, CompletionRequest};

/// At most this many response excerpts per category call.
const MAX_EXCERPTS: usize = 20;
/// Each excerpt is truncated to this many characters.
const EXCERPT_LIMIT: usize = 800;
/// Items kept per list in a single category reply.
const MAX_ITEMS_PER_LIST: usize = 10;

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    recommendations: Vec<ExtractedItem>,
    #[serde(default)]
    competitive_gaps: Vec<ExtractedItem>,
    #[serde(default)]
    content_opportunities: Vec<ExtractedItem>,
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
    text: String,
    #[serde(default = "default_priority")]
    priority: f64,
}

fn default_priority() -> f64 {
    0.5
}

pub struct RecommendationExtractor {
    store: crate::store::postgres::PgStore,
    backend: Arc<dyn CompletionBackend>,
}

impl RecommendationExtractor {
    pub fn new(store: crate::store::postgres::PgStore, backend: Arc<dyn CompletionBackend>) -> Self {
        Self { store, backend }
    }

    pub async fn run(
        &self,
        audit_id: Uuid,
        brand_name: &str,
    ) -> Result<Vec<RankedRecommendation>, EngineError> {
        let texts = self.store.list_analyzed_texts(audit_id).await?;

        let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in texts {
            by_category.entry(row.category).or_default().push(row.response_text);
        }

        let mut extracted: Vec<RankedRecommendation> = Vec::new();
        for (category, texts) in &by_category {
            let prompt = build_extraction_prompt(brand_name, category, texts);
            // No output cap here: a capped batch reply truncates mid-JSON.
            let request = CompletionRequest::json(prompt);
            let reply = match self.backend.complete(&request).await {
                Ok(completion) => match parse_json_reply::<ExtractionReply>(&completion.text) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(%audit_id, category, "extraction reply unusable, accepting empty: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(%audit_id, category, "extraction call failed, accepting empty: {e}");
                    continue;
                }
            };
            let before = extracted.len();
            collect_items(&mut extracted, category, RecommendationKind::Recommendation, reply.recommendations);
            collect_items(&mut extracted, category, RecommendationKind::CompetitiveGap, reply.competitive_gaps);
            collect_items(&mut extracted, category, RecommendationKind::ContentOpportunity, reply.content_opportunities);
            debug!(%audit_id, category, items = extracted.len() - before, "category extraction done");
        }

        let ranked = merge_and_rank(extracted);
        info!(%audit_id, total = ranked.len(), "recommendation extraction complete");
        Ok(ranked)
    }
}

fn collect_items(
    out: &mut Vec<RankedRecommendation>,
    category: &str,
    kind: RecommendationKind,
    items: Vec<ExtractedItem>,
) {
    for item in items.into_iter().take(MAX_ITEMS_PER_LIST) {
        let text = item.text.trim();
        if text.is_empty() {
            continue;
        }
        out.push(RankedRecommendation {
            text: text.to_string(),
            kind,
            category: category.to_string(),
            priority: item.priority.clamp(0.0, 1.0),
        });
    }
}

/// Dedupe by normalized text (first occurrence keeps its kind/category, but
/// adopts the highest priority seen), then rank by priority descending with
/// a text tiebreak for determinism.
pub fn merge_and_rank(items: Vec<RankedRecommendation>) -> Vec<RankedRecommendation> {
    let mut merged: Vec<RankedRecommendation> = Vec::with_capacity(items.len());
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for item in items {
        let key = normalize(&item.text);
        if key.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                if item.priority > merged[i].priority {
                    merged[i].priority = item.priority;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(item);
            }
        }
    }

    merged.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.text.cmp(&b.text))
    });
    merged
}

/// Lowercase, collapse whitespace, strip trailing punctuation.
fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace()).to_lowercase()
}

fn build_extraction_prompt(brand_name: &str, category: &str, texts: &[String]) -> String {
    let mut p = String::new();
    let _ = writeln!(
        p,
        "You analyze how AI assistants answered {category} buyer-journey questions about \
         \"{brand_name}\". From the answers below, extract actionable findings for the brand's \
         marketing team."
    );
    for (i, text) in texts.iter().take(MAX_EXCERPTS).enumerate() {
        let excerpt: String = text.chars().take(EXCERPT_LIMIT).collect();
        let _ = writeln!(p, "\n--- Answer {} ---\n{excerpt}", i + 1);
    }
    if texts.len() > MAX_EXCERPTS {
        let _ = writeln!(p, "\n({} further answers omitted)", texts.len() - MAX_EXCERPTS);
    }
    let _ = writeln!(
        p,
        "\nReturn a JSON object:\n\
         {{\"recommendations\": [{{\"text\": \"...\", \"priority\": 0.0}}],\n\
         \"competitive_gaps\": [{{\"text\": \"...\", \"priority\": 0.0}}],\n\
         \"content_opportunities\": [{{\"text\": \"...\", \"priority\": 0.0}}]}}\n\
         with priority in 0..1 and at most {MAX_ITEMS_PER_LIST} items per list. Empty lists are fine."
    );
    p
}
