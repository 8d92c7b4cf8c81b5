//! Buyer-journey query generation.
//!
//! One prompt enumerates the profile's salient facts and asks for N queries
//! balanced across the six journey categories. Duplicates are folded by
//! lowercased text, per-category counts are capped at ⌈N/6⌉+1, and up to
//! two top-up calls chase the remainder before the generator settles for a
//! partial set.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::company::CompanyProfile;
use crate::models::query::{BuyerJourneyCategory, GeneratedQuery};
use crate::pipeline::parse_json_reply;
use crate::providers::{CompletionBackend, CompletionRequest};

/// Extra top-up calls after the initial generation.
const TOP_UP_CALLS: usize = 2;

/// No category may exceed this many queries for a target of `n`.
pub fn per_category_cap(n: usize) -> usize {
    n.div_ceil(6) + 1
}

/// Minimum usable set: a quarter of the target, rounded up.
pub fn minimum_viable(n: usize) -> usize {
    n.div_ceil(4)
}

#[derive(Debug, Deserialize)]
struct QueryReply {
    queries: Vec<CandidateQuery>,
}

#[derive(Debug, Deserialize)]
struct CandidateQuery {
    #[serde(alias = "query")]
    text: String,
    category: String,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default = "default_priority")]
    priority: f64,
}

fn default_priority() -> f64 {
    0.5
}

pub struct QueryGenerator {
    backend: Arc<dyn CompletionBackend>,
    target: usize,
}

impl QueryGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, target: usize) -> Self {
        Self { backend, target: target.max(1) }
    }

    /// Generate up to `target` unique queries. Fails the audit only when the
    /// final unique set is below the 25% viability threshold.
    pub async fn generate(
        &self,
        profile: &CompanyProfile,
    ) -> Result<Vec<GeneratedQuery>, EngineError> {
        let cap = per_category_cap(self.target);
        let mut accepted: Vec<GeneratedQuery> = Vec::with_capacity(self.target);
        let mut seen: HashSet<String> = HashSet::new();
        let mut counts: HashMap<BuyerJourneyCategory, usize> = HashMap::new();

        // Initial call; a schema mismatch here is retried once.
        let first = match self.request_batch(profile, self.target).await {
            Ok(batch) => batch,
            Err(EngineError::Data(msg)) => {
                warn!("query generation returned malformed JSON, retrying once: {msg}");
                self.request_batch(profile, self.target).await?
            }
            Err(e) => return Err(e),
        };
        fold_candidates(&mut accepted, &mut seen, &mut counts, first, self.target, cap);

        for round in 0..TOP_UP_CALLS {
            if accepted.len() >= self.target {
                break;
            }
            let remaining = self.target - accepted.len();
            debug!(round, remaining, "topping up query generation");
            // Top-up data errors count as an empty batch.
            let batch = match self.request_batch(profile, remaining).await {
                Ok(batch) => batch,
                Err(EngineError::Data(msg)) => {
                    warn!("query top-up returned malformed JSON: {msg}");
                    vec![]
                }
                Err(e) => return Err(e),
            };
            let before = accepted.len();
            fold_candidates(&mut accepted, &mut seen, &mut counts, batch, self.target, cap);
            if accepted.len() == before {
                break;
            }
        }

        if accepted.len() < minimum_viable(self.target) {
            return Err(EngineError::Fatal(format!(
                "query generation produced {} of {} requested queries (minimum {})",
                accepted.len(),
                self.target,
                minimum_viable(self.target)
            )));
        }

        Ok(accepted)
    }

    async fn request_batch(
        &self,
        profile: &CompanyProfile,
        count: usize,
    ) -> Result<Vec<CandidateQuery>, EngineError> {
        let request = CompletionRequest::json(build_prompt(profile, count));
        let completion = self.backend.complete(&request).await.map_err(EngineError::from)?;
        let reply: QueryReply = parse_json_reply(&completion.text)?;
        Ok(reply.queries)
    }
}

/// Fold candidates into the accepted set in arrival order: first occurrence
/// wins on duplicates, full categories and invalid records are skipped, and
/// folding stops at the target.
fn fold_candidates(
    accepted: &mut Vec<GeneratedQuery>,
    seen: &mut HashSet<String>,
    counts: &mut HashMap<BuyerJourneyCategory, usize>,
    candidates: Vec<CandidateQuery>,
    target: usize,
    cap: usize,
) {
    for candidate in candidates {
        if accepted.len() >= target {
            break;
        }
        let text = candidate.text.trim();
        if text.is_empty() {
            continue;
        }
        let Some(category) = BuyerJourneyCategory::parse(&candidate.category) else {
            debug!(category = %candidate.category, "skipping query with unknown category");
            continue;
        };
        let key = text.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        let count = counts.entry(category).or_insert(0);
        if *count >= cap {
            continue;
        }
        *count += 1;
        seen.insert(key);
        accepted.push(GeneratedQuery {
            text: text.to_string(),
            category,
            intent: candidate.intent.filter(|i| !i.trim().is_empty()),
            priority: candidate.priority.clamp(0.0, 1.0),
        });
    }
}

fn build_prompt(profile: &CompanyProfile, count: usize) -> String {
    let mut p = String::new();
    let _ = writeln!(
        p,
        "You research how buyers ask AI assistants about products. Generate {count} distinct, \
         natural-language questions a prospect might ask an AI assistant, spread evenly across \
         these buyer-journey categories: problem_unaware, problem_aware, solution_aware, \
         product_aware, most_aware, brand_defense."
    );
    let _ = writeln!(p, "\nCompany: {}", profile.name);
    if let Some(industry) = &profile.industry {
        let _ = writeln!(p, "Industry: {industry}");
    }
    if let Some(description) = profile.effective_description() {
        let _ = writeln!(p, "Description: {description}");
    }
    push_list(&mut p, "Products/services", &profile.products);
    push_list(&mut p, "Unique value propositions", &profile.value_props);
    push_list(&mut p, "Target audiences", &profile.audiences);
    push_list(&mut p, "Known competitors", &profile.competitors);
    push_list(&mut p, "Pain points solved", &profile.pain_points);
    push_list(&mut p, "Geographies", &profile.geographies);
    let _ = writeln!(
        p,
        "\nRules: early-journey questions (problem_unaware, problem_aware) must not name the \
         company; brand_defense questions compare the company against competitors or probe \
         doubts about it. Every question must be unique."
    );
    let _ = writeln!(
        p,
        "\nReturn a JSON object: {{\"queries\": [{{\"text\": \"...\", \"category\": \"...\", \
         \"intent\": \"...\", \"priority\": 0.0}}]}} where priority is 0..1."
    );
    p
}

fn push_list(buf: &mut String, label: &str, items: &[String]) {
    if !items.is_empty() {
        let _ = writeln!(buf, "{label}: {}", items.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Completion, FinishReason, ProviderError, ProviderId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn candidate(text: &str, category: &str) -> CandidateQuery {
        CandidateQuery {
            text: text.to_string(),
            category: category.to_string(),
            intent: None,
            priority: 0.5,
        }
    }

    fn fold(candidates: Vec<CandidateQuery>, target: usize) -> Vec<GeneratedQuery> {
        let mut accepted = vec![];
        let mut seen = HashSet::new();
        let mut counts = HashMap::new();
        let cap = per_category_cap(target);
        fold_candidates(&mut accepted, &mut seen, &mut counts, candidates, target, cap);
        accepted
    }

    #[test]
    fn caps_match_the_skew_rule() {
        assert_eq!(per_category_cap(48), 9);
        assert_eq!(per_category_cap(12), 3);
        assert_eq!(per_category_cap(1), 2);
        assert_eq!(minimum_viable(48), 12);
        assert_eq!(minimum_viable(10), 3);
    }

    #[test]
    fn duplicates_fold_to_first_occurrence() {
        let accepted = fold(
            vec![
                candidate("Best widget tools?", "solution_aware"),
                candidate("  best widget tools? ", "product_aware"),
                candidate("BEST WIDGET TOOLS?", "most_aware"),
                candidate("How do I automate widgets?", "problem_aware"),
            ],
            48,
        );
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].text, "Best widget tools?");
        assert_eq!(accepted[0].category, BuyerJourneyCategory::SolutionAware);
    }

    #[test]
    fn category_skew_is_capped() {
        let candidates: Vec<CandidateQuery> =
            (0..30).map(|i| candidate(&format!("question {i}"), "most_aware")).collect();
        let accepted = fold(candidates, 48);
        // ⌈48/6⌉+1 = 9
        assert_eq!(accepted.len(), 9);
    }

    #[test]
    fn unknown_categories_and_empty_text_are_skipped() {
        let accepted = fold(
            vec![
                candidate("   ", "most_aware"),
                candidate("valid question", "awareness_stage"),
                candidate("kept question", "brand_defense"),
            ],
            48,
        );
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].text, "kept question");
    }

    #[test]
    fn folding_stops_at_target() {
        let candidates: Vec<CandidateQuery> = BuyerJourneyCategory::ALL
            .iter()
            .flat_map(|c| (0..4).map(move |i| candidate(&format!("{c} q{i}"), c.as_str())))
            .collect();
        let accepted = fold(candidates, 10);
        assert_eq!(accepted.len(), 10);
    }

    #[test]
    fn priorities_are_clamped() {
        let mut c = candidate("q", "most_aware");
        c.priority = 7.0;
        let accepted = fold(vec![c], 4);
        assert_eq!(accepted[0].priority, 1.0);
    }

    // ── End-to-end generator against a scripted backend ─────────

    struct ScriptedBackend {
        calls: AtomicUsize,
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<String>) -> Self {
            Self { calls: AtomicUsize::new(0), replies: Mutex::new(replies) }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn provider(&self) -> ProviderId {
            ProviderId::OpenAi
        }

        async fn complete(&self, _req: &CompletionRequest) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let text = if replies.is_empty() { r#"{"queries": []}"#.to_string() } else { replies.remove(0) };
            Ok(Completion {
                text,
                finish_reason: FinishReason::Stop,
                input_tokens: 100,
                output_tokens: 100,
                latency_ms: 1,
            })
        }
    }

    fn reply_with(count: usize, offset: usize) -> String {
        let queries: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                let n = offset + i;
                serde_json::json!({
                    "text": format!("generated question {n}"),
                    "category": BuyerJourneyCategory::ALL[n % 6].as_str(),
                    "intent": "comparison",
                    "priority": 0.6,
                })
            })
            .collect();
        serde_json::json!({ "queries": queries }).to_string()
    }

    fn profile() -> CompanyProfile {
        CompanyProfile {
            id: uuid::Uuid::nil(),
            name: "Acme".into(),
            domain: Some("acme.com".into()),
            industry: Some("DevTools".into()),
            sub_industry: None,
            description: Some("Widget automation".into()),
            original_description: None,
            final_description: None,
            value_props: vec!["ship faster".into()],
            audiences: vec!["platform teams".into()],
            competitors: vec!["Globex".into(), "Initech".into()],
            products: vec!["WidgetX".into()],
            pain_points: vec!["manual toil".into()],
            geographies: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn happy_path_generates_balanced_target() {
        let backend = Arc::new(ScriptedBackend::new(vec![reply_with(48, 0)]));
        let generator = QueryGenerator::new(backend.clone(), 48);
        let queries = generator.generate(&profile()).await.unwrap();

        assert_eq!(queries.len(), 48);
        let mut counts: HashMap<BuyerJourneyCategory, usize> = HashMap::new();
        for q in &queries {
            *counts.entry(q.category).or_insert(0) += 1;
        }
        for c in BuyerJourneyCategory::ALL {
            assert_eq!(counts[&c], 8, "category {c} should get an equal share");
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_generation_tops_up_then_settles() {
        // 10, then 10 more, then nothing: proceeds with 20 (≥ 12 minimum).
        let backend = Arc::new(ScriptedBackend::new(vec![
            reply_with(10, 0),
            reply_with(10, 10),
            r#"{"queries": []}"#.to_string(),
        ]));
        let generator = QueryGenerator::new(backend.clone(), 48);
        let queries = generator.generate(&profile()).await.unwrap();
        assert_eq!(queries.len(), 20);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn too_few_queries_fails_the_audit() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            reply_with(5, 0),
            r#"{"queries": []}"#.to_string(),
            r#"{"queries": []}"#.to_string(),
        ]));
        let generator = QueryGenerator::new(backend, 48);
        let err = generator.generate(&profile()).await.unwrap_err();
        match err {
            EngineError::Fatal(msg) => {
                assert!(msg.contains("5 of 48"), "message should cite counts: {msg}");
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_first_reply_is_retried_once() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            "not json at all".to_string(),
            reply_with(48, 0),
        ]));
        let generator = QueryGenerator::new(backend.clone(), 48);
        let queries = generator.generate(&profile()).await.unwrap();
        assert_eq!(queries.len(), 48);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_heavy_reply_keeps_unique_set() {
        // 60 items, 20 of them case-variant duplicates → 40 unique.
        let mut items: Vec<serde_json::Value> = vec![];
        for i in 0..40 {
            items.push(serde_json::json!({
                "text": format!("unique question {i}"),
                "category": BuyerJourneyCategory::ALL[i % 6].as_str(),
            }));
        }
        for i in 0..20 {
            items.push(serde_json::json!({
                "text": format!("UNIQUE QUESTION {i}"),
                "category": BuyerJourneyCategory::ALL[(i + 3) % 6].as_str(),
            }));
        }
        let reply = serde_json::json!({ "queries": items }).to_string();
        let backend = Arc::new(ScriptedBackend::new(vec![
            reply,
            r#"{"queries": []}"#.to_string(),
            r#"{"queries": []}"#.to_string(),
        ]));
        let generator = QueryGenerator::new(backend, 48);
        let queries = generator.generate(&profile()).await.unwrap();
        assert_eq!(queries.len(), 40);
    }

    #[test]
    fn prompt_prefers_user_authored_description() {
        let mut p = profile();
        p.description = Some("enriched blurb".into());
        p.final_description = Some("what the user actually wrote".into());
        let prompt = build_prompt(&p, 48);
        assert!(prompt.contains("what the user actually wrote"));
        assert!(!prompt.contains("enriched blurb"));
        assert!(prompt.contains("Globex"));
        assert!(prompt.contains("48"));
    }
}
