//! Per-response analysis: brand and competitor detection, LLM-backed
//! sentiment and rubric scores, GEO structure scoring, and share of voice.
//!
//! Responses flow through a bounded semaphore; a failure analyzing one
//! response marks that row errored and never aborts the phase.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::analysis::{CompetitorMention, NewAnalysis, Sentiment};
use crate::models::company::CompanyProfile;
use crate::models::response::AnalyzableResponse;
use crate::pipeline::fetcher::{DomainFetcher, DomainSnapshot};
use crate::pipeline::parse_json_reply;
use crate::pipeline::progress::ProgressPublisher;
use crate::pipeline::CancelFlag;
use crate::providers::{CompletionBackend, CompletionRequest};

/// Publish progress (and re-check cancellation) every this many analyses.
const PROGRESS_EVERY: usize = 5;

/// Response text sent to the evaluation model is truncated to this many
/// characters; local matching always sees the full text.
const EVAL_TEXT_LIMIT: usize = 6_000;

// ── Brand / competitor matching ─────────────────────────────────

/// Case-insensitive whole-word matcher for one or more name variants.
/// Possessive (`Acme's`) and hyphenated (`Acme-powered`) forms count as
/// mentions; embedded substrings (`Acmeville`) do not.
pub struct BrandMatcher {
    patterns: Vec<Regex>,
}

impl BrandMatcher {
    pub fn new(names: &[String]) -> Self {
        let patterns = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .filter_map(|name| Regex::new(&word_pattern(name)).ok())
            .collect();
        Self { patterns }
    }

    pub fn single(name: &str) -> Self {
        Self::new(std::slice::from_ref(&name.to_string()))
    }

    /// Character offset of the earliest match across all variants.
    pub fn first_match(&self, text: &str) -> Option<usize> {
        self.patterns
            .iter()
            .filter_map(|p| p.find(text))
            .map(|m| m.start())
            .min()
            .map(|byte| text[..byte].chars().count())
    }

    pub fn count(&self, text: &str) -> usize {
        self.patterns.iter().map(|p| p.find_iter(text).count()).sum()
    }
}

fn word_pattern(name: &str) -> String {
    let escaped = regex::escape(name);
    let lead = if name.chars().next().is_some_and(char::is_alphanumeric) { r"\b" } else { "" };
    let tail = if name.chars().last().is_some_and(char::is_alphanumeric) { r"(?:'s)?\b" } else { "" };
    format!("(?i){lead}{escaped}{tail}")
}

// ── Structure / GEO heuristics ──────────────────────────────────

static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+\S|^\*\*[^*\n]+\*\*\s*$").expect("static regex"));
static LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+\S").expect("static regex"));

/// Structural quality of a generative answer (0–100): headings, list
/// structure, and an answer-first opening.
pub fn structural_quality(text: &str) -> f64 {
    let mut score = 0.0;
    if HEADING_RE.is_match(text) {
        score += 30.0;
    }
    if LIST_RE.is_match(text) {
        score += 40.0;
    }
    if answer_first(text) {
        score += 30.0;
    }
    score
}

/// Answer-first prose: the opening sentence is a direct, bounded statement.
fn answer_first(text: &str) -> bool {
    let first_line = text.trim_start().lines().next().unwrap_or("");
    if first_line.is_empty() || first_line.starts_with('#') {
        return false;
    }
    let sentence_end = first_line.find(['.', '!', '?']).map_or(first_line.len(), |i| i + 1);
    sentence_end <= 220
}

/// Share of the brand's core entities that the response carries (0–100).
/// With nothing to check, the signal is neutral rather than punitive.
pub fn entity_completeness(entities: &[String], text: &str) -> f64 {
    let candidates: Vec<&String> = entities.iter().filter(|e| e.trim().len() >= 3).collect();
    if candidates.is_empty() {
        return 50.0;
    }
    let lower = text.to_lowercase();
    let present =
        candidates.iter().filter(|e| lower.contains(e.trim().to_lowercase().as_str())).count();
    100.0 * present as f64 / candidates.len() as f64
}

/// Whether the response cites or links the brand's domain (0 or 100).
pub fn citation_presence(host: Option<&str>, text: &str) -> f64 {
    match host {
        Some(host) if !host.is_empty() => {
            if text.to_lowercase().contains(&host.to_lowercase()) {
                100.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// GEO = 0.4·citation + 0.3·structure + 0.3·entity completeness.
pub fn geo_score(citation: f64, structure: f64, entities: f64) -> f64 {
    0.4 * citation + 0.3 * structure + 0.3 * entities
}

/// Share of voice: brand mentions over all mentions, zero-denominator → 0.
pub fn share_of_voice(brand_mentions: usize, competitor_mentions: usize) -> f64 {
    let denominator = brand_mentions + competitor_mentions;
    if denominator == 0 {
        return 0.0;
    }
    100.0 * brand_mentions as f64 / denominator as f64
}

// ── LLM evaluation pass ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EvaluationReply {
    sentiment: String,
    #[serde(default)]
    sentiment_score: f64,
    #[serde(default)]
    context_completeness: f64,
    #[serde(default)]
    recommendation_strength: f64,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    other_competitors: Vec<String>,
}

fn build_evaluation_prompt(profile: &CompanyProfile, text: &str) -> String {
    let truncated: String = text.chars().take(EVAL_TEXT_LIMIT).collect();
    format!(
        "You evaluate how an AI assistant's answer treats the brand \"{name}\".\n\
         Value propositions: {uvps}\n\
         Target audiences: {audiences}\n\
         Pain points solved: {pains}\n\
         Known competitors: {competitors}\n\n\
         Answer to evaluate:\n---\n{truncated}\n---\n\n\
         Return a JSON object with exactly these fields:\n\
         {{\"sentiment\": \"positive|neutral|negative\" (toward {name}),\n\
         \"sentiment_score\": -1.0..1.0,\n\
         \"context_completeness\": 0..100 (how much of the value propositions, audiences, and pain points the answer covers),\n\
         \"recommendation_strength\": 0..100 (does the answer recommend {name} to the asker),\n\
         \"recommendations\": up to 3 short suggestions to improve {name}'s visibility in answers like this,\n\
         \"other_competitors\": product or company names positioned as alternatives, ONLY if the name appears verbatim in the answer text}}",
        name = profile.name,
        uvps = profile.value_props.join(", "),
        audiences = profile.audiences.join(", "),
        pains = profile.pain_points.join(", "),
        competitors = profile.competitors.join(", "),
    )
}

// ── Analyzer ────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct AnalysisReport {
    pub total: usize,
    pub analyzed: usize,
    pub errored: usize,
}

pub struct ResponseAnalyzer {
    store: crate::store::postgres::PgStore,
    backend: Arc<dyn CompletionBackend>,
    fetcher: Arc<DomainFetcher>,
    concurrency: usize,
}

impl ResponseAnalyzer {
    pub fn new(
        store: crate::store::postgres::PgStore,
        backend: Arc<dyn CompletionBackend>,
        fetcher: Arc<DomainFetcher>,
        concurrency: usize,
    ) -> Self {
        Self { store, backend, fetcher, concurrency: concurrency.max(1) }
    }

    pub async fn run(
        &self,
        audit_id: Uuid,
        profile: &CompanyProfile,
        progress: Arc<ProgressPublisher>,
        cancel: Arc<CancelFlag>,
    ) -> Result<AnalysisReport, EngineError> {
        let responses = self.store.list_analyzable_responses(audit_id).await?;
        let total = responses.len();
        info!(%audit_id, total, "starting response analysis");

        // One reference fetch per audit, before the gate; per-host caching
        // makes repeat audits of the same brand free.
        let snapshot = match &profile.domain {
            Some(domain) => Some(self.fetcher.snapshot(domain).await),
            None => None,
        };

        let context = Arc::new(AnalysisContext::new(profile, snapshot));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let completed = Arc::new(AtomicUsize::new(0));
        let errored = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(total);

        for response in responses {
            if cancel.is_set() {
                debug!(%audit_id, "cancellation observed, stopping analysis launches");
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let store = self.store.clone();
            let backend = self.backend.clone();
            let context = context.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            let completed = completed.clone();
            let errored = errored.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;

                let analysis = analyze_response(&context, backend.as_ref(), &response).await;
                if analysis.error.is_some() {
                    errored.fetch_add(1, Ordering::SeqCst);
                }
                if let Err(e) = store.insert_analysis(&analysis).await {
                    warn!(audit_id = %response.audit_id, response_id = %response.id, "analysis persist failed: {e}");
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if done % PROGRESS_EVERY == 0 || done == total {
                    progress.publish("analyzing", done, total).await;
                    cancel.refresh(&store).await;
                }
            }));
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(%audit_id, "analysis task panicked: {e}");
            }
        }

        let report = AnalysisReport {
            total,
            analyzed: completed.load(Ordering::SeqCst),
            errored: errored.load(Ordering::SeqCst),
        };
        info!(%audit_id, analyzed = report.analyzed, errored = report.errored, "response analysis complete");
        Ok(report)
    }
}

/// Matchers and reference data shared by every analysis task of one audit.
struct AnalysisContext {
    brand: BrandMatcher,
    brand_name: String,
    known_competitors: Vec<(String, BrandMatcher)>,
    entities: Vec<String>,
    host: Option<String>,
    profile: CompanyProfile,
}

impl AnalysisContext {
    fn new(profile: &CompanyProfile, snapshot: Option<DomainSnapshot>) -> Self {
        let mut entities: Vec<String> = profile
            .products
            .iter()
            .chain(profile.value_props.iter())
            .cloned()
            .collect();
        if let Some(snap) = &snapshot {
            entities.extend(snap.terms.iter().take(10).cloned());
        }
        Self {
            brand: BrandMatcher::new(&profile.brand_aliases()),
            brand_name: profile.name.clone(),
            known_competitors: profile
                .competitors
                .iter()
                .filter(|c| !c.trim().is_empty())
                .map(|c| (c.clone(), BrandMatcher::single(c)))
                .collect(),
            entities,
            host: snapshot.map(|s| s.host),
            profile: profile.clone(),
        }
    }
}

/// Analyze one response. LLM-side failures degrade to an errored analysis
/// row; the deterministic half never fails.
async fn analyze_response(
    context: &AnalysisContext,
    backend: &dyn CompletionBackend,
    response: &AnalyzableResponse,
) -> NewAnalysis {
    let text = &response.response_text;

    // Deterministic half: matching and structure.
    let first_mention_pos = context.brand.first_match(text);
    let brand_mentions = context.brand.count(text);

    let mut competitors: Vec<CompetitorMention> = Vec::new();
    for (name, matcher) in &context.known_competitors {
        let mentions = matcher.count(text);
        if mentions > 0 {
            competitors.push(CompetitorMention {
                name: name.clone(),
                position: matcher.first_match(text).map(|p| p as i64),
                mentions: mentions as i64,
            });
        }
    }

    // LLM half: sentiment, rubric scores, unknown competitors.
    let evaluation = evaluate(context, backend, text).await;
    let evaluation = match evaluation {
        Ok(e) => e,
        Err(e) => {
            debug!(response_id = %response.id, "evaluation failed: {e}");
            return NewAnalysis::errored(
                response.audit_id,
                response.id,
                format!("evaluation failed: {e}"),
            );
        }
    };

    for name in &evaluation.other_competitors {
        fold_unknown_competitor(context, text, name, &mut competitors);
    }

    let competitor_total: usize = competitors.iter().map(|c| c.mentions as usize).sum();
    let geo = geo_score(
        citation_presence(context.host.as_deref(), text),
        structural_quality(text),
        entity_completeness(&context.entities, text),
    );

    NewAnalysis {
        audit_id: response.audit_id,
        response_id: response.id,
        brand_mentioned: brand_mentions > 0,
        first_mention_pos: first_mention_pos.map(|p| p as i64),
        brand_mentions: brand_mentions as i64,
        sentiment: Sentiment::parse(&evaluation.sentiment).unwrap_or(Sentiment::Neutral),
        sentiment_score: evaluation.sentiment_score,
        competitors,
        geo_score: geo,
        sov_score: share_of_voice(brand_mentions, competitor_total),
        context_completeness: evaluation.context_completeness,
        recommendation_score: evaluation.recommendation_strength,
        recommendations: evaluation.recommendations,
        error: None,
    }
    .clamped()
}

async fn evaluate(
    context: &AnalysisContext,
    backend: &dyn CompletionBackend,
    text: &str,
) -> Result<EvaluationReply, EngineError> {
    let request = CompletionRequest::json(build_evaluation_prompt(&context.profile, text));
    let completion = backend.complete(&request).await.map_err(EngineError::from)?;
    parse_json_reply(&completion.text)
}

/// Keep an LLM-surfaced competitor only when the name actually appears
/// verbatim (case-insensitive) in the response and is not the brand or an
/// already-counted known competitor.
fn fold_unknown_competitor(
    context: &AnalysisContext,
    text: &str,
    name: &str,
    competitors: &mut Vec<CompetitorMention>,
) {
    let name = name.trim();
    if name.len() < 2 {
        return;
    }
    if name.eq_ignore_ascii_case(&context.brand_name) {
        return;
    }
    if competitors.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
        return;
    }
    if context.known_competitors.iter().any(|(known, _)| known.eq_ignore_ascii_case(name)) {
        return;
    }
    let matcher = BrandMatcher::single(name);
    let mentions = matcher.count(text);
    if mentions > 0 {
        competitors.push(CompetitorMention {
            name: name.to_string(),
            position: matcher.first_match(text).map(|p| p as i64),
            mentions: mentions as i64,
        });
    }
}
