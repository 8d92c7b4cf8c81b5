//! The audit pipeline: query generation → provider fan-out → response
//! analysis → aggregate scoring → recommendation extraction → dashboard
//! population, driven per-audit by the job processor.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::audit::AuditStatus;
use crate::store::postgres::PgStore;

pub mod analyzer;
pub mod dashboard;
pub mod fetcher;
pub mod generator;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod recommender;
pub mod scorer;

/// Parse a model's JSON-object reply into `T`, tolerating the usual noise:
/// markdown code fences and prose around the object.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, EngineError> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<T>(trimmed) {
        return Ok(v);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<T>(&trimmed[start..=end]) {
                return Ok(v);
            }
        }
    }
    Err(EngineError::Data(format!(
        "reply was not the expected JSON object: {}",
        trimmed.chars().take(160).collect::<String>()
    )))
}

/// Cancellation signal shared across a phase's tasks. The flag is refreshed
/// from the store at progress checkpoints, so fan-out loops stop launching
/// new work soon after the API collaborator requests cancellation; the
/// authoritative check stays at phase boundaries.
pub struct CancelFlag {
    audit_id: Uuid,
    cancelled: AtomicBool,
}

impl CancelFlag {
    pub fn new(audit_id: Uuid) -> Self {
        Self { audit_id, cancelled: AtomicBool::new(false) }
    }

    pub fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn set(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Re-read the audit status; flips the flag once a cancel request (or a
    /// supervisor-forced terminal state) is visible.
    pub async fn refresh(&self, store: &PgStore) {
        match store.audit_status(self.audit_id).await {
            Ok(Some(AuditStatus::CancelRequested | AuditStatus::Cancelled | AuditStatus::Failed)) => {
                self.set();
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(audit_id = %self.audit_id, "cancel check failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, PartialEq, Debug)]
    struct Sample {
        value: i32,
    }

    #[test]
    fn parses_bare_json() {
        let s: Sample = parse_json_reply(r#"{"value": 3}"#).unwrap();
        assert_eq!(s, Sample { value: 3 });
    }

    #[test]
    fn parses_fenced_json() {
        let s: Sample = parse_json_reply("```json\n{\"value\": 7}\n```").unwrap();
        assert_eq!(s, Sample { value: 7 });
    }

    #[test]
    fn parses_json_with_surrounding_prose() {
        let s: Sample =
            parse_json_reply("Here is the result you asked for:\n{\"value\": 1}\nHope it helps!")
                .unwrap();
        assert_eq!(s, Sample { value: 1 });
    }

    #[test]
    fn rejects_non_json() {
        let err = parse_json_reply::<Sample>("no structure here").unwrap_err();
        assert!(matches!(err, EngineError::Data(_)));
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = parse_json_reply::<Sample>(r#"{"other": true}"#).unwrap_err();
        assert!(matches!(err, EngineError::Data(_)));
    }
}
