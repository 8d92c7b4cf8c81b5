use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit lifecycle. Transitions are monotonic along the graph below; the
/// two terminal failure states are reachable from any non-terminal state.
/// `CancelRequested` is written by the API collaborator and observed by the
/// processor at phase boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Processing,
    Analyzing,
    Scoring,
    Populating,
    Completed,
    Failed,
    Cancelled,
    CancelRequested,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Processing => "processing",
            AuditStatus::Analyzing => "analyzing",
            AuditStatus::Scoring => "scoring",
            AuditStatus::Populating => "populating",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Cancelled => "cancelled",
            AuditStatus::CancelRequested => "cancel_requested",
        }
    }

    pub fn parse(s: &str) -> Option<AuditStatus> {
        match s {
            "pending" => Some(AuditStatus::Pending),
            "processing" => Some(AuditStatus::Processing),
            "analyzing" => Some(AuditStatus::Analyzing),
            "scoring" => Some(AuditStatus::Scoring),
            "populating" => Some(AuditStatus::Populating),
            "completed" => Some(AuditStatus::Completed),
            "failed" => Some(AuditStatus::Failed),
            "cancelled" => Some(AuditStatus::Cancelled),
            "cancel_requested" => Some(AuditStatus::CancelRequested),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuditStatus::Completed | AuditStatus::Failed | AuditStatus::Cancelled)
    }

    /// The allowed transition graph. Phase order is strict; `failed` and
    /// `cancelled` are reachable from every non-terminal state, and a
    /// cancel request may land on any non-terminal state.
    pub fn can_transition_to(&self, next: AuditStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            AuditStatus::Failed | AuditStatus::Cancelled | AuditStatus::CancelRequested => true,
            AuditStatus::Processing => *self == AuditStatus::Pending,
            AuditStatus::Analyzing => {
                matches!(self, AuditStatus::Processing | AuditStatus::CancelRequested)
            }
            AuditStatus::Scoring => {
                matches!(self, AuditStatus::Analyzing | AuditStatus::CancelRequested)
            }
            AuditStatus::Populating => {
                matches!(self, AuditStatus::Scoring | AuditStatus::CancelRequested)
            }
            AuditStatus::Completed => {
                matches!(self, AuditStatus::Populating | AuditStatus::CancelRequested)
            }
            AuditStatus::Pending => false,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end run, as persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub providers: sqlx::types::Json<Vec<String>>,
    pub query_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub overall_score: Option<Decimal>,
    pub brand_mention_rate: Option<Decimal>,
    pub error_message: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_strict() {
        use AuditStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Scoring));
        assert!(Scoring.can_transition_to(Populating));
        assert!(Populating.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Analyzing));
        assert!(!Processing.can_transition_to(Scoring));
        assert!(!Analyzing.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        use AuditStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Processing, Analyzing, Scoring, Populating, Completed, Failed, Cancelled]
            {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next} must be rejected");
            }
        }
    }

    #[test]
    fn failure_and_cancellation_reachable_from_any_phase() {
        use AuditStatus::*;
        for phase in [Pending, Processing, Analyzing, Scoring, Populating, CancelRequested] {
            assert!(phase.can_transition_to(Failed));
            assert!(phase.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        use AuditStatus::*;
        for s in [Pending, Processing, Analyzing, Scoring, Populating, Completed, Failed, Cancelled, CancelRequested]
        {
            assert_eq!(AuditStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AuditStatus::parse("bogus"), None);
    }
}
