use rust_decimal::Decimal;
use uuid::Uuid;

/// One provider's reply to one query, ready for persistence. Error cells
/// keep an empty text and carry the error label instead.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub audit_id: Uuid,
    pub query_id: Uuid,
    pub provider: String,
    pub response_text: String,
    pub latency_ms: i64,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cost_usd: Option<Decimal>,
    pub error: Option<String>,
}

/// Response joined with its query's category, as the analyzer consumes it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalyzableResponse {
    pub id: Uuid,
    pub audit_id: Uuid,
    pub provider: String,
    pub response_text: String,
    pub category: String,
}
