//! Per-model price table for response cost estimates.
//!
//! Prices are USD per million tokens. Unknown models fall back to their
//! provider's default row so cost columns never go unpopulated.

use rust_decimal::Decimal;

use super::ProviderId;

struct PriceRow {
    model_prefix: &'static str,
    input_per_m: Decimal,
    output_per_m: Decimal,
}

const fn cents(scaled: i64) -> Decimal {
    // Price literals carry 2 fractional digits (e.g. 1_50 = $1.50/M).
    Decimal::from_parts(scaled as u32, 0, 0, false, 2)
}

const OPENAI_ROWS: [PriceRow; 3] = [
    PriceRow { model_prefix: "gpt-4o-mini", input_per_m: cents(15), output_per_m: cents(60) },
    PriceRow { model_prefix: "gpt-4o", input_per_m: cents(2_50), output_per_m: cents(10_00) },
    PriceRow { model_prefix: "", input_per_m: cents(50), output_per_m: cents(1_50) },
];

const ANTHROPIC_ROWS: [PriceRow; 3] = [
    PriceRow { model_prefix: "claude-3-5-haiku", input_per_m: cents(80), output_per_m: cents(4_00) },
    PriceRow { model_prefix: "claude-sonnet", input_per_m: cents(3_00), output_per_m: cents(15_00) },
    PriceRow { model_prefix: "", input_per_m: cents(1_00), output_per_m: cents(5_00) },
];

const GOOGLE_ROWS: [PriceRow; 2] = [
    PriceRow { model_prefix: "gemini-2.0-flash", input_per_m: cents(10), output_per_m: cents(40) },
    PriceRow { model_prefix: "", input_per_m: cents(20), output_per_m: cents(80) },
];

const PERPLEXITY_ROWS: [PriceRow; 2] = [
    PriceRow { model_prefix: "sonar-pro", input_per_m: cents(3_00), output_per_m: cents(15_00) },
    PriceRow { model_prefix: "", input_per_m: cents(1_00), output_per_m: cents(1_00) },
];

fn table(provider: ProviderId) -> &'static [PriceRow] {
    match provider {
        ProviderId::OpenAi => &OPENAI_ROWS,
        ProviderId::Anthropic => &ANTHROPIC_ROWS,
        ProviderId::Google => &GOOGLE_ROWS,
        ProviderId::Perplexity => &PERPLEXITY_ROWS,
    }
}

/// Estimated USD cost of one completion, 6 fractional digits.
pub fn estimate_cost(
    provider: ProviderId,
    model: Option<&str>,
    input_tokens: u32,
    output_tokens: u32,
) -> Decimal {
    let rows = table(provider);
    let row = model
        .and_then(|m| rows.iter().find(|r| !r.model_prefix.is_empty() && m.starts_with(r.model_prefix)))
        .or_else(|| rows.last())
        .expect("price table rows are non-empty");

    let million = Decimal::from(1_000_000u32);
    let cost = Decimal::from(input_tokens) * row.input_per_m / million
        + Decimal::from(output_tokens) * row.output_per_m / million;
    cost.round_dp(6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().expect("test literal")
    }

    #[test]
    fn known_model_uses_its_row() {
        // gpt-4o-mini: $0.15/M in, $0.60/M out
        let cost = estimate_cost(ProviderId::OpenAi, Some("gpt-4o-mini"), 1_000_000, 1_000_000);
        assert_eq!(cost, d("0.75"));
    }

    #[test]
    fn unknown_model_falls_back_to_provider_default() {
        let cost = estimate_cost(ProviderId::Google, Some("gemini-exp-unreleased"), 500_000, 0);
        assert_eq!(cost, d("0.10"));
    }

    #[test]
    fn missing_model_uses_default_row() {
        let cost = estimate_cost(ProviderId::Perplexity, None, 0, 2_000_000);
        assert_eq!(cost, d("2"));
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(estimate_cost(ProviderId::Anthropic, None, 0, 0), Decimal::ZERO);
    }
}
