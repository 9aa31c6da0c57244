//! Rough token counting, per-level budgets, and LLM cost estimation against
//! a pricing table with a hardcoded fallback.

use crate::error::Result;
use crate::models::AuditLevel;
use sqlx::{PgPool, Row};

/// Fallback pricing when a model has no row in `model_pricing`: $5/$25 per
/// million input/output tokens.
pub const FALLBACK_INPUT_COST_PER_MTOK: f64 = 5.0;
pub const FALLBACK_OUTPUT_COST_PER_MTOK: f64 = 25.0;

const OVERHEAD_PCT: f64 = 0.05;
const OUTPUT_RATIO: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_cost_per_mtok: FALLBACK_INPUT_COST_PER_MTOK,
            output_cost_per_mtok: FALLBACK_OUTPUT_COST_PER_MTOK,
        }
    }
}

/// Either precomputed totals or a list of scanned-file rough token counts.
pub enum TokenSource {
    Totals { total_files: i64, total_tokens: i64 },
    Files(Vec<i64>),
}

#[derive(Debug, Clone, Copy)]
pub struct CostEstimate {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub is_precise: bool,
}

pub struct TokenAccountant {
    pool: PgPool,
}

impl TokenAccountant {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn budget_pct(level: AuditLevel) -> f64 {
        level.budget_pct()
    }

    /// Look up a model's pricing row, falling back to the hardcoded rate.
    pub async fn pricing_for(&self, model_id: &str) -> ModelPricing {
        let row = sqlx::query(
            "SELECT input_cost_per_mtok, output_cost_per_mtok FROM model_pricing WHERE model_id = $1",
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        match row {
            Some(r) => ModelPricing {
                input_cost_per_mtok: r.try_get("input_cost_per_mtok").unwrap_or(FALLBACK_INPUT_COST_PER_MTOK),
                output_cost_per_mtok: r.try_get("output_cost_per_mtok").unwrap_or(FALLBACK_OUTPUT_COST_PER_MTOK),
            },
            None => ModelPricing::default(),
        }
    }

    /// Estimate the cost of analyzing at the given level, given the token
    /// source described above. `level_tokens` is the number of tokens the
    /// level has already committed to (e.g. tokens already selected by the
    /// planner); pass 0 to estimate against the budget alone.
    pub fn estimate(
        level_tokens: i64,
        source: &TokenSource,
        pricing: ModelPricing,
    ) -> CostEstimate {
        let (total_tokens, is_precise) = match source {
            TokenSource::Totals { total_tokens, .. } => (*total_tokens, true),
            TokenSource::Files(rough) => (rough.iter().sum(), false),
        };

        let input_tokens = (level_tokens as f64 + total_tokens as f64 * OVERHEAD_PCT).round() as i64;
        let output_tokens = (input_tokens as f64 * OUTPUT_RATIO).round() as i64;

        let cost = input_tokens as f64 / 1_000_000.0 * pricing.input_cost_per_mtok
            + output_tokens as f64 / 1_000_000.0 * pricing.output_cost_per_mtok;
        let cost_usd = (cost * 10_000.0).round() / 10_000.0;

        CostEstimate {
            input_tokens,
            output_tokens,
            cost_usd,
            is_precise,
        }
    }

    pub fn token_budget(level: AuditLevel, total_tokens: i64) -> i64 {
        if matches!(level, AuditLevel::Full) {
            return total_tokens;
        }
        (total_tokens as f64 * level.budget_pct()).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_matches_budget_formula() {
        let pricing = ModelPricing {
            input_cost_per_mtok: 5.0,
            output_cost_per_mtok: 25.0,
        };
        let source = TokenSource::Totals {
            total_files: 10,
            total_tokens: 1_000_000,
        };
        let est = TokenAccountant::estimate(100_000, &source, pricing);

        let expected_input = 100_000.0 + 0.05 * 1_000_000.0;
        let expected_output = expected_input * 0.15;
        let expected_cost =
            ((expected_input / 1e6 * 5.0 + expected_output / 1e6 * 25.0) * 10_000.0).round() / 10_000.0;

        assert_eq!(est.input_tokens, expected_input as i64);
        assert_eq!(est.output_tokens, expected_output as i64);
        assert_eq!(est.cost_usd, expected_cost);
        assert!(est.is_precise);
    }

    #[test]
    fn estimate_from_file_list_is_not_precise() {
        let pricing = ModelPricing::default();
        let source = TokenSource::Files(vec![1000, 2000, 3000]);
        let est = TokenAccountant::estimate(0, &source, pricing);
        assert!(!est.is_precise);
        assert_eq!(est.input_tokens, (6000.0 * 0.05).round() as i64);
    }

    #[test]
    fn full_level_budget_is_total_tokens() {
        assert_eq!(TokenAccountant::token_budget(AuditLevel::Full, 500_000), 500_000);
    }

    #[test]
    fn thorough_level_budget_is_33_pct() {
        assert_eq!(
            TokenAccountant::token_budget(AuditLevel::Thorough, 100_000),
            33_000
        );
    }
}
