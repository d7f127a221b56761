//! Per-model pricing used for cost accounting of agent invocations.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Model Pricing
// ---------------------------------------------------------------------------

/// Per-model pricing in USD per 1M tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub provider: String,
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
    /// Context window size in tokens.
    pub context_window: u64,
}

impl ModelPricing {
    fn new(model: &str, provider: &str, input: f64, output: f64, context_window: u64) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            input_cost_per_1m: input,
            output_cost_per_1m: output,
            context_window,
        }
    }

    /// Calculate cost for a request with the given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_1m
    }
}

/// Default pricing table for common models (approximate 2025-2026 pricing).
pub fn default_pricing_table() -> Vec<ModelPricing> {
    vec![
        // Anthropic
        ModelPricing::new("claude-opus-4-20250514", "anthropic", 15.0, 75.0, 200_000),
        ModelPricing::new("claude-sonnet-4-20250514", "anthropic", 3.0, 15.0, 200_000),
        ModelPricing::new("claude-haiku-4-20250514", "anthropic", 0.80, 4.0, 200_000),
        // OpenAI
        ModelPricing::new("gpt-4o", "openai", 2.50, 10.0, 128_000),
        ModelPricing::new("gpt-4o-mini", "openai", 0.15, 0.60, 128_000),
        ModelPricing::new("o3-mini", "openai", 1.10, 4.40, 200_000),
    ]
}

/// Find pricing for `model`. Exact matches win; otherwise the longest table
/// entry that prefixes the model id (`gpt-4o-2024-08-06` -> `gpt-4o`).
pub fn lookup(model: &str) -> Option<ModelPricing> {
    let table = default_pricing_table();
    if let Some(exact) = table.iter().find(|p| p.model == model) {
        return Some(exact.clone());
    }
    table
        .into_iter()
        .filter(|p| model.starts_with(&p.model))
        .max_by_key(|p| p.model.len())
}

/// Estimated cost in USD; unknown models are free.
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    lookup(model)
        .map(|p| p.calculate_cost(input_tokens, output_tokens))
        .unwrap_or(0.0)
}
