//! Billing: converts raw model-usage cost into user-facing charges.
//!
//! Two billing modes exist. In BYOK the user pays the model provider
//! directly and we charge a platform fee on top of the observed cost. In
//! managed mode the platform fronts the model cost and charges cost plus
//! markup. Charges are denominated in credits (1 credit = $0.001) and
//! always round up, so any strictly positive cost bills at least 1 credit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who pays the underlying model invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Bring-your-own-key: user pays the provider, we charge a platform fee.
    Byok,
    /// Platform pays the provider and bills cost plus markup.
    Managed,
}

/// Where the run executes, which affects the markup rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingContext {
    Cli,
    Cloud,
}

/// Fixed per-run billing configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BillingConfig {
    pub mode: BillingMode,
    pub context: BillingContext,
}

/// Per-model token usage inside a [`CostSnapshot`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub web_search_requests: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub context_window: u64,
}

/// Cost and usage reported by a single agent invocation. Immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSnapshot {
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub model_usage: HashMap<String, ModelUsage>,
}

/// The charge derived from one cost snapshot. Never persisted on its own;
/// `actual_cost_usd` is folded into the run's cumulative totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeResult {
    pub charged_credits: u64,
    pub markup_rate: f64,
    pub actual_cost_usd: f64,
    pub final_cost_usd: f64,
}

/// Fixed markup table.
pub fn markup_rate(mode: BillingMode, context: BillingContext) -> f64 {
    match (mode, context) {
        (BillingMode::Byok, BillingContext::Cli) => 0.15,
        (BillingMode::Byok, BillingContext::Cloud) => 0.20,
        (BillingMode::Managed, BillingContext::Cli) => 1.00,
        (BillingMode::Managed, BillingContext::Cloud) => 2.00,
    }
}

/// Convert a cost snapshot into a charge under the given billing config.
///
/// Pure and total: no side effects, no error conditions.
pub fn calculate_charge(cost: &CostSnapshot, billing: &BillingConfig) -> ChargeResult {
    let rate = markup_rate(billing.mode, billing.context);
    let actual_cost_usd = cost.total_cost_usd;

    let final_cost_usd = match billing.mode {
        // Platform fee only; the user pays the provider directly.
        BillingMode::Byok => actual_cost_usd * rate,
        // Platform pays the provider and recovers cost plus markup.
        BillingMode::Managed => actual_cost_usd * (1.0 + rate),
    };

    ChargeResult {
        charged_credits: credits_for(final_cost_usd),
        markup_rate: rate,
        actual_cost_usd,
        final_cost_usd,
    }
}

/// Ceiling conversion to credits at 1 credit = $0.001.
///
/// The millicent value is snapped to 6 decimal places before the ceiling so
/// float noise (0.1 * 0.15 * 1000 = 15.000000000000002) cannot bill an
/// extra credit.
fn credits_for(final_cost_usd: f64) -> u64 {
    if final_cost_usd <= 0.0 {
        return 0;
    }
    let millis = final_cost_usd * 1000.0;
    let snapped = (millis * 1e6).round() / 1e6;
    (snapped.ceil() as u64).max(1)
}
