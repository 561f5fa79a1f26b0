// =============================================================================
// Session Configuration
// =============================================================================
//
// Read once at session start from the persistence adapter. Every tunable
// field is defaulted so that a partial or empty JSON blob still produces a
// usable configuration; unknown keys in the source payload are ignored by
// serde's normal deserialisation behaviour.

use serde::{Deserialize, Serialize};

fn default_base_order_size() -> f64 {
    1000.0
}
fn default_base_stop_loss_pips() -> f64 {
    8.0
}
fn default_base_take_profit_pips() -> f64 {
    30.0
}
fn default_z_score_divergence_threshold() -> f64 {
    3.5
}
fn default_hurst_entry_floor() -> f64 {
    0.62
}
fn default_hurst_exit_floor() -> f64 {
    0.45
}
fn default_efficiency_entry_floor() -> f64 {
    2.0
}
fn default_weighting_entry_floor_pct() -> f64 {
    50.0
}
fn default_weighting_exit_floor_pct() -> f64 {
    40.0
}
fn default_drift_magnitude_floor() -> f64 {
    0.12
}
fn default_vpin_toxicity_high() -> f64 {
    0.40
}
fn default_absorption_ratio_threshold() -> f64 {
    2.5
}
fn default_rule_of_n() -> u32 {
    3
}
fn default_cooldown_secs() -> i64 {
    300
}
fn default_liquidity_floor_tps() -> f64 {
    0.8
}
fn default_warmup_ticks() -> u64 {
    20
}
fn default_hold_guard_secs() -> i64 {
    90
}
fn default_max_stream_secs() -> u64 {
    110
}

/// Configuration snapshot read once per session. Mirrors the configuration
/// persistence layer's `memory_key`-addressed blob described by the external
/// interfaces this core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_base_order_size")]
    pub base_order_size: f64,
    #[serde(default = "default_base_stop_loss_pips")]
    pub base_stop_loss_pips: f64,
    #[serde(default = "default_base_take_profit_pips")]
    pub base_take_profit_pips: f64,
    #[serde(default = "default_z_score_divergence_threshold")]
    pub z_score_divergence_threshold: f64,
    #[serde(default)]
    pub blocked_instruments: Vec<String>,
    #[serde(default)]
    pub correlation_groups: Option<Vec<Vec<String>>>,

    #[serde(default = "default_hurst_entry_floor")]
    pub hurst_entry_floor: f64,
    #[serde(default = "default_hurst_exit_floor")]
    pub hurst_exit_floor: f64,
    #[serde(default = "default_efficiency_entry_floor")]
    pub efficiency_entry_floor: f64,
    #[serde(default = "default_weighting_entry_floor_pct")]
    pub weighting_entry_floor_pct: f64,
    #[serde(default = "default_weighting_exit_floor_pct")]
    pub weighting_exit_floor_pct: f64,
    #[serde(default = "default_drift_magnitude_floor")]
    pub drift_magnitude_floor: f64,
    #[serde(default = "default_vpin_toxicity_high")]
    pub vpin_toxicity_high: f64,
    #[serde(default = "default_absorption_ratio_threshold")]
    pub absorption_ratio_threshold: f64,
    #[serde(default = "default_rule_of_n")]
    pub rule_of_n: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    #[serde(default = "default_liquidity_floor_tps")]
    pub liquidity_floor_tps: f64,
    #[serde(default = "default_warmup_ticks")]
    pub warmup_ticks: u64,
    #[serde(default = "default_hold_guard_secs")]
    pub hold_guard_secs: i64,
    #[serde(default = "default_max_stream_secs")]
    pub max_stream_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // Deserialising an empty object exercises every `#[serde(default)]`
        // field, so building the default this way keeps one source of truth.
        serde_json::from_str("{}").expect("empty config object always deserialises")
    }
}

/// Process-environment credentials and endpoints. Not part of the
/// configuration snapshot (that comes from the persistence layer); these are
/// read directly from the environment at startup, matching the teacher's
/// `dotenv::dotenv().ok()` + `std::env::var` convention.
#[derive(Debug, Clone)]
pub struct BrokerEnv {
    pub api_base: String,
    pub token: String,
    pub account_id: String,
    pub live_trading_enabled: bool,
    pub admin_user_id: String,
}

impl BrokerEnv {
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        Ok(Self {
            api_base: std::env::var("BROKER_API_BASE")
                .context("BROKER_API_BASE not set")?,
            token: std::env::var("BROKER_TOKEN").context("BROKER_TOKEN not set")?,
            account_id: std::env::var("BROKER_ACCOUNT_ID")
                .context("BROKER_ACCOUNT_ID not set")?,
            live_trading_enabled: std::env::var("LIVE_TRADING_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            admin_user_id: std::env::var("ENGINE_ADMIN_USER_ID")
                .unwrap_or_else(|_| "unknown".to_string()),
        })
    }
}
