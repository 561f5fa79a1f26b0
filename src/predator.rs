// =============================================================================
// Gate Pipeline ("Predatory Hunter")
// =============================================================================
//
// Per tick, per instrument: an ordered chain of nine predicates. The first
// failure short-circuits the chain and resets hysteresis. All nine passing
// is necessary but not sufficient to fire — "Rule of N" requires N
// consecutive same-direction all-pass evaluations first.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::guards::GuardBook;
use crate::instrument_state::InstrumentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Per-instrument hysteresis state for the Rule-of-N gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredatorState {
    pub consecutive_pass_count: u32,
    pub last_pass_direction: Option<Direction>,
    pub last_fire_ts_ms: i64,
}

impl PredatorState {
    pub fn new() -> Self {
        Self {
            consecutive_pass_count: 0,
            last_pass_direction: None,
            last_fire_ts_ms: 0,
        }
    }

    /// Seed from cross-session cooldown state loaded at session start.
    pub fn seeded(last_fire_ts_ms: i64) -> Self {
        Self {
            last_fire_ts_ms,
            ..Self::new()
        }
    }
}

impl Default for PredatorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured record of every predicate's value for one evaluation, whether
/// or not the chain made it all the way through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAudit {
    pub instrument: String,
    pub blocked_at: Option<&'static str>,
    pub candidate_direction: Option<Direction>,
    pub flow_ratio: Option<f64>,
    pub hurst: f64,
    pub efficiency: f64,
    pub vpin: f64,
    pub weighting_pct: f64,
    pub drift_magnitude: f64,
    pub consecutive_pass_count: u32,
    pub fired: bool,
    pub confidence: f64,
}

fn blocked(instrument: &str, gate: &'static str) -> GateAudit {
    GateAudit {
        instrument: instrument.to_string(),
        blocked_at: Some(gate),
        candidate_direction: None,
        flow_ratio: None,
        hurst: 0.0,
        efficiency: 0.0,
        vpin: 0.0,
        weighting_pct: 0.0,
        drift_magnitude: 0.0,
        consecutive_pass_count: 0,
        fired: false,
        confidence: 0.0,
    }
}

/// Evaluate the full gate chain for one instrument at the current tick,
/// mutating `state`'s hysteresis counters in place.
pub fn evaluate(
    instrument: &str,
    micro: &InstrumentState,
    guards: &GuardBook,
    state: &mut PredatorState,
    cfg: &SessionConfig,
    now_ms: i64,
) -> GateAudit {
    // Gate 0: cooldown.
    if now_ms - state.last_fire_ts_ms < cfg.cooldown_secs * 1000 {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "cooldown");
    }

    // Gate 1: liquidity.
    if !guards.liquidity_ok(instrument, cfg.liquidity_floor_tps) {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "liquidity");
    }

    // Gate 2: warm-up.
    if micro.tick_count < cfg.warmup_ticks {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "warmup");
    }

    // Gate 3: flow direction.
    let flow_ratio = micro.recent_flow_ratio();
    let candidate_direction = match flow_ratio {
        Some(r) if r >= 1.6 => Direction::Long,
        Some(r) if r <= 0.625 => Direction::Short,
        _ => {
            state.consecutive_pass_count = 0;
            return blocked(instrument, "flow_direction");
        }
    };

    // Gate 4: Hurst floor.
    if micro.hurst < cfg.hurst_entry_floor {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "hurst");
    }

    // Gate 5: efficiency floor.
    let efficiency = micro.efficiency();
    if efficiency < cfg.efficiency_entry_floor {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "efficiency");
    }

    // Gate 6: weighting majority.
    let weighting_pct = match candidate_direction {
        Direction::Long => micro.ewma_buy_pct * 100.0,
        Direction::Short => micro.ewma_sell_pct * 100.0,
    };
    if weighting_pct < cfg.weighting_entry_floor_pct {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "weighting");
    }

    // Gate 7: drift magnitude.
    let drift_magnitude = micro.drift_magnitude_pips().abs();
    if drift_magnitude < cfg.drift_magnitude_floor {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "drift_magnitude");
    }

    // Gate 8: toxicity band.
    if micro.vpin < cfg.vpin_toxicity_high {
        state.consecutive_pass_count = 0;
        return blocked(instrument, "toxicity");
    }

    // All nine predicates passed. Update Rule-of-N hysteresis.
    if state.last_pass_direction == Some(candidate_direction) {
        state.consecutive_pass_count += 1;
    } else {
        state.consecutive_pass_count = 1;
        state.last_pass_direction = Some(candidate_direction);
    }

    let fired = state.consecutive_pass_count >= cfg.rule_of_n;
    if fired {
        state.last_fire_ts_ms = now_ms;
    }

    let side_bias_aligned = match candidate_direction {
        Direction::Long => micro.running_buys > micro.running_sells,
        Direction::Short => micro.running_sells > micro.running_buys,
    };
    let confidence = ((micro.hurst - 0.5) * 3.0
        + (efficiency - 3.0) * 0.1
        + (micro.vpin - 0.4) * 2.0
        + if side_bias_aligned { 0.2 } else { 0.0 })
    .clamp(0.0, 1.0);

    GateAudit {
        instrument: instrument.to_string(),
        blocked_at: None,
        candidate_direction: Some(candidate_direction),
        flow_ratio,
        hurst: micro.hurst,
        efficiency,
        vpin: micro.vpin,
        weighting_pct,
        drift_magnitude,
        consecutive_pass_count: state.consecutive_pass_count,
        fired,
        confidence,
    }
}
