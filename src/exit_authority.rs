// =============================================================================
// Autonomous Exit Authority
// =============================================================================
//
// Polled by the session orchestrator on a 2-second cadence (the session is a
// single cooperative task; this is a scan invoked inline from the processing
// loop, not a background task). Owns the open-positions snapshot loaded at
// session start, the per-trade monotonic stop-loss ledger, and the
// session-anchored volume-weighted price reference used as the stop-anchor
// failsafe when no structural wall qualifies.

use std::collections::HashMap;

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::client::BrokerClient;
use crate::config::SessionConfig;
use crate::errors::ExitOutcome;
use crate::instrument_state::InstrumentState;
use crate::persistence::PersistenceAdapter;

const WHALE_SHADOW_RANGE_PIPS: f64 = 3.0;
const STOP_OFFSET_PIPS: f64 = 0.3;
const INITIAL_STOP_BUFFER_PIPS: f64 = 2.0;
pub const EXIT_POLL_INTERVAL_MS: i64 = 2_000;
const EXIT_TICK_COUNT_FLOOR: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionDirection {
    Long,
    Short,
}

/// Read-only view of an open position, as loaded from the one-shot snapshot
/// at session start. The core never creates these; it only closes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPositionView {
    pub order_row_id: String,
    pub broker_trade_id: String,
    pub instrument: String,
    pub direction: PositionDirection,
    pub entry_price: f64,
    pub created_at_ms: i64,
}

/// Reasons the exit authority may close a position at market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    RegimeCollapse,
    FlowConsensusLost,
    ZOfiSlam,
    AbsorptionEmergency,
}

impl ExitReason {
    pub fn as_tag(self) -> &'static str {
        match self {
            ExitReason::RegimeCollapse => "REGIME_EXIT",
            ExitReason::FlowConsensusLost => "FLOW_EXIT",
            ExitReason::ZOfiSlam => "ZOFI_SLAM_EXIT",
            ExitReason::AbsorptionEmergency => "ABSORPTION_EXIT",
        }
    }
}

/// Outcome of one scan pass over one position, for session-level counters.
#[derive(Debug, Clone)]
pub enum ExitScanResult {
    Closed {
        instrument: String,
        reason: ExitReason,
        outcome: ExitOutcome,
    },
    StopUpdated {
        instrument: String,
        new_stop: f64,
        outcome: ExitOutcome,
    },
    NoAction,
}

/// Per-instrument session-anchored volume-weighted price reference. Each
/// tick contributes equal weight (the broker stream carries no size field
/// usable as a real volume weight). Resets at UTC midnight.
#[derive(Default)]
struct VwapAnchor {
    sum: f64,
    count: u64,
    day: i32,
}

impl VwapAnchor {
    fn record(&mut self, mid: f64, ts_ms: i64) {
        let today = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .map(|dt| dt.num_days_from_ce())
            .unwrap_or(self.day);
        if today != self.day {
            self.sum = 0.0;
            self.count = 0;
            self.day = today;
        }
        self.sum += mid;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Owns all exit-authority session state: the tracked open positions, the
/// per-trade monotonic stop ledger, and the per-instrument VWAP anchors.
pub struct ExitAuthority {
    positions: HashMap<String, OpenPositionView>,
    last_applied_stop: HashMap<String, f64>,
    vwap: HashMap<String, VwapAnchor>,
}

impl ExitAuthority {
    /// Seed from the one-shot open-positions snapshot loaded at session start.
    pub fn new(open_positions: Vec<OpenPositionView>) -> Self {
        let positions = open_positions
            .into_iter()
            .map(|p| (p.broker_trade_id.clone(), p))
            .collect();
        Self {
            positions,
            last_applied_stop: HashMap::new(),
            vwap: HashMap::new(),
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Feed the session-anchored VWAP reference. Called on every tick,
    /// independent of the 2-second scan cadence.
    pub fn record_tick(&mut self, instrument: &str, mid: f64, ts_ms: i64) {
        self.vwap
            .entry(instrument.to_string())
            .or_default()
            .record(mid, ts_ms);
    }

    /// Scan every tracked open position once. Removes closed positions from
    /// the map. `micro_states` is the session's live per-instrument estimator
    /// state keyed by instrument code.
    pub async fn scan(
        &mut self,
        micro_states: &HashMap<String, InstrumentState>,
        broker: &BrokerClient,
        persistence: &dyn PersistenceAdapter,
        cfg: &SessionConfig,
        now_ms: i64,
    ) -> Vec<ExitScanResult> {
        let trade_ids: Vec<String> = self.positions.keys().cloned().collect();
        let mut results = Vec::with_capacity(trade_ids.len());

        for trade_id in trade_ids {
            let position = match self.positions.get(&trade_id) {
                Some(p) => p.clone(),
                None => continue,
            };
            let micro = match micro_states.get(&position.instrument) {
                Some(m) => m,
                None => continue,
            };
            if micro.tick_count < EXIT_TICK_COUNT_FLOOR {
                continue;
            }
            if now_ms - position.created_at_ms < cfg.hold_guard_secs * 1000 {
                continue;
            }

            if let Some(reason) = exit_predicate(micro, position.direction, cfg) {
                let outcome = broker.close_trade(&position.broker_trade_id).await;
                if matches!(outcome, ExitOutcome::Applied) {
                    let exit_price = micro.prev_mid;
                    if let Err(e) = persistence.update_order_exit(
                        &position.order_row_id,
                        exit_price,
                        "closed",
                        reason.as_tag(),
                    ) {
                        warn!(error = %e, "failed to stamp order row on exit");
                    }
                    self.positions.remove(&trade_id);
                    self.last_applied_stop.remove(&trade_id);
                    info!(
                        instrument = %position.instrument,
                        trade_id = %trade_id,
                        reason = reason.as_tag(),
                        "autonomous exit: position closed"
                    );
                } else {
                    warn!(
                        instrument = %position.instrument,
                        trade_id = %trade_id,
                        ?outcome,
                        "autonomous exit: close failed, retrying next scan"
                    );
                }
                results.push(ExitScanResult::Closed {
                    instrument: position.instrument.clone(),
                    reason,
                    outcome,
                });
                continue;
            }

            match self.compute_stop_anchor(&position, micro) {
                Some(new_stop) => {
                    let price_str = crate::executor::format_price(new_stop, &position.instrument);
                    let outcome = broker.update_stop_loss(&trade_id, &price_str).await;
                    if matches!(outcome, ExitOutcome::Applied) {
                        self.last_applied_stop.insert(trade_id.clone(), new_stop);
                        info!(
                            instrument = %position.instrument,
                            trade_id = %trade_id,
                            new_stop,
                            "autonomous exit: stop-loss updated"
                        );
                    }
                    results.push(ExitScanResult::StopUpdated {
                        instrument: position.instrument.clone(),
                        new_stop,
                        outcome,
                    });
                }
                None => results.push(ExitScanResult::NoAction),
            }
        }

        results
    }

    /// Whale-shadow trail: a structural wall within range, else the
    /// session VWAP failsafe, subject to monotonic improvement.
    fn compute_stop_anchor(
        &self,
        position: &OpenPositionView,
        micro: &InstrumentState,
    ) -> Option<f64> {
        let mid = micro.prev_mid;
        let pip_mul = crate::tick::pip_mul(&position.instrument);
        let offset = STOP_OFFSET_PIPS / pip_mul;

        let candidate = match position.direction {
            PositionDirection::Long => {
                match micro.strongest_wall(mid, 0.0, WHALE_SHADOW_RANGE_PIPS, true, true) {
                    Some((wall_price, _)) => Some(wall_price - offset),
                    None => self
                        .vwap
                        .get(&position.instrument)
                        .and_then(|v| v.value())
                        .filter(|&vwap| vwap < mid)
                        .map(|vwap| vwap - offset),
                }
            }
            PositionDirection::Short => {
                match micro.strongest_wall(mid, 0.0, WHALE_SHADOW_RANGE_PIPS, false, false) {
                    Some((wall_price, _)) => Some(wall_price + offset),
                    None => self
                        .vwap
                        .get(&position.instrument)
                        .and_then(|v| v.value())
                        .filter(|&vwap| vwap > mid)
                        .map(|vwap| vwap + offset),
                }
            }
        }?;

        let buffer = INITIAL_STOP_BUFFER_PIPS / pip_mul;
        let floor = match position.direction {
            PositionDirection::Long => position.entry_price - buffer,
            PositionDirection::Short => position.entry_price + buffer,
        };
        let last = self.last_applied_stop.get(&position.broker_trade_id).copied();

        let beats_last = match last {
            None => true,
            Some(l) => match position.direction {
                PositionDirection::Long => candidate > l,
                PositionDirection::Short => candidate < l,
            },
        };
        let improves = match position.direction {
            PositionDirection::Long => candidate > floor && beats_last,
            PositionDirection::Short => candidate < floor && beats_last,
        };

        improves.then_some(candidate)
    }
}

/// Evaluate the four exit predicates in spec order; the first that fires
/// wins (there is no hysteresis on exits — one qualifying predicate closes).
fn exit_predicate(
    micro: &InstrumentState,
    direction: PositionDirection,
    cfg: &SessionConfig,
) -> Option<ExitReason> {
    if micro.hurst < cfg.hurst_exit_floor {
        return Some(ExitReason::RegimeCollapse);
    }

    let weighting_pct = match direction {
        PositionDirection::Long => micro.ewma_buy_pct * 100.0,
        PositionDirection::Short => micro.ewma_sell_pct * 100.0,
    };
    if weighting_pct <= cfg.weighting_exit_floor_pct {
        return Some(ExitReason::FlowConsensusLost);
    }

    let slammed = match direction {
        PositionDirection::Long => micro.z_ofi < -cfg.z_score_divergence_threshold,
        PositionDirection::Short => micro.z_ofi > cfg.z_score_divergence_threshold,
    };
    if slammed {
        return Some(ExitReason::ZOfiSlam);
    }

    if direction == PositionDirection::Short {
        if let Some(ratio) = micro.recent_flow_ratio() {
            if ratio >= cfg.absorption_ratio_threshold {
                return Some(ExitReason::AbsorptionEmergency);
            }
        }
    }

    None
}
