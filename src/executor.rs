// =============================================================================
// Order Executor
// =============================================================================
//
// Translates a gate-pipeline fire decision into a broker order. Runs the
// final pre-trade friction gates, resolves market vs. limit (with the
// tsunami override), formats prices to the instrument's decimal convention,
// classifies the broker's response, and updates the per-instrument slippage
// rolling record (auto-promoting the instrument to limit-only on repeated
// slippage breaches).

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::client::{order_direction_units, BrokerClient};
use crate::config::SessionConfig;
use crate::errors::OrderOutcome;
use crate::guards::GuardBook;
use crate::instrument_state::InstrumentState;
use crate::persistence::{AuditRow, OrderRow, PersistenceAdapter};
use crate::predator::{Direction, GateAudit};
use crate::tick::pip_mul;

const ENTRY_WALL_MIN_PIPS: f64 = 1.0;
const ENTRY_WALL_MAX_PIPS: f64 = 30.0;
const ENTRY_WALL_OFFSET_PIPS: f64 = 0.3;
const TSUNAMI_EFFICIENCY_FLOOR: f64 = 7.0;
const TSUNAMI_VPIN_FLOOR: f64 = 0.65;
const FRICTION_RATIO_CEILING: f64 = 0.30;
const SLIPPAGE_PROMOTE_THRESHOLD_PIPS: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Per-instrument rolling slippage record. `switched_to_limit` is monotone
/// once set — it is never cleared within a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlippageRecord {
    pub total_slippage_pips: f64,
    pub fills: u64,
    pub switched_to_limit: bool,
}

impl SlippageRecord {
    pub fn average_slippage_pips(&self) -> f64 {
        if self.fills == 0 {
            0.0
        } else {
            self.total_slippage_pips / self.fills as f64
        }
    }

    /// Credit a fill's slippage; returns `true` the moment this fill pushes
    /// the instrument over the auto-promotion threshold for the first time.
    fn record_fill(&mut self, slippage_pips: f64) -> bool {
        self.total_slippage_pips += slippage_pips;
        self.fills += 1;
        if !self.switched_to_limit && slippage_pips > SLIPPAGE_PROMOTE_THRESHOLD_PIPS {
            self.switched_to_limit = true;
            return true;
        }
        false
    }
}

/// Reason an order never reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreTradeRejection {
    SpreadAverage,
    SpreadHardCap,
    SessionHour,
    Friction,
}

impl PreTradeRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            PreTradeRejection::SpreadAverage => "spread_average_exceeded",
            PreTradeRejection::SpreadHardCap => "hard max",
            PreTradeRejection::SessionHour => "session_hour_blackout",
            PreTradeRejection::Friction => "friction_ratio_exceeded",
        }
    }
}

/// Outcome of a full execution attempt, for the caller to log/count.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Filled {
        order: OrderRow,
        slippage_pips: f64,
        auto_promoted: bool,
    },
    Submitted {
        order: OrderRow,
    },
    Rejected {
        reason: String,
    },
}

/// Pre-trade friction gates, executed in spec order. The hard spread cap and
/// relative-average cap are both spread-average-gate checks; session-hour and
/// friction follow.
pub fn pre_trade_gates(
    guards: &GuardBook,
    instrument: &str,
    current_spread_pips: f64,
    ts_ms: u64,
    tp_pips: f64,
) -> Result<(), PreTradeRejection> {
    if !guards.spread_ok(instrument, current_spread_pips) {
        // The hard 4.0-pip ceiling and the 1.5x-relative-average check share
        // one gate in `GuardBook::spread_ok`; distinguish for the audit log.
        return Err(if current_spread_pips > 4.0 {
            PreTradeRejection::SpreadHardCap
        } else {
            PreTradeRejection::SpreadAverage
        });
    }
    if crate::guards::session_hour_blocked_at(ts_ms) {
        return Err(PreTradeRejection::SessionHour);
    }
    if tp_pips > 0.0 && current_spread_pips / tp_pips > FRICTION_RATIO_CEILING {
        return Err(PreTradeRejection::Friction);
    }
    Ok(())
}

/// Resolve market vs. limit for a candidate fire. Returns the order type and,
/// for a limit, the wall-offset price to place it at.
pub fn resolve_order_type(
    micro: &InstrumentState,
    mid: f64,
    direction: Direction,
    slippage: &SlippageRecord,
) -> (OrderType, Option<f64>) {
    if slippage.switched_to_limit {
        return (OrderType::Limit, wall_limit_price(micro, mid, direction));
    }

    let efficiency = micro.efficiency();
    if efficiency > TSUNAMI_EFFICIENCY_FLOOR && micro.vpin > TSUNAMI_VPIN_FLOOR {
        return (OrderType::Market, None);
    }

    match wall_limit_price(micro, mid, direction) {
        Some(price) => (OrderType::Limit, Some(price)),
        None => (OrderType::Market, None),
    }
}

/// Find the structural wall ahead of price on the entry side and return the
/// limit price placed 0.3 pips beyond it (on the far side from current mid).
fn wall_limit_price(micro: &InstrumentState, mid: f64, direction: Direction) -> Option<f64> {
    let pip_mul = pip_mul(&micro.instrument);
    let offset = ENTRY_WALL_OFFSET_PIPS / pip_mul;
    match direction {
        Direction::Long => {
            // Wall ahead (above mid) with a sell-side majority.
            let (price, _) = micro.strongest_wall(
                mid,
                ENTRY_WALL_MIN_PIPS,
                ENTRY_WALL_MAX_PIPS,
                false,
                false,
            )?;
            Some(price + offset)
        }
        Direction::Short => {
            // Wall ahead (below mid) with a buy-side majority.
            let (price, _) = micro.strongest_wall(
                mid,
                ENTRY_WALL_MIN_PIPS,
                ENTRY_WALL_MAX_PIPS,
                true,
                true,
            )?;
            Some(price - offset)
        }
    }
}

/// JPY instruments format to 3 decimal places, all others to 5.
pub fn format_price(price: f64, instrument: &str) -> String {
    if instrument.contains("JPY") {
        format!("{price:.3}")
    } else {
        format!("{price:.5}")
    }
}

/// Issue a fire decision as a broker order, enforcing pre-trade gates and
/// recording the outcome. `mid`/`current_spread_pips` are the tick's values
/// at decision time; `admin_user_id` stamps the order row.
#[allow(clippy::too_many_arguments)]
pub async fn execute_fire(
    broker: &BrokerClient,
    persistence: &dyn PersistenceAdapter,
    guards: &GuardBook,
    micro: &InstrumentState,
    slippage: &mut SlippageRecord,
    audit: &GateAudit,
    direction: Direction,
    mid: f64,
    current_spread_pips: f64,
    ts_ms: u64,
    cfg: &SessionConfig,
    admin_user_id: &str,
    engine_name: &str,
) -> ExecutionOutcome {
    let instrument = &audit.instrument;
    let pip_mul = pip_mul(instrument);

    if let Err(rejection) =
        pre_trade_gates(guards, instrument, current_spread_pips, ts_ms, cfg.base_take_profit_pips)
    {
        warn!(instrument, reason = rejection.as_str(), "pre-trade gate rejected fire");
        return ExecutionOutcome::Rejected {
            reason: rejection.as_str().to_string(),
        };
    }

    let (order_type, limit_price) = resolve_order_type(micro, mid, direction, slippage);
    let units = order_direction_units(direction, cfg.base_order_size);
    let sl_distance = format_price(cfg.base_stop_loss_pips / pip_mul, instrument);
    let tp_distance = format_price(cfg.base_take_profit_pips / pip_mul, instrument);
    let price_str = limit_price.map(|p| format_price(p, instrument));

    let outcome = broker
        .place_order(
            instrument,
            &order_type.to_string(),
            units,
            price_str.as_deref(),
            &sl_distance,
            &tp_distance,
        )
        .await;

    let signal_id = format!("{engine_name}:{instrument}:{ts_ms}");

    match outcome {
        OrderOutcome::Filled { fill_price, trade_id } => {
            let requested_price = limit_price.unwrap_or(mid);
            let slippage_pips = (fill_price - requested_price).abs() * pip_mul;
            let auto_promoted = slippage.record_fill(slippage_pips);

            let row = OrderRow {
                user_id: admin_user_id.to_string(),
                signal_id: signal_id.clone(),
                currency_pair: instrument.clone(),
                direction: direction_str(direction).to_string(),
                units,
                entry_price: Some(fill_price),
                oanda_order_id: trade_id.clone(),
                oanda_trade_id: Some(trade_id),
                status: "filled".to_string(),
                environment: "live".to_string(),
                direction_engine: engine_name.to_string(),
                sovereign_override_tag: None,
                confidence_score: audit.confidence,
                governance_payload: serde_json::to_value(audit).unwrap_or_default(),
                requested_price,
                slippage_pips: Some(slippage_pips),
                spread_at_entry: current_spread_pips,
                exit_price: None,
                closed_at: None,
                health_governance_action: None,
            };
            if let Err(e) = persistence.write_order(&row) {
                warn!(error = %e, "failed to persist order row");
            }

            let audit_row = AuditRow {
                gate_id: format!("PREDATOR_FIRE:{instrument}"),
                reason: serde_json::to_string(audit).unwrap_or_default(),
                expires_at: None,
                revoked: false,
                created_by: engine_name.to_string(),
            };
            if let Err(e) = persistence.write_audit(&audit_row) {
                warn!(error = %e, "failed to persist audit row");
            }

            if auto_promoted {
                warn!(instrument, slippage_pips, "auto-promoted to limit-only on slippage breach");
            }
            info!(instrument, %direction, fill_price, slippage_pips, "fire executed: filled");

            ExecutionOutcome::Filled {
                order: row,
                slippage_pips,
                auto_promoted,
            }
        }
        OrderOutcome::Pending { order_id } => {
            let row = OrderRow {
                user_id: admin_user_id.to_string(),
                signal_id,
                currency_pair: instrument.clone(),
                direction: direction_str(direction).to_string(),
                units,
                entry_price: limit_price,
                oanda_order_id: order_id,
                oanda_trade_id: None,
                status: "submitted".to_string(),
                environment: "live".to_string(),
                direction_engine: engine_name.to_string(),
                sovereign_override_tag: None,
                confidence_score: audit.confidence,
                governance_payload: serde_json::to_value(audit).unwrap_or_default(),
                requested_price: limit_price.unwrap_or(mid),
                slippage_pips: None,
                spread_at_entry: current_spread_pips,
                exit_price: None,
                closed_at: None,
                health_governance_action: None,
            };
            if let Err(e) = persistence.write_order(&row) {
                warn!(error = %e, "failed to persist pending order row");
            }
            info!(instrument, %direction, "fire executed: pending limit");
            ExecutionOutcome::Submitted { order: row }
        }
        OrderOutcome::Rejected(reason) => {
            warn!(instrument, %direction, reason, "broker rejected fire");
            ExecutionOutcome::Rejected { reason }
        }
        OrderOutcome::TransportError(reason) => {
            warn!(instrument, %direction, reason, "broker transport error on fire");
            ExecutionOutcome::Rejected { reason }
        }
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "long",
        Direction::Short => "short",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::PriceTick;

    #[test]
    fn friction_gate_rejects_above_thirty_percent() {
        let guards = GuardBook::new();
        // spread 1.0 pip, tp 3.0 pips -> ratio 0.333 > 0.30
        let result = pre_trade_gates(&guards, "EUR_USD", 1.0, 500_000, 3.0);
        assert_eq!(result, Err(PreTradeRejection::Friction));
    }

    #[test]
    fn friction_gate_accepts_exactly_thirty_percent() {
        let guards = GuardBook::new();
        let result = pre_trade_gates(&guards, "EUR_USD", 0.9, 500_000, 3.0);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn session_hour_gate_rejects_during_blackout() {
        let guards = GuardBook::new();
        // 1970-01-01T21:00:00Z -> ts_ms for hour 21.
        let ts_ms = 21 * 3600 * 1000;
        let result = pre_trade_gates(&guards, "EUR_USD", 0.5, ts_ms, 30.0);
        assert_eq!(result, Err(PreTradeRejection::SessionHour));
    }

    #[test]
    fn spread_hard_cap_rejects_above_four_pips() {
        let guards = GuardBook::new();
        let result = pre_trade_gates(&guards, "EUR_USD", 4.5, 500_000, 30.0);
        assert_eq!(result, Err(PreTradeRejection::SpreadHardCap));
    }

    #[test]
    fn tsunami_override_forces_market_even_with_wall() {
        let mut micro = InstrumentState::new("EUR_USD");
        micro.ofi = 100.0;
        micro.d1 = 0.0000001;
        micro.vpin = 0.8;
        let slippage = SlippageRecord::default();
        let (order_type, _) = resolve_order_type(&micro, 1.10000, Direction::Long, &slippage);
        assert_eq!(order_type, OrderType::Market);
    }

    #[test]
    fn switched_to_limit_forces_limit_regardless_of_wall() {
        let micro = InstrumentState::new("EUR_USD");
        let slippage = SlippageRecord {
            switched_to_limit: true,
            ..Default::default()
        };
        let (order_type, _) = resolve_order_type(&micro, 1.10000, Direction::Long, &slippage);
        assert_eq!(order_type, OrderType::Limit);
    }

    #[test]
    fn no_wall_and_no_tsunami_resolves_market() {
        let micro = InstrumentState::new("EUR_USD");
        let slippage = SlippageRecord::default();
        let (order_type, price) = resolve_order_type(&micro, 1.10000, Direction::Long, &slippage);
        assert_eq!(order_type, OrderType::Market);
        assert!(price.is_none());
    }

    #[test]
    fn format_price_jpy_three_decimals() {
        assert_eq!(format_price(110.123456, "USD_JPY"), "110.123");
    }

    #[test]
    fn format_price_non_jpy_five_decimals() {
        assert_eq!(format_price(1.1005, "EUR_USD"), "1.10050");
    }

    #[test]
    fn slippage_record_auto_promotes_once() {
        let mut record = SlippageRecord::default();
        assert!(record.record_fill(0.3));
        assert!(record.switched_to_limit);
        // Second breach does not re-trigger the "just promoted" signal.
        assert!(!record.record_fill(0.5));
    }

    #[test]
    fn slippage_record_average() {
        let mut record = SlippageRecord::default();
        record.record_fill(0.1);
        record.record_fill(0.1);
        assert!((record.average_slippage_pips() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn wall_limit_price_placed_beyond_wall() {
        let mut micro = InstrumentState::new("EUR_USD");
        let mut ts = 1000u64;
        // Seed above the target level, then hold at 1.10150 for three ticks:
        // the first arrival is a down-tick (sell), and repeats at an
        // unchanged mid carry the last classification (still sell).
        micro.apply_tick(&PriceTick { instrument: "EUR_USD".into(), bid: 1.10195, ask: 1.10205, ts_ms: ts });
        for _ in 0..3 {
            ts += 100;
            micro.apply_tick(&PriceTick { instrument: "EUR_USD".into(), bid: 1.10145, ask: 1.10155, ts_ms: ts });
        }
        let price = wall_limit_price(&micro, 1.10000, Direction::Long)
            .expect("expected a sell-majority wall ~15 pips above mid");
        assert!(price > 1.10150);
    }
}
