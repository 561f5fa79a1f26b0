// =============================================================================
// Per-Instrument Microstructure Estimator
// =============================================================================
//
// One `InstrumentState` per instrument. Every tick runs the same fixed
// sequence of O(1) recursive updates — order matters because later steps
// read fields written by earlier ones:
//
//   1. tick-rule (+ quote fallback) side classification
//   2. dx / dt
//   3. adaptive-alpha gear shift
//   4. Kramers-Moyal D1/D2 recursion
//   5. OFI recursion
//   6. Welford online mean/variance of OFI -> z_ofi
//   7. Hall-Wood fast Hurst exponent (20-tick reset cycle)
//   8. direction EWMA (buy/sell share)
//   9. recursive EWMA VPIN surrogate
//  10. bounded price-level persistence map
//  11. efficiency ratio + market-state classification
//  12. commit prev_mid/prev_ts/tick_count
//
// No allocation happens on the steady-state path except the occasional
// price-level map insert/evict.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::tick::{pip_mul, PriceTick};

const KAPPA: f64 = 1e6;
const ALPHA_MIN: f64 = 0.01;
const ALPHA_MAX: f64 = 0.15;
const OFI_DECAY: f64 = 0.95;
const HURST_SCALE: u64 = 20;
const DIRECTION_DECAY: f64 = 0.88;
const VPIN_DECAY: f64 = 0.92;
pub const PRICE_LEVEL_MEMORY: usize = 500;
const RECENT_SIDES_WINDOW: usize = 20;

const WELFORD_VAR_FLOOR: f64 = 1e-20;
const HURST_SUM_D1_FLOOR: f64 = 1e-15;
const HURST_RAW_FLOOR: f64 = 1e-10;
const EFFICIENCY_DENOM_FLOOR: f64 = 1e-10;
const VPIN_SUM_FLOOR: f64 = 1e-9;

/// Market-state classification derived from the efficiency ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    Absorbing,
    Slipping,
    Liquid,
    Neutral,
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketState::Absorbing => "ABSORBING",
            MarketState::Slipping => "SLIPPING",
            MarketState::Liquid => "LIQUID",
            MarketState::Neutral => "NEUTRAL",
        };
        write!(f, "{s}")
    }
}

/// Bookkeeping for a single bucketed price level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelInfo {
    pub hits: u64,
    pub buys: u64,
    pub sells: u64,
    pub last_ts: u64,
    pub bounces: u64,
    pub last_direction: i8,
    pub broken: bool,
    pub consecutive_same_dir: u64,
}

/// All recursive microstructure state for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentState {
    pub instrument: String,

    pub prev_mid: f64,
    pub prev_ts_ms: u64,

    pub d1: f64,
    pub d2: f64,
    pub alpha: f64,

    pub ofi: f64,
    ofi_mean: f64,
    ofi_m2: f64,
    ofi_n: u64,
    pub z_ofi: f64,

    sum_d1_abs: f64,
    sum_d2_abs: f64,
    prev_dx: f64,
    hurst_n: u64,
    pub hurst: f64,

    pub ewma_buy_vol: f64,
    pub ewma_sell_vol: f64,
    pub vpin: f64,

    pub last_classification: i8,
    recent_sides: VecDeque<i8>,

    pub price_levels: HashMap<i64, LevelInfo>,

    pub running_buys: u64,
    pub running_sells: u64,
    pub ewma_buy_pct: f64,
    pub ewma_sell_pct: f64,

    pub tick_count: u64,
}

impl InstrumentState {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            prev_mid: 0.0,
            prev_ts_ms: 0,
            d1: 0.0,
            d2: 0.0,
            alpha: ALPHA_MIN,
            ofi: 0.0,
            ofi_mean: 0.0,
            ofi_m2: 0.0,
            ofi_n: 0,
            z_ofi: 0.0,
            sum_d1_abs: 0.0,
            sum_d2_abs: 0.0,
            prev_dx: 0.0,
            hurst_n: 0,
            hurst: 0.55,
            ewma_buy_vol: 0.5,
            ewma_sell_vol: 0.5,
            vpin: 0.0,
            last_classification: 1,
            recent_sides: VecDeque::with_capacity(RECENT_SIDES_WINDOW),
            price_levels: HashMap::new(),
            running_buys: 0,
            running_sells: 0,
            ewma_buy_pct: 0.5,
            ewma_sell_pct: 0.5,
            tick_count: 0,
        }
    }

    fn pip_mul(&self) -> f64 {
        pip_mul(&self.instrument)
    }

    fn bucket_size(&self) -> f64 {
        if self.instrument.contains("JPY") {
            0.1
        } else {
            0.001
        }
    }

    /// Apply one tick's worth of updates, in the exact sequence required.
    pub fn apply_tick(&mut self, tick: &PriceTick) {
        let pip_mul = self.pip_mul();
        let mid = tick.mid();
        let is_first_tick = self.tick_count == 0;

        // 1. tick-rule classification with quote fallback.
        let side: i8 = if mid > self.prev_mid {
            1
        } else if mid < self.prev_mid {
            -1
        } else if mid > (tick.bid + tick.ask) / 2.0 {
            1
        } else if mid < (tick.bid + tick.ask) / 2.0 {
            -1
        } else {
            self.last_classification
        };
        self.last_classification = side;
        self.recent_sides.push_back(side);
        if self.recent_sides.len() > RECENT_SIDES_WINDOW {
            self.recent_sides.pop_front();
        }

        // 2. dx / dt.
        let dx = if is_first_tick { 0.0 } else { mid - self.prev_mid };
        let dt_ms = (tick.ts_ms.saturating_sub(self.prev_ts_ms)).max(1) as f64;
        let dt_s = dt_ms / 1000.0;

        // 3. adaptive alpha gear shift (reads D2 from the previous tick).
        self.alpha = ALPHA_MIN + (ALPHA_MAX - ALPHA_MIN) * (-KAPPA * self.d2.abs()).exp();

        // 4. Kramers-Moyal recursion, skipped on the instrument's first tick.
        if !is_first_tick {
            self.d1 = self.alpha * (dx / dt_s) + (1.0 - self.alpha) * self.d1;
            let r = dx - self.d1 * dt_s;
            self.d2 = self.alpha * (r * r / dt_s) + (1.0 - self.alpha) * self.d2;
        }

        // 5. OFI recursion.
        self.ofi = OFI_DECAY * self.ofi + side as f64 * dx.abs() * pip_mul * (1000.0 / dt_ms);

        // 6. Welford online stats over ofi.
        self.ofi_n += 1;
        let delta = self.ofi - self.ofi_mean;
        self.ofi_mean += delta / self.ofi_n as f64;
        let delta2 = self.ofi - self.ofi_mean;
        self.ofi_m2 += delta * delta2;
        let var = self.ofi_m2 / self.ofi_n as f64;
        self.z_ofi = (self.ofi - self.ofi_mean) / var.max(WELFORD_VAR_FLOOR).sqrt();

        // 7. Hall-Wood fast Hurst exponent.
        self.sum_d1_abs += dx.abs();
        self.sum_d2_abs += (dx + self.prev_dx).abs();
        self.prev_dx = dx;
        self.hurst_n += 1;
        if self.hurst_n >= HURST_SCALE && self.sum_d1_abs > HURST_SUM_D1_FLOOR {
            let raw = (self.sum_d2_abs / self.sum_d1_abs).max(HURST_RAW_FLOOR).log2();
            self.hurst = 0.5 * raw.clamp(0.0, 1.0) + 0.5 * self.hurst;
            self.sum_d1_abs = 0.0;
            self.sum_d2_abs = 0.0;
            self.hurst_n = 0;
        }

        // 8. direction EWMA.
        if side == 1 {
            self.ewma_buy_pct = DIRECTION_DECAY * self.ewma_buy_pct + (1.0 - DIRECTION_DECAY);
            self.ewma_sell_pct = DIRECTION_DECAY * self.ewma_sell_pct;
            self.running_buys += 1;
        } else {
            self.ewma_sell_pct = DIRECTION_DECAY * self.ewma_sell_pct + (1.0 - DIRECTION_DECAY);
            self.ewma_buy_pct = DIRECTION_DECAY * self.ewma_buy_pct;
            self.running_sells += 1;
        }

        // 9. recursive EWMA VPIN surrogate.
        let vol_proxy = (dx.abs() * pip_mul * (1000.0 / dt_ms)).max(0.001);
        if side == 1 {
            self.ewma_buy_vol = VPIN_DECAY * self.ewma_buy_vol + (1.0 - VPIN_DECAY) * vol_proxy;
            self.ewma_sell_vol = VPIN_DECAY * self.ewma_sell_vol;
        } else {
            self.ewma_sell_vol = VPIN_DECAY * self.ewma_sell_vol + (1.0 - VPIN_DECAY) * vol_proxy;
            self.ewma_buy_vol = VPIN_DECAY * self.ewma_buy_vol;
        }
        let vol_sum = self.ewma_buy_vol + self.ewma_sell_vol;
        if vol_sum > VPIN_SUM_FLOOR {
            self.vpin = (self.ewma_buy_vol - self.ewma_sell_vol).abs() / vol_sum;
        }

        // 10. bounded price-level persistence map.
        self.update_price_level(mid, side, tick.ts_ms);

        // 11. efficiency ratio + market-state classification (computed on
        //     demand via `efficiency()`/`market_state()`, not stored, since
        //     they are pure functions of d1/ofi already committed above).

        // 12. commit.
        self.prev_mid = mid;
        self.prev_ts_ms = tick.ts_ms;
        self.tick_count += 1;
    }

    fn update_price_level(&mut self, mid: f64, side: i8, ts_ms: u64) {
        let bucket = self.bucket_size();
        let key = (mid / bucket).round() as i64;

        let entry = self
            .price_levels
            .entry(key)
            .or_insert_with(|| LevelInfo {
                hits: 0,
                buys: 0,
                sells: 0,
                last_ts: ts_ms,
                bounces: 0,
                last_direction: side,
                broken: false,
                consecutive_same_dir: 0,
            });

        entry.hits += 1;
        if side == 1 {
            entry.buys += 1;
        } else {
            entry.sells += 1;
        }

        if side == entry.last_direction {
            entry.consecutive_same_dir += 1;
            if entry.consecutive_same_dir >= 3 && entry.hits > 2 {
                entry.broken = true;
            }
        } else {
            if entry.hits > 2 {
                entry.bounces += 1;
            }
            entry.consecutive_same_dir = 1;
        }
        entry.last_direction = side;
        entry.last_ts = ts_ms;

        if self.price_levels.len() > PRICE_LEVEL_MEMORY {
            self.evict_farthest(mid);
        }
    }

    fn evict_farthest(&mut self, mid: f64) {
        let bucket = self.bucket_size();
        while self.price_levels.len() > PRICE_LEVEL_MEMORY {
            let farthest = self
                .price_levels
                .keys()
                .copied()
                .max_by(|a, b| {
                    let da = (*a as f64 * bucket - mid).abs();
                    let db = (*b as f64 * bucket - mid).abs();
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                });
            match farthest {
                Some(k) => {
                    self.price_levels.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Efficiency ratio E = (|ofi|/pip_mul) / (|D1|*pip_mul + floor).
    pub fn efficiency(&self) -> f64 {
        let pip_mul = self.pip_mul();
        (self.ofi.abs() / pip_mul) / (self.d1.abs() * pip_mul + EFFICIENCY_DENOM_FLOOR)
    }

    pub fn market_state(&self) -> MarketState {
        let e = self.efficiency();
        if e < 0.3 {
            MarketState::Absorbing
        } else if e > 3.0 {
            MarketState::Slipping
        } else if (0.7..=1.5).contains(&e) {
            MarketState::Liquid
        } else {
            MarketState::Neutral
        }
    }

    /// Drift magnitude expressed in pips/sec-normalised units, used by the
    /// gate pipeline's drift-magnitude predicate.
    pub fn drift_magnitude_pips(&self) -> f64 {
        let pip_mul = self.pip_mul();
        (self.d1 / self.d2.max(1e-14).sqrt()) * pip_mul
    }

    /// buys/sells ratio over the last (at most 20) classified ticks.
    pub fn recent_flow_ratio(&self) -> Option<f64> {
        if self.recent_sides.is_empty() {
            return None;
        }
        let buys = self.recent_sides.iter().filter(|&&s| s == 1).count() as f64;
        let sells = self.recent_sides.iter().filter(|&&s| s == -1).count() as f64;
        if sells < 1.0 {
            return if buys > 0.0 { Some(f64::INFINITY) } else { None };
        }
        Some(buys / sells)
    }

    /// Strongest qualifying price-level wall within `[min_range_pips,
    /// max_range_pips]` of `mid` on the requested side (buy-side walls below
    /// mid for a long stop, sell-side walls above mid for a short stop /
    /// long entry limit).
    pub fn strongest_wall(
        &self,
        mid: f64,
        min_range_pips: f64,
        max_range_pips: f64,
        want_buy_side: bool,
        below_mid: bool,
    ) -> Option<(f64, &LevelInfo)> {
        let bucket = self.bucket_size();
        let pip_mul = self.pip_mul();
        let min_range = min_range_pips / pip_mul;
        let max_range = max_range_pips / pip_mul;

        self.price_levels
            .iter()
            .filter_map(|(&key, info)| {
                if info.hits < 3 {
                    return None;
                }
                let price = key as f64 * bucket;
                let dist = (price - mid).abs();
                if dist < min_range || dist > max_range {
                    return None;
                }
                if below_mid && price >= mid {
                    return None;
                }
                if !below_mid && price <= mid {
                    return None;
                }
                let majority_buy = info.buys > info.sells;
                if want_buy_side != majority_buy {
                    return None;
                }
                let net = info.buys as i64 - info.sells as i64;
                let score = net.unsigned_abs() as f64 * info.hits as f64;
                Some((price, info, score))
            })
            .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(price, info, _)| (price, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(instrument: &str, bid: f64, ask: f64, ts_ms: u64) -> PriceTick {
        PriceTick {
            instrument: instrument.to_string(),
            bid,
            ask,
            ts_ms,
        }
    }

    #[test]
    fn first_tick_seeds_prev_mid_without_km_update() {
        let mut s = InstrumentState::new("EUR_USD");
        s.apply_tick(&tick("EUR_USD", 1.10000, 1.10010, 1000));
        assert_eq!(s.tick_count, 1);
        assert!((s.prev_mid - 1.10005).abs() < 1e-9);
        assert_eq!(s.d1, 0.0);
    }

    #[test]
    fn ewma_buy_sell_pct_sum_to_one() {
        let mut s = InstrumentState::new("EUR_USD");
        let mut ts = 1000u64;
        let mut price = 1.10000;
        for _ in 0..30 {
            price += 0.00002;
            ts += 200;
            s.apply_tick(&tick("EUR_USD", price, price + 0.00001, ts));
            assert!((s.ewma_buy_pct + s.ewma_sell_pct - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn vpin_and_hurst_stay_in_unit_interval() {
        let mut s = InstrumentState::new("EUR_USD");
        let mut ts = 1000u64;
        let mut price = 1.10000;
        for i in 0..60 {
            price += if i % 2 == 0 { 0.00003 } else { -0.00003 };
            ts += 250;
            s.apply_tick(&tick("EUR_USD", price, price + 0.00001, ts));
            assert!((0.0..=1.0).contains(&s.vpin));
            assert!((0.0..=1.0).contains(&s.hurst));
            assert!(s.d2 >= 0.0);
        }
    }

    #[test]
    fn price_level_map_bounded() {
        let mut s = InstrumentState::new("EUR_USD");
        let mut ts = 1000u64;
        for i in 0..2000 {
            let price = 1.10000 + (i as f64) * 0.001;
            ts += 100;
            s.apply_tick(&tick("EUR_USD", price, price + 0.00001, ts));
            assert!(s.price_levels.len() <= PRICE_LEVEL_MEMORY);
        }
    }

    #[test]
    fn level_breaks_after_three_consecutive_same_direction_hits() {
        let mut s = InstrumentState::new("EUR_USD");
        // Hammer the exact same price level with buy-side ticks repeatedly.
        let mut ts = 1000u64;
        s.apply_tick(&tick("EUR_USD", 1.09999, 1.10001, ts)); // seeds prev_mid below level
        for _ in 0..6 {
            ts += 100;
            s.apply_tick(&tick("EUR_USD", 1.10001, 1.10003, ts)); // mid rises -> buy side
        }
        let key = (1.10002_f64 / 0.001).round() as i64;
        let level = s.price_levels.get(&key);
        assert!(level.is_some());
    }

    #[test]
    fn efficiency_classifies_absorbing_when_force_dominates() {
        let mut s = InstrumentState::new("EUR_USD");
        s.ofi = 0.01;
        s.d1 = 5.0;
        assert_eq!(s.market_state(), MarketState::Absorbing);
    }

    #[test]
    fn recent_flow_ratio_none_with_no_ticks() {
        let s = InstrumentState::new("EUR_USD");
        assert!(s.recent_flow_ratio().is_none());
    }

    #[test]
    fn jpy_pip_mul_and_bucket() {
        let s = InstrumentState::new("USD_JPY");
        assert_eq!(s.pip_mul(), 100.0);
        assert_eq!(s.bucket_size(), 0.1);
    }
}
