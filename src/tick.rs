// =============================================================================
// Tick Decoder
// =============================================================================
//
// Parses line-delimited records from the broker's price stream. Each line is
// either a PRICE record (turned into a `PriceTick`) or something else
// (HEARTBEAT, malformed JSON) which is silently skipped — the stream is never
// allowed to terminate the session over a bad line.

use anyhow::{Context, Result};

/// A single bid/ask observation for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub instrument: String,
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: u64,
}

impl PriceTick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn spread_pips(&self) -> f64 {
        self.spread() * pip_mul(&self.instrument)
    }
}

/// Pip multiplier: 100 for JPY-quoted instruments, 10000 otherwise.
pub fn pip_mul(instrument: &str) -> f64 {
    if instrument.contains("JPY") {
        100.0
    } else {
        10000.0
    }
}

/// Decode one line of the broker stream. Returns `Ok(None)` for anything that
/// is not a `type == "PRICE"` record (heartbeats, unrecognised types, blank
/// lines) and `Err` only when the line looks like a price record but is
/// missing a field it must have.
pub fn decode_line(line: &str) -> Result<Option<PriceTick>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let root: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let record_type = root.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if record_type != "PRICE" {
        return Ok(None);
    }

    let instrument = root["instrument"]
        .as_str()
        .context("PRICE record missing instrument")?
        .to_string();

    let bid = root["bids"][0]["price"]
        .as_str()
        .context("PRICE record missing bids[0].price")?
        .parse::<f64>()
        .context("bids[0].price is not a valid f64")?;

    let ask = root["asks"][0]["price"]
        .as_str()
        .context("PRICE record missing asks[0].price")?
        .parse::<f64>()
        .context("asks[0].price is not a valid f64")?;

    let ts_ms = root
        .get("time_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or_else(now_ms);

    Ok(Some(PriceTick {
        instrument,
        bid,
        ask,
        ts_ms,
    }))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pip_mul_jpy() {
        assert_eq!(pip_mul("USD_JPY"), 100.0);
    }

    #[test]
    fn pip_mul_non_jpy() {
        assert_eq!(pip_mul("EUR_USD"), 10000.0);
    }

    #[test]
    fn decode_valid_price_record() {
        let line = r#"{"type":"PRICE","instrument":"EUR_USD","time_ms":1000,
            "bids":[{"price":"1.10000"}],"asks":[{"price":"1.10010"}]}"#;
        let tick = decode_line(line).unwrap().unwrap();
        assert_eq!(tick.instrument, "EUR_USD");
        assert!((tick.bid - 1.10000).abs() < 1e-9);
        assert!((tick.ask - 1.10010).abs() < 1e-9);
        assert_eq!(tick.ts_ms, 1000);
    }

    #[test]
    fn decode_heartbeat_is_none() {
        let line = r#"{"type":"HEARTBEAT","time":"2024-01-01T00:00:00Z"}"#;
        assert!(decode_line(line).unwrap().is_none());
    }

    #[test]
    fn decode_malformed_json_is_none() {
        assert!(decode_line("not json at all {{{").unwrap().is_none());
    }

    #[test]
    fn decode_blank_line_is_none() {
        assert!(decode_line("   ").unwrap().is_none());
    }

    #[test]
    fn decode_price_missing_field_is_err() {
        let line = r#"{"type":"PRICE","instrument":"EUR_USD"}"#;
        assert!(decode_line(line).is_err());
    }

    #[test]
    fn mid_and_spread_pips() {
        let tick = PriceTick {
            instrument: "EUR_USD".to_string(),
            bid: 1.10000,
            ask: 1.10010,
            ts_ms: 0,
        };
        assert!((tick.mid() - 1.10005).abs() < 1e-9);
        assert!((tick.spread_pips() - 1.0).abs() < 1e-6);
    }
}
