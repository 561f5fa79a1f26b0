// =============================================================================
// Broker REST + streaming client
// =============================================================================
//
// Bearer-authenticated client against an OANDA-shaped API: a chunked
// `application/stream+json` pricing feed, a POST orders endpoint, and PUT
// endpoints for stop-loss updates and market-close. No request signing —
// a single bearer token is attached to every call.

use anyhow::{Context, Result};
use futures_util::Stream;
use serde_json::{json, Value};

use crate::errors::{ExitOutcome, OrderOutcome};
use crate::predator::Direction;

pub struct BrokerClient {
    http: reqwest::Client,
    api_base: String,
    account_id: String,
    token: String,
}

impl BrokerClient {
    pub fn new(api_base: impl Into<String>, account_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            account_id: account_id.into(),
            token: token.into(),
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    /// Open the streaming pricing feed for the given instruments. Returns a
    /// byte stream the caller splits on newlines and decodes line by line.
    pub async fn open_price_stream(
        &self,
        instruments: &[String],
    ) -> Result<impl Stream<Item = reqwest::Result<bytes::Bytes>>> {
        let url = format!(
            "{}/accounts/{}/pricing/stream?instruments={}&snapshot=true",
            self.api_base,
            self.account_id,
            instruments.join(",")
        );
        let resp = self
            .auth(self.http.get(&url))
            .send()
            .await
            .context("failed to open broker pricing stream")?
            .error_for_status()
            .context("broker pricing stream returned an error status")?;
        Ok(resp.bytes_stream())
    }

    /// Submit a market or limit order. `units` is signed: negative for short.
    /// Price and distance fields arrive pre-formatted to the instrument's
    /// correct decimal precision (the Order Executor owns that formatting).
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        instrument: &str,
        order_type: &str,
        units: f64,
        price: Option<&str>,
        stop_loss_distance: &str,
        take_profit_distance: &str,
    ) -> OrderOutcome {
        let mut order = json!({
            "type": order_type,
            "instrument": instrument,
            "units": format!("{:.0}", units),
            "timeInForce": if order_type == "MARKET" { "FOK" } else { "GTD" },
            "stopLossOnFill": { "distance": stop_loss_distance, "timeInForce": "GTC" },
            "takeProfitOnFill": { "distance": take_profit_distance, "timeInForce": "GTC" },
        });
        if let Some(p) = price {
            order["price"] = json!(p);
            order["gtdTime"] = json!(chrono::Utc::now()
                .checked_add_signed(chrono::Duration::minutes(5))
                .unwrap_or_else(chrono::Utc::now)
                .to_rfc3339());
        }
        let body = json!({ "order": order });

        let url = format!("{}/accounts/{}/orders", self.api_base, self.account_id);
        let resp = match self.auth(self.http.post(&url)).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return OrderOutcome::TransportError(e.to_string()),
        };
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return OrderOutcome::TransportError(e.to_string()),
        };
        classify_order_response(&value)
    }

    /// PUT a stop-loss update for an open trade. `price` arrives pre-formatted
    /// to the instrument's correct decimal precision.
    pub async fn update_stop_loss(&self, trade_id: &str, price: &str) -> ExitOutcome {
        let url = format!(
            "{}/accounts/{}/trades/{trade_id}/orders",
            self.api_base, self.account_id
        );
        let body = json!({ "stopLoss": { "price": price, "timeInForce": "GTC" } });
        match self.auth(self.http.put(&url)).json(&body).send().await {
            Ok(r) if r.status().is_success() => ExitOutcome::Applied,
            Ok(r) => ExitOutcome::Failed(format!("status {}", r.status())),
            Err(e) => ExitOutcome::Failed(e.to_string()),
        }
    }

    /// PUT a market-close for an open trade.
    pub async fn close_trade(&self, trade_id: &str) -> ExitOutcome {
        let url = format!(
            "{}/accounts/{}/trades/{trade_id}/close",
            self.api_base, self.account_id
        );
        match self.auth(self.http.put(&url)).send().await {
            Ok(r) if r.status().is_success() => ExitOutcome::Applied,
            Ok(r) => ExitOutcome::Failed(format!("status {}", r.status())),
            Err(e) => ExitOutcome::Failed(e.to_string()),
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub fn order_direction_units(direction: Direction, base_units: f64) -> f64 {
    match direction {
        Direction::Long => base_units,
        Direction::Short => -base_units,
    }
}

fn classify_order_response(value: &Value) -> OrderOutcome {
    if let Some(fill) = value.get("orderFillTransaction") {
        let fill_price = fill["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let trade_id = fill["tradeOpened"]["tradeID"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        return OrderOutcome::Filled { fill_price, trade_id };
    }
    if let Some(create) = value.get("orderCreateTransaction") {
        let order_id = create["id"].as_str().unwrap_or_default().to_string();
        return OrderOutcome::Pending { order_id };
    }
    if let Some(reject) = value.get("orderRejectTransaction") {
        let reason = reject["rejectReason"]
            .as_str()
            .unwrap_or("unknown rejection")
            .to_string();
        return OrderOutcome::Rejected(reason);
    }
    if let Some(cancel) = value.get("orderCancelTransaction") {
        let reason = cancel["reason"].as_str().unwrap_or("cancelled").to_string();
        return OrderOutcome::Rejected(reason);
    }
    OrderOutcome::TransportError("unrecognised broker response shape".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_fill_response() {
        let value = json!({
            "orderFillTransaction": {
                "price": "1.10050",
                "tradeOpened": { "tradeID": "789" }
            }
        });
        match classify_order_response(&value) {
            OrderOutcome::Filled { fill_price, trade_id } => {
                assert!((fill_price - 1.10050).abs() < 1e-9);
                assert_eq!(trade_id, "789");
            }
            other => panic!("expected Filled, got {other:?}"),
        }
    }

    #[test]
    fn classify_pending_limit_response() {
        let value = json!({ "orderCreateTransaction": { "id": "321" } });
        match classify_order_response(&value) {
            OrderOutcome::Pending { order_id } => assert_eq!(order_id, "321"),
            other => panic!("expected Pending, got {other:?}"),
        }
    }

    #[test]
    fn classify_reject_response() {
        let value = json!({ "orderRejectTransaction": { "rejectReason": "INSUFFICIENT_MARGIN" } });
        match classify_order_response(&value) {
            OrderOutcome::Rejected(reason) => assert_eq!(reason, "INSUFFICIENT_MARGIN"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn units_are_negative_for_short() {
        assert_eq!(order_direction_units(Direction::Long, 1000.0), 1000.0);
        assert_eq!(order_direction_units(Direction::Short, 1000.0), -1000.0);
    }
}
