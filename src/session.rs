// =============================================================================
// Session Orchestrator
// =============================================================================
//
// Owns the whole session lifecycle: loads configuration and cross-session
// cooldown state, opens the broker stream, drives the decode loop under a
// hard monotonic deadline well below the hosting runtime's own timeout,
// snapshots per-instrument observable state on shutdown, and returns a
// structured report. `Session` exclusively owns every piece of per-instrument
// state; none of it survives past `run()` returning except the persisted
// snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::broker::client::BrokerClient;
use crate::config::SessionConfig;
use crate::executor::{self, ExecutionOutcome, SlippageRecord};
use crate::exit_authority::{ExitAuthority, EXIT_POLL_INTERVAL_MS};
use crate::guards::GuardBook;
use crate::instrument_state::InstrumentState;
use crate::persistence::{PersistenceAdapter, SnapshotPayload};
use crate::predator::{self, PredatorState};
use crate::tick;

const ENGINE_NAME: &str = "predatory_hunter";
const SNAPSHOT_MEMORY_TYPE: &str = "ofi_synthetic_book";
const SNAPSHOT_MEMORY_KEY: &str = "latest_snapshot";

/// Final structured report returned when a session completes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionReport {
    pub duration_ms: u64,
    pub ticks_processed: u64,
    pub fires: u64,
    pub autonomous_exits: u64,
    pub slippage_summary: HashMap<String, SlippageRecord>,
    pub gate_diagnostics: HashMap<String, u64>,
    pub snapshot: serde_json::Value,
}

/// Owns all per-session mutable state. Created fresh every invocation; every
/// rolling window and recursive estimator dies with it.
pub struct Session {
    instruments: Vec<String>,
    broker: BrokerClient,
    persistence: Box<dyn PersistenceAdapter>,
    admin_user_id: String,
    cfg: SessionConfig,

    micro_states: HashMap<String, InstrumentState>,
    predator_states: HashMap<String, PredatorState>,
    slippage: HashMap<String, SlippageRecord>,
    guards: GuardBook,
    exit_authority: ExitAuthority,

    gate_diagnostics: HashMap<String, u64>,
    ticks_processed: u64,
    fires: u64,
    autonomous_exits: u64,
}

impl Session {
    /// Run the full startup sequence: load config, cooldown, open positions,
    /// compute the instrument set (minus blocked), and construct `Session`.
    pub async fn start(
        persistence: Box<dyn PersistenceAdapter>,
        broker: BrokerClient,
        admin_user_id: String,
        candidate_instruments: Vec<String>,
    ) -> anyhow::Result<Self> {
        let cfg: SessionConfig = persistence
            .load_config("session_config")
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let instruments: Vec<String> = candidate_instruments
            .into_iter()
            .filter(|i| !cfg.blocked_instruments.contains(i))
            .collect();

        let now_ms = now_ms() as i64;
        let cooldown_window_ms = cfg.cooldown_secs * 1000;
        let recent_fires = persistence
            .load_recent_fires(cooldown_window_ms, now_ms)
            .unwrap_or_default();

        let mut predator_states = HashMap::new();
        for instrument in &instruments {
            let seeded_ts = recent_fires.get(instrument).copied().unwrap_or(0);
            predator_states.insert(instrument.clone(), PredatorState::seeded(seeded_ts));
        }

        let open_positions = persistence.load_open_positions().unwrap_or_default();
        info!(count = open_positions.len(), "loaded open-positions snapshot");
        let exit_authority = ExitAuthority::new(open_positions);

        let micro_states = instruments
            .iter()
            .map(|i| (i.clone(), InstrumentState::new(i.clone())))
            .collect();
        let slippage = instruments
            .iter()
            .map(|i| (i.clone(), SlippageRecord::default()))
            .collect();

        Ok(Self {
            instruments,
            broker,
            persistence,
            admin_user_id,
            cfg,
            micro_states,
            predator_states,
            slippage,
            guards: GuardBook::new(),
            exit_authority,
            gate_diagnostics: HashMap::new(),
            ticks_processed: 0,
            fires: 0,
            autonomous_exits: 0,
        })
    }

    /// Drive the processing loop until stream EOF, the deadline elapses, or
    /// the loop is cancelled, then build and return the session report.
    pub async fn run(mut self) -> anyhow::Result<SessionReport> {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.cfg.max_stream_secs);
        let mut last_exit_scan_ms: i64 = 0;

        let stream = self.broker.open_price_stream(&self.instruments).await?;
        tokio::pin!(stream);
        let mut buf = String::new();

        loop {
            if started.elapsed() >= deadline {
                info!("session deadline reached, shutting down");
                break;
            }

            let chunk = tokio::select! {
                biased;
                _ = tokio::time::sleep(deadline.saturating_sub(started.elapsed())) => {
                    info!("session deadline reached mid-read, shutting down");
                    break;
                }
                item = stream.next() => item,
            };

            let bytes = match chunk {
                Some(Ok(b)) => b,
                Some(Err(e)) => {
                    warn!(error = %e, "broker stream error, continuing");
                    continue;
                }
                None => {
                    info!("broker stream EOF, shutting down");
                    break;
                }
            };

            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                self.process_line(&line, &mut last_exit_scan_ms).await;
            }
        }

        self.shutdown(started.elapsed()).await
    }

    async fn process_line(&mut self, line: &str, last_exit_scan_ms: &mut i64) {
        let parsed = match tick::decode_line(line) {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "malformed price line, skipping");
                return;
            }
        };

        if !self.instruments.iter().any(|i| i == &parsed.instrument) {
            return;
        }

        self.guards
            .record(&parsed.instrument, parsed.spread_pips(), parsed.ts_ms);

        let micro = self
            .micro_states
            .entry(parsed.instrument.clone())
            .or_insert_with(|| InstrumentState::new(parsed.instrument.clone()));
        micro.apply_tick(&parsed);
        self.ticks_processed += 1;

        self.exit_authority
            .record_tick(&parsed.instrument, micro.prev_mid, parsed.ts_ms as i64);

        let now_ms = parsed.ts_ms as i64;
        let predator_state = self
            .predator_states
            .entry(parsed.instrument.clone())
            .or_insert_with(PredatorState::new);

        let audit = predator::evaluate(
            &parsed.instrument,
            micro,
            &self.guards,
            predator_state,
            &self.cfg,
            now_ms,
        );

        if let Some(gate) = audit.blocked_at {
            *self.gate_diagnostics.entry(gate.to_string()).or_insert(0) += 1;
        }

        if audit.fired {
            if let Some(direction) = audit.candidate_direction {
                let slippage = self
                    .slippage
                    .entry(parsed.instrument.clone())
                    .or_insert_with(SlippageRecord::default);

                let outcome = executor::execute_fire(
                    &self.broker,
                    self.persistence.as_ref(),
                    &self.guards,
                    micro,
                    slippage,
                    &audit,
                    direction,
                    micro.prev_mid,
                    parsed.spread_pips(),
                    parsed.ts_ms,
                    &self.cfg,
                    &self.admin_user_id,
                    ENGINE_NAME,
                )
                .await;

                match outcome {
                    ExecutionOutcome::Filled { .. } | ExecutionOutcome::Submitted { .. } => {
                        self.fires += 1;
                    }
                    ExecutionOutcome::Rejected { reason } => {
                        warn!(instrument = %parsed.instrument, reason, "fire rejected at executor");
                    }
                }
            }
        }

        if now_ms - *last_exit_scan_ms >= EXIT_POLL_INTERVAL_MS {
            *last_exit_scan_ms = now_ms;
            let results = self
                .exit_authority
                .scan(
                    &self.micro_states,
                    &self.broker,
                    self.persistence.as_ref(),
                    &self.cfg,
                    now_ms,
                )
                .await;
            for result in results {
                if matches!(result, crate::exit_authority::ExitScanResult::Closed { .. }) {
                    self.autonomous_exits += 1;
                }
            }
        }
    }

    async fn shutdown(self, elapsed: Duration) -> anyhow::Result<SessionReport> {
        let snapshot = serde_json::to_value(&self.micro_states).unwrap_or_default();

        let payload = SnapshotPayload {
            memory_type: SNAPSHOT_MEMORY_TYPE.to_string(),
            memory_key: SNAPSHOT_MEMORY_KEY.to_string(),
            payload: snapshot.clone(),
            relevance_score: 1.0,
            created_by: ENGINE_NAME.to_string(),
        };
        if let Err(e) = self.persistence.upsert_snapshot(&payload) {
            warn!(error = %e, "failed to persist shutdown snapshot");
        }

        info!(
            gate_diagnostics = ?self.gate_diagnostics,
            ticks = self.ticks_processed,
            fires = self.fires,
            autonomous_exits = self.autonomous_exits,
            "session complete"
        );

        Ok(SessionReport {
            duration_ms: elapsed.as_millis() as u64,
            ticks_processed: self.ticks_processed,
            fires: self.fires,
            autonomous_exits: self.autonomous_exits,
            slippage_summary: self.slippage,
            gate_diagnostics: self.gate_diagnostics,
            snapshot,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_authority::OpenPositionView;
    use crate::persistence::{AuditRow, OrderRow};
    use std::sync::Mutex;

    /// In-memory adapter for session-level unit tests; the file-backed
    /// adapter is exercised directly in `persistence.rs`.
    #[derive(Default)]
    struct MemoryAdapter {
        config: serde_json::Value,
        open_positions: Vec<OpenPositionView>,
        orders: Mutex<Vec<OrderRow>>,
    }

    impl PersistenceAdapter for MemoryAdapter {
        fn load_config(&self, _key: &str) -> anyhow::Result<serde_json::Value> {
            Ok(self.config.clone())
        }
        fn write_order(&self, row: &OrderRow) -> anyhow::Result<()> {
            self.orders.lock().unwrap().push(row.clone());
            Ok(())
        }
        fn write_audit(&self, _row: &AuditRow) -> anyhow::Result<()> {
            Ok(())
        }
        fn upsert_snapshot(&self, _snapshot: &SnapshotPayload) -> anyhow::Result<()> {
            Ok(())
        }
        fn update_order_exit(
            &self,
            _signal_id: &str,
            _exit_price: f64,
            _status: &str,
            _reason: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        fn load_open_positions(&self) -> anyhow::Result<Vec<OpenPositionView>> {
            Ok(self.open_positions.clone())
        }
        fn load_recent_fires(
            &self,
            _window_ms: i64,
            _now_ms: i64,
        ) -> anyhow::Result<HashMap<String, i64>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn start_builds_instrument_set_minus_blocked() {
        let mut adapter = MemoryAdapter::default();
        adapter.config = serde_json::json!({ "blocked_instruments": ["USD_TRY"] });
        let broker = BrokerClient::new("https://example.test", "acct", "token");
        let session = Session::start(
            Box::new(adapter),
            broker,
            "admin".to_string(),
            vec!["EUR_USD".to_string(), "USD_TRY".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(session.instruments, vec!["EUR_USD".to_string()]);
        assert!(session.micro_states.contains_key("EUR_USD"));
        assert!(!session.micro_states.contains_key("USD_TRY"));
    }

    #[tokio::test]
    async fn start_seeds_predator_state_from_open_positions_and_cooldown() {
        let adapter = MemoryAdapter::default();
        let broker = BrokerClient::new("https://example.test", "acct", "token");
        let session = Session::start(
            Box::new(adapter),
            broker,
            "admin".to_string(),
            vec!["EUR_USD".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(
            session.predator_states.get("EUR_USD").unwrap().last_fire_ts_ms,
            0
        );
        assert_eq!(session.exit_authority.open_position_count(), 0);
    }
}
