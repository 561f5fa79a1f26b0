// =============================================================================
// Persistence Adapter
// =============================================================================
//
// Thin interface to read configuration blobs and write order/audit rows and
// the microstructure snapshot. Writes are idempotent on retry. The file-backed
// implementation is a concrete default so the core can run standalone; a real
// deployment supplies its own `PersistenceAdapter` against its actual store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::exit_authority::OpenPositionView;

/// `oanda_orders` row, per the external persistence schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub user_id: String,
    pub signal_id: String,
    pub currency_pair: String,
    pub direction: String,
    pub units: f64,
    pub entry_price: Option<f64>,
    pub oanda_order_id: String,
    pub oanda_trade_id: Option<String>,
    pub status: String,
    pub environment: String,
    pub direction_engine: String,
    pub sovereign_override_tag: Option<String>,
    pub confidence_score: f64,
    pub governance_payload: serde_json::Value,
    pub requested_price: f64,
    pub slippage_pips: Option<f64>,
    pub spread_at_entry: f64,
    pub exit_price: Option<f64>,
    pub closed_at: Option<String>,
    pub health_governance_action: Option<String>,
}

/// `gate_bypasses` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub gate_id: String,
    pub reason: String,
    pub expires_at: Option<String>,
    pub revoked: bool,
    pub created_by: String,
}

/// Per-instrument snapshot payload upserted at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub memory_type: String,
    pub memory_key: String,
    pub payload: serde_json::Value,
    pub relevance_score: f64,
    pub created_by: String,
}

pub trait PersistenceAdapter: Send + Sync {
    fn load_config(&self, key: &str) -> Result<serde_json::Value>;
    fn write_order(&self, row: &OrderRow) -> Result<()>;
    fn write_audit(&self, row: &AuditRow) -> Result<()>;
    fn upsert_snapshot(&self, snapshot: &SnapshotPayload) -> Result<()>;
    /// Stamp an existing order row (by `signal_id`) with its close outcome.
    /// Used by the exit authority, which does not hold the full row the
    /// executor originally wrote. A no-op if the row is unknown.
    fn update_order_exit(
        &self,
        signal_id: &str,
        exit_price: f64,
        status: &str,
        health_governance_action: &str,
    ) -> Result<()>;
    /// One-shot load of currently open positions, read once at session start.
    fn load_open_positions(&self) -> Result<Vec<OpenPositionView>>;
    /// Seed cross-session cooldown: the most recent fire timestamp per
    /// instrument within `cooldown_window_ms` of `now_ms`. Cross-session
    /// cooldown reload is an input to the session, never a value the core
    /// computes from scratch.
    fn load_recent_fires(
        &self,
        cooldown_window_ms: i64,
        now_ms: i64,
    ) -> Result<HashMap<String, i64>>;
}

/// File-backed adapter: each concern lives under its own JSON file inside
/// `data_dir`. Writes are atomic (write to a `.tmp` sibling, then rename),
/// matching the configuration layer's own save convention.
pub struct FilePersistenceAdapter {
    data_dir: PathBuf,
}

impl FilePersistenceAdapter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {data_dir:?}"))?;
        Ok(Self { data_dir })
    }

    fn atomic_write(&self, path: &Path, contents: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)
            .with_context(|| format!("failed to write {tmp:?}"))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {tmp:?} -> {path:?}"))?;
        Ok(())
    }

    fn orders_path(&self) -> PathBuf {
        self.data_dir.join("oanda_orders.json")
    }

    fn audit_path(&self) -> PathBuf {
        self.data_dir.join("gate_bypasses.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("snapshot.json")
    }

    fn config_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("config_{key}.json"))
    }

    fn open_positions_path(&self) -> PathBuf {
        self.data_dir.join("open_positions.json")
    }

    fn load_orders(&self) -> HashMap<String, OrderRow> {
        fs::read_to_string(self.orders_path())
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }
}

impl PersistenceAdapter for FilePersistenceAdapter {
    fn load_config(&self, key: &str) -> Result<serde_json::Value> {
        match fs::read_to_string(self.config_path(key)) {
            Ok(contents) => {
                serde_json::from_str(&contents).context("config blob is not valid JSON")
            }
            Err(_) => Ok(serde_json::json!({})),
        }
    }

    fn write_order(&self, row: &OrderRow) -> Result<()> {
        let mut orders = self.load_orders();
        orders.insert(row.signal_id.clone(), row.clone());
        let json = serde_json::to_string_pretty(&orders)?;
        self.atomic_write(&self.orders_path(), &json)
    }

    fn write_audit(&self, row: &AuditRow) -> Result<()> {
        use std::io::Write;
        let line = serde_json::to_string(row)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path())
            .with_context(|| "failed to open audit log for append")?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn upsert_snapshot(&self, snapshot: &SnapshotPayload) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        self.atomic_write(&self.snapshot_path(), &json)
    }

    fn update_order_exit(
        &self,
        signal_id: &str,
        exit_price: f64,
        status: &str,
        health_governance_action: &str,
    ) -> Result<()> {
        let mut orders = self.load_orders();
        if let Some(row) = orders.get_mut(signal_id) {
            row.exit_price = Some(exit_price);
            row.status = status.to_string();
            row.health_governance_action = Some(health_governance_action.to_string());
            row.closed_at = Some(chrono::Utc::now().to_rfc3339());
            let json = serde_json::to_string_pretty(&orders)?;
            self.atomic_write(&self.orders_path(), &json)?;
        }
        Ok(())
    }

    fn load_open_positions(&self) -> Result<Vec<OpenPositionView>> {
        match fs::read_to_string(self.open_positions_path()) {
            Ok(contents) => serde_json::from_str(&contents)
                .context("open positions file is not valid JSON"),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn load_recent_fires(
        &self,
        cooldown_window_ms: i64,
        now_ms: i64,
    ) -> Result<HashMap<String, i64>> {
        let mut recent: HashMap<String, i64> = HashMap::new();
        for row in self.load_orders().values() {
            // signal_id is "<engine>:<instrument>:<ts_ms>" (see executor.rs).
            let Some(ts_str) = row.signal_id.rsplit(':').next() else {
                continue;
            };
            let Ok(ts_ms) = ts_str.parse::<i64>() else {
                continue;
            };
            if now_ms - ts_ms > cooldown_window_ms {
                continue;
            }
            recent
                .entry(row.currency_pair.clone())
                .and_modify(|existing| *existing = (*existing).max(ts_ms))
                .or_insert(ts_ms);
        }
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_adapter() -> (FilePersistenceAdapter, tempdir_guard::TempDir) {
        let dir = tempdir_guard::TempDir::new();
        let adapter = FilePersistenceAdapter::new(dir.path()).unwrap();
        (adapter, dir)
    }

    /// Minimal self-contained temp-dir guard so tests don't depend on an
    /// external `tempfile` crate the teacher's stack doesn't carry.
    mod tempdir_guard {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let path = std::env::temp_dir().join(format!(
                    "predatory-hunter-test-{}",
                    std::process::id()
                ));
                let _ = std::fs::remove_dir_all(&path);
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    fn sample_order(signal_id: &str) -> OrderRow {
        OrderRow {
            user_id: "admin".to_string(),
            signal_id: signal_id.to_string(),
            currency_pair: "EUR_USD".to_string(),
            direction: "long".to_string(),
            units: 1000.0,
            entry_price: Some(1.1),
            oanda_order_id: "123".to_string(),
            oanda_trade_id: Some("456".to_string()),
            status: "filled".to_string(),
            environment: "live".to_string(),
            direction_engine: "predatory_hunter".to_string(),
            sovereign_override_tag: None,
            confidence_score: 0.8,
            governance_payload: serde_json::json!({}),
            requested_price: 1.1,
            slippage_pips: Some(0.1),
            spread_at_entry: 1.0,
            exit_price: None,
            closed_at: None,
            health_governance_action: None,
        }
    }

    #[test]
    fn write_order_is_idempotent_on_retry() {
        let (adapter, _guard) = temp_adapter();
        let row = sample_order("engine:EUR_USD:1000");
        adapter.write_order(&row).unwrap();
        adapter.write_order(&row).unwrap();
        let orders = adapter.load_orders();
        assert_eq!(orders.len(), 1);
    }

    #[test]
    fn update_order_exit_stamps_known_row() {
        let (adapter, _guard) = temp_adapter();
        let row = sample_order("engine:EUR_USD:1000");
        adapter.write_order(&row).unwrap();
        adapter
            .update_order_exit("engine:EUR_USD:1000", 1.1050, "closed", "REGIME_EXIT")
            .unwrap();
        let orders = adapter.load_orders();
        let updated = orders.get("engine:EUR_USD:1000").unwrap();
        assert_eq!(updated.status, "closed");
        assert_eq!(updated.exit_price, Some(1.1050));
        assert_eq!(
            updated.health_governance_action.as_deref(),
            Some("REGIME_EXIT")
        );
    }

    #[test]
    fn update_order_exit_on_unknown_row_is_noop() {
        let (adapter, _guard) = temp_adapter();
        assert!(adapter
            .update_order_exit("nonexistent", 1.0, "closed", "REGIME_EXIT")
            .is_ok());
    }

    #[test]
    fn snapshot_upsert_overwrites_same_key() {
        let (adapter, _guard) = temp_adapter();
        let snap = SnapshotPayload {
            memory_type: "ofi_synthetic_book".to_string(),
            memory_key: "latest_snapshot".to_string(),
            payload: serde_json::json!({"a": 1}),
            relevance_score: 1.0,
            created_by: "engine".to_string(),
        };
        adapter.upsert_snapshot(&snap).unwrap();
        let snap2 = SnapshotPayload {
            payload: serde_json::json!({"a": 2}),
            ..snap
        };
        adapter.upsert_snapshot(&snap2).unwrap();
        let contents = fs::read_to_string(adapter.snapshot_path()).unwrap();
        assert!(contents.contains("\"a\": 2"));
    }

    #[test]
    fn audit_rows_append() {
        let (adapter, _guard) = temp_adapter();
        let row = AuditRow {
            gate_id: "PREDATOR_FIRE:EUR_USD".to_string(),
            reason: "{}".to_string(),
            expires_at: None,
            revoked: false,
            created_by: "engine".to_string(),
        };
        adapter.write_audit(&row).unwrap();
        adapter.write_audit(&row).unwrap();
        let contents = fs::read_to_string(adapter.audit_path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn load_open_positions_defaults_to_empty() {
        let (adapter, _guard) = temp_adapter();
        assert!(adapter.load_open_positions().unwrap().is_empty());
    }

    #[test]
    fn load_recent_fires_filters_by_window() {
        let (adapter, _guard) = temp_adapter();
        let mut old = sample_order("engine:EUR_USD:1000");
        old.signal_id = "engine:EUR_USD:1000".to_string();
        adapter.write_order(&old).unwrap();
        let mut recent = sample_order("engine:GBP_USD:500000");
        recent.currency_pair = "GBP_USD".to_string();
        adapter.write_order(&recent).unwrap();

        let fires = adapter.load_recent_fires(300_000, 500_100).unwrap();
        assert!(!fires.contains_key("EUR_USD"));
        assert_eq!(fires.get("GBP_USD"), Some(&500_000));
    }

    #[test]
    fn load_missing_config_returns_empty_object() {
        let (adapter, _guard) = temp_adapter();
        let value = adapter.load_config("nonexistent").unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
