//! Position Persistence (spec §4.3): survive restarts with no double orders
//! and no state regressions. The reference implementation stores the WAL,
//! snapshots, history, and kill-switch/halt state as append-only JSON-lines
//! files under a data directory, each write followed by `File::sync_data()` —
//! the simplest mechanism that satisfies "survives power loss between write
//! return and the next call" (§4.3). A secondary, best-effort audit log
//! (`position_actions`) is exempt from that contract and may batch.

mod halt;
mod wal;

pub use halt::{HaltStore, KillSwitchRecord};
pub use wal::{Intent, IntentStatus, Wal};

use crate::error::PersistenceError;
use crate::ids::PositionId;
use crate::position::ManagedPosition;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const POSITIONS_FILE: &str = "positions.jsonl";
const FILLS_FILE: &str = "position_fills.jsonl";
const HISTORY_FILE: &str = "history.jsonl";
const ACTIONS_FILE: &str = "position_actions.jsonl";

/// Durable store for Managed Position snapshots and the terminal-position
/// history table. The WAL itself lives in [`Wal`].
pub struct PositionStore {
    data_dir: PathBuf,
}

impl PositionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    fn append_durable(&self, file: &str, line: &str) -> Result<(), PersistenceError> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(file))?;
        writeln!(f, "{}", line)?;
        f.sync_data()?;
        Ok(())
    }

    /// Persists `position`'s current snapshot. Called on every state
    /// transition (§4.3); idempotent for an unchanged state.
    pub fn snapshot_position(&self, position: &ManagedPosition) -> Result<(), PersistenceError> {
        let bytes = position
            .snapshot()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let line = String::from_utf8(bytes).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        self.append_durable(POSITIONS_FILE, &line)
    }

    /// Appends a fill record line to the append-only fills log, keyed by
    /// `fill_id` (§6.3).
    pub fn append_fill(
        &self,
        position_id: &PositionId,
        fill: &crate::types::FillRecord,
    ) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(&serde_json::json!({
            "position_id": position_id.as_str(),
            "fill": fill,
        }))?;
        self.append_durable(FILLS_FILE, &line)
    }

    /// Appends a terminal position to history. Does not remove it from the
    /// `positions` snapshot log — the loader reconstructs live state by
    /// taking the latest snapshot per `position_id` and filtering out
    /// archived ids.
    pub fn archive(&self, position: &ManagedPosition) -> Result<(), PersistenceError> {
        let bytes = position
            .snapshot()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let line = String::from_utf8(bytes).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        self.append_durable(HISTORY_FILE, &line)
    }

    /// Best-effort audit trail of actions executed by the gateway. Exempt
    /// from the durability contract (§6.3); failures are swallowed by the
    /// caller, never escalated.
    pub fn append_action_audit(&self, line: &str) -> Result<(), PersistenceError> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(ACTIONS_FILE))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// Loads the latest snapshot per `position_id` from the positions log,
    /// excluding any that have since been archived to history.
    pub fn load_positions(&self) -> Result<Vec<ManagedPosition>, PersistenceError> {
        let archived = self.archived_ids()?;
        let mut latest: std::collections::HashMap<PositionId, ManagedPosition> =
            std::collections::HashMap::new();

        let path = self.path(POSITIONS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let position = ManagedPosition::from_snapshot(line.as_bytes())
                .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
            latest.insert(position.position_id().clone(), position);
        }

        Ok(latest
            .into_values()
            .filter(|p| !archived.contains(p.position_id()))
            .collect())
    }

    fn archived_ids(&self) -> Result<std::collections::HashSet<PositionId>, PersistenceError> {
        let path = self.path(HISTORY_FILE);
        if !path.exists() {
            return Ok(std::collections::HashSet::new());
        }
        let file = File::open(&path)?;
        let mut ids = std::collections::HashSet::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let position = ManagedPosition::from_snapshot(line.as_bytes())
                .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
            ids.insert(position.position_id().clone());
        }
        Ok(ids)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::ids::PositionId;
    use crate::position::PositionIntent;
    use crate::types::{Side, Symbol};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn intent() -> PositionIntent {
        PositionIntent {
            initial_size: dec!(1.0),
            initial_entry_price: dec!(50000),
            initial_stop_price: dec!(49000),
            initial_tp_prices: [dec!(50500), dec!(51000), dec!(52000)],
            entry_score: dec!(1),
            cluster: None,
            initial_stop_distance_pct: dec!(0.02),
            margin_used_at_entry: dec!(5000),
            atr_at_entry: None,
        }
    }

    #[test]
    fn snapshot_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = PositionStore::new(dir.path()).unwrap();
        let clock = FakeClock::new();

        let position = ManagedPosition::new(
            PositionId::try_from("p1".to_string()).unwrap(),
            Symbol::from("BTC/USD"),
            Side::Long,
            intent(),
            &clock,
        );
        store.snapshot_position(&position).unwrap();

        let loaded = store.load_positions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].position_id(), position.position_id());
    }

    #[test]
    fn archived_positions_excluded_from_load() {
        let dir = tempdir().unwrap();
        let store = PositionStore::new(dir.path()).unwrap();
        let clock = FakeClock::new();

        let position = ManagedPosition::new(
            PositionId::try_from("p1".to_string()).unwrap(),
            Symbol::from("BTC/USD"),
            Side::Long,
            intent(),
            &clock,
        );
        store.snapshot_position(&position).unwrap();
        store.archive(&position).unwrap();

        let loaded = store.load_positions().unwrap();
        assert!(loaded.is_empty());
    }
}
