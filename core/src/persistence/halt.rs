//! Kill-switch / halt-state persistence (spec §6.3): a small latched file. Its
//! mere presence on disk is the halt signal, so a restart during a halt comes
//! back up halted rather than silently resuming trading.

use crate::error::PersistenceError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::time::SystemTime;

const KILL_SWITCH_STATE_FILE: &str = "kill_switch_state.json";
const HALT_LATCH_FILE: &str = "halt_state.latch";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchRecord {
    pub trigger: String,
    pub reason: String,
    pub triggered_at: SystemTime,
    /// Rolling record of auto-recovery timestamps, used to enforce the
    /// per-24h cap.
    pub auto_recoveries: Vec<SystemTime>,
}

pub struct HaltStore {
    data_dir: PathBuf,
}

impl HaltStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join(KILL_SWITCH_STATE_FILE)
    }

    fn latch_path(&self) -> PathBuf {
        self.data_dir.join(HALT_LATCH_FILE)
    }

    pub fn write_kill_switch_state(&self, record: &KillSwitchRecord) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let mut f = File::create(self.state_path())?;
        f.write_all(&bytes)?;
        f.sync_data()?;
        Ok(())
    }

    pub fn read_kill_switch_state(&self) -> Result<Option<KillSwitchRecord>, PersistenceError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Writes the halt latch. Idempotent.
    pub fn write_halt_latch(&self) -> Result<(), PersistenceError> {
        let mut f = File::create(self.latch_path())?;
        f.write_all(b"halted")?;
        f.sync_data()?;
        Ok(())
    }

    /// Acknowledging the kill switch clears the latch but keeps the last
    /// kill-switch record on disk for audit.
    pub fn clear_halt_latch(&self) -> Result<(), PersistenceError> {
        let path = self.latch_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn is_latched(&self) -> bool {
        self.latch_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn latch_round_trips() {
        let dir = tempdir().unwrap();
        let store = HaltStore::new(dir.path()).unwrap();
        assert!(!store.is_latched());

        store.write_halt_latch().unwrap();
        assert!(store.is_latched());

        store.clear_halt_latch().unwrap();
        assert!(!store.is_latched());
    }

    #[test]
    fn kill_switch_state_persists_across_instances() {
        let dir = tempdir().unwrap();
        let store = HaltStore::new(dir.path()).unwrap();
        let record = KillSwitchRecord {
            trigger: "MARGIN_CRITICAL".to_string(),
            reason: "margin utilisation breached halt threshold".to_string(),
            triggered_at: SystemTime::now(),
            auto_recoveries: Vec::new(),
        };
        store.write_kill_switch_state(&record).unwrap();

        let reloaded = HaltStore::new(dir.path()).unwrap();
        let loaded = reloaded.read_kill_switch_state().unwrap().unwrap();
        assert_eq!(loaded.trigger, "MARGIN_CRITICAL");
    }
}
