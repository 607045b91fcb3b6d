//! Write-ahead log for in-flight exchange intents (spec §4.3, §6.3).
//!
//! `{intent_id, position_id, action_kind, client_order_id, payload, status,
//! created_at}`. Every write must flush durably before the gateway proceeds.

use crate::error::PersistenceError;
use crate::ids::{IntentId, PositionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Pending,
    Sent,
    Acked,
    Failed,
    Completed,
}

impl IntentStatus {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: IntentId,
    pub position_id: PositionId,
    pub action_kind: String,
    pub client_order_id: String,
    pub payload: serde_json::Value,
    pub status: IntentStatus,
    pub created_at: SystemTime,
}

/// Append-only WAL backed by a JSON-lines file, `fsync`'d after every write.
/// The in-memory index is rebuilt from the file at construction and kept in
/// lockstep with every write — this implementation treats the file, not the
/// index, as ground truth, and rewrites the whole file on update since the
/// WAL is expected to stay small (bounded by in-flight intents, not history).
pub struct Wal {
    path: PathBuf,
    entries: parking_lot::Mutex<HashMap<IntentId, Intent>>,
}

impl Wal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = if path.exists() {
            Self::read_all(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: parking_lot::Mutex::new(entries),
        })
    }

    fn read_all(path: &PathBuf) -> Result<HashMap<IntentId, Intent>, PersistenceError> {
        let file = File::open(path)?;
        let mut map = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let intent: Intent = serde_json::from_str(&line)?;
            map.insert(intent.intent_id.clone(), intent);
        }
        Ok(map)
    }

    fn rewrite(&self, entries: &HashMap<IntentId, Intent>) -> Result<(), PersistenceError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for intent in entries.values() {
            writeln!(file, "{}", serde_json::to_string(intent)?)?;
        }
        file.sync_data()?;
        Ok(())
    }

    /// Durable append of a new WAL entry before the gateway calls the
    /// exchange. Blocking.
    pub fn write_intent(&self, intent: Intent) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        entries.insert(intent.intent_id.clone(), intent);
        self.rewrite(&entries)
    }

    /// Durable update of an existing entry's status when an ack/fail arrives.
    pub fn update_intent(
        &self,
        intent_id: &IntentId,
        status: IntentStatus,
    ) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(intent_id) {
            Some(intent) => {
                intent.status = status;
                self.rewrite(&entries)
            }
            None => Err(PersistenceError::Corrupt(format!(
                "update_intent: unknown intent {}",
                intent_id
            ))),
        }
    }

    /// All entries not yet `Completed`/`Failed`.
    pub fn open_intents(&self) -> Vec<Intent> {
        self.entries
            .lock()
            .values()
            .filter(|i| i.status.is_open())
            .cloned()
            .collect()
    }

    pub fn get(&self, intent_id: &IntentId) -> Option<Intent> {
        self.entries.lock().get(intent_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_intent(id: &str, position_id: &str) -> Intent {
        Intent {
            intent_id: IntentId(id.to_string()),
            position_id: PositionId::try_from(position_id.to_string()).unwrap(),
            action_kind: "entry".to_string(),
            client_order_id: format!("{}:entry:1", position_id),
            payload: serde_json::json!({}),
            status: IntentStatus::Pending,
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn write_then_reload_recovers_open_intents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");

        let wal = Wal::open(&path).unwrap();
        wal.write_intent(sample_intent("i1", "p1")).unwrap();
        wal.update_intent(&IntentId("i1".to_string()), IntentStatus::Sent)
            .unwrap();

        let reloaded = Wal::open(&path).unwrap();
        let open = reloaded.open_intents();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, IntentStatus::Sent);
    }

    #[test]
    fn completed_intents_excluded_from_open_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let wal = Wal::open(&path).unwrap();

        wal.write_intent(sample_intent("i1", "p1")).unwrap();
        wal.update_intent(&IntentId("i1".to_string()), IntentStatus::Completed)
            .unwrap();

        assert!(wal.open_intents().is_empty());
    }
}
