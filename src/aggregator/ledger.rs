use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::types::{BatchKey, PatientStudyAttributes};
use crate::error::{NodeError, Result};

/// Lifecycle of a batch.
///
/// `Sent` and `Pending` are the two ways a batch can be done; a pending report can still
/// become `Sent` through a resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Collecting,
    Ready,
    Processing,
    Forwarding,
    Sent,
    Pending,
    Failed,
}

impl BatchState {
    pub fn is_finished(self) -> bool {
        matches!(self, BatchState::Sent | BatchState::Pending | BatchState::Failed)
    }

    pub fn can_become(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Collecting, Ready)
                | (Ready, Processing)
                | (Processing, Forwarding)
                | (Forwarding, Sent)
                | (Forwarding, Pending)
                | (Pending, Sent)
                | (Ready, Failed)
                | (Processing, Failed)
                | (Forwarding, Failed)
        )
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchState::Collecting => "collecting",
            BatchState::Ready => "ready",
            BatchState::Processing => "processing",
            BatchState::Forwarding => "forwarding",
            BatchState::Sent => "sent",
            BatchState::Pending => "pending",
            BatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub key: BatchKey,
    pub state: BatchState,
    pub instances: usize,
    pub patient_name: String,
    pub patient_id: String,
    pub first_arrival: DateTime<Utc>,
    pub last_arrival: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub report_uid: Option<String>,
    pub error: Option<String>,
}

/// One line of `history.jsonl`
#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    batch_id: Uuid,
    patient_name: &'a str,
    patient_id: &'a str,
    study_uid: &'a str,
    series_uid: &'a str,
    time: DateTime<Utc>,
    status: BatchState,
    error: Option<&'a str>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    records: HashMap<Uuid, BatchRecord>,
    finished: VecDeque<Uuid>,
}

/// Status of every batch the node has seen, with a bounded history of finished ones.
#[derive(Debug)]
pub struct BatchLedger {
    inner: Mutex<LedgerInner>,
    history_limit: usize,
    history_path: Option<PathBuf>,
}

impl BatchLedger {
    pub fn new(history_limit: usize, history_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            history_limit,
            history_path,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self, id: Uuid, key: &BatchKey, patient: &PatientStudyAttributes, at: DateTime<Utc>) {
        let record = BatchRecord {
            id,
            key: key.clone(),
            state: BatchState::Collecting,
            instances: 0,
            patient_name: patient.patient_name.clone(),
            patient_id: patient.patient_id.clone(),
            first_arrival: at,
            last_arrival: at,
            updated_at: at,
            report_uid: None,
            error: None,
        };
        self.lock().records.insert(id, record);
    }

    pub fn record_arrival(&self, id: Uuid, instances: usize, at: DateTime<Utc>) {
        if let Some(record) = self.lock().records.get_mut(&id) {
            record.instances = instances;
            record.last_arrival = at;
            record.updated_at = at;
        }
    }

    pub fn set_report(&self, id: Uuid, report_uid: &str) {
        if let Some(record) = self.lock().records.get_mut(&id) {
            record.report_uid = Some(report_uid.to_string());
        }
    }

    pub fn transition(&self, id: Uuid, next: BatchState) -> Result<BatchRecord> {
        self.apply(id, next, None)
    }

    pub fn fail(&self, id: Uuid, reason: &str) -> Result<BatchRecord> {
        self.apply(id, BatchState::Failed, Some(reason))
    }

    fn apply(&self, id: Uuid, next: BatchState, error: Option<&str>) -> Result<BatchRecord> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| NodeError::InvalidTransition(format!("unknown batch {}", id)))?;

        if !record.state.can_become(next) {
            return Err(NodeError::InvalidTransition(format!(
                "batch {} cannot go from {} to {}",
                id, record.state, next
            )));
        }

        debug!(batch_id = %id, from = %record.state, to = %next, "batch transition");
        record.state = next;
        record.updated_at = Utc::now();
        if let Some(error) = error {
            record.error = Some(error.to_string());
        }
        let snapshot = record.clone();

        if next.is_finished() {
            if !inner.finished.contains(&id) {
                inner.finished.push_back(id);
            }
            while inner.finished.len() > self.history_limit {
                if let Some(evicted) = inner.finished.pop_front() {
                    inner.records.remove(&evicted);
                }
            }
            drop(inner);
            self.append_history(&snapshot);
        }
        Ok(snapshot)
    }

    fn append_history(&self, record: &BatchRecord) {
        let Some(path) = &self.history_path else {
            return;
        };
        let entry = HistoryEntry {
            batch_id: record.id,
            patient_name: &record.patient_name,
            patient_id: &record.patient_id,
            study_uid: &record.key.study_uid,
            series_uid: &record.key.series_uid,
            time: record.updated_at,
            status: record.state,
            error: record.error.as_deref(),
        };
        let result = serde_json::to_string(&entry)
            .map_err(NodeError::from)
            .and_then(|line| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                writeln!(file, "{}", line)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to append history to {}: {}", path.display(), e);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<BatchRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// All known batches, oldest first
    pub fn snapshot(&self) -> Vec<BatchRecord> {
        let mut records: Vec<_> = self.lock().records.values().cloned().collect();
        records.sort_by_key(|r| r.first_arrival);
        records
    }

    pub fn count_by_state(&self) -> BTreeMap<BatchState, usize> {
        let mut counts = BTreeMap::new();
        for record in self.lock().records.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(ledger: &BatchLedger) -> Uuid {
        let id = Uuid::new_v4();
        ledger.open(id, &BatchKey::new("S1", "R1"), &PatientStudyAttributes::default(), Utc::now());
        id
    }

    #[test]
    fn happy_path_transitions() {
        let ledger = BatchLedger::new(10, None);
        let id = opened(&ledger);
        for state in [
            BatchState::Ready,
            BatchState::Processing,
            BatchState::Forwarding,
            BatchState::Sent,
        ] {
            assert_eq!(ledger.transition(id, state).unwrap().state, state);
        }
    }

    #[test]
    fn processing_batch_cannot_be_requeued() {
        let ledger = BatchLedger::new(10, None);
        let id = opened(&ledger);
        ledger.transition(id, BatchState::Ready).unwrap();
        ledger.transition(id, BatchState::Processing).unwrap();

        assert!(matches!(
            ledger.transition(id, BatchState::Ready),
            Err(NodeError::InvalidTransition(_))
        ));
        assert!(ledger.transition(id, BatchState::Processing).is_err());
    }

    #[test]
    fn failure_is_terminal() {
        let ledger = BatchLedger::new(10, None);
        let id = opened(&ledger);
        ledger.transition(id, BatchState::Ready).unwrap();
        let record = ledger.fail(id, "segmentation timed out").unwrap();
        assert_eq!(record.error.as_deref(), Some("segmentation timed out"));

        for state in [BatchState::Ready, BatchState::Processing, BatchState::Sent] {
            assert!(ledger.transition(id, state).is_err());
        }
        assert!(ledger.fail(id, "again").is_err());
    }

    #[test]
    fn collecting_batch_cannot_skip_ready() {
        let ledger = BatchLedger::new(10, None);
        let id = opened(&ledger);
        assert!(ledger.transition(id, BatchState::Processing).is_err());
        assert!(ledger.fail(id, "nope").is_err());
    }

    #[test]
    fn history_is_bounded_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let ledger = BatchLedger::new(2, Some(path.clone()));

        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let id = opened(&ledger);
                ledger.transition(id, BatchState::Ready).unwrap();
                ledger.fail(id, "boom").unwrap();
                id
            })
            .collect();

        assert!(ledger.get(ids[0]).is_none());
        assert!(ledger.get(ids[2]).is_some());
        assert_eq!(ledger.count_by_state().get(&BatchState::Failed), Some(&2));

        let history = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = history
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["status"], "failed");
        assert_eq!(lines[0]["error"], "boom");
    }
}
