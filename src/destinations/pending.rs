use chrono::{DateTime, Utc};
use dicom_object::DefaultDicomObject;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{NodeError, Result};

/// A report that could not be delivered yet
#[derive(Debug, Clone)]
pub struct PendingReport {
    pub batch_id: Option<Uuid>,
    pub sop_uid: String,
    pub reason: String,
    pub since: DateTime<Utc>,
    pub object: DefaultDicomObject,
}

/// Sidecar kept next to each pending object
#[derive(Debug, Serialize, Deserialize)]
struct PendingMeta {
    batch_id: Option<Uuid>,
    sop_uid: String,
    reason: String,
    since: DateTime<Utc>,
}

/// Reports waiting for a resend, in the order they became pending
#[derive(Debug)]
pub struct PendingStore {
    dir: Option<PathBuf>,
    reports: Mutex<Vec<PendingReport>>,
}

impl PendingStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Open the store, reloading every report left in `dir`
    pub fn open(dir: Option<PathBuf>) -> Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self::in_memory());
        };
        std::fs::create_dir_all(&dir)?;

        let mut reports = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match load(&path) {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!("Skipping pending report {}: {}", path.display(), e),
                }
            }
        }
        reports.sort_by(|a, b| a.since.cmp(&b.since).then_with(|| a.sop_uid.cmp(&b.sop_uid)));
        if !reports.is_empty() {
            info!("📬  {} pending reports waiting in {}", reports.len(), dir.display());
        }

        Ok(Self {
            dir: Some(dir),
            reports: Mutex::new(reports),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingReport>> {
        self.reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, report: PendingReport) -> Result<()> {
        if let Some(dir) = &self.dir {
            let object_path = dir.join(format!("{}.dcm", report.sop_uid));
            report
                .object
                .write_to_file(&object_path)
                .map_err(|e| NodeError::dicom(format!("cannot write {}: {}", object_path.display(), e)))?;
            let meta = PendingMeta {
                batch_id: report.batch_id,
                sop_uid: report.sop_uid.clone(),
                reason: report.reason.clone(),
                since: report.since,
            };
            std::fs::write(
                dir.join(format!("{}.json", report.sop_uid)),
                serde_json::to_string_pretty(&meta)?,
            )?;
        }

        let mut reports = self.lock();
        reports.retain(|r| r.sop_uid != report.sop_uid);
        reports.push(report);
        Ok(())
    }

    pub fn remove(&self, sop_uid: &str) -> Option<PendingReport> {
        let removed = {
            let mut reports = self.lock();
            let index = reports.iter().position(|r| r.sop_uid == sop_uid)?;
            reports.remove(index)
        };
        if let Some(dir) = &self.dir {
            for ext in ["dcm", "json"] {
                let path = dir.join(format!("{}.{}", sop_uid, ext));
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
        }
        Some(removed)
    }

    pub fn list(&self) -> Vec<PendingReport> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn load(meta_path: &Path) -> Result<PendingReport> {
    let meta: PendingMeta = serde_json::from_str(&std::fs::read_to_string(meta_path)?)?;
    let object = dicom::object::open_file(meta_path.with_extension("dcm")).map_err(NodeError::dicom)?;
    Ok(PendingReport {
        batch_id: meta.batch_id,
        sop_uid: meta.sop_uid,
        reason: meta.reason,
        since: meta.since,
        object,
    })
}
