use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::Batch;
use crate::common::types::Instance;
use crate::error::{NodeError, Result};

/// On-disk copy of every instance that belongs to an unfinished batch, laid out as
/// `<batch-id>/<sop>.dcm`.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
    failed_dir: Option<PathBuf>,
}

/// An instance found in the spool at startup, with the batch it was spooled for
#[derive(Debug)]
pub struct SpooledInstance {
    pub batch_id: Uuid,
    pub path: PathBuf,
    pub instance: Instance,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>, failed_dir: Option<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, failed_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_dir(&self, batch_id: Uuid) -> PathBuf {
        self.dir.join(batch_id.to_string())
    }

    fn path_for(&self, batch_id: Uuid, sop_uid: &str) -> PathBuf {
        self.batch_dir(batch_id).join(format!("{}.dcm", path_safe(sop_uid)))
    }

    pub fn persist(&self, batch_id: Uuid, instance: &Instance) -> Result<PathBuf> {
        let path = self.path_for(batch_id, &instance.sop_uid);
        std::fs::create_dir_all(self.batch_dir(batch_id))?;
        instance
            .to_file_object()?
            .write_to_file(&path)
            .map_err(|e| NodeError::Io(std::io::Error::other(e.to_string())))?;
        debug!(batch_id = %batch_id, "Spooled {} to {}", instance.sop_uid, path.display());
        Ok(path)
    }

    /// Move a recovered file under another batch
    pub fn adopt(&self, path: &Path, batch_id: Uuid, sop_uid: &str) -> Result<PathBuf> {
        let target = self.path_for(batch_id, sop_uid);
        std::fs::create_dir_all(self.batch_dir(batch_id))?;
        std::fs::rename(path, &target)?;
        remove_if_empty(path.parent());
        Ok(target)
    }

    /// Remove a recovered file that turned out to be a duplicate
    pub fn discard(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to drop duplicate spool file {}: {}", path.display(), e);
        }
        remove_if_empty(path.parent());
    }

    /// Every readable instance left in the spool, grouped by batch and ordered by instance
    /// number within a batch. Unreadable files and files outside a batch directory are skipped.
    pub fn recover(&self) -> Vec<SpooledInstance> {
        let mut recovered = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "dcm"))
        {
            let path = entry.into_path();
            let Some(batch_id) = path
                .parent()
                .and_then(|dir| dir.file_name())
                .and_then(|name| Uuid::parse_str(&name.to_string_lossy()).ok())
            else {
                warn!("Skipping spool file outside a batch directory: {}", path.display());
                continue;
            };
            let loaded = dicom::object::open_file(&path)
                .map_err(NodeError::dicom)
                .and_then(|file| Instance::from_file_object(&file));
            match loaded {
                Ok(instance) => recovered.push(SpooledInstance {
                    batch_id,
                    path,
                    instance,
                }),
                Err(e) => warn!("Skipping unreadable spool file {}: {}", path.display(), e),
            }
        }
        recovered.sort_by_key(|s| (s.batch_id, s.instance.geometry.instance_number));
        if !recovered.is_empty() {
            info!("Recovered {} instances from {}", recovered.len(), self.dir.display());
        }
        recovered
    }

    /// Drop a finished batch from the spool, keeping failed ones aside when configured
    pub fn retire(&self, batch: &Batch, failed: bool) {
        let archive = match (&self.failed_dir, failed) {
            (Some(dir), true) => Some(dir.join(batch.id.to_string())),
            _ => None,
        };
        for instance in &batch.instances {
            let path = self.path_for(batch.id, &instance.sop_uid);
            let result = match &archive {
                Some(dir) => move_into(&path, dir),
                None => std::fs::remove_file(&path),
            };
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to retire spooled {}: {}", path.display(), e);
                }
            }
        }
        remove_if_empty(Some(&self.batch_dir(batch.id)));
    }

    pub fn archived_batch_dir(&self, batch_id: Uuid) -> Option<PathBuf> {
        self.failed_dir.as_ref().map(|dir| dir.join(batch_id.to_string()))
    }
}

fn remove_if_empty(dir: Option<&Path>) {
    if let Some(dir) = dir {
        // fails unless empty
        let _ = std::fs::remove_dir(dir);
    }
}

fn move_into(path: &Path, dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    std::fs::rename(path, dir.join(name))
}

fn path_safe(uid: &str) -> String {
    uid.chars()
        .map(|c| if c.is_ascii_digit() || c == '.' { c } else { '_' })
        .collect()
}
