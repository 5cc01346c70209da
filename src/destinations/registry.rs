use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::validate_ae_title;
use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::sender::DicomPeer;

/// A remote DICOM node reports can be forwarded to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub active: bool,
}

impl Endpoint {
    pub fn new(
        ae_title: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            description: description.into(),
            verified: false,
            active: false,
        }
    }

    /// `host:port`, as used to open a connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title).map_err(|e| NodeError::registry(e.to_string()))?;
        if self.host.trim().is_empty() {
            return Err(NodeError::registry("destination host is empty"));
        }
        if self.port == 0 {
            return Err(NodeError::registry("destination port must be non-zero"));
        }
        Ok(())
    }

    fn same_target(&self, other: &Endpoint) -> bool {
        self.ae_title == other.ae_title && self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    endpoints: Vec<Endpoint>,
}

/// Persisted set of destinations, at most one of them active.
///
/// Every mutation is applied to a copy, written to disk and only then committed, so a failed
/// write leaves both the file and the in-memory state unchanged.
#[derive(Debug)]
pub struct DestinationRegistry {
    path: Option<PathBuf>,
    endpoints: Mutex<Vec<Endpoint>>,
    events: EventBus,
}

impl DestinationRegistry {
    pub fn in_memory(events: EventBus) -> Self {
        Self {
            path: None,
            endpoints: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Load the registry from `path` if it exists; without a path it lives in memory only
    pub fn open(path: Option<PathBuf>, events: EventBus) -> Result<Self> {
        let mut endpoints = match &path {
            Some(path) if path.exists() => load(path)?,
            _ => Vec::new(),
        };

        let mut seen_active = false;
        for endpoint in endpoints.iter_mut().filter(|e| e.active) {
            if seen_active {
                warn!("Registry lists more than one active destination, deactivating {}", endpoint);
                endpoint.active = false;
            }
            seen_active = true;
        }

        if let Some(path) = &path {
            info!("Loaded {} destinations from {}", endpoints.len(), path.display());
        }
        Ok(Self {
            path,
            endpoints: Mutex::new(endpoints),
            events,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn commit(&self, current: &mut Vec<Endpoint>, updated: Vec<Endpoint>) -> Result<()> {
        if let Some(path) = &self.path {
            save(path, &updated)?;
        }
        *current = updated;
        Ok(())
    }

    pub fn list(&self) -> Vec<Endpoint> {
        self.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Endpoint> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Look a destination up by id or AE title
    pub fn find(&self, key: &str) -> Option<Endpoint> {
        let endpoints = self.lock();
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(endpoint) = endpoints.iter().find(|e| e.id == id) {
                return Some(endpoint.clone());
            }
        }
        endpoints.iter().find(|e| e.ae_title == key).cloned()
    }

    pub fn active(&self) -> Option<Endpoint> {
        self.lock().iter().find(|e| e.active).cloned()
    }

    /// Verify `endpoint` with a C-ECHO and persist it. Nothing is stored if the echo fails.
    pub async fn add(&self, mut endpoint: Endpoint, peer: &dyn DicomPeer) -> Result<Endpoint> {
        endpoint.validate()?;
        if self.lock().iter().any(|e| e.same_target(&endpoint)) {
            return Err(NodeError::registry(format!("{} is already registered", endpoint)));
        }

        let status = peer
            .echo(&endpoint)
            .await
            .map_err(|e| NodeError::registry(format!("C-ECHO to {} failed: {}", endpoint, e)))?;
        if !status.is_delivered() {
            return Err(NodeError::registry(format!(
                "C-ECHO to {} answered {}",
                endpoint, status
            )));
        }
        endpoint.verified = true;
        endpoint.active = false;

        let mut current = self.lock();
        // checked again, the echo ran without the lock
        if current.iter().any(|e| e.same_target(&endpoint)) {
            return Err(NodeError::registry(format!("{} is already registered", endpoint)));
        }
        let mut updated = current.clone();
        updated.push(endpoint.clone());
        self.commit(&mut current, updated)?;
        drop(current);

        info!("➕  Added destination {}", endpoint);
        self.events.publish(NodeEvent::DestinationAdded {
            id: endpoint.id,
            ae_title: endpoint.ae_title.clone(),
        });
        Ok(endpoint)
    }

    /// Make `id` the only active destination
    pub fn activate(&self, id: Uuid) -> Result<Endpoint> {
        let mut current = self.lock();
        if !current.iter().any(|e| e.id == id) {
            return Err(NodeError::registry(format!("no destination with id {}", id)));
        }
        let updated: Vec<Endpoint> = current
            .iter()
            .cloned()
            .map(|mut e| {
                e.active = e.id == id;
                e
            })
            .collect();
        self.commit(&mut current, updated)?;
        let activated = current.iter().find(|e| e.id == id).cloned();
        drop(current);

        let activated = activated.ok_or_else(|| NodeError::registry(format!("no destination with id {}", id)))?;
        info!("🎯  Active destination is now {}", activated);
        self.events.publish(NodeEvent::DestinationActivated { id: Some(id) });
        Ok(activated)
    }

    /// Clear the active destination. Returns the one that was active.
    pub fn deactivate(&self) -> Result<Option<Uuid>> {
        let mut current = self.lock();
        let previous = current.iter().find(|e| e.active).map(|e| e.id);
        if previous.is_none() {
            return Ok(None);
        }
        let updated = current
            .iter()
            .cloned()
            .map(|mut e| {
                e.active = false;
                e
            })
            .collect();
        self.commit(&mut current, updated)?;
        drop(current);

        self.events.publish(NodeEvent::DestinationActivated { id: None });
        Ok(previous)
    }

    pub fn remove(&self, id: Uuid) -> Result<Endpoint> {
        let mut current = self.lock();
        let removed = current
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| NodeError::registry(format!("no destination with id {}", id)))?;
        let updated = current.iter().filter(|e| e.id != id).cloned().collect();
        self.commit(&mut current, updated)?;
        drop(current);

        info!("➖  Removed destination {}", removed);
        if removed.active {
            self.events.publish(NodeEvent::DestinationActivated { id: None });
        }
        Ok(removed)
    }

    /// Echo a registered destination and record the outcome
    pub async fn verify(&self, id: Uuid, peer: &dyn DicomPeer) -> Result<bool> {
        let endpoint = self
            .get(id)
            .ok_or_else(|| NodeError::registry(format!("no destination with id {}", id)))?;
        let verified = match peer.echo(&endpoint).await {
            Ok(status) => status.is_delivered(),
            Err(e) => {
                warn!("C-ECHO to {} failed: {}", endpoint, e);
                false
            }
        };

        let mut current = self.lock();
        let updated = current
            .iter()
            .cloned()
            .map(|mut e| {
                if e.id == id {
                    e.verified = verified;
                }
                e
            })
            .collect();
        self.commit(&mut current, updated)?;
        Ok(verified)
    }
}

fn load(path: &Path) -> Result<Vec<Endpoint>> {
    let text = std::fs::read_to_string(path)?;
    let file: RegistryFile = serde_json::from_str(&text)
        .map_err(|e| NodeError::registry(format!("{} is not a valid registry: {}", path.display(), e)))?;
    Ok(file.endpoints)
}

fn save(path: &Path, endpoints: &[Endpoint]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = RegistryFile {
        endpoints: endpoints.to_vec(),
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dimse::DimseStatus;
    use crate::sender::testing::ScriptedPeer;

    fn endpoint(ae: &str, port: u16) -> Endpoint {
        Endpoint::new(ae, "127.0.0.1", port, "test")
    }

    #[tokio::test]
    async fn add_requires_a_successful_echo() {
        let registry = DestinationRegistry::in_memory(EventBus::new());
        let refusing = ScriptedPeer::echoing(Err(NodeError::network("connection refused")));
        assert!(registry.add(endpoint("PACS", 104), &refusing).await.is_err());

        let failing = ScriptedPeer::echoing(Ok(DimseStatus::Failure(0x0110)));
        assert!(registry.add(endpoint("PACS", 104), &failing).await.is_err());
        assert!(registry.list().is_empty());

        let ok = ScriptedPeer::echoing(Ok(DimseStatus::Success));
        let added = registry.add(endpoint("PACS", 104), &ok).await.unwrap();
        assert!(added.verified);
        assert!(!added.active);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn invalid_and_duplicate_endpoints_are_rejected() {
        let registry = DestinationRegistry::in_memory(EventBus::new());
        let ok = ScriptedPeer::echoing(Ok(DimseStatus::Success));

        assert!(registry.add(endpoint("THIS_AE_TITLE_IS_TOO_LONG", 104), &ok).await.is_err());
        assert!(registry.add(endpoint("BAD AE", 104), &ok).await.is_err());
        assert!(registry.add(endpoint("PACS", 0), &ok).await.is_err());

        registry.add(endpoint("PACS", 104), &ok).await.unwrap();
        assert!(registry.add(endpoint("PACS", 104), &ok).await.is_err());
        assert_eq!(ok.echo_count(), 1);
    }

    #[tokio::test]
    async fn at_most_one_destination_is_active() {
        let registry = DestinationRegistry::in_memory(EventBus::new());
        let ok = ScriptedPeer::echoing(Ok(DimseStatus::Success));
        let ids: Vec<Uuid> = {
            let mut ids = Vec::new();
            for port in [104, 105, 106] {
                ids.push(registry.add(endpoint("PACS", port), &ok).await.unwrap().id);
            }
            ids
        };

        for id in [ids[0], ids[2], ids[1], ids[1], ids[0]] {
            registry.activate(id).unwrap();
            let active: Vec<_> = registry.list().into_iter().filter(|e| e.active).collect();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].id, id);
        }

        assert_eq!(registry.deactivate().unwrap(), Some(ids[0]));
        assert!(registry.active().is_none());
        assert!(registry.activate(Uuid::new_v4()).is_err());
    }

    #[tokio::test]
    async fn registry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destinations.json");
        let ok = ScriptedPeer::echoing(Ok(DimseStatus::Success));

        let registry = DestinationRegistry::open(Some(path.clone()), EventBus::new()).unwrap();
        let first = registry.add(endpoint("PACS", 104), &ok).await.unwrap();
        let second = registry.add(endpoint("TPS", 11112), &ok).await.unwrap();
        registry.activate(second.id).unwrap();
        registry.remove(first.id).unwrap();

        let reopened = DestinationRegistry::open(Some(path), EventBus::new()).unwrap();
        assert_eq!(reopened.list().len(), 1);
        assert_eq!(reopened.active().map(|e| e.id), Some(second.id));
        assert_eq!(reopened.find("TPS").map(|e| e.port), Some(11112));
        assert_eq!(reopened.find(&second.id.to_string()).map(|e| e.id), Some(second.id));
    }

    #[test]
    fn reopening_repairs_multiple_active_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destinations.json");
        let mut a = endpoint("A", 1);
        let mut b = endpoint("B", 2);
        a.active = true;
        b.active = true;
        save(&path, &[a.clone(), b]).unwrap();

        let registry = DestinationRegistry::open(Some(path), EventBus::new()).unwrap();
        assert_eq!(registry.active().map(|e| e.id), Some(a.id));
        assert_eq!(registry.list().iter().filter(|e| e.active).count(), 1);
    }

    #[tokio::test]
    async fn verify_records_the_echo_outcome() {
        let registry = DestinationRegistry::in_memory(EventBus::new());
        let ok = ScriptedPeer::echoing(Ok(DimseStatus::Success));
        let added = registry.add(endpoint("PACS", 104), &ok).await.unwrap();

        let down = ScriptedPeer::echoing(Err(NodeError::network("timed out")));
        assert!(!registry.verify(added.id, &down).await.unwrap());
        assert!(!registry.get(added.id).unwrap().verified);
    }
}
