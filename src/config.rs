//! Node configuration: TOML file, defaults and validation, plus a reloadable handle.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use crate::error::{NodeError, Result};
use crate::uid::is_valid_uid;

pub const DEFAULT_PORT: u16 = 11112;

/// Longest UID root that still leaves room for the generated suffix
pub const MAX_UID_ROOT_LEN: usize = 26;

/// Configuration for the autocontour node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Local Application Entity Title
    #[serde(default = "default_ae_title")]
    pub ae_title: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Root for generated UIDs. Without one, UUID derived `2.25.` UIDs are used.
    #[serde(default)]
    pub uid_root: Option<String>,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,

    /// How long a connection beyond the limit waits for a free slot before being answered busy
    #[serde(default = "default_association_queue_timeout")]
    pub association_queue_timeout_ms: u64,

    /// Idle time after which an inbound connection is closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Upper bound on a whole inbound association
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Quiet period after the last instance of a series before the batch is complete
    #[serde(default = "default_batch_idle_window")]
    pub batch_idle_window_ms: u64,

    #[serde(default = "default_max_concurrent_segmentations")]
    pub max_concurrent_segmentations: usize,

    #[serde(default = "default_segmentation_timeout")]
    pub segmentation_timeout_ms: u64,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub segmentation: SegmentationConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Retry policy for outbound delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Periodic resend of pending reports; disabled when absent
    #[serde(default)]
    pub resend_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root of everything persisted by the node. Nothing is written when absent.
    #[serde(default = "default_data_dir")]
    pub data_dir: Option<PathBuf>,

    /// Write each received instance to the spool before acknowledging it
    #[serde(default = "default_true")]
    pub durable_spool: bool,

    /// Keep the instances of failed batches under `failed/`
    #[serde(default = "default_true")]
    pub archive_failed: bool,

    /// Number of finished batches kept in the in-memory history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentationConfig {
    #[serde(default)]
    pub backend: ModelBackend,

    #[serde(default = "default_structures")]
    pub structures: Vec<StructureSpec>,
}

/// Which segmentation implementation the node runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelBackend {
    /// External program speaking JSON over stdin/stdout
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    #[default]
    Disabled,
}

/// A structure requested from the segmentation backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructureSpec {
    pub name: String,

    #[serde(default)]
    pub color: Option<[u8; 3]>,

    #[serde(default = "default_interpreted_type")]
    pub interpreted_type: String,
}

impl StructureSpec {
    pub fn new(name: impl Into<String>, color: [u8; 3]) -> Self {
        Self {
            name: name.into(),
            color: Some(color),
            interpreted_type: default_interpreted_type(),
        }
    }
}

/// Fixed attributes of the generated structure set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportConfig {
    #[serde(default = "default_series_description")]
    pub series_description: String,

    #[serde(default = "default_structure_set_label")]
    pub structure_set_label: String,

    #[serde(default = "default_structure_set_name")]
    pub structure_set_name: String,

    #[serde(default = "default_series_number")]
    pub series_number: String,

    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "default_generation_algorithm")]
    pub generation_algorithm: String,
}

fn default_ae_title() -> String {
    "MRPAC".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_max_associations() -> usize {
    10
}

fn default_association_queue_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    30_000
}

fn default_association_timeout() -> u64 {
    600_000
}

fn default_shutdown_grace() -> u64 {
    10_000
}

fn default_batch_idle_window() -> u64 {
    10_000
}

fn default_max_concurrent_segmentations() -> usize {
    1
}

fn default_segmentation_timeout() -> u64 {
    600_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_attempt_timeout() -> u64 {
    60_000
}

fn default_data_dir() -> Option<PathBuf> {
    Some(PathBuf::from("data"))
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    500
}

fn default_structures() -> Vec<StructureSpec> {
    vec![
        StructureSpec::new("O_Femr_rt", [0, 255, 0]),
        StructureSpec::new("O_Femr_lt", [255, 0, 0]),
        StructureSpec::new("O_Bldr", [255, 255, 0]),
        StructureSpec::new("O_Rctm", [191, 146, 96]),
    ]
}

fn default_interpreted_type() -> String {
    "ORGAN".to_string()
}

fn default_series_description() -> String {
    "MRPAutoContour".to_string()
}

fn default_structure_set_label() -> String {
    "RTstruct".to_string()
}

fn default_structure_set_name() -> String {
    "PelvisAutoContours".to_string()
}

fn default_series_number() -> String {
    "99".to_string()
}

fn default_manufacturer() -> String {
    "dicom-autocontour".to_string()
}

fn default_generation_algorithm() -> String {
    "AUTOMATIC".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ae_title: default_ae_title(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            uid_root: None,
            max_pdu: default_max_pdu(),
            max_associations: default_max_associations(),
            association_queue_timeout_ms: default_association_queue_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            association_timeout_ms: default_association_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            batch_idle_window_ms: default_batch_idle_window(),
            max_concurrent_segmentations: default_max_concurrent_segmentations(),
            segmentation_timeout_ms: default_segmentation_timeout(),
            forward: ForwardConfig::default(),
            storage: StorageConfig::default(),
            segmentation: SegmentationConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            attempt_timeout_ms: default_attempt_timeout(),
            resend_interval_secs: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            durable_spool: true,
            archive_failed: true,
            history_limit: default_history_limit(),
        }
    }
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            backend: ModelBackend::default(),
            structures: default_structures(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            series_description: default_series_description(),
            structure_set_label: default_structure_set_label(),
            structure_set_name: default_structure_set_name(),
            series_number: default_series_number(),
            manufacturer: default_manufacturer(),
            generation_algorithm: default_generation_algorithm(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text)
            .map_err(|e| NodeError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NodeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| NodeError::config(format!("cannot serialize configuration: {}", e)))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    pub fn association_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.association_queue_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn batch_idle_window(&self) -> Duration {
        Duration::from_millis(self.batch_idle_window_ms)
    }

    pub fn segmentation_timeout(&self) -> Duration {
        Duration::from_millis(self.segmentation_timeout_ms)
    }

    pub fn structure_names(&self) -> Vec<String> {
        self.segmentation
            .structures
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(NodeError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(NodeError::config("max_associations must be at least 1"));
        }

        if self.max_concurrent_segmentations == 0 {
            return Err(NodeError::config(
                "max_concurrent_segmentations must be at least 1",
            ));
        }

        for (name, value) in [
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("association_timeout_ms", self.association_timeout_ms),
            ("batch_idle_window_ms", self.batch_idle_window_ms),
            ("segmentation_timeout_ms", self.segmentation_timeout_ms),
            ("forward.attempt_timeout_ms", self.forward.attempt_timeout_ms),
        ] {
            if value == 0 {
                return Err(NodeError::config(format!("{} must be greater than 0", name)));
            }
        }

        if self.forward.max_attempts == 0 {
            return Err(NodeError::config("forward.max_attempts must be at least 1"));
        }

        if let Some(root) = &self.uid_root {
            validate_uid_root(root)?;
        }

        if self.segmentation.structures.is_empty() {
            return Err(NodeError::config("at least one structure must be requested"));
        }

        Ok(())
    }
}

impl StorageConfig {
    fn under(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(name))
    }

    pub fn registry_path(&self) -> Option<PathBuf> {
        self.under("destinations.json")
    }

    pub fn spool_dir(&self) -> Option<PathBuf> {
        if self.durable_spool {
            self.under("spool")
        } else {
            None
        }
    }

    pub fn failed_dir(&self) -> Option<PathBuf> {
        if self.archive_failed {
            self.under("failed")
        } else {
            None
        }
    }

    pub fn pending_dir(&self) -> Option<PathBuf> {
        self.under("pending")
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        self.under("history.jsonl")
    }

    pub fn status_path(&self) -> Option<PathBuf> {
        self.under("status.json")
    }
}

/// AE titles are 1-16 characters without spaces, quotes, wildcards, backslashes or control characters.
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    if ae_title.is_empty() || ae_title.len() > 16 {
        return Err(NodeError::config(format!(
            "AE title '{}' must be 1-16 characters",
            ae_title
        )));
    }
    if let Some(c) = ae_title
        .chars()
        .find(|c| matches!(c, ' ' | '"' | '\'' | '*' | '\\') || c.is_control() || !c.is_ascii())
    {
        return Err(NodeError::config(format!(
            "AE title '{}' contains invalid character {:?}",
            ae_title, c
        )));
    }
    Ok(())
}

fn validate_uid_root(root: &str) -> Result<()> {
    let root = root.trim_end_matches('.');
    if root.is_empty() || root.len() > MAX_UID_ROOT_LEN {
        return Err(NodeError::config(format!(
            "uid_root must be 1-{} characters",
            MAX_UID_ROOT_LEN
        )));
    }
    if !is_valid_uid(root) {
        return Err(NodeError::config(format!("uid_root '{}' is not a valid UID", root)));
    }
    Ok(())
}

/// Shared, reloadable configuration.
///
/// Components take a snapshot at the point of use, so a reload applies to the next
/// connection, batch or delivery without disturbing work already in flight.
#[derive(Debug)]
pub struct ConfigHandle {
    source: Option<PathBuf>,
    current: RwLock<Arc<NodeConfig>>,
}

impl ConfigHandle {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = NodeConfig::from_file(&path)?;
        Ok(Self {
            source: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn snapshot(&self) -> Arc<NodeConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the source file. The current configuration is kept if the new one is invalid.
    pub fn reload(&self) -> Result<Arc<NodeConfig>> {
        let path = self
            .source
            .as_ref()
            .ok_or_else(|| NodeError::config("configuration was not loaded from a file"))?;
        let config = NodeConfig::from_file(path)?;
        info!("Reloaded configuration from {}", path.display());
        Ok(self.swap(config))
    }

    pub fn replace(&self, config: NodeConfig) -> Result<Arc<NodeConfig>> {
        config.validate()?;
        Ok(self.swap(config))
    }

    fn swap(&self, config: NodeConfig) -> Arc<NodeConfig> {
        let config = Arc::new(config);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config.clone();
        config
    }
}
