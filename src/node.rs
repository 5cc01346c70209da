//! The assembled node: receiver, aggregator, orchestrator and delivery stage over shared state.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::ledger::{BatchLedger, BatchRecord, BatchState};
use crate::aggregator::spool::Spool;
use crate::aggregator::StudyAggregator;
use crate::autocontour::{model_from_config, AutocontourOrchestrator, SegmentationModel};
use crate::config::ConfigHandle;
use crate::destinations::{DestinationRegistry, Endpoint, Forwarder, PendingStore, ResendSummary};
use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::pipeline::DeliveryStage;
use crate::receiver::AssociationManager;
use crate::sender::{DicomPeer, DicomScu};
use crate::uid::UidGenerator;

/// Point-in-time view of the node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub listening: Option<SocketAddr>,
    pub ae_title: String,
    pub active_associations: usize,
    pub collecting_batches: usize,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub pending_reports: usize,
    pub active_destination: Option<Endpoint>,
    pub batches: Vec<BatchRecord>,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    manager: Arc<AssociationManager>,
    aggregator: Arc<StudyAggregator>,
    orchestrator: Arc<AutocontourOrchestrator>,
    accept_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    delivery_task: JoinHandle<()>,
    resend_task: Option<JoinHandle<()>>,
}

pub struct AutocontourNode {
    config: Arc<ConfigHandle>,
    events: EventBus,
    uids: Arc<UidGenerator>,
    ledger: Arc<BatchLedger>,
    registry: Arc<DestinationRegistry>,
    peer: Arc<dyn DicomPeer>,
    model: Arc<dyn SegmentationModel>,
    forwarder: Arc<Forwarder>,
    running: Mutex<Option<Running>>,
}

impl AutocontourNode {
    /// Node with an explicit segmentation backend and outbound peer
    pub fn new(config: ConfigHandle, model: Arc<dyn SegmentationModel>, peer: Arc<dyn DicomPeer>) -> Result<Self> {
        Self::assemble(Arc::new(config), model, peer)
    }

    /// Node with the configured backend talking DICOM over the network
    pub fn from_config(config: ConfigHandle) -> Result<Self> {
        let config = Arc::new(config);
        let model = model_from_config(&config.snapshot().segmentation);
        let peer: Arc<dyn DicomPeer> = Arc::new(DicomScu::new(config.clone()));
        Self::assemble(config, model, peer)
    }

    fn assemble(config: Arc<ConfigHandle>, model: Arc<dyn SegmentationModel>, peer: Arc<dyn DicomPeer>) -> Result<Self> {
        let snapshot = config.snapshot();
        snapshot.validate()?;
        if let Some(dir) = &snapshot.storage.data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let events = EventBus::new();
        let uids = Arc::new(UidGenerator::new(snapshot.uid_root.as_deref()));
        let ledger = Arc::new(BatchLedger::new(
            snapshot.storage.history_limit,
            snapshot.storage.history_path(),
        ));
        let registry = Arc::new(DestinationRegistry::open(
            snapshot.storage.registry_path(),
            events.clone(),
        )?);
        let pending = Arc::new(PendingStore::open(snapshot.storage.pending_dir())?);
        let forwarder = Arc::new(Forwarder::new(
            config.clone(),
            registry.clone(),
            peer.clone(),
            pending,
            ledger.clone(),
            events.clone(),
        ));

        Ok(Self {
            config,
            events,
            uids,
            ledger,
            registry,
            peer,
            model,
            forwarder,
            running: Mutex::new(None),
        })
    }

    /// Bind the listener and start every stage. Batches left in the spool by an earlier run
    /// are collected again. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(NodeError::config(format!("node is already listening on {}", current.addr)));
        }
        let config = self.config.snapshot();

        let listener = AssociationManager::bind(&config).await?;
        let addr = listener.local_addr()?;

        let spool = config
            .storage
            .spool_dir()
            .map(|dir| Spool::new(dir, config.storage.failed_dir()))
            .transpose()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let aggregator = StudyAggregator::new(
            self.config.clone(),
            self.ledger.clone(),
            self.events.clone(),
            spool.clone(),
            ready_tx,
        )?;
        if let Some(spool) = &spool {
            for spooled in spool.recover() {
                let path = spooled.path.clone();
                if let Err(e) = aggregator.restore(spooled) {
                    warn!("Cannot restore spooled {}: {}", path.display(), e);
                }
            }
        }

        let orchestrator = AutocontourOrchestrator::new(
            self.config.clone(),
            self.model.clone(),
            self.ledger.clone(),
            self.events.clone(),
        );
        let workers = orchestrator.spawn_workers(ready_rx, outcome_tx, shutdown_rx.clone());

        let delivery = DeliveryStage::new(
            self.config.clone(),
            self.uids.clone(),
            self.ledger.clone(),
            self.events.clone(),
            self.forwarder.clone(),
            spool,
        );
        let delivery_task = tokio::spawn(delivery.run(outcome_rx));

        let manager = AssociationManager::new(self.config.clone(), aggregator.clone(), self.events.clone());
        let accept_task = tokio::spawn(Arc::clone(&manager).run(listener, shutdown_rx.clone()));

        let resend_task = config.forward.resend_interval_secs.filter(|secs| *secs > 0).map(|secs| {
            let forwarder = self.forwarder.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let summary = forwarder.resend_pending().await;
                            if summary.sent > 0 || summary.still_pending > 0 {
                                info!("Scheduled resend: {} sent, {} still pending", summary.sent, summary.still_pending);
                            }
                        }
                    }
                }
            })
        });

        info!("🚀  {} listening on {}", config.ae_title, addr);
        *running = Some(Running {
            addr,
            shutdown: shutdown_tx,
            manager,
            aggregator,
            orchestrator,
            accept_task,
            workers,
            delivery_task,
            resend_task,
        });
        Ok(addr)
    }

    /// Stop accepting, let in-flight associations finish within the grace period, then wait
    /// for running segmentations and their delivery. Batches not yet picked up by a worker,
    /// and series still collecting, stay in the spool for the next start.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!("Stopping node on {}", running.addr);
        running.aggregator.suspend();
        let _ = running.shutdown.send(true);

        if let Err(e) = running.accept_task.await {
            warn!("Receiver task ended abnormally: {}", e);
        }
        for worker in running.workers {
            if let Err(e) = worker.await {
                warn!("Segmentation worker ended abnormally: {}", e);
            }
        }
        if let Err(e) = running.delivery_task.await {
            warn!("Delivery task ended abnormally: {}", e);
        }
        if let Some(task) = running.resend_task {
            let _ = task.await;
        }
        info!("Node stopped");
    }

    pub async fn status(&self) -> NodeStatus {
        let config = self.config.snapshot();
        let running = self.running.lock().await;
        let counts = self.ledger.count_by_state();
        NodeStatus {
            listening: running.as_ref().map(|r| r.addr),
            ae_title: config.ae_title.clone(),
            active_associations: running.as_ref().map_or(0, |r| r.manager.active_associations()),
            collecting_batches: running.as_ref().map_or(0, |r| r.aggregator.collecting()),
            queued_jobs: counts.get(&BatchState::Ready).copied().unwrap_or(0),
            running_jobs: running.as_ref().map_or(0, |r| r.orchestrator.running()),
            pending_reports: self.forwarder.pending().len(),
            active_destination: self.registry.active(),
            batches: self.ledger.snapshot(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub async fn resend_pending(&self) -> ResendSummary {
        self.forwarder.resend_pending().await
    }

    /// Verify `endpoint` with a C-ECHO and add it to the registry
    pub async fn add_destination(&self, endpoint: Endpoint) -> Result<Endpoint> {
        self.registry.add(endpoint, self.peer.as_ref()).await
    }

    pub async fn verify_destination(&self, id: Uuid) -> Result<bool> {
        self.registry.verify(id, self.peer.as_ref()).await
    }

    pub fn registry(&self) -> &Arc<DestinationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<BatchLedger> {
        &self.ledger
    }

    pub fn peer(&self) -> &Arc<dyn DicomPeer> {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocontour::DisabledModel;
    use crate::config::NodeConfig;
    use crate::sender::testing::ScriptedPeer;

    fn config() -> NodeConfig {
        let mut config = NodeConfig {
            port: 0,
            bind_addr: "127.0.0.1".parse().unwrap(),
            ..NodeConfig::default()
        };
        config.storage.data_dir = None;
        config
    }

    fn node(config: NodeConfig) -> AutocontourNode {
        AutocontourNode::new(
            ConfigHandle::new(config),
            Arc::new(DisabledModel),
            Arc::new(ScriptedPeer::storing(vec![])),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_reports_the_bound_address() {
        let node = node(config());
        let addr = node.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        let status = node.status().await;
        assert_eq!(status.listening, Some(addr));
        assert_eq!(status.ae_title, "MRPAC");
        assert_eq!(status.queued_jobs, 0);
        assert!(status.active_destination.is_none());

        assert!(node.start().await.is_err());
        node.stop().await;
        assert_eq!(node.status().await.listening, None);
    }

    #[tokio::test]
    async fn invalid_configuration_is_refused() {
        let mut bad = config();
        bad.ae_title = "WAY TOO LONG FOR AN AE".into();
        let result = AutocontourNode::new(
            ConfigHandle::new(bad),
            Arc::new(DisabledModel),
            Arc::new(ScriptedPeer::storing(vec![])),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn destinations_are_verified_before_they_are_added() {
        let node = AutocontourNode::new(
            ConfigHandle::new(config()),
            Arc::new(DisabledModel),
            Arc::new(ScriptedPeer::echoing(Err(NodeError::network("refused")))),
        )
        .unwrap();
        assert!(node
            .add_destination(Endpoint::new("TPS", "127.0.0.1", 104, ""))
            .await
            .is_err());
        assert!(node.registry().list().is_empty());
    }

    #[tokio::test]
    async fn status_serializes() {
        let node = node(config());
        let json = serde_json::to_value(node.status().await).unwrap();
        assert_eq!(json["ae_title"], "MRPAC");
        assert!(json["listening"].is_null());
    }
}
