//! Study aggregation: groups received instances into batches per study and series and
//! releases a batch once its series has been quiet for the configured idle window.

pub mod ledger;
pub mod spool;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::types::{BatchKey, Instance};
use crate::config::ConfigHandle;
use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent};
use ledger::{BatchLedger, BatchState};
use spool::{Spool, SpooledInstance};

/// A complete unit of work: every instance of one series, in arrival order
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub key: BatchKey,
    pub instances: Vec<Arc<Instance>>,
    pub first_arrival: DateTime<Utc>,
    pub last_arrival: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn sop_uids(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|i| i.sop_uid.as_str())
    }

    /// Check, in arrival order, that patient/study attributes and the frame of reference agree
    /// across every instance. Returns the shared frame of reference UID.
    pub fn validate_consistency(&self) -> Result<&str> {
        let first = self
            .instances
            .first()
            .ok_or_else(|| NodeError::integrity(format!("batch {} has no instances", self.id)))?;
        let frame_of_reference = first.frame_of_reference_uid.as_deref().ok_or_else(|| {
            NodeError::integrity(format!("instance {} has no FrameOfReferenceUID", first.sop_uid))
        })?;

        for instance in &self.instances[1..] {
            let differences = first.patient.differences(&instance.patient);
            if !differences.is_empty() {
                return Err(NodeError::integrity(format!(
                    "instance {} differs from {} in {}",
                    instance.sop_uid,
                    first.sop_uid,
                    differences.join(", ")
                )));
            }
            if instance.frame_of_reference_uid.as_deref() != Some(frame_of_reference) {
                return Err(NodeError::integrity(format!(
                    "instance {} is not in frame of reference {}",
                    instance.sop_uid, frame_of_reference
                )));
            }
        }
        Ok(frame_of_reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptOutcome {
    pub batch_id: Uuid,
    /// The SOP instance was already part of the batch and was not added again
    pub duplicate: bool,
}

enum Origin {
    Received,
    Spooled { batch_id: Uuid, path: PathBuf },
}

struct CollectingBatch {
    id: Uuid,
    instances: Vec<Arc<Instance>>,
    sop_uids: HashSet<String>,
    first_arrival: DateTime<Utc>,
    last_arrival: DateTime<Utc>,
    revision: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct StudyAggregator {
    config: Arc<ConfigHandle>,
    ledger: Arc<BatchLedger>,
    events: EventBus,
    spool: Option<Spool>,
    ready_tx: mpsc::UnboundedSender<Batch>,
    handle: Handle,
    suspended: AtomicBool,
    collecting: Mutex<HashMap<BatchKey, CollectingBatch>>,
}

impl StudyAggregator {
    /// Must be created inside a tokio runtime; idle timers run on it.
    pub fn new(
        config: Arc<ConfigHandle>,
        ledger: Arc<BatchLedger>,
        events: EventBus,
        spool: Option<Spool>,
        ready_tx: mpsc::UnboundedSender<Batch>,
    ) -> Result<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|e| NodeError::config(format!("aggregator needs a tokio runtime: {}", e)))?;
        Ok(Arc::new(Self {
            config,
            ledger,
            events,
            spool,
            ready_tx,
            handle,
            suspended: AtomicBool::new(false),
            collecting: Mutex::new(HashMap::new()),
        }))
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<BatchKey, CollectingBatch>> {
        self.collecting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of a received instance. Returns once the instance is spooled
    /// (when durable storage is on) and recorded in its batch.
    pub fn accept(self: &Arc<Self>, instance: Instance) -> Result<AcceptOutcome> {
        self.insert(instance, Origin::Received)
    }

    /// Re-aggregate an instance found in the spool at startup. It rejoins the batch it was
    /// spooled for unless another batch of the same series is already collecting.
    pub fn restore(self: &Arc<Self>, spooled: SpooledInstance) -> Result<AcceptOutcome> {
        let SpooledInstance {
            batch_id,
            path,
            instance,
        } = spooled;
        self.insert(instance, Origin::Spooled { batch_id, path })
    }

    /// Stop completing batches. Pending idle timers are cancelled and later arrivals are only
    /// collected, so every unfinished batch stays in the spool for the next start.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        for batch in self.table().values_mut() {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
        }
        info!("Batch completion suspended, {} series left collecting", self.collecting());
    }

    fn insert(self: &Arc<Self>, instance: Instance, origin: Origin) -> Result<AcceptOutcome> {
        let window = self.config.snapshot().batch_idle_window();
        let key = instance.key();
        let now = Utc::now();

        let mut table = self.table();
        let existing = table
            .get(&key)
            .map(|batch| (batch.id, batch.sop_uids.contains(&instance.sop_uid)));
        let duplicate = existing.is_some_and(|(_, seen)| seen);
        let batch_id = match (&existing, &origin) {
            (Some((id, _)), _) => *id,
            (None, Origin::Spooled { batch_id, .. }) => *batch_id,
            (None, Origin::Received) => Uuid::new_v4(),
        };

        if let Some(spool) = &self.spool {
            match &origin {
                Origin::Received if !duplicate => {
                    spool.persist(batch_id, &instance)?;
                }
                Origin::Spooled { path, .. } if duplicate => spool.discard(path),
                Origin::Spooled { batch_id: from, path } if *from != batch_id => {
                    spool.adopt(path, batch_id, &instance.sop_uid)?;
                }
                _ => {}
            }
        }

        let batch = table.entry(key.clone()).or_insert_with(|| {
            self.ledger.open(batch_id, &key, &instance.patient, now);
            info!(batch_id = %batch_id, "📂  New batch for {}", key);
            CollectingBatch {
                id: batch_id,
                instances: Vec::new(),
                sop_uids: HashSet::new(),
                first_arrival: now,
                last_arrival: now,
                revision: 0,
                timer: None,
            }
        });

        if duplicate {
            warn!(batch_id = %batch.id, "Instance {} received twice, keeping the first copy", instance.sop_uid);
        } else {
            batch.sop_uids.insert(instance.sop_uid.clone());
        }

        self.events.publish(NodeEvent::InstanceReceived {
            batch_id: batch.id,
            study_uid: instance.study_uid.clone(),
            series_uid: instance.series_uid.clone(),
            sop_uid: instance.sop_uid.clone(),
        });
        if !duplicate {
            batch.instances.push(Arc::new(instance));
        }

        // every arrival restarts the idle window
        batch.last_arrival = now;
        batch.revision += 1;
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        if !self.suspended.load(Ordering::SeqCst) {
            let weak: Weak<Self> = Arc::downgrade(self);
            let timer_key = key.clone();
            let revision = batch.revision;
            let deadline = tokio::time::Instant::now() + window;
            batch.timer = Some(self.handle.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(aggregator) = weak.upgrade() {
                    aggregator.complete(&timer_key, revision);
                }
            }));
        }

        self.ledger.record_arrival(batch.id, batch.instances.len(), now);
        debug!(batch_id = %batch.id, instances = batch.instances.len(), "instance added to {}", key);

        Ok(AcceptOutcome {
            batch_id: batch.id,
            duplicate,
        })
    }

    fn complete(&self, key: &BatchKey, revision: u64) {
        let collected = {
            let mut table = self.table();
            if self.suspended.load(Ordering::SeqCst) {
                return;
            }
            match table.get(key) {
                Some(batch) if batch.revision == revision => table.remove(key),
                _ => None,
            }
        };
        let Some(collected) = collected else {
            return;
        };

        let batch = Batch {
            id: collected.id,
            key: key.clone(),
            instances: collected.instances,
            first_arrival: collected.first_arrival,
            last_arrival: collected.last_arrival,
        };

        if let Err(e) = self.ledger.transition(batch.id, BatchState::Ready) {
            error!(batch_id = %batch.id, "Cannot mark batch ready: {}", e);
            return;
        }
        info!(batch_id = %batch.id, "✅  Batch {} complete with {} instances", key, batch.len());
        self.events.publish(NodeEvent::BatchReady {
            batch_id: batch.id,
            instances: batch.len(),
        });

        let id = batch.id;
        if self.ready_tx.send(batch).is_err() {
            // left Ready and spooled, the next start collects it again
            warn!(batch_id = %id, "Autocontour queue is closed, batch stays in the spool");
        }
    }

    /// Number of series still collecting
    pub fn collecting(&self) -> usize {
        self.table().len()
    }

    pub fn spool(&self) -> Option<&Spool> {
        self.spool.as_ref()
    }
}

impl Drop for StudyAggregator {
    fn drop(&mut self) {
        for batch in self.table().values_mut() {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::fixtures::{mr_slice, mr_slice_for_patient};
    use crate::config::NodeConfig;
    use std::time::Duration;

    const WINDOW: Duration = Duration::from_millis(10_000);

    struct Harness {
        aggregator: Arc<StudyAggregator>,
        ledger: Arc<BatchLedger>,
        ready: mpsc::UnboundedReceiver<Batch>,
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    fn harness_with(spool: Option<Spool>) -> Harness {
        let config = NodeConfig {
            batch_idle_window_ms: WINDOW.as_millis() as u64,
            ..NodeConfig::default()
        };
        let ledger = Arc::new(BatchLedger::new(100, None));
        let (tx, ready) = mpsc::unbounded_channel();
        let aggregator = StudyAggregator::new(
            Arc::new(ConfigHandle::new(config)),
            ledger.clone(),
            EventBus::new(),
            spool,
            tx,
        )
        .unwrap();
        Harness { aggregator, ledger, ready }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_ready_one_window_after_last_arrival() {
        let mut h = harness();
        let outcome = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();

        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        settle().await;
        assert!(h.ready.try_recv().is_err());
        assert_eq!(h.ledger.get(outcome.batch_id).unwrap().state, BatchState::Collecting);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        let batch = h.ready.try_recv().unwrap();
        assert_eq!(batch.id, outcome.batch_id);
        assert_eq!(h.ledger.get(batch.id).unwrap().state, BatchState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrival_resets_the_window() {
        let mut h = harness();
        h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();

        // just before the window closes
        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        settle().await;
        h.aggregator.accept(mr_slice("S1", "R1", "1.2", 3.0)).unwrap();

        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        settle().await;
        assert!(h.ready.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        let batch = h.ready.try_recv().unwrap();
        assert_eq!(batch.sop_uids().collect::<Vec<_>>(), vec!["1.1", "1.2"]);
        assert!(h.ready.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn series_are_independent() {
        let mut h = harness();
        h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        tokio::time::advance(Duration::from_millis(5_000)).await;
        h.aggregator.accept(mr_slice("S1", "R2", "2.1", 0.0)).unwrap();

        tokio::time::advance(Duration::from_millis(5_000)).await;
        settle().await;
        assert_eq!(h.ready.try_recv().unwrap().key, BatchKey::new("S1", "R1"));
        assert!(h.ready.try_recv().is_err());
        assert_eq!(h.aggregator.collecting(), 1);

        tokio::time::advance(Duration::from_millis(5_000)).await;
        settle().await;
        assert_eq!(h.ready.try_recv().unwrap().key, BatchKey::new("S1", "R2"));
    }

    #[tokio::test(start_paused = true)]
    async fn instances_after_dispatch_start_a_new_batch() {
        let mut h = harness();
        let first = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        tokio::time::advance(WINDOW).await;
        settle().await;
        let dispatched = h.ready.try_recv().unwrap();

        let second = h.aggregator.accept(mr_slice("S1", "R1", "1.2", 3.0)).unwrap();
        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(dispatched.len(), 1);

        tokio::time::advance(WINDOW).await;
        settle().await;
        let next = h.ready.try_recv().unwrap();
        assert_eq!(next.id, second.batch_id);
        assert_eq!(next.sop_uids().collect::<Vec<_>>(), vec!["1.2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_instance_is_kept_once() {
        let mut h = harness();
        h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        let again = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        assert!(again.duplicate);

        tokio::time::advance(WINDOW).await;
        settle().await;
        assert_eq!(h.ready.try_recv().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inconsistent_patients_still_aggregate_in_arrival_order() {
        let mut h = harness();
        h.aggregator.accept(mr_slice_for_patient("S1", "R1", "1.1", 0.0, "A")).unwrap();
        h.aggregator.accept(mr_slice_for_patient("S1", "R1", "1.2", 3.0, "B")).unwrap();
        tokio::time::advance(WINDOW).await;
        settle().await;
        let batch = h.ready.try_recv().unwrap();
        let ids: Vec<_> = batch.instances.iter().map(|i| i.patient.patient_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        let err = batch.validate_consistency().unwrap_err();
        assert!(matches!(err, NodeError::AggregationIntegrity(_)));
        assert!(err.to_string().contains("PatientID"));
    }

    #[tokio::test(start_paused = true)]
    async fn consistent_batch_reports_its_frame_of_reference() {
        let mut h = harness();
        for (i, z) in [0.0, 3.0, 6.0].into_iter().enumerate() {
            h.aggregator.accept(mr_slice("S1", "R1", &format!("1.{}", i), z)).unwrap();
        }
        tokio::time::advance(WINDOW).await;
        settle().await;
        let batch = h.ready.try_recv().unwrap();
        assert_eq!(batch.validate_consistency().unwrap(), "1.2.3.999.1");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_leaves_the_batch_ready() {
        let h = harness();
        let outcome = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        drop(h.ready);
        tokio::time::advance(WINDOW).await;
        settle().await;
        let record = h.ledger.get(outcome.batch_id).unwrap();
        assert_eq!(record.state, BatchState::Ready);
        assert!(record.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_aggregator_completes_nothing() {
        let mut h = harness();
        let before = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        h.aggregator.suspend();
        let after = h.aggregator.accept(mr_slice("S1", "R2", "2.1", 0.0)).unwrap();

        tokio::time::advance(WINDOW * 2).await;
        settle().await;
        assert!(h.ready.try_recv().is_err());
        assert_eq!(h.aggregator.collecting(), 2);
        for id in [before.batch_id, after.batch_id] {
            assert_eq!(h.ledger.get(id).unwrap().state, BatchState::Collecting);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spooled_instances_rejoin_their_batch() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"), None).unwrap();
        let earlier = Uuid::new_v4();
        spool.persist(earlier, &mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        spool.persist(earlier, &mr_slice("S1", "R1", "1.2", 3.0)).unwrap();

        let mut h = harness_with(Some(spool.clone()));
        for spooled in spool.recover() {
            let outcome = h.aggregator.restore(spooled).unwrap();
            assert_eq!(outcome.batch_id, earlier);
        }
        tokio::time::advance(WINDOW).await;
        settle().await;
        let batch = h.ready.try_recv().unwrap();
        assert_eq!(batch.id, earlier);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn spooled_copies_of_one_series_merge_into_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"), None).unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        spool.persist(a, &mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        spool.persist(b, &mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        spool.persist(b, &mr_slice("S1", "R1", "1.2", 3.0)).unwrap();

        let h = harness_with(Some(spool.clone()));
        let ids: HashSet<Uuid> = spool
            .recover()
            .into_iter()
            .map(|spooled| h.aggregator.restore(spooled).unwrap().batch_id)
            .collect();
        assert_eq!(ids.len(), 1);

        let kept = *ids.iter().next().unwrap();
        let on_disk = spool.recover();
        assert_eq!(on_disk.len(), 2);
        assert!(on_disk.iter().all(|s| s.batch_id == kept));
    }

    #[tokio::test(start_paused = true)]
    async fn received_instances_are_spooled_under_their_batch() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"), None).unwrap();
        let h = harness_with(Some(spool.clone()));

        let outcome = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        let again = h.aggregator.accept(mr_slice("S1", "R1", "1.1", 0.0)).unwrap();
        assert!(again.duplicate);

        let on_disk = spool.recover();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].batch_id, outcome.batch_id);
    }
}
