use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ContourResult, ImageStack, SegmentationModel};
use crate::aggregator::ledger::{BatchLedger, BatchState};
use crate::aggregator::Batch;
use crate::config::ConfigHandle;
use crate::error::{ModelError, NodeError};
use crate::events::{EventBus, NodeEvent};

/// What came out of running a batch through the model
#[derive(Debug)]
pub enum JobOutcome {
    Segmented { batch: Batch, result: ContourResult },
    Failed { batch: Batch, error: NodeError },
}

/// Runs ready batches through the segmentation model, first in first out, with at most
/// `max_concurrent_segmentations` invocations at a time.
pub struct AutocontourOrchestrator {
    config: Arc<ConfigHandle>,
    model: Arc<dyn SegmentationModel>,
    ledger: Arc<BatchLedger>,
    events: EventBus,
    running: AtomicUsize,
}

impl AutocontourOrchestrator {
    pub fn new(
        config: Arc<ConfigHandle>,
        model: Arc<dyn SegmentationModel>,
        ledger: Arc<BatchLedger>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            model,
            ledger,
            events,
            running: AtomicUsize::new(0),
        })
    }

    /// Invocations in progress
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the workers. They share one queue, so batches start in the order they became
    /// ready. Workers stop taking batches once `shutdown` flips; a running job finishes or
    /// hits its timeout.
    pub fn spawn_workers(
        self: &Arc<Self>,
        queue: mpsc::UnboundedReceiver<Batch>,
        outcomes: mpsc::UnboundedSender<JobOutcome>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let workers = self.config.snapshot().max_concurrent_segmentations.max(1);
        let queue = Arc::new(Mutex::new(queue));
        (0..workers)
            .map(|worker| {
                let orchestrator = Arc::clone(self);
                let queue = Arc::clone(&queue);
                let outcomes = outcomes.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let next = tokio::select! {
                            _ = shutdown.changed() => break,
                            batch = async { queue.lock().await.recv().await } => batch,
                        };
                        let Some(batch) = next else { break };
                        let outcome = orchestrator.run(batch).await;
                        if outcomes.send(outcome).is_err() {
                            warn!(worker, "Outcome channel closed");
                            break;
                        }
                    }
                })
            })
            .collect()
    }

    /// Run one batch. Integrity problems fail the batch before the model is invoked.
    pub async fn run(&self, batch: Batch) -> JobOutcome {
        if let Err(error) = self.ledger.transition(batch.id, BatchState::Processing) {
            return JobOutcome::Failed { batch, error };
        }
        self.events.publish(NodeEvent::BatchProcessing { batch_id: batch.id });

        if let Err(error) = batch.validate_consistency() {
            warn!(batch_id = %batch.id, "Batch is inconsistent: {}", error);
            return JobOutcome::Failed { batch, error };
        }

        let config = self.config.snapshot();
        let structures = config.structure_names();
        let limit = config.segmentation_timeout();
        let stack = ImageStack::from_batch(&batch);

        info!(
            batch_id = %batch.id,
            model = self.model.name(),
            "🧠  Segmenting {} slices of {}",
            stack.len(),
            batch.key
        );
        self.running.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = tokio::time::timeout(limit, self.model.segment(&stack, &structures)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(result)) => {
                info!(
                    batch_id = %batch.id,
                    contours = result.contour_count(),
                    "✅  Segmentation finished in {:?}",
                    started.elapsed()
                );
                JobOutcome::Segmented { batch, result }
            }
            Ok(Err(e)) => {
                error!(batch_id = %batch.id, "❌  Segmentation failed: {}", e);
                JobOutcome::Failed {
                    batch,
                    error: NodeError::Model(e),
                }
            }
            Err(_) => {
                error!(batch_id = %batch.id, "❌  Segmentation timed out after {:?}", limit);
                JobOutcome::Failed {
                    batch,
                    error: NodeError::Model(ModelError::Timeout(limit)),
                }
            }
        }
    }
}
