//! The stage after segmentation: report synthesis, forwarding and batch bookkeeping.

use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::aggregator::ledger::{BatchLedger, BatchState};
use crate::aggregator::spool::Spool;
use crate::aggregator::Batch;
use crate::autocontour::JobOutcome;
use crate::config::ConfigHandle;
use crate::destinations::{Delivery, Forwarder};
use crate::error::NodeError;
use crate::events::{EventBus, NodeEvent};
use crate::report::ReportSynthesizer;
use crate::uid::UidGenerator;

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Takes finished segmentation jobs to their terminal batch state
pub struct DeliveryStage {
    config: Arc<ConfigHandle>,
    uids: Arc<UidGenerator>,
    ledger: Arc<BatchLedger>,
    events: EventBus,
    forwarder: Arc<Forwarder>,
    spool: Option<Spool>,
    clock: fn() -> NaiveDateTime,
}

impl DeliveryStage {
    pub fn new(
        config: Arc<ConfigHandle>,
        uids: Arc<UidGenerator>,
        ledger: Arc<BatchLedger>,
        events: EventBus,
        forwarder: Arc<Forwarder>,
        spool: Option<Spool>,
    ) -> Self {
        Self {
            config,
            uids,
            ledger,
            events,
            forwarder,
            spool,
            clock: local_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Handle outcomes until every orchestrator worker has gone away
    pub async fn run(self, mut outcomes: mpsc::UnboundedReceiver<JobOutcome>) {
        while let Some(outcome) = outcomes.recv().await {
            self.handle(outcome).await;
        }
        info!("Delivery stage stopped");
    }

    /// Returns the state the batch ended in
    pub async fn handle(&self, outcome: JobOutcome) -> BatchState {
        match outcome {
            JobOutcome::Failed { batch, error } => self.fail(&batch, &error),
            JobOutcome::Segmented { batch, result } => {
                let synthesizer = ReportSynthesizer::from_config(self.uids.clone(), &self.config.snapshot());
                let report = match synthesizer.synthesize(&batch, &result, (self.clock)()) {
                    Ok(report) => report,
                    Err(e) => return self.fail(&batch, &e),
                };
                self.ledger.set_report(batch.id, &report.sop_instance_uid);
                self.events.publish(NodeEvent::ReportSynthesized {
                    batch_id: batch.id,
                    sop_uid: report.sop_instance_uid.clone(),
                    contours: report.contours.len(),
                });

                if let Err(e) = self.ledger.transition(batch.id, BatchState::Forwarding) {
                    return self.fail(&batch, &e);
                }
                let delivery = self
                    .forwarder
                    .deliver(report.batch_id, &report.sop_instance_uid, &report.object)
                    .await;
                let state = match delivery {
                    Delivery::Sent { .. } => BatchState::Sent,
                    Delivery::Pending { .. } => BatchState::Pending,
                };
                if let Err(e) = self.ledger.transition(batch.id, state) {
                    warn!(batch_id = %batch.id, "Cannot record delivery: {}", e);
                }
                self.retire(&batch, false);
                state
            }
        }
    }

    fn fail(&self, batch: &Batch, error: &NodeError) -> BatchState {
        let reason = error.to_string();
        error!(batch_id = %batch.id, "❌  Batch {} failed: {}", batch.key, reason);
        if let Err(e) = self.ledger.fail(batch.id, &reason) {
            warn!(batch_id = %batch.id, "Cannot record failure: {}", e);
        }
        self.events.publish(NodeEvent::BatchFailed {
            batch_id: batch.id,
            reason,
        });
        self.retire(batch, true);
        BatchState::Failed
    }

    fn retire(&self, batch: &Batch, failed: bool) {
        if let Some(spool) = &self.spool {
            spool.retire(batch, failed);
        }
    }
}
