//! Internal notification channel for anything observing the node.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    AssociationAccepted {
        peer: String,
        calling_ae: String,
        busy: bool,
    },
    AssociationRejected {
        peer: String,
        reason: String,
    },
    AssociationClosed {
        peer: String,
        instances: usize,
    },
    InstanceReceived {
        batch_id: Uuid,
        study_uid: String,
        series_uid: String,
        sop_uid: String,
    },
    BatchReady {
        batch_id: Uuid,
        instances: usize,
    },
    BatchProcessing {
        batch_id: Uuid,
    },
    BatchFailed {
        batch_id: Uuid,
        reason: String,
    },
    ReportSynthesized {
        batch_id: Uuid,
        sop_uid: String,
        contours: usize,
    },
    ReportSent {
        batch_id: Option<Uuid>,
        sop_uid: String,
        destination: String,
    },
    ReportPending {
        batch_id: Option<Uuid>,
        sop_uid: String,
        reason: String,
    },
    DestinationAdded {
        id: Uuid,
        ae_title: String,
    },
    DestinationActivated {
        id: Option<Uuid>,
    },
}

/// Broadcast fan-out of [`NodeEvent`]s. Publishing never blocks; slow subscribers lag.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: NodeEvent) {
        trace!(?event, "event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
