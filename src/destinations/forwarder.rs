use chrono::Utc;
use dicom_object::DefaultDicomObject;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::pending::{PendingReport, PendingStore};
use super::registry::{DestinationRegistry, Endpoint};
use crate::aggregator::ledger::{BatchLedger, BatchState};
use crate::config::{ConfigHandle, ForwardConfig};
use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::sender::DicomPeer;

/// Where a report ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { destination: String },
    Pending { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendSummary {
    pub sent: usize,
    pub still_pending: usize,
}

/// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
pub fn backoff(forward: &ForwardConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let millis = forward.backoff_base_ms.saturating_mul(factor).min(forward.backoff_max_ms);
    Duration::from_millis(millis)
}

/// Delivers reports to the active destination, keeping undeliverable ones as pending.
pub struct Forwarder {
    config: Arc<ConfigHandle>,
    registry: Arc<DestinationRegistry>,
    peer: Arc<dyn DicomPeer>,
    pending: Arc<PendingStore>,
    ledger: Arc<BatchLedger>,
    events: EventBus,
}

impl Forwarder {
    pub fn new(
        config: Arc<ConfigHandle>,
        registry: Arc<DestinationRegistry>,
        peer: Arc<dyn DicomPeer>,
        pending: Arc<PendingStore>,
        ledger: Arc<BatchLedger>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            peer,
            pending,
            ledger,
            events,
        }
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    /// Send `object` to the active destination. Never loses the object: anything that is not
    /// delivered is kept in the pending store.
    pub async fn deliver(&self, batch_id: Option<Uuid>, sop_uid: &str, object: &DefaultDicomObject) -> Delivery {
        let outcome = match self.registry.active() {
            Some(endpoint) => self.send_with_retry(&endpoint, object).await.map(|_| endpoint),
            None => Err(NodeError::forwarding("no active destination")),
        };

        match outcome {
            Ok(endpoint) => {
                info!(batch_id = ?batch_id, "🚀  Report {} sent to {}", sop_uid, endpoint);
                self.events.publish(NodeEvent::ReportSent {
                    batch_id,
                    sop_uid: sop_uid.to_string(),
                    destination: endpoint.to_string(),
                });
                Delivery::Sent {
                    destination: endpoint.to_string(),
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(batch_id = ?batch_id, "📬  Report {} kept as pending: {}", sop_uid, reason);
                let report = PendingReport {
                    batch_id,
                    sop_uid: sop_uid.to_string(),
                    reason: reason.clone(),
                    since: Utc::now(),
                    object: object.clone(),
                };
                if let Err(e) = self.pending.add(report) {
                    error!("❌  Failed to persist pending report {}: {}", sop_uid, e);
                }
                self.events.publish(NodeEvent::ReportPending {
                    batch_id,
                    sop_uid: sop_uid.to_string(),
                    reason: reason.clone(),
                });
                Delivery::Pending { reason }
            }
        }
    }

    /// Try every pending report against the active destination once more
    pub async fn resend_pending(&self) -> ResendSummary {
        let reports = self.pending.list();
        let mut summary = ResendSummary::default();
        if reports.is_empty() {
            return summary;
        }
        let Some(endpoint) = self.registry.active() else {
            warn!("{} pending reports but no active destination", reports.len());
            summary.still_pending = reports.len();
            return summary;
        };

        for report in reports {
            match self.send_with_retry(&endpoint, &report.object).await {
                Ok(()) => {
                    self.pending.remove(&report.sop_uid);
                    if let Some(batch_id) = report.batch_id {
                        if let Err(e) = self.ledger.transition(batch_id, BatchState::Sent) {
                            // batches from an earlier run are no longer in the ledger
                            warn!(batch_id = %batch_id, "Resent report without ledger update: {}", e);
                        }
                    }
                    info!("🚀  Pending report {} sent to {}", report.sop_uid, endpoint);
                    self.events.publish(NodeEvent::ReportSent {
                        batch_id: report.batch_id,
                        sop_uid: report.sop_uid.clone(),
                        destination: endpoint.to_string(),
                    });
                    summary.sent += 1;
                }
                Err(e) => {
                    warn!("Pending report {} still undeliverable: {}", report.sop_uid, e);
                    summary.still_pending += 1;
                }
            }
        }
        summary
    }

    async fn send_with_retry(&self, endpoint: &Endpoint, object: &DefaultDicomObject) -> Result<()> {
        let forward = self.config.snapshot().forward.clone();
        let attempts = forward.max_attempts.max(1);
        let attempt_timeout = Duration::from_millis(forward.attempt_timeout_ms);
        let mut last_error = NodeError::forwarding("no attempt made");

        for attempt in 1..=attempts {
            let error = match tokio::time::timeout(attempt_timeout, self.peer.store(endpoint, object)).await {
                Ok(Ok(status)) if status.is_delivered() => return Ok(()),
                Ok(Ok(status)) if status.is_transient() => {
                    NodeError::forwarding(format!("{} is busy ({})", endpoint, status))
                }
                Ok(Ok(status)) => {
                    return Err(NodeError::forwarding(format!("{} rejected the report: {}", endpoint, status)));
                }
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return Err(NodeError::forwarding(format!("{}: {}", endpoint, e))),
                Err(_) => NodeError::network(format!("attempt timed out after {:?}", attempt_timeout)),
            };

            warn!("Attempt {}/{} to {} failed: {}", attempt, attempts, endpoint, error);
            last_error = error;
            if attempt < attempts {
                tokio::time::sleep(backoff(&forward, attempt)).await;
            }
        }

        Err(NodeError::forwarding(format!(
            "gave up on {} after {} attempts: {}",
            endpoint, attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dimse::DimseStatus;
    use crate::common::types::fixtures::mr_slice;
    use crate::config::NodeConfig;
    use crate::sender::testing::ScriptedPeer;
    use tokio::time::Instant;

    struct Harness {
        forwarder: Forwarder,
        registry: Arc<DestinationRegistry>,
        peer: Arc<ScriptedPeer>,
    }

    async fn harness(peer: ScriptedPeer, with_destination: bool) -> Harness {
        let config = NodeConfig::default();
        let events = EventBus::new();
        let registry = Arc::new(DestinationRegistry::in_memory(events.clone()));
        let peer = Arc::new(peer);
        if with_destination {
            let endpoint = registry
                .add(Endpoint::new("TPS", "127.0.0.1", 104, ""), peer.as_ref())
                .await
                .unwrap();
            registry.activate(endpoint.id).unwrap();
        }
        let forwarder = Forwarder::new(
            Arc::new(ConfigHandle::new(config)),
            registry.clone(),
            peer.clone(),
            Arc::new(PendingStore::in_memory()),
            Arc::new(BatchLedger::new(10, None)),
            events,
        );
        Harness { forwarder, registry, peer }
    }

    fn object() -> DefaultDicomObject {
        mr_slice("1.2.3", "1.2.3.4", "1.2.3.4.1", 0.0).to_file_object().unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let forward = ForwardConfig {
            backoff_base_ms: 1000,
            backoff_max_ms: 5000,
            ..NodeConfig::default().forward
        };
        let delays: Vec<u64> = (1..=5).map(|n| backoff(&forward, n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
        assert_eq!(backoff(&forward, 200), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn no_active_destination_means_pending() {
        let h = harness(ScriptedPeer::storing(vec![]), false).await;
        let delivery = h.forwarder.deliver(None, "1.2.3.4.1", &object()).await;
        assert!(matches!(delivery, Delivery::Pending { .. }));
        assert_eq!(h.peer.store_count(), 0);
        assert_eq!(h.forwarder.pending().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_destination_is_retried_with_backoff() {
        let h = harness(
            ScriptedPeer::storing(vec![
                Ok(DimseStatus::Busy(0xA700)),
                Err(NodeError::network("connection reset")),
                Ok(DimseStatus::Success),
            ]),
            true,
        )
        .await;

        let started = Instant::now();
        let delivery = h.forwarder.deliver(None, "1.2.3.4.1", &object()).await;
        assert_eq!(
            delivery,
            Delivery::Sent {
                destination: "TPS@127.0.0.1:104".into()
            }
        );
        assert_eq!(h.peer.store_count(), 3);
        // 1s then 2s of backoff
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert!(h.forwarder.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_the_report() {
        let h = harness(
            ScriptedPeer::storing(vec![
                Ok(DimseStatus::Busy(0xA700)),
                Ok(DimseStatus::Busy(0xA700)),
                Ok(DimseStatus::Busy(0xA700)),
            ]),
            true,
        )
        .await;
        let delivery = h.forwarder.deliver(None, "1.2.3.4.1", &object()).await;
        assert!(matches!(delivery, Delivery::Pending { .. }));
        assert_eq!(h.peer.store_count(), 3);
        assert_eq!(h.forwarder.pending().len(), 1);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let h = harness(ScriptedPeer::storing(vec![Ok(DimseStatus::Failure(0xC000))]), true).await;
        let delivery = h.forwarder.deliver(None, "1.2.3.4.1", &object()).await;
        assert!(matches!(delivery, Delivery::Pending { .. }));
        assert_eq!(h.peer.store_count(), 1);
    }

    #[tokio::test]
    async fn resend_delivers_pending_reports() {
        let h = harness(ScriptedPeer::storing(vec![]), false).await;
        h.forwarder.deliver(None, "1.2.3.4.1", &object()).await;
        assert_eq!(
            h.forwarder.resend_pending().await,
            ResendSummary { sent: 0, still_pending: 1 }
        );

        let endpoint = h
            .registry
            .add(Endpoint::new("TPS", "127.0.0.1", 104, ""), h.peer.as_ref())
            .await
            .unwrap();
        h.registry.activate(endpoint.id).unwrap();
        assert_eq!(
            h.forwarder.resend_pending().await,
            ResendSummary { sent: 1, still_pending: 0 }
        );
        assert!(h.forwarder.pending().is_empty());
        assert_eq!(h.peer.delivered(), vec!["1.2.3.4.1".to_string()]);
    }
}
