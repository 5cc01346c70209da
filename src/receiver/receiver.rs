use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::association::ServerAssociation;
use dicom_ul::pdu::{PresentationContextResultReason, Pdu};

use super::assembly::{DimseMessage, MessageAssembler};
use crate::aggregator::StudyAggregator;
use crate::common::dimse::{self, status, CommandField};
use crate::common::sop_classes::SopClassRegistry;
use crate::common::transfer_syntaxes::{trim_uid, TransferSyntaxCatalog};
use crate::common::types::Instance;
use crate::config::{ConfigHandle, NodeConfig};
use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent};

/// How a served association came to an end
#[derive(Debug)]
enum Ending {
    Released,
    PeerAborted,
    /// We abort: protocol violation, idle or lifetime timer
    Abort(String),
    /// The transport failed underneath us
    Dropped(String),
}

enum Flow {
    Continue,
    Abort(String),
}

/// Accepts inbound associations and routes C-ECHO and C-STORE requests.
pub struct AssociationManager {
    config: Arc<ConfigHandle>,
    aggregator: Arc<StudyAggregator>,
    events: EventBus,
    sop_registry: SopClassRegistry,
    transfer_catalog: TransferSyntaxCatalog,
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    next_connection: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl AssociationManager {
    pub fn new(config: Arc<ConfigHandle>, aggregator: Arc<StudyAggregator>, events: EventBus) -> Arc<Self> {
        let max_associations = config.snapshot().max_associations;
        Arc::new(Self {
            config,
            aggregator,
            events,
            sop_registry: SopClassRegistry::new(),
            transfer_catalog: TransferSyntaxCatalog::new(),
            slots: Arc::new(Semaphore::new(max_associations)),
            active: AtomicUsize::new(0),
            next_connection: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub async fn bind(config: &NodeConfig) -> Result<TcpListener> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        TcpListener::bind(addr)
            .await
            .map_err(|e| NodeError::network(format!("cannot listen on {}: {}", addr, e)))
    }

    /// Associations currently being served
    pub fn active_associations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections until `shutdown` flips, then give in-flight associations the grace
    /// period before their sockets are closed.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("📥  DICOM receiver listening on {}", addr);
        }
        let mut connections = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "🔗  New connection");
                        let manager = Arc::clone(&self);
                        connections.spawn(async move { manager.handle_connection(stream, peer).await });
                    }
                    Err(e) => error!("❌  Failed to accept connection: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        let grace = self.config.snapshot().shutdown_grace();
        info!("Receiver stopping, {} associations in flight", connections.len());
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Grace period of {:?} elapsed, closing remaining associations", grace);
            self.force_close();
            while connections.join_next().await.is_some() {}
        }
        info!("📡  Receiver stopped");
    }

    /// Shut down every registered socket; blocked reads return immediately
    pub fn force_close(&self) {
        for stream in self.lock_streams().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let config = self.config.snapshot();

        // beyond the bound: wait in line, then negotiate anyway and answer stores with busy
        let permit = match tokio::time::timeout(
            config.association_queue_timeout(),
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Some(permit),
            _ => {
                warn!(%peer, "All {} association slots taken, serving as busy", config.max_associations);
                None
            }
        };
        let busy = permit.is_none();

        let (stream, control) = match prepare_stream(stream, config.idle_timeout()) {
            Ok(pair) => pair,
            Err(e) => {
                error!(%peer, "❌  Cannot prepare connection: {}", e);
                return;
            }
        };
        let connection_id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        if let Ok(clone) = control.try_clone() {
            self.lock_streams().insert(connection_id, clone);
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let manager = Arc::clone(&self);
        let served = tokio::task::spawn_blocking(move || {
            manager.serve_blocking(stream, control, peer, busy, &config)
        })
        .await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.lock_streams().remove(&connection_id);
        drop(permit);

        match served {
            Ok(Ok(instances)) => {
                info!(%peer, instances, "📡  Association closed");
                self.events.publish(NodeEvent::AssociationClosed {
                    peer: peer.to_string(),
                    instances,
                });
            }
            Ok(Err(e)) => warn!(%peer, "Association ended with error: {}", e),
            Err(e) => error!(%peer, "Association task failed: {}", e),
        }
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve one association on a blocking thread. Returns the number of stored instances.
    fn serve_blocking(
        &self,
        stream: TcpStream,
        control: TcpStream,
        peer: SocketAddr,
        busy: bool,
        config: &NodeConfig,
    ) -> Result<usize> {
        let mut options = ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title(config.ae_title.as_str())
            .max_pdu_length(config.max_pdu);
        for uid in self.sop_registry.get_all_uids() {
            options = options.with_abstract_syntax(uid);
        }
        for uid in self.transfer_catalog.get_all_uids() {
            options = options.with_transfer_syntax(uid);
        }

        let mut association = match options.establish(stream) {
            Ok(association) => association,
            Err(e) => {
                warn!(%peer, "Association rejected: {}", e);
                self.events.publish(NodeEvent::AssociationRejected {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                });
                return Err(NodeError::protocol(format!("negotiation with {} failed: {}", peer, e)));
            }
        };

        let calling_ae = association.client_ae_title().trim().to_string();
        info!(%peer, calling_ae = %calling_ae, busy, "✅  Association established");
        self.events.publish(NodeEvent::AssociationAccepted {
            peer: peer.to_string(),
            calling_ae,
            busy,
        });

        let accepted: HashMap<u8, String> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .map(|pc| (pc.id, trim_uid(&pc.transfer_syntax).to_string()))
            .collect();
        for (id, ts) in &accepted {
            debug!(%peer, "📋  Accepted presentation context {} with {}", id, ts);
        }

        let idle = config.idle_timeout();
        let lifetime = config.association_timeout();
        let started = Instant::now();
        let mut assembler = MessageAssembler::new();
        let mut stored = 0usize;

        let ending = 'serve: loop {
            let remaining = lifetime.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break Ending::Abort(format!("association exceeded {:?}", lifetime));
            }
            let wait = idle.min(remaining);
            if let Err(e) = control.set_read_timeout(Some(wait)) {
                break Ending::Dropped(e.to_string());
            }

            let waiting_since = Instant::now();
            match association.receive() {
                Ok(Pdu::PData { data }) => {
                    for pdv in data {
                        let Some(transfer_syntax) = accepted.get(&pdv.presentation_context_id) else {
                            break 'serve Ending::Abort(format!(
                                "PDV on unaccepted presentation context {}",
                                pdv.presentation_context_id
                            ));
                        };
                        let message = match assembler.push(pdv) {
                            Ok(Some(message)) => message,
                            Ok(None) => continue,
                            Err(e) => break 'serve Ending::Abort(e.to_string()),
                        };
                        match self.dispatch(&mut association, message, transfer_syntax, busy, peer) {
                            Ok((Flow::Continue, stored_one)) => stored += usize::from(stored_one),
                            Ok((Flow::Abort(reason), _)) => break 'serve Ending::Abort(reason),
                            Err(e) => break 'serve Ending::Dropped(e.to_string()),
                        }
                    }
                }
                Ok(Pdu::ReleaseRQ) => {
                    if let Err(e) = association.send(&Pdu::ReleaseRP) {
                        warn!(%peer, "Failed to send release response: {}", e);
                    }
                    break Ending::Released;
                }
                Ok(Pdu::AbortRQ { .. }) => break Ending::PeerAborted,
                Ok(other) => {
                    break Ending::Abort(format!("unexpected PDU {:?}", std::mem::discriminant(&other)))
                }
                Err(e) => {
                    if waiting_since.elapsed() >= wait {
                        break Ending::Abort(format!("no activity for {:?}", wait));
                    }
                    break Ending::Dropped(e.to_string());
                }
            }
        };

        if !assembler.is_idle() {
            warn!(%peer, "Discarding {} bytes of an incomplete message", assembler.buffered_bytes());
        }
        match ending {
            Ending::Released => debug!(%peer, "📤  Association released"),
            Ending::PeerAborted => info!(%peer, "🔌  Peer aborted the association"),
            Ending::Abort(reason) => {
                warn!(%peer, "Aborting association: {}", reason);
                let _ = association.abort();
            }
            Ending::Dropped(reason) => info!(%peer, "🔌  Connection lost: {}", reason),
        }
        Ok(stored)
    }

    /// Answer one message. The flag reports whether an instance was stored.
    fn dispatch(
        &self,
        association: &mut ServerAssociation<TcpStream>,
        message: DimseMessage,
        transfer_syntax: &str,
        busy: bool,
        peer: SocketAddr,
    ) -> Result<(Flow, bool)> {
        let pc_id = message.presentation_context_id;
        let command = message.command.clone();

        let (code, flow, stored) = match command.field {
            CommandField::CEchoRq => {
                debug!(%peer, "C-ECHO");
                (status::SUCCESS, Flow::Continue, false)
            }
            CommandField::CStoreRq if busy => {
                warn!(%peer, "Refusing C-STORE while busy");
                (status::OUT_OF_RESOURCES, Flow::Continue, false)
            }
            CommandField::CStoreRq => {
                let code = self.store(message, transfer_syntax, peer);
                (code, Flow::Continue, code == status::SUCCESS)
            }
            other => {
                warn!(%peer, "Unrecognized DIMSE command 0x{:04x}", other.code());
                (
                    status::UNRECOGNIZED_OPERATION,
                    Flow::Abort(format!("unrecognized command 0x{:04x}", other.code())),
                    false,
                )
            }
        };

        let reply = dimse::response(&command, code)?;
        association
            .send(&dimse::command_pdu(pc_id, reply))
            .map_err(|e| NodeError::network(format!("cannot send response to {}: {}", peer, e)))?;
        Ok((flow, stored))
    }

    fn store(&self, message: DimseMessage, transfer_syntax: &str, peer: SocketAddr) -> u16 {
        let Some(dataset) = message.dataset else {
            warn!(%peer, "C-STORE without a dataset");
            return status::CANNOT_UNDERSTAND;
        };
        let bytes = dataset.len();

        let accepted = Instance::decode(dataset, transfer_syntax).and_then(|instance| {
            if let Some(announced) = &message.command.affected_sop_instance_uid {
                if announced != &instance.sop_uid {
                    warn!(%peer, "C-STORE announced {} but the dataset is {}", announced, instance.sop_uid);
                }
            }
            let sop_uid = instance.sop_uid.clone();
            self.aggregator.accept(instance).map(|outcome| (sop_uid, outcome))
        });

        match accepted {
            Ok((sop_uid, outcome)) => {
                info!(%peer, batch_id = %outcome.batch_id, sop_uid = %sop_uid, bytes, "✅  Stored instance");
                status::SUCCESS
            }
            Err(NodeError::DicomObject(reason)) => {
                warn!(%peer, "Cannot understand dataset: {}", reason);
                status::CANNOT_UNDERSTAND
            }
            Err(NodeError::Io(e)) => {
                error!(%peer, "❌  Cannot spool instance: {}", e);
                status::OUT_OF_RESOURCES
            }
            Err(e) => {
                error!(%peer, "❌  Failed to accept instance: {}", e);
                status::PROCESSING_FAILURE
            }
        }
    }
}

/// Convert the accepted socket for blocking use. The second stream shares the socket and is used
/// to adjust timeouts while the association owns the first.
fn prepare_stream(stream: tokio::net::TcpStream, idle: Duration) -> std::io::Result<(TcpStream, TcpStream)> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(idle))?;
    stream.set_write_timeout(Some(idle))?;
    let control = stream.try_clone()?;
    Ok((stream, control))
}
