use async_trait::async_trait;
use dicom_object::DefaultDicomObject;
use dicom_ul::association::client::ClientAssociationOptions;
use dicom_ul::pdu::{PDataValueType, PresentationContextResultReason, Pdu};
use dicom_ul::ClientAssociation;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::DicomPeer;
use crate::common::dimse::{self, status, CommandField, CommandSet, DimseStatus};
use crate::common::sop_classes::{SopClassRegistry, VERIFICATION};
use crate::common::transfer_syntaxes::{
    trim_uid, TransferSyntaxCatalog, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
use crate::config::ConfigHandle;
use crate::destinations::Endpoint;
use crate::error::{NodeError, Result};

/// Association settings taken from the configuration at the time of a request
#[derive(Debug, Clone)]
struct ScuSettings {
    calling_ae: String,
    max_pdu: u32,
    timeout: Duration,
}

/// Real network peer: one association per request, released afterwards
#[derive(Debug, Clone)]
pub struct DicomScu {
    config: Arc<ConfigHandle>,
}

impl DicomScu {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self { config }
    }

    fn settings(&self) -> ScuSettings {
        let config = self.config.snapshot();
        ScuSettings {
            calling_ae: config.ae_title.clone(),
            max_pdu: config.max_pdu,
            timeout: Duration::from_millis(config.forward.attempt_timeout_ms),
        }
    }

    fn echo_blocking(settings: &ScuSettings, endpoint: &Endpoint) -> Result<DimseStatus> {
        let mut association = ClientAssociationOptions::new()
            .calling_ae_title(settings.calling_ae.as_str())
            .called_ae_title(endpoint.ae_title.as_str())
            .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LITTLE_ENDIAN])
            .max_pdu_length(settings.max_pdu)
            .read_timeout(settings.timeout)
            .write_timeout(settings.timeout)
            .establish_with(&endpoint.address())
            .map_err(|e| NodeError::network(format!("cannot associate with {}: {}", endpoint, e)))?;

        let pc_id = match accepted_context(&association) {
            Some((id, _)) => id,
            None => {
                let _ = association.abort();
                return Err(NodeError::protocol(format!("{} refused the Verification context", endpoint)));
            }
        };

        let started = Instant::now();
        association
            .send(&dimse::command_pdu(pc_id, dimse::echo_request(1)?))
            .map_err(|e| NodeError::network(format!("cannot send C-ECHO to {}: {}", endpoint, e)))?;
        let response = read_response(&mut association, endpoint)?;
        release(association, endpoint);

        let status = response
            .dimse_status()
            .ok_or_else(|| NodeError::protocol("C-ECHO response without status"))?;
        info!("🔔  C-ECHO {} answered {} in {:?}", endpoint, status, started.elapsed());
        Ok(status)
    }

    fn store_blocking(settings: &ScuSettings, endpoint: &Endpoint, object: &DefaultDicomObject) -> Result<DimseStatus> {
        let sop_class = trim_uid(object.meta().media_storage_sop_class_uid()).to_string();
        let sop_instance = trim_uid(object.meta().media_storage_sop_instance_uid()).to_string();
        if let Some(name) = SopClassRegistry::new().get_name(&sop_class) {
            debug!("Storing {} ({}) to {}", sop_instance, name, endpoint);
        }

        let mut association = ClientAssociationOptions::new()
            .calling_ae_title(settings.calling_ae.as_str())
            .called_ae_title(endpoint.ae_title.as_str())
            .with_presentation_context(
                sop_class.as_str(),
                vec![EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN],
            )
            .max_pdu_length(settings.max_pdu)
            .read_timeout(settings.timeout)
            .write_timeout(settings.timeout)
            .establish_with(&endpoint.address())
            .map_err(|e| NodeError::network(format!("cannot associate with {}: {}", endpoint, e)))?;

        let Some((pc_id, transfer_syntax)) = accepted_context(&association) else {
            warn!("{} accepted no presentation context for {}", endpoint, sop_class);
            let _ = association.abort();
            return Ok(DimseStatus::Failure(status::SOP_CLASS_NOT_SUPPORTED));
        };
        let codec = TransferSyntaxCatalog::new()
            .codec(&transfer_syntax)
            .ok_or_else(|| NodeError::protocol(format!("negotiated unsupported transfer syntax {}", transfer_syntax)))?;

        let mut dataset = Vec::new();
        object
            .write_dataset_with_ts(&mut dataset, &codec)
            .map_err(|e| NodeError::dicom(format!("cannot encode {}: {}", sop_instance, e)))?;

        let started = Instant::now();
        let command = dimse::store_request(1, &sop_class, &sop_instance)?;
        association
            .send(&dimse::command_pdu(pc_id, command))
            .map_err(|e| NodeError::network(format!("cannot send C-STORE to {}: {}", endpoint, e)))?;
        for pdu in dimse::data_pdus(pc_id, &dataset) {
            association
                .send(&pdu)
                .map_err(|e| NodeError::network(format!("cannot send dataset to {}: {}", endpoint, e)))?;
        }

        let response = read_response(&mut association, endpoint)?;
        release(association, endpoint);
        let status = response
            .dimse_status()
            .ok_or_else(|| NodeError::protocol("C-STORE response without status"))?;
        info!(
            "📤  C-STORE {} to {}: {} ({} bytes in {:?})",
            sop_instance,
            endpoint,
            status,
            dataset.len(),
            started.elapsed()
        );
        Ok(status)
    }
}

#[async_trait]
impl DicomPeer for DicomScu {
    async fn echo(&self, endpoint: &Endpoint) -> Result<DimseStatus> {
        let settings = self.settings();
        let endpoint = endpoint.clone();
        tokio::task::spawn_blocking(move || Self::echo_blocking(&settings, &endpoint))
            .await
            .map_err(|e| NodeError::network(format!("C-ECHO task failed: {}", e)))?
    }

    async fn store(&self, endpoint: &Endpoint, object: &DefaultDicomObject) -> Result<DimseStatus> {
        let settings = self.settings();
        let endpoint = endpoint.clone();
        let object = object.clone();
        tokio::task::spawn_blocking(move || Self::store_blocking(&settings, &endpoint, &object))
            .await
            .map_err(|e| NodeError::network(format!("C-STORE task failed: {}", e)))?
    }
}

fn accepted_context(association: &ClientAssociation<TcpStream>) -> Option<(u8, String)> {
    association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| (pc.id, trim_uid(&pc.transfer_syntax).to_string()))
}

/// Collect command fragments until a complete response command set arrives
fn read_response(association: &mut ClientAssociation<TcpStream>, endpoint: &Endpoint) -> Result<CommandSet> {
    let mut command = Vec::new();
    loop {
        let pdu = association
            .receive()
            .map_err(|e| NodeError::network(format!("no response from {}: {}", endpoint, e)))?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    if !matches!(pdv.value_type, PDataValueType::Command) {
                        continue;
                    }
                    command.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        let parsed = CommandSet::parse(&command)?;
                        if !matches!(parsed.field, CommandField::CEchoRsp | CommandField::CStoreRsp) {
                            return Err(NodeError::protocol(format!(
                                "{} answered with command 0x{:04x}",
                                endpoint,
                                parsed.field.code()
                            )));
                        }
                        return Ok(parsed);
                    }
                }
            }
            Pdu::AbortRQ { .. } => {
                return Err(NodeError::network(format!("{} aborted the association", endpoint)));
            }
            other => {
                return Err(NodeError::protocol(format!(
                    "unexpected PDU from {}: {:?}",
                    endpoint,
                    std::mem::discriminant(&other)
                )));
            }
        }
    }
}

fn release(association: ClientAssociation<TcpStream>, endpoint: &Endpoint) {
    if let Err(e) = association.release() {
        warn!("Failed to release association with {}: {}", endpoint, e);
    }
}
