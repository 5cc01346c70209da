//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use dicom_autocontour::common::dimse::{CommandSet, DimseStatus};
use dicom_autocontour::config::NodeConfig;
use dicom_autocontour::destinations::Endpoint;
use dicom_autocontour::sender::DicomPeer;
use dicom_autocontour::{NodeError, NodeEvent};
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use dicom_ul::association::client::ClientAssociationOptions;
use dicom_ul::pdu::{PDataValueType, Pdu};
use dicom_ul::ClientAssociation;
use smallvec::smallvec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const FRAME_OF_REFERENCE: &str = "1.2.3.999.1";
pub const VERIFICATION: &str = "1.2.840.10008.1.1";
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Node listening on an ephemeral loopback port, nothing on disk
pub fn node_config(ae_title: &str) -> NodeConfig {
    let mut config = NodeConfig {
        ae_title: ae_title.to_string(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        batch_idle_window_ms: 300,
        shutdown_grace_ms: 1_000,
        ..NodeConfig::default()
    };
    config.storage.data_dir = None;
    config.forward.attempt_timeout_ms = 5_000;
    config
}

/// One 4x4 axial MR slice at height `z`
pub fn mr_slice(study: &str, series: &str, sop: &str, z: f64) -> DefaultDicomObject {
    let text = |tag, vr, value: &str| DataElement::new(tag, vr, PrimitiveValue::from(value));
    let ds = |tag, values: &[f64]| {
        DataElement::new(
            tag,
            VR::DS,
            PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect()),
        )
    };
    let us = |tag, value: u16| DataElement::new(tag, VR::US, PrimitiveValue::U16(smallvec![value]));

    InMemDicomObject::from_element_iter([
        text(tags::SOP_CLASS_UID, VR::UI, MR_IMAGE_STORAGE),
        text(tags::SOP_INSTANCE_UID, VR::UI, sop),
        text(tags::STUDY_INSTANCE_UID, VR::UI, study),
        text(tags::SERIES_INSTANCE_UID, VR::UI, series),
        text(tags::FRAME_OF_REFERENCE_UID, VR::UI, FRAME_OF_REFERENCE),
        text(tags::MODALITY, VR::CS, "MR"),
        text(tags::PATIENT_NAME, VR::PN, "Doe^Jane"),
        text(tags::PATIENT_ID, VR::LO, "PID001"),
        text(tags::PATIENT_BIRTH_DATE, VR::DA, "19700101"),
        text(tags::PATIENT_SEX, VR::CS, "F"),
        text(tags::STUDY_DATE, VR::DA, "20240501"),
        text(tags::STUDY_TIME, VR::TM, "101500"),
        ds(tags::IMAGE_POSITION_PATIENT, &[-100.0, -100.0, z]),
        ds(tags::IMAGE_ORIENTATION_PATIENT, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
        ds(tags::PIXEL_SPACING, &[0.5, 0.5]),
        us(tags::ROWS, 4),
        us(tags::COLUMNS, 4),
        us(tags::BITS_ALLOCATED, 16),
        us(tags::PIXEL_REPRESENTATION, 0),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16((0..16_u16).collect())),
    ])
    .with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax("1.2.840.10008.1.2.1")
            .media_storage_sop_class_uid(MR_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop),
    )
    .unwrap()
}

/// Outbound peer that answers every echo and store with success and keeps what it was sent
#[derive(Default)]
pub struct RecordingPeer {
    pub stores: AtomicUsize,
    pub received: Mutex<Vec<DefaultDicomObject>>,
}

#[async_trait]
impl DicomPeer for RecordingPeer {
    async fn echo(&self, _endpoint: &Endpoint) -> Result<DimseStatus, NodeError> {
        Ok(DimseStatus::Success)
    }

    async fn store(&self, _endpoint: &Endpoint, object: &DefaultDicomObject) -> Result<DimseStatus, NodeError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(object.clone());
        Ok(DimseStatus::Success)
    }
}

/// Wait for the first event matching `pick`
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<NodeEvent>,
    limit: Duration,
    mut pick: impl FnMut(&NodeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Open a raw association proposing one transfer syntax per abstract syntax. Blocking.
pub fn associate(addr: SocketAddr, called_ae: &str, contexts: &[(&str, &str)]) -> ClientAssociation<TcpStream> {
    let mut options = ClientAssociationOptions::new()
        .calling_ae_title("MODALITY")
        .called_ae_title(called_ae.to_string())
        .read_timeout(Duration::from_secs(5))
        .write_timeout(Duration::from_secs(5));
    for (abstract_syntax, transfer_syntax) in contexts {
        options = options.with_presentation_context(abstract_syntax.to_string(), vec![transfer_syntax.to_string()]);
    }
    options.establish_with(&addr.to_string()).unwrap()
}

/// Accepted presentation context ids, in the order they were proposed
pub fn context_ids(association: &ClientAssociation<TcpStream>) -> Vec<u8> {
    association.presentation_contexts().iter().map(|pc| pc.id).collect()
}

/// What the node sent back on a raw association
#[derive(Debug)]
pub enum Reply {
    Command(CommandSet),
    Aborted,
    Closed,
}

/// Read the next complete command set, or how the association ended. Blocking.
pub fn next_reply(association: &mut ClientAssociation<TcpStream>) -> Reply {
    let mut command = Vec::new();
    loop {
        match association.receive() {
            Ok(Pdu::PData { data }) => {
                for pdv in data {
                    if !matches!(pdv.value_type, PDataValueType::Command) {
                        continue;
                    }
                    command.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        return Reply::Command(CommandSet::parse(&command).unwrap());
                    }
                }
            }
            Ok(Pdu::AbortRQ { .. }) => return Reply::Aborted,
            Ok(other) => panic!("unexpected PDU {:?}", other),
            Err(_) => return Reply::Closed,
        }
    }
}
