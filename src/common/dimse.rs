//! DIMSE command sets for C-ECHO and C-STORE, and their status codes.

use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use smallvec::smallvec;

use super::transfer_syntaxes::trim_uid;
use crate::error::{NodeError, Result};

/// Largest dataset fragment sent in one PDV, leaving room for PDU headers
pub const MAX_PDV_DATA: usize = 16000;

const NO_DATASET: u16 = 0x0101;
const DATASET_PRESENT: u16 = 0x0001;

pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CEchoRq,
    CEchoRsp,
    Other(u16),
}

impl CommandField {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Self::CStoreRq,
            0x8001 => Self::CStoreRsp,
            0x0030 => Self::CEchoRq,
            0x8030 => Self::CEchoRsp,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::CStoreRq => 0x0001,
            Self::CStoreRsp => 0x8001,
            Self::CEchoRq => 0x0030,
            Self::CEchoRsp => 0x8030,
            Self::Other(code) => code,
        }
    }

    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }

    /// The response field matching a request
    pub fn response(self) -> Self {
        Self::from_code(self.code() | 0x8000)
    }
}

/// Outcome carried by a DIMSE response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    Success,
    Warning(u16),
    /// Out of resources, retry later
    Busy(u16),
    Failure(u16),
}

impl DimseStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Self::Success,
            0x0001 | 0xB000..=0xBFFF => Self::Warning(code),
            0xA700..=0xA7FF => Self::Busy(code),
            _ => Self::Failure(code),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Success => status::SUCCESS,
            Self::Warning(code) | Self::Busy(code) | Self::Failure(code) => code,
        }
    }

    /// The object was stored, possibly with a warning
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Success | Self::Warning(_))
    }

    pub fn is_transient(self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success (0x0000)"),
            Self::Warning(code) => write!(f, "warning (0x{:04x})", code),
            Self::Busy(code) => write!(f, "busy (0x{:04x})", code),
            Self::Failure(code) => write!(f, "failure (0x{:04x})", code),
        }
    }
}

/// The fields of a command set this node acts on
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    pub field: CommandField,
    /// Message ID of a request, or the ID being responded to for a response
    pub message_id: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub has_dataset: bool,
    pub status: Option<u16>,
}

impl CommandSet {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            bytes,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| NodeError::protocol(format!("malformed command set: {}", e)))?;

        let field = obj
            .element(tags::COMMAND_FIELD)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            .map(CommandField::from_code)
            .ok_or_else(|| NodeError::protocol("command set without Command Field"))?;

        let id_tag = if field.is_request() {
            tags::MESSAGE_ID
        } else {
            tags::MESSAGE_ID_BEING_RESPONDED_TO
        };
        let message_id = read_u16(&obj, id_tag).unwrap_or(0);
        let has_dataset = read_u16(&obj, tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATASET)
            .unwrap_or(false);

        Ok(Self {
            field,
            message_id,
            affected_sop_class_uid: read_uid(&obj, tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: read_uid(&obj, tags::AFFECTED_SOP_INSTANCE_UID),
            has_dataset,
            status: read_u16(&obj, tags::STATUS),
        })
    }

    pub fn dimse_status(&self) -> Option<DimseStatus> {
        self.status.map(DimseStatus::from_code)
    }
}

fn read_u16(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

fn read_uid(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| trim_uid(&s).to_string())
        .filter(|s| !s.is_empty())
}

fn us(tag: dicom_core::Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, PrimitiveValue::U16(smallvec![value]))
}

fn ui(tag: dicom_core::Tag, value: &str) -> InMemElement {
    DataElement::new(tag, VR::UI, PrimitiveValue::from(value))
}

fn encode(elements: Vec<InMemElement>) -> Result<Vec<u8>> {
    let command = InMemDicomObject::command_from_element_iter(elements);
    let mut buffer = Vec::new();
    command
        .write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| NodeError::protocol(format!("cannot encode command set: {}", e)))?;
    Ok(buffer)
}

pub fn echo_request(message_id: u16) -> Result<Vec<u8>> {
    encode(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, super::sop_classes::VERIFICATION),
        us(tags::COMMAND_FIELD, CommandField::CEchoRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
    ])
}

pub fn store_request(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Result<Vec<u8>> {
    encode(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CStoreRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, 0x0000),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

/// Response to `request` with the given status. Responses never carry a dataset.
pub fn response(request: &CommandSet, status: u16) -> Result<Vec<u8>> {
    let mut elements = Vec::with_capacity(6);
    if let Some(sop_class) = &request.affected_sop_class_uid {
        elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, sop_class));
    }
    elements.push(us(tags::COMMAND_FIELD, request.field.response().code()));
    elements.push(us(tags::MESSAGE_ID_BEING_RESPONDED_TO, request.message_id));
    elements.push(us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET));
    elements.push(us(tags::STATUS, status));
    if let Some(sop_instance) = &request.affected_sop_instance_uid {
        elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance));
    }
    encode(elements)
}

pub fn command_pdu(presentation_context_id: u8, command: Vec<u8>) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: command,
        }],
    }
}

/// Split a dataset into P-DATA PDUs of at most [`MAX_PDV_DATA`] bytes each
pub fn data_pdus(presentation_context_id: u8, dataset: &[u8]) -> Vec<Pdu> {
    if dataset.is_empty() {
        return vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: Vec::new(),
            }],
        }];
    }
    let chunks = dataset.chunks(MAX_PDV_DATA);
    let count = chunks.len();
    chunks
        .enumerate()
        .map(|(i, chunk)| Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Data,
                is_last: i + 1 == count,
                data: chunk.to_vec(),
            }],
        })
        .collect()
}
