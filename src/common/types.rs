use chrono::{DateTime, Utc};
use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::transfer_syntaxes::{trim_uid, TransferSyntaxCatalog};
use crate::error::{NodeError, Result};

/// Study and series UIDs that identify a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub study_uid: String,
    pub series_uid: String,
}

impl BatchKey {
    pub fn new(study_uid: impl Into<String>, series_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.study_uid, self.series_uid)
    }
}

/// Patient and study level attributes that must agree across a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientStudyAttributes {
    pub patient_name: String,
    pub patient_id: String,
    pub patient_birth_date: String,
    pub patient_sex: String,
    pub study_date: String,
    pub study_time: String,
    pub study_id: String,
    pub accession_number: String,
    pub referring_physician_name: String,
    pub study_description: String,
}

impl PatientStudyAttributes {
    pub fn from_object(obj: &InMemDicomObject) -> Self {
        Self {
            patient_name: read_text(obj, tags::PATIENT_NAME),
            patient_id: read_text(obj, tags::PATIENT_ID),
            patient_birth_date: read_text(obj, tags::PATIENT_BIRTH_DATE),
            patient_sex: read_text(obj, tags::PATIENT_SEX),
            study_date: read_text(obj, tags::STUDY_DATE),
            study_time: read_text(obj, tags::STUDY_TIME),
            study_id: read_text(obj, tags::STUDY_ID),
            accession_number: read_text(obj, tags::ACCESSION_NUMBER),
            referring_physician_name: read_text(obj, tags::REFERRING_PHYSICIAN_NAME),
            study_description: read_text(obj, tags::STUDY_DESCRIPTION),
        }
    }

    /// Names of the attributes whose values differ
    pub fn differences(&self, other: &Self) -> Vec<&'static str> {
        [
            ("PatientName", self.patient_name == other.patient_name),
            ("PatientID", self.patient_id == other.patient_id),
            ("PatientBirthDate", self.patient_birth_date == other.patient_birth_date),
            ("PatientSex", self.patient_sex == other.patient_sex),
            ("StudyDate", self.study_date == other.study_date),
            ("StudyTime", self.study_time == other.study_time),
            ("StudyID", self.study_id == other.study_id),
            ("AccessionNumber", self.accession_number == other.accession_number),
            (
                "ReferringPhysicianName",
                self.referring_physician_name == other.referring_physician_name,
            ),
            ("StudyDescription", self.study_description == other.study_description),
        ]
        .into_iter()
        .filter(|(_, same)| !same)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Spatial and pixel layout of one image slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceGeometry {
    pub image_position: Option<[f64; 3]>,
    pub image_orientation: Option<[f64; 6]>,
    /// Row spacing then column spacing, in mm
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    pub slice_location: Option<f64>,
    pub instance_number: Option<i32>,
    pub rows: u16,
    pub columns: u16,
    pub bits_allocated: u16,
    pub pixel_representation: u16,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
}

impl SliceGeometry {
    pub fn from_object(obj: &InMemDicomObject) -> Self {
        Self {
            image_position: read_floats(obj, tags::IMAGE_POSITION_PATIENT)
                .and_then(|v| v.try_into().ok()),
            image_orientation: read_floats(obj, tags::IMAGE_ORIENTATION_PATIENT)
                .and_then(|v| v.try_into().ok()),
            pixel_spacing: read_floats(obj, tags::PIXEL_SPACING).and_then(|v| v.try_into().ok()),
            slice_thickness: read_float(obj, tags::SLICE_THICKNESS),
            slice_location: read_float(obj, tags::SLICE_LOCATION),
            instance_number: obj
                .element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok()),
            rows: read_u16(obj, tags::ROWS),
            columns: read_u16(obj, tags::COLUMNS),
            bits_allocated: read_u16(obj, tags::BITS_ALLOCATED),
            pixel_representation: read_u16(obj, tags::PIXEL_REPRESENTATION),
            rescale_slope: read_float(obj, tags::RESCALE_SLOPE),
            rescale_intercept: read_float(obj, tags::RESCALE_INTERCEPT),
        }
    }

    /// Unit normal of the image plane
    pub fn normal(&self) -> Option<[f64; 3]> {
        let o = self.image_orientation?;
        let n = [
            o[1] * o[5] - o[2] * o[4],
            o[2] * o[3] - o[0] * o[5],
            o[0] * o[4] - o[1] * o[3],
        ];
        let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        if len == 0.0 {
            return None;
        }
        Some([n[0] / len, n[1] / len, n[2] / len])
    }

    /// Distance of the slice along its normal, used to order a stack
    pub fn position_along_normal(&self) -> Option<f64> {
        let p = self.image_position?;
        let n = self.normal()?;
        Some(p[0] * n[0] + p[1] * n[1] + p[2] * n[2])
    }

    /// Patient coordinates (mm) of the centre of pixel (row, column)
    pub fn pixel_to_patient(&self, row: f64, column: f64) -> Option<[f64; 3]> {
        let p = self.image_position?;
        let o = self.image_orientation?;
        let [row_spacing, column_spacing] = self.pixel_spacing?;
        let mut out = [0.0; 3];
        for (axis, value) in out.iter_mut().enumerate() {
            *value = p[axis] + o[axis] * column_spacing * column + o[axis + 3] * row_spacing * row;
        }
        Some(out)
    }
}

/// One received image, immutable once stored
#[derive(Debug, Clone)]
pub struct Instance {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub sop_class_uid: String,
    pub modality: String,
    pub frame_of_reference_uid: Option<String>,
    pub patient: PatientStudyAttributes,
    pub geometry: SliceGeometry,
    pub transfer_syntax: String,
    /// Dataset as received, encoded in `transfer_syntax`
    pub dataset: Arc<Vec<u8>>,
    /// Native pixel data, when present
    pub pixel_data: Option<Arc<Vec<u8>>>,
    pub received_at: DateTime<Utc>,
}

impl Instance {
    /// Decode a dataset received in `transfer_syntax`
    pub fn decode(dataset: Vec<u8>, transfer_syntax: &str) -> Result<Self> {
        let codec = TransferSyntaxCatalog::new().codec(transfer_syntax).ok_or_else(|| {
            NodeError::dicom(format!("unsupported transfer syntax {}", transfer_syntax))
        })?;
        let obj = InMemDicomObject::read_dataset_with_ts(dataset.as_slice(), &codec)
            .map_err(|e| NodeError::dicom(format!("cannot decode dataset: {}", e)))?;
        Self::from_object(&obj, transfer_syntax, dataset)
    }

    /// Rebuild an instance from a Part 10 file
    pub fn from_file_object(file: &DefaultDicomObject) -> Result<Self> {
        let transfer_syntax = trim_uid(file.meta().transfer_syntax()).to_string();
        let codec = TransferSyntaxCatalog::new().codec(&transfer_syntax).ok_or_else(|| {
            NodeError::dicom(format!("unsupported transfer syntax {}", transfer_syntax))
        })?;
        let mut dataset = Vec::new();
        file.write_dataset_with_ts(&mut dataset, &codec)
            .map_err(|e| NodeError::dicom(format!("cannot encode dataset: {}", e)))?;
        Self::from_object(file, &transfer_syntax, dataset)
    }

    pub fn from_object(obj: &InMemDicomObject, transfer_syntax: &str, dataset: Vec<u8>) -> Result<Self> {
        let required = |tag, name: &str| {
            read_uid(obj, tag).ok_or_else(|| NodeError::dicom(format!("dataset has no {}", name)))
        };

        let pixel_data = obj
            .element(tags::PIXEL_DATA)
            .ok()
            .and_then(|e| e.to_bytes().ok().map(|b| Arc::new(b.into_owned())));

        Ok(Self {
            study_uid: required(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
            series_uid: required(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
            sop_uid: required(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
            sop_class_uid: required(tags::SOP_CLASS_UID, "SOPClassUID")?,
            modality: read_text(obj, tags::MODALITY),
            frame_of_reference_uid: read_uid(obj, tags::FRAME_OF_REFERENCE_UID),
            patient: PatientStudyAttributes::from_object(obj),
            geometry: SliceGeometry::from_object(obj),
            transfer_syntax: trim_uid(transfer_syntax).to_string(),
            dataset: Arc::new(dataset),
            pixel_data,
            received_at: Utc::now(),
        })
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(&self.study_uid, &self.series_uid)
    }

    /// The instance as a Part 10 object, for the spool
    pub fn to_file_object(&self) -> Result<DefaultDicomObject> {
        let codec = TransferSyntaxCatalog::new()
            .codec(&self.transfer_syntax)
            .ok_or_else(|| {
                NodeError::dicom(format!("unsupported transfer syntax {}", self.transfer_syntax))
            })?;
        let obj = InMemDicomObject::read_dataset_with_ts(self.dataset.as_slice(), &codec)
            .map_err(|e| NodeError::dicom(format!("cannot decode dataset: {}", e)))?;
        obj.with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(self.transfer_syntax.as_str())
                .media_storage_sop_class_uid(self.sop_class_uid.as_str())
                .media_storage_sop_instance_uid(self.sop_uid.as_str()),
        )
        .map_err(NodeError::dicom)
    }
}

pub(crate) fn read_text(obj: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .unwrap_or_default()
}

pub(crate) fn read_uid(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| trim_uid(&s).to_string())
        .filter(|s| !s.is_empty())
}

fn read_u16(obj: &InMemDicomObject, tag: dicom_core::Tag) -> u16 {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .unwrap_or(0)
}

fn read_float(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<f64> {
    obj.element(tag).ok().and_then(|e| e.to_float64().ok())
}

fn read_floats(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok().and_then(|e| e.to_multi_float64().ok())
}
