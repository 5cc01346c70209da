use chrono::NaiveDateTime;
use dicom_core::value::{DataSetSequence, PrimitiveValue};
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregator::Batch;
use crate::autocontour::{ContourResult, ImageStack, SlicePolygon};
use crate::common::sop_classes::RT_STRUCTURE_SET_STORAGE;
use crate::common::transfer_syntaxes::IMPLICIT_VR_LITTLE_ENDIAN;
use crate::common::types::PatientStudyAttributes;
use crate::config::{NodeConfig, ReportConfig, StructureSpec};
use crate::error::{ModelError, NodeError, Result};
use crate::uid::UidGenerator;

const STUDY_COMPONENT_MANAGEMENT: &str = "1.2.840.10008.3.1.2.3.1";

// RT Structure Set module attributes
const STRUCTURE_SET_LABEL: Tag = Tag(0x3006, 0x0002);
const STRUCTURE_SET_NAME: Tag = Tag(0x3006, 0x0004);
const STRUCTURE_SET_DATE: Tag = Tag(0x3006, 0x0008);
const STRUCTURE_SET_TIME: Tag = Tag(0x3006, 0x0009);
const REFERENCED_FRAME_OF_REFERENCE_SEQUENCE: Tag = Tag(0x3006, 0x0010);
const RT_REFERENCED_STUDY_SEQUENCE: Tag = Tag(0x3006, 0x0012);
const RT_REFERENCED_SERIES_SEQUENCE: Tag = Tag(0x3006, 0x0014);
const CONTOUR_IMAGE_SEQUENCE: Tag = Tag(0x3006, 0x0016);
const STRUCTURE_SET_ROI_SEQUENCE: Tag = Tag(0x3006, 0x0020);
const ROI_NUMBER: Tag = Tag(0x3006, 0x0022);
const REFERENCED_FRAME_OF_REFERENCE_UID: Tag = Tag(0x3006, 0x0024);
const ROI_NAME: Tag = Tag(0x3006, 0x0026);
const ROI_DISPLAY_COLOR: Tag = Tag(0x3006, 0x002A);
const ROI_GENERATION_ALGORITHM: Tag = Tag(0x3006, 0x0036);
const ROI_CONTOUR_SEQUENCE: Tag = Tag(0x3006, 0x0039);
const CONTOUR_SEQUENCE: Tag = Tag(0x3006, 0x0040);
const CONTOUR_GEOMETRIC_TYPE: Tag = Tag(0x3006, 0x0042);
const NUMBER_OF_CONTOUR_POINTS: Tag = Tag(0x3006, 0x0046);
const CONTOUR_NUMBER: Tag = Tag(0x3006, 0x0048);
const CONTOUR_DATA: Tag = Tag(0x3006, 0x0050);
const RT_ROI_OBSERVATIONS_SEQUENCE: Tag = Tag(0x3006, 0x0080);
const OBSERVATION_NUMBER: Tag = Tag(0x3006, 0x0082);
const REFERENCED_ROI_NUMBER: Tag = Tag(0x3006, 0x0084);
const ROI_OBSERVATION_LABEL: Tag = Tag(0x3006, 0x0085);
const RT_ROI_INTERPRETED_TYPE: Tag = Tag(0x3006, 0x00A4);
const ROI_INTERPRETER: Tag = Tag(0x3006, 0x00A6);
const APPROVAL_STATUS: Tag = Tag(0x300E, 0x0002);

/// Colors for structures configured without one, assigned by ROI number
const PALETTE: [[u8; 3]; 8] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [0, 255, 255],
    [255, 0, 255],
    [255, 128, 0],
    [128, 0, 255],
];

/// One polygon of the structure set
#[derive(Debug, Clone, PartialEq)]
pub struct ContourEntry {
    pub structure: String,
    pub roi_number: u32,
    pub slice_uid: String,
    pub points: Vec<[f64; 3]>,
}

/// A synthesized RT Structure Set plus the facts it was built from
#[derive(Debug, Clone)]
pub struct ReportObject {
    pub batch_id: Option<Uuid>,
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub frame_of_reference_uid: String,
    /// Source images in stack order
    pub referenced_sop_uids: Vec<String>,
    pub contours: Vec<ContourEntry>,
    pub patient: PatientStudyAttributes,
    pub object: DefaultDicomObject,
}

struct Roi<'a> {
    number: u32,
    name: &'a str,
    color: [u8; 3],
    interpreted_type: &'a str,
    polygons: &'a [SlicePolygon],
}

/// Builds RT Structure Sets from segmented batches.
///
/// Synthesis is a pure function of the batch, the contours and the supplied clock, except for
/// the two UIDs drawn from the generator.
pub struct ReportSynthesizer {
    uids: Arc<UidGenerator>,
    report: ReportConfig,
    structures: Vec<StructureSpec>,
}

impl ReportSynthesizer {
    pub fn from_config(uids: Arc<UidGenerator>, config: &NodeConfig) -> Self {
        Self {
            uids,
            report: config.report.clone(),
            structures: config.segmentation.structures.clone(),
        }
    }

    pub fn synthesize(&self, batch: &Batch, result: &ContourResult, now: NaiveDateTime) -> Result<ReportObject> {
        let frame_of_reference = batch.validate_consistency()?.to_string();
        if result.is_empty() {
            return Err(ModelError::EmptyResult.into());
        }

        let stack = ImageStack::from_batch(batch);
        for (structure, polygons) in &result.structures {
            for polygon in polygons {
                if stack.slice(&polygon.slice_uid).is_none() {
                    return Err(NodeError::integrity(format!(
                        "{} contour references slice {} outside batch {}",
                        structure, polygon.slice_uid, batch.id
                    )));
                }
                if polygon.points.len() < 3 {
                    return Err(NodeError::integrity(format!(
                        "{} contour on slice {} has {} points",
                        structure,
                        polygon.slice_uid,
                        polygon.points.len()
                    )));
                }
            }
        }

        for instance in &batch.instances {
            self.uids.observe(&instance.study_uid);
            self.uids.observe(&instance.series_uid);
            self.uids.observe(&instance.sop_uid);
        }
        self.uids.observe(&frame_of_reference);
        let sop_instance_uid = self.uids.generate()?;
        let series_instance_uid = self.uids.generate()?;

        let rois = self.rois(result);
        let source = &batch.instances[0];
        let patient = source.patient.clone();
        let date = now.format("%Y%m%d").to_string();
        let time = now.format("%H%M%S").to_string();

        let mut elements = vec![
            text(tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 100"),
            text(tags::INSTANCE_CREATION_DATE, VR::DA, &date),
            text(tags::INSTANCE_CREATION_TIME, VR::TM, &time),
            text(tags::SOP_CLASS_UID, VR::UI, RT_STRUCTURE_SET_STORAGE),
            text(tags::SOP_INSTANCE_UID, VR::UI, &sop_instance_uid),
            text(tags::STUDY_DATE, VR::DA, &patient.study_date),
            text(tags::SERIES_DATE, VR::DA, &date),
            text(tags::STUDY_TIME, VR::TM, &patient.study_time),
            text(tags::SERIES_TIME, VR::TM, &time),
            text(tags::ACCESSION_NUMBER, VR::SH, &patient.accession_number),
            text(tags::MODALITY, VR::CS, "RTSTRUCT"),
            text(tags::MANUFACTURER, VR::LO, &self.report.manufacturer),
            text(tags::REFERRING_PHYSICIAN_NAME, VR::PN, &patient.referring_physician_name),
            text(tags::STUDY_DESCRIPTION, VR::LO, &patient.study_description),
            text(tags::SERIES_DESCRIPTION, VR::LO, &self.report.series_description),
            text(tags::PATIENT_NAME, VR::PN, &patient.patient_name),
            text(tags::PATIENT_ID, VR::LO, &patient.patient_id),
            text(tags::PATIENT_BIRTH_DATE, VR::DA, &patient.patient_birth_date),
            text(tags::PATIENT_SEX, VR::CS, &patient.patient_sex),
            text(tags::STUDY_INSTANCE_UID, VR::UI, &source.study_uid),
            text(tags::SERIES_INSTANCE_UID, VR::UI, &series_instance_uid),
            text(tags::STUDY_ID, VR::SH, &patient.study_id),
            text(tags::SERIES_NUMBER, VR::IS, &self.report.series_number),
            text(STRUCTURE_SET_LABEL, VR::SH, &self.report.structure_set_label),
            text(STRUCTURE_SET_NAME, VR::LO, &self.report.structure_set_name),
            text(STRUCTURE_SET_DATE, VR::DA, &date),
            text(STRUCTURE_SET_TIME, VR::TM, &time),
            sequence(
                REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
                vec![referenced_frame(&frame_of_reference, &source.study_uid, &source.series_uid, &stack)],
            ),
            sequence(
                STRUCTURE_SET_ROI_SEQUENCE,
                rois.iter()
                    .map(|roi| self.structure_set_roi(roi, &frame_of_reference))
                    .collect(),
            ),
            sequence(
                ROI_CONTOUR_SEQUENCE,
                rois.iter().map(|roi| roi_contour(roi, &stack)).collect(),
            ),
            sequence(RT_ROI_OBSERVATIONS_SEQUENCE, rois.iter().map(observation).collect()),
            text(APPROVAL_STATUS, VR::CS, "UNAPPROVED"),
        ];
        elements.retain(|e| !is_empty_text(e));

        let object = InMemDicomObject::from_element_iter(elements)
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(RT_STRUCTURE_SET_STORAGE)
                    .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
            )
            .map_err(|e| NodeError::synthesis(format!("cannot build file meta: {}", e)))?;

        let contours: Vec<ContourEntry> = rois
            .iter()
            .flat_map(|roi| {
                roi.polygons.iter().map(move |polygon| ContourEntry {
                    structure: roi.name.to_string(),
                    roi_number: roi.number,
                    slice_uid: polygon.slice_uid.clone(),
                    points: polygon.points.clone(),
                })
            })
            .collect();

        info!(
            batch_id = %batch.id,
            "📝  Structure set {} with {} structures and {} contours",
            sop_instance_uid,
            rois.len(),
            contours.len()
        );

        Ok(ReportObject {
            batch_id: Some(batch.id),
            sop_instance_uid,
            series_instance_uid,
            study_instance_uid: source.study_uid.clone(),
            frame_of_reference_uid: frame_of_reference,
            referenced_sop_uids: stack.slices.iter().map(|s| s.sop_uid.clone()).collect(),
            contours,
            patient,
            object,
        })
    }

    /// Structures with contours, configured ones first in configured order, then the rest by name
    fn rois<'a>(&'a self, result: &'a ContourResult) -> Vec<Roi<'a>> {
        let configured: HashMap<&str, &StructureSpec> =
            self.structures.iter().map(|s| (s.name.as_str(), s)).collect();
        let names = self
            .structures
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| result.structures.contains_key(*name))
            .chain(
                result
                    .structures
                    .keys()
                    .map(String::as_str)
                    .filter(|name| !configured.contains_key(name)),
            );

        names
            .filter_map(|name| {
                let polygons = result.structures.get(name)?;
                (!polygons.is_empty()).then_some((name, polygons))
            })
            .enumerate()
            .map(|(index, (name, polygons))| {
                let structure = configured.get(name).copied();
                let number = index as u32 + 1;
                Roi {
                    number,
                    name,
                    color: structure
                        .and_then(|s| s.color)
                        .unwrap_or(PALETTE[index % PALETTE.len()]),
                    interpreted_type: structure.map(|s| s.interpreted_type.as_str()).unwrap_or("ORGAN"),
                    polygons: polygons.as_slice(),
                }
            })
            .collect()
    }

    fn structure_set_roi(&self, roi: &Roi<'_>, frame_of_reference: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            int(ROI_NUMBER, roi.number),
            text(REFERENCED_FRAME_OF_REFERENCE_UID, VR::UI, frame_of_reference),
            text(ROI_NAME, VR::LO, roi.name),
            text(ROI_GENERATION_ALGORITHM, VR::CS, &self.report.generation_algorithm),
        ])
    }
}

fn referenced_frame(frame_of_reference: &str, study_uid: &str, series_uid: &str, stack: &ImageStack) -> InMemDicomObject {
    let images = stack.slices.iter().map(|slice| image_reference(&slice.sop_class_uid, &slice.sop_uid)).collect();
    let series = InMemDicomObject::from_element_iter([
        text(tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
        sequence(CONTOUR_IMAGE_SEQUENCE, images),
    ]);
    let study = InMemDicomObject::from_element_iter([
        text(tags::REFERENCED_SOP_CLASS_UID, VR::UI, STUDY_COMPONENT_MANAGEMENT),
        text(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, study_uid),
        sequence(RT_REFERENCED_SERIES_SEQUENCE, vec![series]),
    ]);
    InMemDicomObject::from_element_iter([
        text(tags::FRAME_OF_REFERENCE_UID, VR::UI, frame_of_reference),
        sequence(RT_REFERENCED_STUDY_SEQUENCE, vec![study]),
    ])
}

fn image_reference(sop_class_uid: &str, sop_uid: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        text(tags::REFERENCED_SOP_CLASS_UID, VR::UI, sop_class_uid),
        text(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, sop_uid),
    ])
}

fn roi_contour(roi: &Roi<'_>, stack: &ImageStack) -> InMemDicomObject {
    let contours = roi
        .polygons
        .iter()
        .enumerate()
        .filter_map(|(index, polygon)| {
            // slices were checked against the stack before synthesis
            let slice = stack.slice(&polygon.slice_uid)?;
            let data: Vec<String> = polygon.points.iter().flatten().map(|v| format_ds(*v)).collect();
            debug!(roi = roi.name, slice = %slice.sop_uid, points = polygon.points.len(), "contour");
            Some(InMemDicomObject::from_element_iter([
                sequence(
                    CONTOUR_IMAGE_SEQUENCE,
                    vec![image_reference(&slice.sop_class_uid, &slice.sop_uid)],
                ),
                int(CONTOUR_NUMBER, index as u32 + 1),
                text(CONTOUR_GEOMETRIC_TYPE, VR::CS, "CLOSED_PLANAR"),
                int(NUMBER_OF_CONTOUR_POINTS, polygon.points.len() as u32),
                DataElement::new(CONTOUR_DATA, VR::DS, PrimitiveValue::Strs(data.into())),
            ]))
        })
        .collect();

    InMemDicomObject::from_element_iter([
        DataElement::new(
            ROI_DISPLAY_COLOR,
            VR::IS,
            PrimitiveValue::Strs(roi.color.iter().map(|c| c.to_string()).collect()),
        ),
        sequence(CONTOUR_SEQUENCE, contours),
        int(REFERENCED_ROI_NUMBER, roi.number),
    ])
}

fn observation(roi: &Roi<'_>) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        int(OBSERVATION_NUMBER, roi.number),
        int(REFERENCED_ROI_NUMBER, roi.number),
        text(ROI_OBSERVATION_LABEL, VR::SH, roi.name),
        text(RT_ROI_INTERPRETED_TYPE, VR::CS, roi.interpreted_type),
        text(ROI_INTERPRETER, VR::PN, ""),
    ])
}

fn text(tag: Tag, vr: VR, value: &str) -> InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

/// IS values are written as text
fn int(tag: Tag, value: u32) -> InMemElement {
    DataElement::new(tag, VR::IS, PrimitiveValue::from(value.to_string()))
}

fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
}

/// Optional type 2 text at the top level is dropped when the source had no value
fn is_empty_text(element: &InMemElement) -> bool {
    let optional = [
        tags::ACCESSION_NUMBER,
        tags::REFERRING_PHYSICIAN_NAME,
        tags::STUDY_DESCRIPTION,
        tags::STUDY_ID,
    ];
    optional.contains(&element.header().tag) && element.to_str().map(|s| s.is_empty()).unwrap_or(false)
}

/// Decimal string of at most 16 characters
pub(crate) fn format_ds(value: f64) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    for precision in (0..=6).rev() {
        let formatted = format!("{:.*}", precision, value);
        let trimmed = if formatted.contains('.') {
            formatted.trim_end_matches('0').trim_end_matches('.')
        } else {
            formatted.as_str()
        };
        let trimmed = if trimmed == "-0" { "0" } else { trimmed };
        if trimmed.len() <= 16 {
            return trimmed.to_string();
        }
    }
    format!("{:.6e}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::fixtures::{mr_slice, mr_slice_for_patient};
    use crate::common::types::Instance;
    use chrono::NaiveDate;

    fn batch(instances: Vec<Instance>) -> Batch {
        let now = chrono::Utc::now();
        Batch {
            id: Uuid::new_v4(),
            key: instances[0].key(),
            instances: instances.into_iter().map(Arc::new).collect(),
            first_arrival: now,
            last_arrival: now,
        }
    }

    fn five_slices() -> Batch {
        batch(
            (0..5)
                .map(|i| mr_slice("1.2.3", "1.2.3.4", &format!("1.2.3.4.{}", i + 1), i as f64 * 3.0))
                .collect(),
        )
    }

    fn square(slice_uid: &str, z: f64) -> SlicePolygon {
        SlicePolygon {
            slice_uid: slice_uid.to_string(),
            points: vec![[0.0, 0.0, z], [10.5, 0.0, z], [10.5, 10.5, z], [0.0, 10.5, z]],
        }
    }

    fn clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(8, 30, 15)
            .unwrap()
    }

    fn synthesizer() -> ReportSynthesizer {
        ReportSynthesizer::from_config(
            Arc::new(UidGenerator::new(Some("1.2.826.0.1.3680043.8.498"))),
            &NodeConfig::default(),
        )
    }

    fn text_of(obj: &InMemDicomObject, tag: Tag) -> String {
        obj.element(tag)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches(['\0', ' '])
            .to_string()
    }

    fn items(obj: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
        obj.element(tag).unwrap().items().unwrap()
    }

    #[test]
    fn bladder_on_three_slices() {
        let batch = five_slices();
        let mut result = ContourResult::new();
        for (uid, z) in [("1.2.3.4.2", 3.0), ("1.2.3.4.3", 6.0), ("1.2.3.4.4", 9.0)] {
            result.add("Bladder", square(uid, z));
        }

        let report = synthesizer().synthesize(&batch, &result, clock()).unwrap();
        assert_eq!(report.referenced_sop_uids.len(), 5);
        assert_eq!(report.frame_of_reference_uid, "1.2.3.999.1");
        assert_eq!(report.contours.len(), 3);
        assert!(report.contours.iter().all(|c| c.roi_number == 1 && c.structure == "Bladder"));
        assert_ne!(report.sop_instance_uid, report.series_instance_uid);
        assert!(report.sop_instance_uid.starts_with("1.2.826.0.1.3680043.8.498."));

        let obj = &report.object;
        assert_eq!(text_of(obj, tags::SOP_CLASS_UID), RT_STRUCTURE_SET_STORAGE);
        assert_eq!(text_of(obj, tags::MODALITY), "RTSTRUCT");
        assert_eq!(text_of(obj, tags::PATIENT_NAME), "Doe^Jane");
        assert_eq!(text_of(obj, tags::STUDY_INSTANCE_UID), "1.2.3");
        assert_eq!(text_of(obj, STRUCTURE_SET_DATE), "20240502");
        assert_eq!(text_of(obj, STRUCTURE_SET_TIME), "083015");
        assert_eq!(text_of(obj, APPROVAL_STATUS), "UNAPPROVED");
        assert_eq!(obj.meta().transfer_syntax().trim_end_matches('\0'), IMPLICIT_VR_LITTLE_ENDIAN);

        let frame = &items(obj, REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)[0];
        assert_eq!(text_of(frame, tags::FRAME_OF_REFERENCE_UID), "1.2.3.999.1");
        let study = &items(frame, RT_REFERENCED_STUDY_SEQUENCE)[0];
        let series = &items(study, RT_REFERENCED_SERIES_SEQUENCE)[0];
        assert_eq!(items(series, CONTOUR_IMAGE_SEQUENCE).len(), 5);

        let roi = &items(obj, STRUCTURE_SET_ROI_SEQUENCE)[0];
        assert_eq!(text_of(roi, ROI_NAME), "Bladder");
        assert_eq!(text_of(roi, REFERENCED_FRAME_OF_REFERENCE_UID), "1.2.3.999.1");

        let contours = items(&items(obj, ROI_CONTOUR_SEQUENCE)[0], CONTOUR_SEQUENCE);
        assert_eq!(contours.len(), 3);
        assert_eq!(text_of(&contours[0], NUMBER_OF_CONTOUR_POINTS), "4");
        let image = &items(&contours[0], CONTOUR_IMAGE_SEQUENCE)[0];
        assert_eq!(text_of(image, tags::REFERENCED_SOP_INSTANCE_UID), "1.2.3.4.2");
        let data = contours[0].element(CONTOUR_DATA).unwrap().to_multi_float64().unwrap();
        assert_eq!(data.len(), 12);
        assert_eq!(data[3], 10.5);
    }

    #[test]
    fn rois_follow_configured_order_and_colors() {
        let batch = five_slices();
        let mut result = ContourResult::new();
        result.add("Zeta", square("1.2.3.4.1", 0.0));
        result.add("O_Rctm", square("1.2.3.4.1", 0.0));
        result.add("O_Bldr", square("1.2.3.4.2", 3.0));

        let report = synthesizer().synthesize(&batch, &result, clock()).unwrap();
        let rois = items(&report.object, STRUCTURE_SET_ROI_SEQUENCE);
        let names: Vec<String> = rois.iter().map(|r| text_of(r, ROI_NAME)).collect();
        assert_eq!(names, vec!["O_Bldr", "O_Rctm", "Zeta"]);

        let colors: Vec<Vec<f64>> = items(&report.object, ROI_CONTOUR_SEQUENCE)
            .iter()
            .map(|c| c.element(ROI_DISPLAY_COLOR).unwrap().to_multi_float64().unwrap())
            .collect();
        assert_eq!(colors[0], vec![255.0, 255.0, 0.0]);
        assert_eq!(colors[1], vec![191.0, 146.0, 96.0]);
        assert_eq!(colors[2], vec![0.0, 0.0, 255.0]);
    }

    #[test]
    fn generated_uids_are_fresh() {
        let batch = five_slices();
        let mut result = ContourResult::new();
        result.add("O_Bldr", square("1.2.3.4.1", 0.0));
        let synthesizer = synthesizer();

        let first = synthesizer.synthesize(&batch, &result, clock()).unwrap();
        let second = synthesizer.synthesize(&batch, &result, clock()).unwrap();
        assert_ne!(first.sop_instance_uid, second.sop_instance_uid);
        assert!(batch.sop_uids().all(|uid| uid != first.sop_instance_uid));
        assert!(synthesizer.uids.is_known("1.2.3.4.5"));
    }

    #[test]
    fn empty_result_is_rejected() {
        let err = synthesizer()
            .synthesize(&five_slices(), &ContourResult::new(), clock())
            .unwrap_err();
        assert!(matches!(err, NodeError::Model(ModelError::EmptyResult)));
        assert!(!err.is_transient());
    }

    #[test]
    fn unknown_slice_is_rejected() {
        let mut result = ContourResult::new();
        result.add("O_Bldr", square("9.9.9", 0.0));
        let err = synthesizer().synthesize(&five_slices(), &result, clock()).unwrap_err();
        assert!(matches!(err, NodeError::AggregationIntegrity(_)));
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        let mut result = ContourResult::new();
        result.add(
            "O_Bldr",
            SlicePolygon {
                slice_uid: "1.2.3.4.1".into(),
                points: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            },
        );
        let err = synthesizer().synthesize(&five_slices(), &result, clock()).unwrap_err();
        assert!(matches!(err, NodeError::AggregationIntegrity(_)));
    }

    #[test]
    fn mixed_patients_are_rejected() {
        let batch = batch(vec![
            mr_slice_for_patient("1.2.3", "1.2.3.4", "1.2.3.4.1", 0.0, "A"),
            mr_slice_for_patient("1.2.3", "1.2.3.4", "1.2.3.4.2", 3.0, "B"),
        ]);
        let mut result = ContourResult::new();
        result.add("O_Bldr", square("1.2.3.4.1", 0.0));
        let err = synthesizer().synthesize(&batch, &result, clock()).unwrap_err();
        assert!(matches!(err, NodeError::AggregationIntegrity(_)));
    }

    #[test]
    fn decimal_strings_fit_sixteen_characters() {
        assert_eq!(format_ds(10.5), "10.5");
        assert_eq!(format_ds(-0.0), "0");
        assert_eq!(format_ds(3.0), "3");
        assert_eq!(format_ds(-123.4567891234), "-123.456789");
        assert!(format_ds(-1234567890.123456).len() <= 16);
    }
}
