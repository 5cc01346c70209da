//! Segmentation capability: the model interface, its input stack and output contours, and the
//! orchestrator that runs it on ready batches.

pub mod command;
pub mod orchestrator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::aggregator::Batch;
use crate::common::types::SliceGeometry;
use crate::config::{ModelBackend, SegmentationConfig};
use crate::error::ModelError;

pub use command::CommandModel;
pub use orchestrator::{AutocontourOrchestrator, JobOutcome};

/// One image of the stack handed to the model
#[derive(Debug, Clone)]
pub struct ImageSlice {
    pub sop_uid: String,
    pub sop_class_uid: String,
    pub geometry: SliceGeometry,
    /// Native pixel bytes as received
    pub pixel_data: Option<Arc<Vec<u8>>>,
}

/// A batch's images in spatial order
#[derive(Debug, Clone)]
pub struct ImageStack {
    pub batch_id: Uuid,
    pub study_uid: String,
    pub series_uid: String,
    pub modality: String,
    pub frame_of_reference_uid: Option<String>,
    pub slices: Vec<ImageSlice>,
}

impl ImageStack {
    /// Order by position along the slice normal, then SliceLocation, then InstanceNumber.
    /// At each level slices carrying the value come before slices without it. Ties keep
    /// arrival order.
    pub fn from_batch(batch: &Batch) -> Self {
        let mut slices: Vec<ImageSlice> = batch
            .instances
            .iter()
            .map(|instance| ImageSlice {
                sop_uid: instance.sop_uid.clone(),
                sop_class_uid: instance.sop_class_uid.clone(),
                geometry: instance.geometry.clone(),
                pixel_data: instance.pixel_data.clone(),
            })
            .collect();

        slices.sort_by(|a, b| {
            compare_present(a.geometry.position_along_normal(), b.geometry.position_along_normal())
                .then_with(|| compare_present(a.geometry.slice_location, b.geometry.slice_location))
                .then_with(|| present_first(a.geometry.instance_number, b.geometry.instance_number, |x, y| x.cmp(&y)))
        });

        let first = batch.instances.first();
        Self {
            batch_id: batch.id,
            study_uid: batch.key.study_uid.clone(),
            series_uid: batch.key.series_uid.clone(),
            modality: first.map(|i| i.modality.clone()).unwrap_or_default(),
            frame_of_reference_uid: first.and_then(|i| i.frame_of_reference_uid.clone()),
            slices,
        }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn slice(&self, sop_uid: &str) -> Option<&ImageSlice> {
        self.slices.iter().find(|s| s.sop_uid == sop_uid)
    }
}

fn compare_present(a: Option<f64>, b: Option<f64>) -> Ordering {
    present_first(a, b, |x, y| x.total_cmp(&y))
}

fn present_first<T>(a: Option<T>, b: Option<T>, cmp: impl FnOnce(T, T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// One closed polygon on one slice, in patient coordinates (mm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlicePolygon {
    pub slice_uid: String,
    pub points: Vec<[f64; 3]>,
}

/// Structure name to its polygons, as produced by a model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContourResult {
    pub structures: BTreeMap<String, Vec<SlicePolygon>>,
}

impl ContourResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, structure: impl Into<String>, polygon: SlicePolygon) {
        self.structures.entry(structure.into()).or_default().push(polygon);
    }

    /// Total number of polygons across all structures
    pub fn contour_count(&self) -> usize {
        self.structures.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.contour_count() == 0
    }
}

/// The segmentation capability: image stack and structure names in, contours out.
#[async_trait]
pub trait SegmentationModel: Send + Sync {
    fn name(&self) -> &str;

    async fn segment(&self, stack: &ImageStack, structures: &[String]) -> Result<ContourResult, ModelError>;
}

/// Used when no backend is configured. Batches are still received and recorded.
#[derive(Debug, Default)]
pub struct DisabledModel;

#[async_trait]
impl SegmentationModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn segment(&self, _stack: &ImageStack, _structures: &[String]) -> Result<ContourResult, ModelError> {
        Err(ModelError::Unavailable("no segmentation backend configured".into()))
    }
}

pub fn model_from_config(config: &SegmentationConfig) -> Arc<dyn SegmentationModel> {
    match &config.backend {
        ModelBackend::Command { program, args } => {
            info!("Segmentation backend: {} {}", program.display(), args.join(" "));
            Arc::new(CommandModel::new(program.clone(), args.clone()))
        }
        ModelBackend::Disabled => {
            info!("Segmentation backend disabled");
            Arc::new(DisabledModel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::fixtures::mr_slice;

    fn batch_of(instances: Vec<crate::common::types::Instance>) -> Batch {
        let now = chrono::Utc::now();
        Batch {
            id: Uuid::new_v4(),
            key: instances[0].key(),
            instances: instances.into_iter().map(Arc::new).collect(),
            first_arrival: now,
            last_arrival: now,
        }
    }

    #[test]
    fn stack_is_ordered_along_the_normal() {
        let batch = batch_of(vec![
            mr_slice("S1", "R1", "1.3", 6.0),
            mr_slice("S1", "R1", "1.1", 0.0),
            mr_slice("S1", "R1", "1.2", 3.0),
        ]);
        let stack = ImageStack::from_batch(&batch);
        let order: Vec<&str> = stack.slices.iter().map(|s| s.sop_uid.as_str()).collect();
        assert_eq!(order, vec!["1.1", "1.2", "1.3"]);
        assert_eq!(stack.frame_of_reference_uid.as_deref(), Some("1.2.3.999.1"));
        assert_eq!(stack.modality, "MR");
        assert!(stack.slice("1.2").unwrap().pixel_data.is_some());
    }

    #[test]
    fn equal_positions_keep_arrival_order() {
        let batch = batch_of(vec![
            mr_slice("S1", "R1", "1.9", 0.0),
            mr_slice("S1", "R1", "1.1", 0.0),
        ]);
        let stack = ImageStack::from_batch(&batch);
        assert_eq!(stack.slices[0].sop_uid, "1.9");
    }

    #[test]
    fn slices_without_geometry_sort_after_positioned_ones() {
        let without = |sop: &str, location: Option<f64>, number: Option<i32>| {
            let mut instance = mr_slice("S1", "R1", sop, 0.0);
            instance.geometry.image_position = None;
            instance.geometry.slice_location = location;
            instance.geometry.instance_number = number;
            instance
        };
        let batch = batch_of(vec![
            without("2.1", None, None),
            mr_slice("S1", "R1", "1.2", 3.0),
            without("2.2", Some(9.0), None),
            mr_slice("S1", "R1", "1.1", 0.0),
            without("2.3", None, Some(1)),
            without("2.4", Some(-9.0), None),
            mr_slice("S1", "R1", "1.3", 6.0),
        ]);
        let stack = ImageStack::from_batch(&batch);
        let order: Vec<&str> = stack.slices.iter().map(|s| s.sop_uid.as_str()).collect();
        assert_eq!(order, vec!["1.1", "1.2", "1.3", "2.4", "2.2", "2.3", "2.1"]);
    }

    #[test]
    fn contour_result_counts_polygons() {
        let mut result = ContourResult::new();
        assert!(result.is_empty());
        for uid in ["1.1", "1.2"] {
            result.add(
                "Bladder",
                SlicePolygon {
                    slice_uid: uid.into(),
                    points: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                },
            );
        }
        assert_eq!(result.contour_count(), 2);
        assert_eq!(result.structures.len(), 1);
    }

    #[tokio::test]
    async fn disabled_model_is_unavailable() {
        let stack = ImageStack::from_batch(&batch_of(vec![mr_slice("S1", "R1", "1.1", 0.0)]));
        let result = DisabledModel.segment(&stack, &["O_Bldr".to_string()]).await;
        assert!(matches!(result, Err(ModelError::Unavailable(_))));
    }
}
