use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ContourResult, ImageStack, SegmentationModel, SlicePolygon};
use crate::error::ModelError;

#[derive(Debug, Serialize)]
struct SegmentationRequest<'a> {
    structures: &'a [String],
    study_uid: &'a str,
    series_uid: &'a str,
    modality: &'a str,
    frame_of_reference_uid: Option<&'a str>,
    slices: Vec<SliceRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct SliceRequest<'a> {
    index: usize,
    sop_uid: &'a str,
    pixel_file: Option<PathBuf>,
    rows: u16,
    columns: u16,
    bits_allocated: u16,
    pixel_representation: u16,
    image_position: Option<[f64; 3]>,
    image_orientation: Option<[f64; 6]>,
    pixel_spacing: Option<[f64; 2]>,
    slice_thickness: Option<f64>,
    rescale_slope: Option<f64>,
    rescale_intercept: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentationResponse {
    Failure { error: ErrorBody },
    Success { structures: BTreeMap<String, Vec<SlicePolygon>> },
}

/// Runs an external program per batch: JSON request on stdin, JSON contours on stdout.
///
/// Pixel data goes to one raw file per slice in a temporary directory that is removed
/// afterwards. The child is killed if the invocation is dropped, which is how timeouts end it.
#[derive(Debug, Clone)]
pub struct CommandModel {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandModel {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn write_pixels(stack: &ImageStack, dir: &Path) -> Result<Vec<Option<PathBuf>>, ModelError> {
        let mut files = Vec::with_capacity(stack.slices.len());
        for (index, slice) in stack.slices.iter().enumerate() {
            let Some(pixels) = &slice.pixel_data else {
                files.push(None);
                continue;
            };
            let path = dir.join(format!("slice_{:04}.raw", index));
            tokio::fs::write(&path, pixels.as_slice())
                .await
                .map_err(|e| ModelError::Unavailable(format!("cannot write {}: {}", path.display(), e)))?;
            files.push(Some(path));
        }
        Ok(files)
    }
}

#[async_trait]
impl SegmentationModel for CommandModel {
    fn name(&self) -> &str {
        "command"
    }

    async fn segment(&self, stack: &ImageStack, structures: &[String]) -> Result<ContourResult, ModelError> {
        let workdir = tempfile::tempdir()
            .map_err(|e| ModelError::Unavailable(format!("cannot create work directory: {}", e)))?;
        let pixel_files = Self::write_pixels(stack, workdir.path()).await?;

        let request = SegmentationRequest {
            structures,
            study_uid: &stack.study_uid,
            series_uid: &stack.series_uid,
            modality: &stack.modality,
            frame_of_reference_uid: stack.frame_of_reference_uid.as_deref(),
            slices: stack
                .slices
                .iter()
                .zip(pixel_files)
                .enumerate()
                .map(|(index, (slice, pixel_file))| SliceRequest {
                    index,
                    sop_uid: &slice.sop_uid,
                    pixel_file,
                    rows: slice.geometry.rows,
                    columns: slice.geometry.columns,
                    bits_allocated: slice.geometry.bits_allocated,
                    pixel_representation: slice.geometry.pixel_representation,
                    image_position: slice.geometry.image_position,
                    image_orientation: slice.geometry.image_orientation,
                    pixel_spacing: slice.geometry.pixel_spacing,
                    slice_thickness: slice.geometry.slice_thickness,
                    rescale_slope: slice.geometry.rescale_slope,
                    rescale_intercept: slice.geometry.rescale_intercept,
                })
                .collect(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ModelError::InvalidOutput(format!("cannot encode request: {}", e)))?;

        info!(
            batch_id = %stack.batch_id,
            "🧠  Running {} on {} slices",
            self.program.display(),
            stack.len()
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ModelError::Unavailable(format!("cannot start {}: {}", self.program.display(), e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ModelError::Unavailable("child has no stdin".into()))?;
        let writer = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output.map_err(|e| ModelError::Unavailable(format!("cannot wait for model: {}", e)))?;
        if let Err(e) = written {
            // the program may legitimately stop reading early
            debug!("Model closed stdin early: {}", e);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(batch_id = %stack.batch_id, "model stderr: {}", stderr.trim());
        }
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!("exit {}", c))
                .unwrap_or_else(|| "signal".to_string());
            return Err(ModelError::failed(code, stderr.trim().to_string()));
        }

        let response: SegmentationResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| ModelError::InvalidOutput(format!("cannot parse model output: {}", e)))?;
        match response {
            SegmentationResponse::Failure { error } => Err(ModelError::failed(error.code, error.message)),
            SegmentationResponse::Success { structures } => {
                let result = ContourResult { structures };
                debug!(batch_id = %stack.batch_id, contours = result.contour_count(), "model finished");
                Ok(result)
            }
        }
    }
}
