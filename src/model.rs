use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::SessionBuilder, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    config::{ComputeMode, Config},
    errors::{ClassifyError, Result},
    loader::ImageBatch,
    traits::ImageClassifier,
};

/// Model files handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// ONNX graph.
    pub architecture: PathBuf,
    /// External initializer data referenced by the graph, if it is not embedded.
    pub weights: Option<PathBuf>,
}

impl ModelSpec {
    pub fn new(architecture: impl Into<PathBuf>, weights: Option<PathBuf>) -> Self {
        Self {
            architecture: architecture.into(),
            weights,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.model.clone(), config.weights.clone())
    }

    /// Checks that both files exist and that the weights can be found by the
    /// runtime, which resolves external data relative to the graph's directory.
    pub fn validate(&self) -> Result<()> {
        if !self.architecture.is_file() {
            return Err(ClassifyError::configuration(format!(
                "model file {} does not exist",
                self.architecture.display()
            )));
        }

        if let Some(weights) = &self.weights {
            if !weights.is_file() {
                return Err(ClassifyError::configuration(format!(
                    "weights file {} does not exist",
                    weights.display()
                )));
            }
            if canonical_dir(weights)? != canonical_dir(&self.architecture)? {
                return Err(ClassifyError::configuration(format!(
                    "weights file {} must be in the same directory as {}",
                    weights.display(),
                    self.architecture.display()
                )));
            }
        }

        Ok(())
    }
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    dir.canonicalize().map_err(|source| ClassifyError::FileSystem {
        path: dir.to_path_buf(),
        operation: "model directory resolution".to_string(),
        source,
    })
}

/// Image classifier backed by an ONNX Runtime session.
pub struct OrtClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    /// Declared `[N, C, H, W]`; dynamic axes are negative.
    input_shape: Vec<i64>,
    scale: f32,
    oversample: bool,
}

impl OrtClassifier {
    pub fn load(spec: &ModelSpec, config: &Config) -> Result<Self> {
        spec.validate()?;

        let mut builder = SessionBuilder::new()
            .map_err(|e| ClassifyError::inference("session builder initialization", e))?;

        if config.compute_mode() == ComputeMode::Gpu {
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build()
                    .error_on_failure()])
                .map_err(|e| {
                    ClassifyError::inference(
                        format!("CUDA execution provider (device {})", config.device_id),
                        e,
                    )
                })?;
        }

        let session = builder
            .with_memory_pattern(true)
            .map_err(|e| ClassifyError::inference("memory pattern setup", e))?
            .commit_from_file(&spec.architecture)
            .map_err(|e| {
                ClassifyError::inference(
                    format!("model load: {}", spec.architecture.display()),
                    e,
                )
            })?;

        let input = session.inputs.first().ok_or_else(|| {
            ClassifyError::inference("model input lookup", "model declares no inputs")
        })?;
        let output = session.outputs.first().ok_or_else(|| {
            ClassifyError::inference("model output lookup", "model declares no outputs")
        })?;
        let input_shape: Vec<i64> = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| ClassifyError::inference("model input shape", "input is not a tensor"))?
            .iter()
            .copied()
            .collect();
        if input_shape.len() != 4 {
            return Err(ClassifyError::inference(
                "model input shape",
                format!("expected a 4-d image input, got {:?}", input_shape),
            ));
        }

        info!(
            "Loaded {} on {:?} (input `{}` {:?}, output `{}`)",
            spec.architecture.display(),
            config.compute_mode(),
            input.name,
            input_shape,
            output.name
        );

        Ok(Self {
            input_name: input.name.clone(),
            output_name: output.name.clone(),
            input_shape,
            scale: config.scale,
            oversample: config.oversample(),
            session: Mutex::new(session),
        })
    }

    fn run(&self, tensor: ArrayView4<f32>) -> Result<Array2<f32>> {
        let input = tensor.as_standard_layout();
        let input = TensorRef::from_array_view(&input)
            .map_err(|e| ClassifyError::inference("input tensor creation", e))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| ClassifyError::inference("session run", e))?;

        let scores = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| ClassifyError::inference("output extraction", e))?;
        flatten_scores(scores, tensor.shape()[0])
    }
}

impl ImageClassifier for OrtClassifier {
    fn predict(&self, batch: &ImageBatch) -> Result<Array2<f32>> {
        let tensor = batch.to_tensor(self.scale)?;
        let geometry = InputGeometry::resolve(tensor.dim(), &self.input_shape)?;

        let (input, crops) = if self.oversample {
            (
                oversample(tensor.view(), geometry.height, geometry.width),
                OVERSAMPLE_CROPS,
            )
        } else {
            (
                center_crop(tensor.view(), geometry.height, geometry.width).to_owned(),
                1,
            )
        };
        debug!(
            "Running inference on {:?} ({} crop(s) per image)",
            input.shape(),
            crops
        );

        let scores = run_in_chunks(input.view(), geometry.batch, |chunk| self.run(chunk))?;
        average_crops(scores, crops)
    }
}

/// Crops taken per image when oversampling: four corners and the center, each
/// also mirrored horizontally.
pub const OVERSAMPLE_CROPS: usize = 10;

/// What the model's declared input allows for a given `(N, C, H, W)` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputGeometry {
    /// Fixed batch size, if the model declares one.
    pub batch: Option<usize>,
    /// Crop size fed to the model.
    pub height: usize,
    pub width: usize,
}

impl InputGeometry {
    /// The channel count must agree. Spatial axes larger than the model's are
    /// cropped down to it; smaller ones are a shape mismatch. Dynamic axes
    /// accept anything.
    pub fn resolve(dim: (usize, usize, usize, usize), expected: &[i64]) -> Result<Self> {
        let (_, channels, height, width) = dim;
        let declared = |axis: usize| {
            expected
                .get(axis)
                .copied()
                .filter(|dim| *dim > 0)
                .map(|dim| dim as usize)
        };

        if let Some(expected_channels) = declared(1) {
            if expected_channels != channels {
                return Err(ClassifyError::inference(
                    "input shape check",
                    format!(
                        "model expects {} channel(s) but images have {} (check --color)",
                        expected_channels, channels
                    ),
                ));
            }
        }

        let crop_height = declared(2).unwrap_or(height);
        let crop_width = declared(3).unwrap_or(width);
        if crop_height > height || crop_width > width {
            return Err(ClassifyError::inference(
                "input shape check",
                format!(
                    "model expects {}x{} images but they were resized to {}x{}",
                    crop_width, crop_height, width, height
                ),
            ));
        }

        Ok(Self {
            batch: declared(0),
            height: crop_height,
            width: crop_width,
        })
    }
}

pub fn center_crop(tensor: ArrayView4<f32>, height: usize, width: usize) -> ArrayView4<f32> {
    let (_, _, h, w) = tensor.dim();
    let y = (h - height) / 2;
    let x = (w - width) / 2;
    tensor.slice_move(s![.., .., y..y + height, x..x + width])
}

/// Expands every image into [`OVERSAMPLE_CROPS`] crops, image-major: the
/// corners (top-left, top-right, bottom-left, bottom-right), the center, then
/// the same five mirrored along the width axis.
pub fn oversample(tensor: ArrayView4<f32>, height: usize, width: usize) -> Array4<f32> {
    let (n, channels, h, w) = tensor.dim();
    let (bottom, right) = (h - height, w - width);
    let offsets = [
        (0, 0),
        (0, right),
        (bottom, 0),
        (bottom, right),
        (bottom / 2, right / 2),
    ];
    let mirrored = offsets.len();

    let mut crops = Array4::zeros((n * OVERSAMPLE_CROPS, channels, height, width));
    for (i, image) in tensor.outer_iter().enumerate() {
        for (k, &(y, x)) in offsets.iter().enumerate() {
            let crop = image.slice(s![.., y..y + height, x..x + width]);
            let base = i * OVERSAMPLE_CROPS + k;
            crops.index_axis_mut(Axis(0), base).assign(&crop);
            crops
                .index_axis_mut(Axis(0), base + mirrored)
                .assign(&crop.slice(s![.., .., ..;-1]));
        }
    }
    crops
}

/// Averages each image's consecutive `crops` score rows into one.
pub fn average_crops(scores: Array2<f32>, crops: usize) -> Result<Array2<f32>> {
    if crops <= 1 {
        return Ok(scores);
    }
    let (rows, classes) = scores.dim();
    if rows % crops != 0 {
        return Err(ClassifyError::inference(
            "crop averaging",
            format!("{} score row(s) is not a multiple of {} crops", rows, crops),
        ));
    }

    scores
        .into_shape_with_order((rows / crops, crops, classes))?
        .mean_axis(Axis(1))
        .ok_or_else(|| ClassifyError::inference("crop averaging", "no crops to average"))
}

/// Feeds `tensor` to `run` in chunks of the model's fixed batch size. A short
/// last chunk is zero-padded and the padding rows are dropped from its scores.
/// Without a fixed size the whole tensor goes in one call.
pub fn run_in_chunks<F>(
    tensor: ArrayView4<f32>,
    batch: Option<usize>,
    mut run: F,
) -> Result<Array2<f32>>
where
    F: FnMut(ArrayView4<f32>) -> Result<Array2<f32>>,
{
    let Some(size) = batch else {
        return run(tensor);
    };

    let (_, channels, height, width) = tensor.dim();
    let mut parts = Vec::new();
    for chunk in tensor.axis_chunks_iter(Axis(0), size) {
        let rows = chunk.len_of(Axis(0));
        if rows == size {
            parts.push(run(chunk)?);
        } else {
            let mut padded = Array4::zeros((size, channels, height, width));
            padded.slice_mut(s![..rows, .., .., ..]).assign(&chunk);
            let scores = run(padded.view())?;
            parts.push(scores.slice(s![..rows, ..]).to_owned());
        }
    }

    let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
    Ok(ndarray::concatenate(Axis(0), &views)?)
}

/// Reshapes runtime output to one score row per image.
fn flatten_scores(scores: ArrayViewD<f32>, batch_size: usize) -> Result<Array2<f32>> {
    let rows = scores.shape().first().copied().unwrap_or(0);
    if rows == 0 || rows != batch_size {
        return Err(ClassifyError::inference(
            "output shape check",
            format!(
                "model returned {} row(s) for {} image(s) (shape {:?})",
                rows,
                batch_size,
                scores.shape()
            ),
        ));
    }
    let classes = scores.len() / rows;
    Ok(scores.to_shape((rows, classes))?.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_center_crop() -> Result<()> {
        let tensor = Array4::from_shape_fn((1, 1, 4, 6), |(_, _, y, x)| (y * 10 + x) as f32);
        let geometry = InputGeometry::resolve(tensor.dim(), &[-1, 1, 2, 2])?;

        let cropped = center_crop(tensor.view(), geometry.height, geometry.width);

        assert_eq!(cropped.shape(), &[1, 1, 2, 2]);
        assert_eq!(cropped[[0, 0, 0, 0]], 12.0);
        assert_eq!(cropped[[0, 0, 1, 1]], 23.0);
        Ok(())
    }

    #[test]
    fn test_geometry_dynamic_axes() -> Result<()> {
        let geometry = InputGeometry::resolve((2, 3, 5, 7), &[-1, 3, -1, -1])?;

        assert_eq!(
            geometry,
            InputGeometry {
                batch: None,
                height: 5,
                width: 7
            }
        );
        Ok(())
    }

    #[test]
    fn test_geometry_fixed_batch() -> Result<()> {
        let geometry = InputGeometry::resolve((3, 1, 28, 28), &[1, 1, 28, 28])?;

        assert_eq!(geometry.batch, Some(1));
        Ok(())
    }

    #[test]
    fn test_geometry_mismatch() {
        let err = InputGeometry::resolve((1, 1, 28, 28), &[1, 3, 28, 28]).unwrap_err();
        assert!(matches!(err, ClassifyError::Inference { .. }));

        let err = InputGeometry::resolve((1, 1, 28, 28), &[1, 1, 32, 32]).unwrap_err();
        assert!(matches!(err, ClassifyError::Inference { .. }));
    }

    #[test]
    fn test_oversample_crop_positions() {
        let tensor = Array4::from_shape_fn((2, 1, 4, 4), |(n, _, y, x)| {
            (n * 100 + y * 10 + x) as f32
        });

        let crops = oversample(tensor.view(), 2, 2);

        assert_eq!(crops.shape(), &[20, 1, 2, 2]);
        // top-left value of each unmirrored crop: corners, then center
        let corners: Vec<f32> = (0..5).map(|k| crops[[k, 0, 0, 0]]).collect();
        assert_eq!(corners, [0.0, 2.0, 20.0, 22.0, 11.0]);
        // mirrored top-left crop reverses each row
        assert_eq!(
            crops.index_axis(Axis(0), 5),
            array![[[1.0f32, 0.0], [11.0, 10.0]]]
        );
        // second image starts after the first image's ten crops
        assert_eq!(crops[[10, 0, 0, 0]], 100.0);
        assert_eq!(crops[[14, 0, 1, 1]], 122.0);
    }

    #[test]
    fn test_average_crops() -> Result<()> {
        let scores = Array2::from_shape_fn((2 * OVERSAMPLE_CROPS, 2), |(row, class)| {
            let image = row / OVERSAMPLE_CROPS;
            let crop = row % OVERSAMPLE_CROPS;
            match (image, class) {
                (0, 0) => crop as f32,
                (0, _) => 1.0,
                (_, 0) => 0.0,
                _ => 2.0,
            }
        });

        let averaged = average_crops(scores, OVERSAMPLE_CROPS)?;

        assert_eq!(averaged, array![[4.5f32, 1.0], [0.0, 2.0]]);
        assert!(average_crops(Array2::zeros((7, 2)), OVERSAMPLE_CROPS).is_err());
        Ok(())
    }

    #[test]
    fn test_run_in_chunks_fixed_batch() -> Result<()> {
        let tensor = Array4::from_shape_fn((5, 1, 1, 1), |(n, _, _, _)| n as f32);
        let mut calls = Vec::new();

        let scores = run_in_chunks(tensor.view(), Some(2), |chunk| {
            calls.push(chunk.len_of(Axis(0)));
            Ok(Array2::from_shape_fn((chunk.len_of(Axis(0)), 2), |(row, class)| {
                if class == 0 {
                    chunk[[row, 0, 0, 0]]
                } else {
                    -chunk[[row, 0, 0, 0]]
                }
            }))
        })?;

        assert_eq!(calls, [2, 2, 2]);
        assert_eq!(scores.column(0), array![0.0f32, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(scores.column(1), array![0.0f32, -1.0, -2.0, -3.0, -4.0]);
        Ok(())
    }

    #[test]
    fn test_run_in_chunks_dynamic_batch() -> Result<()> {
        let tensor = Array4::<f32>::zeros((3, 1, 2, 2));
        let mut calls = 0;

        let scores = run_in_chunks(tensor.view(), None, |chunk| {
            calls += 1;
            Ok(Array2::zeros((chunk.len_of(Axis(0)), 4)))
        })?;

        assert_eq!(calls, 1);
        assert_eq!(scores.dim(), (3, 4));
        Ok(())
    }

    #[test]
    fn test_flatten_scores() -> Result<()> {
        let scores = Array4::from_shape_vec((2, 3, 1, 1), vec![0.1, 0.7, 0.2, 0.5, 0.3, 0.2])?;

        let flat = flatten_scores(scores.view().into_dyn(), 2)?;

        assert_eq!(flat, array![[0.1f32, 0.7, 0.2], [0.5, 0.3, 0.2]]);
        assert!(flatten_scores(scores.view().into_dyn(), 3).is_err());
        Ok(())
    }

    #[test]
    fn test_model_spec_validation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let model = temp_dir.path().join("classifier.onnx");
        let weights = temp_dir.path().join("classifier.onnx.data");

        let err = ModelSpec::new(&model, None).validate().unwrap_err();
        assert!(matches!(err, ClassifyError::Configuration { .. }));

        fs::write(&model, b"graph")?;
        ModelSpec::new(&model, None).validate()?;

        let err = ModelSpec::new(&model, Some(weights.clone()))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Configuration { .. }));

        fs::write(&weights, b"weights")?;
        ModelSpec::new(&model, Some(weights))
            .validate()?;

        let elsewhere = temp_dir.path().join("other");
        fs::create_dir(&elsewhere)?;
        let stray = elsewhere.join("weights.bin");
        fs::write(&stray, b"weights")?;
        let err = ModelSpec::new(&model, Some(stray)).validate().unwrap_err();
        assert!(matches!(err, ClassifyError::Configuration { .. }));
        Ok(())
    }

    #[test]
    fn test_load_rejects_missing_model() -> Result<()> {
        let config = Config::resolve_from([
            "batch-classify",
            "-s",
            "255",
            "-w",
            "28",
            "-h",
            "28",
            "-m",
            "/nonexistent/classifier.onnx",
        ])?;

        let result = OrtClassifier::load(&ModelSpec::from_config(&config), &config);
        assert!(matches!(result, Err(ClassifyError::Configuration { .. })));
        Ok(())
    }
}
