pub mod config;
pub mod errors;
pub mod loader;
pub mod model;
pub mod report;
pub mod traits;

pub mod mocks;

use tracing::info;

pub use config::{ComputeMode, Config};
pub use errors::{ClassifyError, Result};
pub use loader::{ImageBatch, LoadedImage};
pub use model::{ModelSpec, OrtClassifier};
pub use report::{argmax, OutputTarget, Predictions};
pub use traits::*;

/// Load, classify, report.
pub struct ClassificationPipeline<C: ImageClassifier> {
    classifier: C,
    config: Config,
}

impl<C: ImageClassifier> ClassificationPipeline<C> {
    pub const fn new(classifier: C, config: Config) -> Self {
        Self { classifier, config }
    }

    /// Loads the image directory and classifies every image in it.
    pub fn classify(&self) -> Result<Predictions> {
        let batch = loader::load_images(
            &self.config.images_dir,
            self.config.color,
            self.config.image_width,
            self.config.image_height,
        )?;

        let scores = self.classifier.predict(&batch)?;
        let predictions = Predictions::from_scores(&batch, scores.view())?;
        info!("Classified {} image(s)", predictions.len());
        Ok(predictions)
    }

    /// Classifies and writes the result to the configured target.
    pub fn run(&self) -> Result<Predictions> {
        let predictions = self.classify()?;
        report::write_predictions(&predictions, &self.config.output_target())?;
        Ok(predictions)
    }
}

impl ClassificationPipeline<OrtClassifier> {
    pub fn with_onnx_model(config: Config) -> Result<Self> {
        let classifier = OrtClassifier::load(&ModelSpec::from_config(&config), &config)?;
        Ok(Self::new(classifier, config))
    }
}
