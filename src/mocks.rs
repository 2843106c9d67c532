use std::collections::HashMap;

use ndarray::Array2;

use crate::errors::{ClassifyError, Result};
use crate::loader::ImageBatch;
use crate::traits::ImageClassifier;

/// Classifier returning canned scores per file name, for tests.
#[derive(Debug, Clone, Default)]
pub struct MockClassifier {
    scores: HashMap<String, Vec<f32>>,
    fail_with: Option<String>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scores(mut self, filename: &str, scores: &[f32]) -> Self {
        self.scores.insert(filename.to_string(), scores.to_vec());
        self
    }

    /// Makes every `predict` call fail with an inference error.
    pub fn failing(message: &str) -> Self {
        Self {
            scores: HashMap::new(),
            fail_with: Some(message.to_string()),
        }
    }
}

impl ImageClassifier for MockClassifier {
    fn predict(&self, batch: &ImageBatch) -> Result<Array2<f32>> {
        if let Some(message) = &self.fail_with {
            return Err(ClassifyError::inference("mock prediction", message));
        }

        let classes = self.scores.values().map(Vec::len).max().unwrap_or(0);
        let mut output = Array2::<f32>::zeros((batch.len(), classes));
        for (mut row, filename) in output.rows_mut().into_iter().zip(batch.filenames()) {
            let scores = self.scores.get(filename).ok_or_else(|| {
                ClassifyError::inference("mock prediction", format!("no scores for {}", filename))
            })?;
            for (slot, score) in row.iter_mut().zip(scores) {
                *slot = *score;
            }
        }
        Ok(output)
    }
}
