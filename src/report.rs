use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use ndarray::ArrayView2;
use num_traits::Float;
use serde::Serialize;
use tracing::info;

use crate::errors::{ClassifyError, Result};
use crate::loader::ImageBatch;

/// Index of the largest score. Ties go to the lowest index and NaN never wins.
pub fn argmax<T: Float>(scores: &[T]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best: Option<(usize, T)>, (index, &score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
        .map(|(index, _)| index)
}

/// Predicted class per image file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Predictions(BTreeMap<String, usize>);

impl Predictions {
    /// Pairs every image in `batch` with the arg-max of its score row.
    pub fn from_scores(batch: &ImageBatch, scores: ArrayView2<f32>) -> Result<Self> {
        if scores.nrows() != batch.len() {
            return Err(ClassifyError::report(format!(
                "{} score row(s) for {} image(s)",
                scores.nrows(),
                batch.len()
            )));
        }

        let mut predictions = BTreeMap::new();
        for (filename, row) in batch.filenames().zip(scores.rows()) {
            let row = row.to_vec();
            let class = argmax(&row).ok_or_else(|| {
                ClassifyError::report(format!("no usable scores for {}", filename))
            })?;
            if predictions.insert(filename.to_string(), class).is_some() {
                return Err(ClassifyError::report(format!(
                    "duplicate file name {}",
                    filename
                )));
            }
        }

        Ok(Self(predictions))
    }

    pub fn get(&self, filename: &str) -> Option<usize> {
        self.0.get(filename).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(name, class)| (name.as_str(), *class))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Where the result object goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Created or overwritten.
    File(PathBuf),
    Stdout,
}

/// Serializes `predictions` to `target`. Nothing is written if serialization fails.
pub fn write_predictions(predictions: &Predictions, target: &OutputTarget) -> Result<()> {
    let json = predictions.to_json()?;

    match target {
        OutputTarget::File(path) => {
            fs::write(path, json.as_bytes()).map_err(|source| ClassifyError::FileSystem {
                path: path.clone(),
                operation: "result write".to_string(),
                source,
            })?;
            info!("Output saved to {}", path.display());
        }
        OutputTarget::Stdout => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
            stdout.flush()?;
        }
    }

    Ok(())
}
