use crate::errors::Result;
use crate::loader::ImageBatch;
use ndarray::Array2;

/// A loaded classifier that turns a batch of images into class scores.
///
/// Implementors are constructed from their model files up front; `predict`
/// only runs inference. The concrete runtime is [`crate::model::OrtClassifier`];
/// tests use [`crate::mocks::MockClassifier`].
pub trait ImageClassifier: Send + Sync {
    /// Returns one row of scores per image, in batch order.
    fn predict(&self, batch: &ImageBatch) -> Result<Array2<f32>>;
}

impl<C: ImageClassifier + ?Sized> ImageClassifier for &C {
    fn predict(&self, batch: &ImageBatch) -> Result<Array2<f32>> {
        (**self).predict(batch)
    }
}
