//! Core traits for visor's pluggable components.

use crate::error::Result;
use crate::models::FeatureMatrix;

/// One augmented network input: an RGB float image, already scaled and
/// mean-subtracted, with channels in the order the backend expects.
pub type View = image::Rgb32FImage;

/// Stateful inference backend wrapped by a feature extractor instance.
///
/// A backend is owned by exactly one extractor instance and is never shared
/// between threads concurrently; the pool guarantees exclusive access, so
/// implementations may keep mutable scratch buffers.
pub trait FeatureBackend: Send {
    /// Run one forward pass over `views`, returning one row per view.
    ///
    /// Rows are raw (not normalized); the extractor reduces and normalizes.
    fn forward(&mut self, views: &[View]) -> Result<FeatureMatrix>;

    /// Width of every row returned by [`forward`](Self::forward).
    fn code_size(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Something that can turn images into feature rows.
///
/// Implemented by the extractor pool; ingestion and index updates depend on
/// this trait rather than on the pool directly.
pub trait FeatureExtractor: Send + Sync {
    /// Compute one L2-normalized feature row per image.
    fn compute(&self, images: &[image::DynamicImage]) -> Result<FeatureMatrix>;

    /// Feature dimension of every returned row.
    fn code_size(&self) -> usize;
}
