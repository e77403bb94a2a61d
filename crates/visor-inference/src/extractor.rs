//! A single feature extractor instance: one backend plus augmentation.

use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::trace;

use visor_core::{l2_normalize, Error, FeatureBackend, FeatureMatrix, Result, View};

use crate::augment::Augmenter;

/// Owns one inference backend. Not `Clone`: backend state is not duplicable.
///
/// The backend sits behind a mutex only to allow `&self` calls; the pool
/// hands each instance to at most one caller at a time, so the lock is
/// never contended.
pub struct ExtractorInstance {
    index: usize,
    augmenter: Arc<Augmenter>,
    backend: Mutex<Box<dyn FeatureBackend>>,
    code_size: usize,
}

impl ExtractorInstance {
    pub fn new(index: usize, augmenter: Arc<Augmenter>, backend: Box<dyn FeatureBackend>) -> Self {
        let code_size = backend.code_size();
        Self {
            index,
            augmenter,
            backend: Mutex::new(backend),
            code_size,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn augmenter(&self) -> &Augmenter {
        &self.augmenter
    }

    /// Augment, forward and reduce: one normalized row per image.
    pub fn compute(&self, images: &[DynamicImage]) -> Result<FeatureMatrix> {
        let mut views = Vec::with_capacity(images.len() * self.augmenter.view_count());
        for image in images {
            views.extend(self.augmenter.prepare_views(image)?);
        }
        self.compute_views(&views, images.len())
    }

    /// Forward already augmented views belonging to `image_count` images.
    pub fn compute_views(&self, views: &[View], image_count: usize) -> Result<FeatureMatrix> {
        if image_count == 0 {
            return Ok(FeatureMatrix::with_cols(self.code_size));
        }
        if views.len() != image_count * self.augmenter.view_count() {
            return Err(Error::Internal(format!(
                "expected {} views for {} images, got {}",
                image_count * self.augmenter.view_count(),
                image_count,
                views.len()
            )));
        }

        let raw = self.backend.lock().forward(views)?;
        trace!(instance = self.index, view_count = views.len(), "Forward pass done");
        if raw.rows() != views.len() || raw.cols() != self.code_size {
            return Err(Error::Internal(format!(
                "backend returned {}x{} for {} views of width {}",
                raw.rows(),
                raw.cols(),
                views.len(),
                self.code_size
            )));
        }
        Ok(reduce_views(&raw, self.augmenter.view_count()))
    }
}

/// Mean of every consecutive group of `views_per_image` rows, L2-normalized.
pub fn reduce_views(raw: &FeatureMatrix, views_per_image: usize) -> FeatureMatrix {
    let per = views_per_image.max(1);
    let image_count = raw.rows() / per;
    let mut out = FeatureMatrix::zeros(image_count, raw.cols());
    for i in 0..image_count {
        let row = out.row_mut(i);
        for v in 0..per {
            for (acc, x) in row.iter_mut().zip(raw.row(i * per + v)) {
                *acc += x;
            }
        }
        row.iter_mut().for_each(|x| *x /= per as f32);
        l2_normalize(row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AugmentationMode, ExtractorConfig};
    use crate::mock::ConstantBackend;
    use crate::projection::ProjectionBackend;
    use image::{Rgb, RgbImage};

    fn config(mode: AugmentationMode) -> ExtractorConfig {
        ExtractorConfig::default()
            .with_augmentation(mode)
            .with_dims(16, 12)
            .with_grid(2)
            .with_code_size(8)
    }

    fn image(seed: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(20, 18, |x, y| {
            Rgb([seed.wrapping_add(x as u8), y as u8, seed])
        }))
    }

    #[test]
    fn test_reduce_views_means_and_normalizes() {
        let raw = FeatureMatrix::from_rows(
            2,
            &[vec![1.0, 0.0], vec![3.0, 0.0], vec![0.0, 2.0], vec![0.0, 4.0]],
        )
        .unwrap();
        let reduced = reduce_views(&raw, 2);
        assert_eq!(reduced.rows(), 2);
        assert_eq!(reduced.row(0), &[1.0, 0.0]);
        assert_eq!(reduced.row(1), &[0.0, 1.0]);
    }

    #[test]
    fn test_compute_returns_one_unit_row_per_image() {
        for mode in [AugmentationMode::Whole, AugmentationMode::AspectCorners] {
            let cfg = config(mode);
            let instance = ExtractorInstance::new(
                0,
                Arc::new(Augmenter::new(&cfg)),
                Box::new(ProjectionBackend::seeded(3, cfg.grid, cfg.code_size)),
            );
            let feats = instance.compute(&[image(1), image(90), image(200)]).unwrap();
            assert_eq!(feats.rows(), 3);
            assert_eq!(feats.cols(), 8);
            for row in feats.iter_rows() {
                let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
                assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_compute_with_no_images() {
        let cfg = config(AugmentationMode::Whole);
        let instance = ExtractorInstance::new(
            0,
            Arc::new(Augmenter::new(&cfg)),
            Box::new(ConstantBackend::new(4)),
        );
        let feats = instance.compute(&[]).unwrap();
        assert!(feats.is_empty());
        assert_eq!(feats.cols(), 4);
    }

    #[test]
    fn test_backend_with_wrong_width_is_reported() {
        let cfg = config(AugmentationMode::Whole);
        let instance = ExtractorInstance::new(
            0,
            Arc::new(Augmenter::new(&cfg)),
            Box::new(ConstantBackend::new(4).with_reported_code_size(5)),
        );
        assert!(matches!(instance.compute(&[image(1)]), Err(Error::Internal(_))));
    }
}
