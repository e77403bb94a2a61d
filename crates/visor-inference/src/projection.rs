//! Random-projection inference backend.
//!
//! Each view is average-pooled onto a `grid x grid` cell layout per channel,
//! then projected to `code_size` dimensions by a dense weight matrix and
//! passed through a ReLU. Weights come from a seeded RNG or from a weights
//! matrix loaded by the caller.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use visor_core::{Error, FeatureBackend, FeatureMatrix, Result, View};

/// Deterministic CPU backend producing `code_size`-wide rows.
pub struct ProjectionBackend {
    grid: u32,
    /// `code_size` rows of `grid * grid * 3` weights.
    weights: FeatureMatrix,
    input: Vec<f32>,
}

impl ProjectionBackend {
    /// Draw weights uniformly from `[-s, s]` with `s = 1 / sqrt(input_len)`.
    pub fn seeded(seed: u64, grid: u32, code_size: usize) -> Self {
        let input_len = Self::input_len(grid);
        let scale = 1.0 / (input_len as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..code_size * input_len)
            .map(|_| rng.gen_range(-scale..=scale))
            .collect();
        let weights = FeatureMatrix::from_vec(code_size, input_len, data)
            .unwrap_or_else(|_| FeatureMatrix::zeros(code_size, input_len));
        debug!(seed, grid, code_size, "Projection backend seeded");
        Self::with_weights_unchecked(grid, weights)
    }

    /// Use an explicit weight matrix (`code_size` x `grid * grid * 3`).
    pub fn from_weights(grid: u32, weights: FeatureMatrix) -> Result<Self> {
        let expected = Self::input_len(grid);
        if weights.cols() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: weights.cols(),
            });
        }
        if weights.is_empty() {
            return Err(Error::Config("projection weights have no rows".to_string()));
        }
        Ok(Self::with_weights_unchecked(grid, weights))
    }

    fn with_weights_unchecked(grid: u32, weights: FeatureMatrix) -> Self {
        let input = vec![0.0; weights.cols()];
        Self {
            grid,
            weights,
            input,
        }
    }

    pub fn input_len(grid: u32) -> usize {
        (grid * grid * 3) as usize
    }

    fn pool_view(&mut self, view: &View) {
        let (w, h) = view.dimensions();
        let grid = self.grid;
        let mut counts = vec![0u32; (grid * grid) as usize];
        self.input.iter_mut().for_each(|v| *v = 0.0);

        for (x, y, pixel) in view.enumerate_pixels() {
            let gx = (x * grid / w).min(grid - 1);
            let gy = (y * grid / h).min(grid - 1);
            let cell = (gy * grid + gx) as usize;
            counts[cell] += 1;
            for c in 0..3 {
                self.input[cell * 3 + c] += pixel[c];
            }
        }
        for (cell, count) in counts.iter().enumerate() {
            if *count > 0 {
                for c in 0..3 {
                    self.input[cell * 3 + c] /= *count as f32;
                }
            }
        }
    }
}

impl FeatureBackend for ProjectionBackend {
    fn forward(&mut self, views: &[View]) -> Result<FeatureMatrix> {
        let mut out = FeatureMatrix::zeros(views.len(), self.weights.rows());
        for (i, view) in views.iter().enumerate() {
            if view.width() < self.grid || view.height() < self.grid {
                return Err(Error::InvalidImage(format!(
                    "view {}x{} is smaller than the {}x{} pooling grid",
                    view.width(),
                    view.height(),
                    self.grid,
                    self.grid
                )));
            }
            self.pool_view(view);
            let projected = self.weights.matvec(&self.input)?;
            for (dst, src) in out.row_mut(i).iter_mut().zip(projected) {
                *dst = src.max(0.0);
            }
        }
        Ok(out)
    }

    fn code_size(&self) -> usize {
        self.weights.rows()
    }

    fn name(&self) -> &str {
        "projection"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(size: u32, value: f32) -> View {
        View::from_pixel(size, size, Rgb([value, value, value]))
    }

    #[test]
    fn test_forward_shape() {
        let mut backend = ProjectionBackend::seeded(1, 4, 16);
        let out = backend.forward(&[solid(8, 1.0), solid(8, 2.0), solid(8, 3.0)]).unwrap();
        assert_eq!(out.rows(), 3);
        assert_eq!(out.cols(), 16);
        assert_eq!(backend.code_size(), 16);
        assert!(out.as_slice().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_same_seed_same_output() {
        let views = [solid(8, 5.0)];
        let a = ProjectionBackend::seeded(42, 2, 8).forward(&views).unwrap();
        let b = ProjectionBackend::seeded(42, 2, 8).forward(&views).unwrap();
        let c = ProjectionBackend::seeded(43, 2, 8).forward(&views).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_weights_checks_width() {
        let weights = FeatureMatrix::zeros(4, 5);
        assert!(matches!(
            ProjectionBackend::from_weights(2, weights),
            Err(Error::DimensionMismatch { expected: 12, actual: 5 })
        ));
    }

    #[test]
    fn test_explicit_weights() {
        // one output picking the red channel of cell 0
        let mut weights = FeatureMatrix::zeros(1, ProjectionBackend::input_len(1));
        weights.row_mut(0)[0] = 2.0;
        let mut backend = ProjectionBackend::from_weights(1, weights).unwrap();
        let out = backend.forward(&[solid(3, 1.5)]).unwrap();
        assert_eq!(out.row(0), &[3.0]);
    }

    #[test]
    fn test_view_smaller_than_grid_rejected() {
        let mut backend = ProjectionBackend::seeded(1, 8, 4);
        assert!(backend.forward(&[solid(4, 1.0)]).is_err());
    }
}
