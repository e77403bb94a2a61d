//! One-vs-rest linear SVM trainer.
//!
//! Solves the dual of the L2-regularized, L2-loss (squared hinge) SVM by
//! coordinate descent, the same formulation liblinear uses for its default
//! dual solver. A constant bias feature is appended to every sample so the
//! intercept is learned as an extra weight.
//!
//! Positives are labelled +1 and negatives -1. After training the model's
//! orientation is checked against the data: if positives do not score
//! higher than negatives on average, the model is negated.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use visor_core::{defaults, dot, Error, FeatureMatrix, LinearModel, Result};

/// How the regularization strength is chosen for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationPolicy {
    /// C used when at least `few_positives_threshold` positives are given.
    pub c: f64,
    /// Positive counts below this switch to `few_positives_c`.
    pub few_positives_threshold: usize,
    pub few_positives_c: f64,
    /// Stopping tolerance on the projected gradient spread.
    pub eps: f64,
    pub max_iter: usize,
}

impl Default for RegularizationPolicy {
    fn default() -> Self {
        Self {
            c: defaults::SVM_C,
            few_positives_threshold: defaults::SVM_FEW_POSITIVES_THRESHOLD,
            few_positives_c: defaults::SVM_FEW_POSITIVES_C,
            eps: defaults::SVM_EPS,
            max_iter: defaults::SVM_MAX_ITER,
        }
    }
}

impl RegularizationPolicy {
    /// Regularization strength for a run with `positive_count` positives.
    pub fn c_for(&self, positive_count: usize) -> f64 {
        if positive_count < self.few_positives_threshold {
            self.few_positives_c
        } else {
            self.c
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("c", self.c), ("few_positives_c", self.few_positives_c), ("eps", self.eps)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!("svm {} must be positive, got {}", name, value)));
            }
        }
        if self.max_iter == 0 {
            return Err(Error::Config("svm max_iter must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Trains a binary linear classifier from positive and negative rows.
#[derive(Debug, Clone, Default)]
pub struct LinearSvmTrainer {
    policy: RegularizationPolicy,
}

impl LinearSvmTrainer {
    pub fn new(policy: RegularizationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RegularizationPolicy {
        &self.policy
    }

    /// Train with the C chosen by the policy for this many positives.
    pub fn train(&self, positives: &FeatureMatrix, negatives: &FeatureMatrix) -> Result<LinearModel> {
        let c = self.policy.c_for(positives.rows());
        self.train_with_c(positives, negatives, c)
    }

    /// Train with an explicit regularization strength.
    #[instrument(skip(self, positives, negatives), fields(positive_count = positives.rows(), negative_count = negatives.rows()))]
    pub fn train_with_c(
        &self,
        positives: &FeatureMatrix,
        negatives: &FeatureMatrix,
        c: f64,
    ) -> Result<LinearModel> {
        if positives.is_empty() {
            return Err(Error::Training("no training images".to_string()));
        }
        if negatives.is_empty() {
            return Err(Error::Training("negative pool is empty".to_string()));
        }
        if positives.cols() != negatives.cols() {
            return Err(Error::DimensionMismatch {
                expected: negatives.cols(),
                actual: positives.cols(),
            });
        }
        if !c.is_finite() || c <= 0.0 {
            return Err(Error::Training(format!("invalid regularization strength {}", c)));
        }

        let samples = FeatureMatrix::vconcat(positives, negatives)?;
        let labels: Vec<f64> = (0..samples.rows())
            .map(|i| if i < positives.rows() { 1.0 } else { -1.0 })
            .collect();

        let w = solve_dual_cd(&samples, &labels, c, self.policy.eps, self.policy.max_iter);
        if w.iter().any(|v| !v.is_finite()) {
            return Err(Error::Training("solver produced non-finite weights".to_string()));
        }

        let dim = samples.cols();
        let bias = defaults::SVM_BIAS as f64;
        let mut model = LinearModel {
            weights: w[..dim].iter().map(|v| *v as f32).collect(),
            bias: (w[dim] * bias) as f32,
        };
        orient(&mut model, positives, negatives);
        debug!(c, dim, "Linear SVM trained");
        Ok(model)
    }
}

/// Negate `model` if positives do not outscore negatives on average.
fn orient(model: &mut LinearModel, positives: &FeatureMatrix, negatives: &FeatureMatrix) {
    let mean = |m: &FeatureMatrix| {
        m.iter_rows().map(|r| dot(&model.weights, r) as f64).sum::<f64>() / m.rows() as f64
    };
    let (pos_mean, neg_mean) = (mean(positives), mean(negatives));
    if pos_mean < neg_mean {
        warn!(pos_mean, neg_mean, "Classifier orientation inverted, flipping sign");
        model.weights.iter_mut().for_each(|w| *w = -*w);
        model.bias = -model.bias;
    }
}

/// Dual coordinate descent for L2-regularized L2-loss SVM with bias feature.
///
/// Returns `dim + 1` weights, the last one multiplying the bias feature.
fn solve_dual_cd(samples: &FeatureMatrix, labels: &[f64], c: f64, eps: f64, max_iter: usize) -> Vec<f64> {
    let n = samples.rows();
    let dim = samples.cols();
    let bias = defaults::SVM_BIAS as f64;
    let diag = 0.5 / c;

    let qd: Vec<f64> = samples
        .iter_rows()
        .map(|row| row.iter().map(|x| (*x as f64).powi(2)).sum::<f64>() + bias * bias + diag)
        .collect();

    let mut alpha = vec![0.0f64; n];
    let mut w = vec![0.0f64; dim + 1];
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(0);

    let mut iter = 0;
    while iter < max_iter {
        order.shuffle(&mut rng);
        let mut pg_max = f64::NEG_INFINITY;
        let mut pg_min = f64::INFINITY;

        for &i in &order {
            let row = samples.row(i);
            let y = labels[i];
            let wx = row
                .iter()
                .zip(&w[..dim])
                .map(|(x, wj)| *x as f64 * wj)
                .sum::<f64>()
                + w[dim] * bias;
            let g = y * wx - 1.0 + diag * alpha[i];

            let pg = if alpha[i] == 0.0 { g.min(0.0) } else { g };
            pg_max = pg_max.max(pg);
            pg_min = pg_min.min(pg);

            if pg.abs() > 1e-12 {
                let old = alpha[i];
                alpha[i] = (alpha[i] - g / qd[i]).max(0.0);
                let d = (alpha[i] - old) * y;
                for (wj, x) in w[..dim].iter_mut().zip(row) {
                    *wj += d * *x as f64;
                }
                w[dim] += d * bias;
            }
        }

        iter += 1;
        if pg_max - pg_min <= eps {
            break;
        }
    }

    if iter >= max_iter {
        debug!(max_iter, "SVM solver reached iteration limit");
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn cluster(center: &[f32], count: usize, seed: u64) -> FeatureMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows: Vec<Vec<f32>> = (0..count)
            .map(|_| center.iter().map(|c| c + rng.gen_range(-0.1..0.1)).collect())
            .collect();
        FeatureMatrix::from_rows(center.len(), &rows).unwrap()
    }

    #[test]
    fn test_separates_two_clusters() {
        let pos = cluster(&[1.0, 0.0, 0.2], 15, 1);
        let neg = cluster(&[0.0, 1.0, 0.2], 40, 2);
        let model = LinearSvmTrainer::default().train(&pos, &neg).unwrap();

        assert_eq!(model.dim(), 3);
        assert!(pos.iter_rows().all(|r| model.score(r) > 0.0));
        assert!(neg.iter_rows().all(|r| model.score(r) < 0.0));
    }

    #[test]
    fn test_orientation_holds_with_single_positive() {
        let pos = cluster(&[0.0, 0.0, 1.0], 1, 3);
        let neg = cluster(&[1.0, 1.0, 0.0], 25, 4);
        let model = LinearSvmTrainer::default().train(&pos, &neg).unwrap();

        let pos_score = dot(&model.weights, pos.row(0));
        let neg_best = neg
            .iter_rows()
            .map(|r| dot(&model.weights, r))
            .fold(f32::NEG_INFINITY, f32::max);
        assert!(pos_score > neg_best);
    }

    #[test]
    fn test_orient_flips_inverted_model() {
        let pos = cluster(&[1.0, 0.0], 3, 5);
        let neg = cluster(&[0.0, 1.0], 3, 6);
        let mut model = LinearModel {
            weights: vec![-1.0, 1.0],
            bias: 0.5,
        };
        orient(&mut model, &pos, &neg);
        assert_eq!(model.weights, vec![1.0, -1.0]);
        assert_eq!(model.bias, -0.5);
    }

    #[test]
    fn test_no_positives_is_training_error() {
        let neg = cluster(&[0.0, 1.0], 3, 7);
        let err = LinearSvmTrainer::default()
            .train(&FeatureMatrix::with_cols(2), &neg)
            .unwrap_err();
        assert!(matches!(err, Error::Training(ref m) if m.contains("no training images")));
    }

    #[test]
    fn test_dimension_mismatch() {
        let pos = cluster(&[1.0, 0.0, 0.0], 2, 8);
        let neg = cluster(&[0.0, 1.0], 2, 9);
        assert!(matches!(
            LinearSvmTrainer::default().train(&pos, &neg),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_policy_switches_c_below_threshold() {
        let policy = RegularizationPolicy {
            c: 0.1,
            few_positives_threshold: 10,
            few_positives_c: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.c_for(1), 2.0);
        assert_eq!(policy.c_for(9), 2.0);
        assert_eq!(policy.c_for(10), 0.1);
        policy.validate().unwrap();
    }

    #[test]
    fn test_policy_validation() {
        let policy = RegularizationPolicy {
            c: 0.0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        let policy = RegularizationPolicy {
            max_iter: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_training_is_deterministic() {
        let pos = cluster(&[1.0, 0.5], 12, 10);
        let neg = cluster(&[0.2, 1.0], 30, 11);
        let trainer = LinearSvmTrainer::default();
        assert_eq!(trainer.train(&pos, &neg).unwrap(), trainer.train(&pos, &neg).unwrap());
    }
}
