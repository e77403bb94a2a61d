//! Shared data model: query states, feature matrices, models and rankings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// QUERY STATE
// =============================================================================

/// Lifecycle state of a query.
///
/// ```text
/// DATACOLL -> DATACOLL_COMPLETE -> TRAINING -> TRAINED -> RANKING -> RANKED
/// ```
///
/// `TRAINING` may also be entered from `DATACOLL`, `TRAINED` and `RANKED`
/// (re-train), and failed operations fall back to the state they started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryState {
    #[serde(rename = "QS_DATACOLL")]
    DataColl,
    #[serde(rename = "QS_DATACOLL_COMPLETE")]
    DataCollComplete,
    #[serde(rename = "QS_TRAINING")]
    Training,
    #[serde(rename = "QS_TRAINED")]
    Trained,
    #[serde(rename = "QS_RANKING")]
    Ranking,
    #[serde(rename = "QS_RANKED")]
    Ranked,
}

impl QueryState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::DataColl => "QS_DATACOLL",
            QueryState::DataCollComplete => "QS_DATACOLL_COMPLETE",
            QueryState::Training => "QS_TRAINING",
            QueryState::Trained => "QS_TRAINED",
            QueryState::Ranking => "QS_RANKING",
            QueryState::Ranked => "QS_RANKED",
        }
    }

    /// Whether a train/rank operation currently owns the query.
    pub fn is_busy(&self) -> bool {
        matches!(self, QueryState::Training | QueryState::Ranking)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// FEATURE MATRIX
// =============================================================================

/// Dense row-major `f32` matrix, one feature vector per row.
///
/// A matrix with zero rows still carries its column width, so empty
/// positive sets can be checked against the extractor code size.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    /// Create an empty matrix with a fixed column width.
    pub fn with_cols(cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            data: Vec::new(),
        }
    }

    /// Create a zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap flat row-major data.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::DimensionMismatch {
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from equally sized rows.
    pub fn from_rows(cols: usize, rows: &[Vec<f32>]) -> Result<Self> {
        let mut matrix = Self::with_cols(cols);
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Flat row-major view of the data.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Borrow row `i`.
    ///
    /// # Panics
    /// Panics if `i >= rows()`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Mutably borrow row `i`.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact(0) panics, and a zero-width matrix has no row data anyway
        self.data.chunks_exact(self.cols.max(1)).take(self.rows)
    }

    /// Append a row; its length must equal the column width.
    pub fn push_row(&mut self, row: &[f32]) -> Result<()> {
        if row.len() != self.cols {
            return Err(Error::DimensionMismatch {
                expected: self.cols,
                actual: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Append all rows of `other` below this matrix.
    pub fn append(&mut self, other: &FeatureMatrix) -> Result<()> {
        if other.cols != self.cols {
            return Err(Error::DimensionMismatch {
                expected: self.cols,
                actual: other.cols,
            });
        }
        self.data.extend_from_slice(&other.data);
        self.rows += other.rows;
        Ok(())
    }

    /// Stack `top` above `bottom` into a new matrix.
    pub fn vconcat(top: &FeatureMatrix, bottom: &FeatureMatrix) -> Result<FeatureMatrix> {
        let mut out = top.clone();
        out.append(bottom)?;
        Ok(out)
    }

    /// Matrix-vector product: one dot product per row.
    pub fn matvec(&self, v: &[f32]) -> Result<Vec<f32>> {
        if v.len() != self.cols {
            return Err(Error::DimensionMismatch {
                expected: self.cols,
                actual: v.len(),
            });
        }
        Ok(self.iter_rows().map(|row| dot(row, v)).collect())
    }
}

/// Dot product of two equally long slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// =============================================================================
// CLASSIFIER AND RANKING
// =============================================================================

/// Trained linear classifier. Higher `score` means more positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f32>,
    pub bias: f32,
}

impl LinearModel {
    pub fn dim(&self) -> usize {
        self.weights.len()
    }

    /// Decision value for a single feature row.
    pub fn score(&self, row: &[f32]) -> f32 {
        dot(&self.weights, row) + self.bias
    }
}

/// Scores for every dataset row plus their descending order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ranking {
    /// Score of dataset row `i`.
    pub scores: Vec<f32>,
    /// Permutation of dataset indices, best first.
    pub order: Vec<usize>,
}

impl Ranking {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// One ranked dataset image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub path: String,
    pub score: f32,
}

/// A single page of a ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingPage {
    /// 1-based page number.
    pub page: usize,
    pub page_count: usize,
    pub rlist: Vec<RankedItem>,
}

/// Annotation label for a training image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationLabel {
    Positive,
    Neutral,
    Negative,
}

impl AnnotationLabel {
    pub fn as_i32(&self) -> i32 {
        match self {
            AnnotationLabel::Positive => 1,
            AnnotationLabel::Neutral => 0,
            AnnotationLabel::Negative => -1,
        }
    }
}

impl TryFrom<i32> for AnnotationLabel {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(AnnotationLabel::Positive),
            0 => Ok(AnnotationLabel::Neutral),
            -1 => Ok(AnnotationLabel::Negative),
            other => Err(Error::InvalidAnnoFile(format!(
                "annotation value must be 1, 0 or -1, got {}",
                other
            ))),
        }
    }
}

/// A path paired with its annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub path: String,
    pub anno: AnnotationLabel,
}
