//! Dataset index and negative pool.
//!
//! The dataset index is shared read-mostly by every query. Rankings and
//! lookups take the read side of its lock; only the in-memory append of an
//! incremental update takes the write side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::info;

use visor_core::{Error, FeatureMatrix, Result};

use crate::feature_file::{self, FeatureData, Layout};

/// Features, paths and a path -> row lookup, kept in step.
#[derive(Debug, Default)]
pub struct IndexData {
    feats: FeatureMatrix,
    paths: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl IndexData {
    fn new(data: FeatureData) -> Self {
        let lookup = data
            .paths
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();
        Self {
            feats: data.feats,
            paths: data.paths,
            lookup,
        }
    }

    pub fn feats(&self) -> &FeatureMatrix {
        &self.feats
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn path(&self, row: usize) -> Option<&str> {
        self.paths.get(row).map(String::as_str)
    }

    /// Row index of a dataset-relative path.
    pub fn row_of(&self, rel_path: &str) -> Option<usize> {
        self.lookup.get(rel_path).copied()
    }
}

/// What the canonical feature file holds: its layout and how many of the
/// in-memory rows it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Persisted {
    pub layout: Layout,
    pub rows: usize,
}

/// The precomputed dataset features, shared by all queries.
///
/// Rows appended in memory whose write failed stay served from memory and
/// are written by the next successful update.
pub struct DatasetIndex {
    data: RwLock<IndexData>,
    base_path: PathBuf,
    feats_file: Option<PathBuf>,
    persisted: Mutex<Persisted>,
}

impl DatasetIndex {
    /// Load from a feature file of either layout.
    pub fn load(feats_file: &Path, base_path: &Path) -> Result<Self> {
        let (data, layout) = feature_file::read_features_with_layout(feats_file)?;
        info!(
            dataset_size = data.len(),
            feature_dim = data.feats.cols(),
            file = %feats_file.display(),
            chunked = matches!(layout, Layout::Chunked(_)),
            "Dataset index loaded"
        );
        let rows = data.len();
        Ok(Self {
            data: RwLock::new(IndexData::new(data)),
            base_path: base_path.to_path_buf(),
            feats_file: Some(feats_file.to_path_buf()),
            persisted: Mutex::new(Persisted { layout, rows }),
        })
    }

    /// Build an index that is not backed by a file.
    pub fn in_memory(data: FeatureData, base_path: &Path) -> Self {
        let rows = data.len();
        Self {
            data: RwLock::new(IndexData::new(data)),
            base_path: base_path.to_path_buf(),
            feats_file: None,
            persisted: Mutex::new(Persisted {
                layout: Layout::Blob,
                rows,
            }),
        }
    }

    /// Shared access for ranking and lookups.
    pub fn read(&self) -> RwLockReadGuard<'_, IndexData> {
        self.data.read()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn code_size(&self) -> usize {
        self.data.read().feats.cols()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn feats_file(&self) -> Option<&Path> {
        self.feats_file.as_deref()
    }

    pub fn path(&self, row: usize) -> Option<String> {
        self.data.read().path(row).map(String::from)
    }

    /// Copy of the feature row stored for a dataset-relative path.
    pub fn lookup(&self, rel_path: &str) -> Option<Vec<f32>> {
        let data = self.data.read();
        data.row_of(rel_path).map(|row| data.feats.row(row).to_vec())
    }

    pub fn contains(&self, rel_path: &str) -> bool {
        self.data.read().row_of(rel_path).is_some()
    }

    /// Append rows under the write lock: features first, then paths.
    /// Returns the row count before the append.
    pub fn append(&self, feats: &FeatureMatrix, paths: &[String]) -> Result<usize> {
        if feats.rows() != paths.len() {
            return Err(Error::Internal(format!(
                "appending {} rows with {} paths",
                feats.rows(),
                paths.len()
            )));
        }
        let mut data = self.data.write();
        let old_len = data.paths.len();
        data.feats.append(feats)?;
        for (i, p) in paths.iter().enumerate() {
            data.paths.push(p.clone());
            data.lookup.insert(p.clone(), old_len + i);
        }
        Ok(old_len)
    }

    /// Number of rows the feature file on disk holds.
    pub fn persisted_len(&self) -> usize {
        self.persisted.lock().rows
    }

    pub(crate) fn layout(&self) -> Layout {
        self.persisted.lock().layout.clone()
    }

    pub(crate) fn persisted(&self) -> Persisted {
        self.persisted.lock().clone()
    }

    pub(crate) fn set_persisted(&self, persisted: Persisted) {
        *self.persisted.lock() = persisted;
    }
}

/// Immutable negative training examples, shared by all trainings.
#[derive(Debug, Clone)]
pub struct NegativePool {
    data: FeatureData,
    base_path: PathBuf,
}

impl NegativePool {
    pub fn load(feats_file: &Path, base_path: &Path) -> Result<Self> {
        let data = feature_file::read_features(feats_file)?;
        if data.is_empty() {
            return Err(Error::Config(format!(
                "negative pool {} has no rows",
                feats_file.display()
            )));
        }
        info!(
            negative_count = data.len(),
            feature_dim = data.feats.cols(),
            "Negative pool loaded"
        );
        Ok(Self::new(data, base_path))
    }

    pub fn new(data: FeatureData, base_path: &Path) -> Self {
        Self {
            data,
            base_path: base_path.to_path_buf(),
        }
    }

    pub fn feats(&self) -> &FeatureMatrix {
        &self.data.feats
    }

    pub fn paths(&self) -> &[String] {
        &self.data.paths
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
