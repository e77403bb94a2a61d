//! Turning fetched training images into positive feature rows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use visor_core::{Error, FeatureExtractor, FeatureMatrix, NotificationBus, Result};
use visor_db::{relative_path, DatasetIndex};
use visor_inference::load_image;
use visor_jobs::{PostProcessor, Source};

use crate::query::QueryRecord;

/// Per-download context: the owning query and where to report progress.
#[derive(Clone)]
pub struct IngestTarget {
    pub query: Arc<QueryRecord>,
    pub notifications: Arc<NotificationBus>,
}

/// Computes (or looks up) one feature row per image and appends it.
pub struct QueryPostProcessor {
    extractor: Arc<dyn FeatureExtractor>,
    index: Arc<DatasetIndex>,
    cache_dir: PathBuf,
}

impl QueryPostProcessor {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, index: Arc<DatasetIndex>, cache_dir: &Path) -> Self {
        Self {
            extractor,
            index,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    /// Stored row for an image that is already part of the dataset.
    fn dataset_row(&self, path: &Path) -> Option<FeatureMatrix> {
        let rel = relative_path(path, &[self.index.base_path()])?;
        let row = self.index.lookup(&rel)?;
        debug!(source = %rel, "Reusing dataset features");
        FeatureMatrix::from_vec(1, row.len(), row).ok()
    }

    fn compute(&self, path: &Path) -> Result<FeatureMatrix> {
        let image = load_image(path)?;
        self.extractor.compute(std::slice::from_ref(&image))
    }

    /// Remove a rejected image, but only from the download cache.
    fn discard(&self, path: &Path) {
        if relative_path(path, &[&self.cache_dir]).is_none() {
            debug!(source = %path.display(), "Rejected image is outside the cache, keeping it");
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            warn!(source = %path.display(), error = %e, "Could not delete rejected image");
        }
    }
}

impl PostProcessor<IngestTarget> for QueryPostProcessor {
    fn process(&self, path: &Path, _source: &Source, target: &IngestTarget) -> Result<()> {
        let query = &target.query;
        if !query.accepts_positives() {
            debug!(query_id = %query.id(), "Query no longer collecting, skipping image");
            return Ok(());
        }

        let feats = match self.dataset_row(path) {
            Some(row) => row,
            None => match self.compute(path) {
                Ok(feats) => feats,
                Err(e @ Error::InvalidImage(_)) => {
                    self.discard(path);
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
        };

        let fname = path.display().to_string();
        if query.append_positive(&feats, &fname)? {
            target.notifications.post_image_processed(query.id(), &fname);
        }
        Ok(())
    }
}
