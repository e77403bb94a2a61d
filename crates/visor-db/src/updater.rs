//! Incremental dataset index updates.
//!
//! `add_images` validates and extracts new images outside any lock, appends
//! them to the in-memory index under the write lock, then persists while
//! holding only the read lock. Persisting replaces the canonical file in
//! two renames (`file -> file.bak`, `file.tmp -> file`); if the second
//! rename fails the previous index is left at `file.bak`.
//!
//! A blob index is rewritten whole. A chunked index gets one new chunk
//! holding every row not yet on disk, and only the chunk index file is
//! swapped. If persisting fails the appended rows stay in memory and the
//! file keeps its previous content; the next update writes them too.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use visor_core::{defaults, Error, FeatureExtractor, FeatureMatrix, Result};
use visor_inference::load_image;

use crate::feature_file::{self, Layout};
use crate::index::{DatasetIndex, Persisted};
use crate::paths::resolve_under_base;

pub struct IncrementalIndexUpdater {
    index: Arc<DatasetIndex>,
    extractor: Arc<dyn FeatureExtractor>,
    /// Serializes updaters; readers are never blocked by it.
    update_lock: Mutex<()>,
}

impl IncrementalIndexUpdater {
    pub fn new(index: Arc<DatasetIndex>, extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            index,
            extractor,
            update_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> &Arc<DatasetIndex> {
        &self.index
    }

    /// Add dataset images, returning how many new rows were appended.
    ///
    /// Paths may be relative to the dataset base directory or absolute
    /// paths inside it. Paths already indexed are skipped. Any invalid
    /// path or image rejects the whole request before the index changes.
    #[instrument(skip(self, paths), fields(image_count = paths.len()))]
    pub fn add_images(&self, paths: &[String]) -> Result<usize> {
        let start = Instant::now();
        let _update = self.update_lock.lock();

        let candidates = self.resolve(paths)?;
        if candidates.is_empty() {
            info!("No new dataset images to add");
            if self.index.persisted_len() < self.index.len() {
                self.persist_logged()?;
            }
            return Ok(0);
        }

        let feats = self.compute(&candidates)?;
        let rel_paths: Vec<String> = candidates.into_iter().map(|(_, rel)| rel).collect();

        let old_len = self.index.append(&feats, &rel_paths)?;
        debug!(old_len, added = rel_paths.len(), "Dataset index extended in memory");

        self.persist_logged()?;

        info!(
            added = rel_paths.len(),
            dataset_size = old_len + rel_paths.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Dataset index updated"
        );
        Ok(rel_paths.len())
    }

    fn resolve(&self, paths: &[String]) -> Result<Vec<(PathBuf, String)>> {
        let base = self.index.base_path();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for raw in paths {
            let (absolute, rel) = resolve_under_base(Path::new(raw), base).ok_or_else(|| {
                Error::InvalidDsetIncrementalUpdate(format!(
                    "{} is not inside the dataset directory {}",
                    raw,
                    base.display()
                ))
            })?;
            if !absolute.is_file() {
                return Err(Error::InvalidDsetIncrementalUpdate(format!(
                    "{} does not exist",
                    absolute.display()
                )));
            }
            if self.index.contains(&rel) || !seen.insert(rel.clone()) {
                debug!(source = %rel, "Skipping image already in dataset index");
                continue;
            }
            out.push((absolute, rel));
        }
        Ok(out)
    }

    fn compute(&self, candidates: &[(PathBuf, String)]) -> Result<FeatureMatrix> {
        let mut feats = FeatureMatrix::with_cols(self.extractor.code_size());
        for (absolute, rel) in candidates {
            let row = load_image(absolute)
                .and_then(|image| self.extractor.compute(std::slice::from_ref(&image)))
                .map_err(|e| {
                    warn!(source = %rel, error = %e, "Dataset image rejected");
                    Error::InvalidDsetIncrementalUpdate(format!("{}: {}", rel, e))
                })?;
            feats.append(&row)?;
        }
        Ok(feats)
    }

    fn persist_logged(&self) -> Result<()> {
        self.persist().map_err(|e| {
            error!(
                error = %e,
                persisted = self.index.persisted_len(),
                in_memory = self.index.len(),
                "Persisting dataset index failed; unwritten rows stay in memory"
            );
            e
        })
    }

    /// Write every in-memory row the feature file does not hold yet.
    fn persist(&self) -> Result<()> {
        let Some(file) = self.index.feats_file() else {
            return Ok(());
        };
        let tmp = feature_file::with_suffix(file, defaults::INDEX_TEMP_SUFFIX);
        let data = self.index.read();
        let new_len = data.len();
        let persisted = self.index.persisted();

        let layout = match persisted.layout {
            Layout::Blob => {
                feature_file::write_blob(&tmp, data.feats(), data.paths())
                    .map_err(|e| write_failed(&tmp, e))?;
                swap_into_place(&tmp, file)?;
                Layout::Blob
            }
            Layout::Chunked(mut chunks) => {
                let start = persisted.rows;
                let name = feature_file::chunk_file_name(file, start, new_len);
                let chunk_path = feature_file::parent_dir(file).join(&name);
                let chunk_tmp = feature_file::with_suffix(&chunk_path, defaults::INDEX_TEMP_SUFFIX);
                let rows = feature_file::slice_rows(data.feats(), start, new_len)?;
                feature_file::write_blob(&chunk_tmp, &rows, &data.paths()[start..new_len])
                    .map_err(|e| write_failed(&chunk_tmp, e))?;
                std::fs::rename(&chunk_tmp, &chunk_path).map_err(|e| write_failed(&chunk_path, e.into()))?;

                chunks.push(name);
                feature_file::write_chunk_index(&tmp, &chunks, new_len, data.feats().cols())
                    .map_err(|e| write_failed(&tmp, e))?;
                swap_into_place(&tmp, file)?;
                Layout::Chunked(chunks)
            }
        };
        self.index.set_persisted(Persisted { layout, rows: new_len });
        Ok(())
    }
}

fn write_failed(path: &Path, e: Error) -> Error {
    Error::InvalidDsetIncrementalUpdate(format!(
        "could not write {}: {}; the on-disk index is unchanged",
        path.display(),
        e
    ))
}

/// Replace `file` with `tmp`, keeping the previous version at `file.bak`.
fn swap_into_place(tmp: &Path, file: &Path) -> Result<()> {
    let bak = feature_file::with_suffix(file, defaults::INDEX_BACKUP_SUFFIX);
    if file.exists() {
        std::fs::rename(file, &bak).map_err(|e| {
            Error::InvalidDsetIncrementalUpdate(format!(
                "could not move {} to {}: {}; the on-disk index is unchanged",
                file.display(),
                bak.display(),
                e
            ))
        })?;
    }
    std::fs::rename(tmp, file).map_err(|e| {
        Error::InvalidDsetIncrementalUpdate(format!(
            "could not move {} to {}: {}; the previous index is at {}, restore it manually",
            tmp.display(),
            file.display(),
            e,
            bak.display()
        ))
    })
}
