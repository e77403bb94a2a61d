//! Query lifecycle management.
//!
//! ```text
//! DATACOLL --(ingestion complete)--> DATACOLL_COMPLETE
//! DATACOLL | DATACOLL_COMPLETE | TRAINED | RANKED --train--> TRAINING --> TRAINED
//! TRAINED --rank--> RANKING --> RANKED
//! ```
//!
//! A failed train or rank returns the query to the state it started from.
//! Train and rank run either on the caller's thread (`wait = true`) or on a
//! detached blocking task; both paths share the same transition logic.
//! Blocking methods must not be called from an async task directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use visor_core::logging::{
    DATASET_SIZE, DURATION_MS, ERROR_MSG, FEATURE_DIM, IMAGE_COUNT, OPERATION, POSITIVE_COUNT, QUERY_ID,
    QUERY_TAG, STATE, SUCCESS,
};
use visor_core::{
    Annotation, Error, LinearModel, NotificationBus, QueryIdGenerator, QueryState, RankingPage, Result,
};
use visor_db::{
    load_annotations, load_classifier, save_annotations, save_classifier, DatasetIndex,
    IncrementalIndexUpdater, NegativePool,
};
use visor_jobs::{CompletionCallback, ImageDownloader};
use visor_search::{rank, ranking_page, LinearSvmTrainer};

use crate::ingest::IngestTarget;
use crate::query::QueryRecord;

/// Everything the manager needs, assembled by the composition root.
pub struct ManagerParts {
    pub notifications: Arc<NotificationBus>,
    pub index: Arc<DatasetIndex>,
    pub negatives: Arc<NegativePool>,
    pub trainer: LinearSvmTrainer,
    pub downloader: Arc<ImageDownloader<IngestTarget>>,
    pub updater: Arc<IncrementalIndexUpdater>,
    pub page_size: usize,
    pub cache_dir: PathBuf,
}

/// Registry of live queries and the operations on them.
pub struct QueryManager {
    queries: Mutex<HashMap<String, Arc<QueryRecord>>>,
    ids: QueryIdGenerator,
    notifications: Arc<NotificationBus>,
    index: Arc<DatasetIndex>,
    negatives: Arc<NegativePool>,
    trainer: Arc<LinearSvmTrainer>,
    downloader: Arc<ImageDownloader<IngestTarget>>,
    updater: Arc<IncrementalIndexUpdater>,
    page_size: usize,
    cache_dir: PathBuf,
}

impl QueryManager {
    pub fn new(parts: ManagerParts) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            ids: QueryIdGenerator::new(),
            notifications: parts.notifications,
            index: parts.index,
            negatives: parts.negatives,
            trainer: Arc::new(parts.trainer),
            downloader: parts.downloader,
            updater: parts.updater,
            page_size: parts.page_size,
            cache_dir: parts.cache_dir,
        }
    }

    pub fn notifications(&self) -> &Arc<NotificationBus> {
        &self.notifications
    }

    pub fn index(&self) -> &Arc<DatasetIndex> {
        &self.index
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    /// Look up a live query.
    pub fn query(&self, id: &str) -> Result<Arc<QueryRecord>> {
        if id.is_empty() {
            return Err(Error::InvalidRequest("query id must not be empty".to_string()));
        }
        self.queries
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("query {} does not exist", id)))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a query in `DataColl`. The tag defaults to the id.
    pub fn start_query(&self, tag: Option<&str>) -> String {
        let id = self.ids.next_id();
        let tag = tag.filter(|t| !t.is_empty()).unwrap_or(&id).to_string();
        let query = Arc::new(QueryRecord::new(id.clone(), tag.clone(), self.index.code_size()));
        self.queries.lock().insert(id.clone(), query);
        info!({ QUERY_ID } = %id, { QUERY_TAG } = %tag, "Query started");
        self.notifications.post_state_change(&id, QueryState::DataColl);
        id
    }

    pub fn set_tag(&self, id: &str, tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Err(Error::InvalidRequest("tag must not be empty".to_string()));
        }
        self.query(id)?.set_tag(tag);
        info!({ QUERY_ID } = %id, { QUERY_TAG } = tag, "Query tag set");
        Ok(())
    }

    /// Remove a query. In-flight work holding the record finishes harmlessly.
    pub fn free_query(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidRequest("query id must not be empty".to_string()));
        }
        match self.queries.lock().remove(id) {
            Some(_) => {
                info!({ QUERY_ID } = %id, "Query freed");
                Ok(())
            }
            None => Err(Error::InvalidRequest(format!("query {} does not exist", id))),
        }
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Start collecting positives from `urls`.
    ///
    /// Ignored (not an error) once the query has left `DataColl`.
    #[instrument(skip(self, urls), fields(query_id = %id, image_count = urls.len()))]
    pub fn add_trs(&self, id: &str, urls: &[String]) -> Result<()> {
        let Some((query, tag)) = self.ingestion_target(id, urls.len())? else {
            return Ok(());
        };
        let target = self.target(&query);
        let callback = self.completion_callback(&query);
        self.downloader.download_urls(urls, &tag, target, Some(callback))?;
        Ok(())
    }

    /// Collect positives from local files, without fetching.
    ///
    /// With `wait` the call blocks until every file was post-processed.
    #[instrument(skip(self, paths), fields(query_id = %id, image_count = paths.len()))]
    pub fn add_trs_from_file(&self, id: &str, paths: &[String], wait: bool) -> Result<()> {
        let Some((query, _tag)) = self.ingestion_target(id, paths.len())? else {
            return Ok(());
        };
        let target = self.target(&query);
        let on_complete = self.completion_callback(&query);
        let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();

        if !wait {
            self.downloader.process_files(&paths, target, Some(on_complete))?;
            return Ok(());
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let callback: CompletionCallback = Box::new(move || {
            on_complete();
            let _ = done_tx.send(());
        });
        self.downloader.process_files(&paths, target, Some(callback))?;
        done_rx
            .recv()
            .map_err(|_| Error::Internal("ingestion stopped before completing".to_string()))
    }

    /// Validate an ingestion request; `None` means "ignore it".
    fn ingestion_target(&self, id: &str, count: usize) -> Result<Option<(Arc<QueryRecord>, String)>> {
        let query = self.query(id)?;
        if count == 0 {
            return Err(Error::InvalidRequest("no training images given".to_string()));
        }
        let tag = query.tag();
        if tag.is_empty() {
            return Err(Error::InvalidRequest(
                "tag must be set before adding training images".to_string(),
            ));
        }
        if !query.accepts_positives() {
            info!(
                { QUERY_ID } = %id,
                { STATE } = %query.state(),
                "Query no longer collecting, ignoring training images"
            );
            return Ok(None);
        }
        Ok(Some((query, tag)))
    }

    fn target(&self, query: &Arc<QueryRecord>) -> IngestTarget {
        IngestTarget {
            query: query.clone(),
            notifications: self.notifications.clone(),
        }
    }

    fn completion_callback(&self, query: &Arc<QueryRecord>) -> CompletionCallback {
        let query = query.clone();
        let bus = self.notifications.clone();
        Box::new(move || {
            query.complete_data_collection(&bus);
            info!(
                { QUERY_ID } = %query.id(),
                { POSITIVE_COUNT } = query.positive_count(),
                "All training images processed"
            );
            bus.post_all_images_processed(query.id());
        })
    }

    // =========================================================================
    // Train / rank
    // =========================================================================

    /// Train the query's classifier.
    ///
    /// Requires at least one positive and a query that is not already
    /// training or ranking. Without `wait`, failures are reported on the
    /// error queue instead of returned.
    pub fn train(&self, id: &str, wait: bool) -> Result<()> {
        let query = self.query(id)?;
        if query.positive_count() == 0 {
            return Err(Error::Training("no training images".to_string()));
        }
        let from = self.enter(&query, |s| !s.is_busy(), QueryState::Training, "train")?;

        let job = self.train_job(query.clone(), from);
        if wait {
            job()
        } else {
            self.detach(query, job);
            Ok(())
        }
    }

    /// Rank the dataset with the trained classifier. Requires `Trained`.
    pub fn rank(&self, id: &str, wait: bool) -> Result<()> {
        let query = self.query(id)?;
        self.enter(&query, |s| s == QueryState::Trained, QueryState::Ranking, "rank")?;

        let job = self.rank_job(query.clone());
        if wait {
            job()
        } else {
            self.detach(query, job);
            Ok(())
        }
    }

    /// Blocking train, rank and page retrieval.
    pub fn train_rank_get_ranking(&self, id: &str, page: usize) -> Result<RankingPage> {
        self.train(id, true)?;
        self.rank(id, true)?;
        self.get_ranking(id, page)
    }

    /// A 1-based page of the query's ranking. Requires `Ranked`.
    pub fn get_ranking(&self, id: &str, page: usize) -> Result<RankingPage> {
        let query = self.query(id)?;
        if query.state() != QueryState::Ranked {
            return Err(Error::CannotReturnRanking(format!(
                "query {} is {}, not {}",
                id,
                query.state(),
                QueryState::Ranked
            )));
        }
        query
            .with_ranking(|ranking| {
                ranking_page(ranking, page, self.page_size, |row| self.index.path(row))
            })
            .unwrap_or_else(|| {
                Err(Error::CannotReturnRanking(format!("query {} has no ranking", id)))
            })
    }

    fn enter<F>(&self, query: &QueryRecord, allowed: F, to: QueryState, op: &str) -> Result<QueryState>
    where
        F: Fn(QueryState) -> bool,
    {
        query
            .transition(allowed, to, &self.notifications)
            .map_err(|current| {
                Error::WrongQueryStatus(format!(
                    "cannot {} query {} while it is {}",
                    op,
                    query.id(),
                    current
                ))
            })
    }

    fn train_job(&self, query: Arc<QueryRecord>, from: QueryState) -> impl FnOnce() -> Result<()> + Send + 'static {
        let trainer = self.trainer.clone();
        let negatives = self.negatives.clone();
        let bus = self.notifications.clone();
        move || {
            let start = Instant::now();
            let positives = query.positive_feats();
            match trainer.train(&positives, negatives.feats()) {
                Ok(model) => {
                    query.set_model(model);
                    query.set_state(QueryState::Trained, &bus);
                    info!(
                        { QUERY_ID } = %query.id(),
                        { POSITIVE_COUNT } = positives.rows(),
                        { DURATION_MS } = start.elapsed().as_millis() as u64,
                        "Query trained"
                    );
                    Ok(())
                }
                Err(e) => {
                    error!(
                        { QUERY_ID } = %query.id(),
                        { OPERATION } = "train",
                        { ERROR_MSG } = %e,
                        "Training failed"
                    );
                    query.set_state(from, &bus);
                    Err(e)
                }
            }
        }
    }

    fn rank_job(&self, query: Arc<QueryRecord>) -> impl FnOnce() -> Result<()> + Send + 'static {
        let index = self.index.clone();
        let bus = self.notifications.clone();
        move || {
            let start = Instant::now();
            let result = match query.model() {
                Some(model) => rank(&model.weights, index.read().feats()),
                None => Err(Error::Internal(format!("query {} has no model", query.id()))),
            };
            match result {
                Ok(ranking) => {
                    let dataset_size = ranking.len();
                    query.set_ranking(ranking);
                    query.set_state(QueryState::Ranked, &bus);
                    info!(
                        { QUERY_ID } = %query.id(),
                        { DATASET_SIZE } = dataset_size,
                        { DURATION_MS } = start.elapsed().as_millis() as u64,
                        "Query ranked"
                    );
                    Ok(())
                }
                Err(e) => {
                    error!(
                        { QUERY_ID } = %query.id(),
                        { OPERATION } = "rank",
                        { ERROR_MSG } = %e,
                        "Ranking failed"
                    );
                    query.set_state(QueryState::Trained, &bus);
                    Err(e)
                }
            }
        }
    }

    /// Run `job` on a blocking task, posting its error if it fails.
    fn detach<J>(&self, query: Arc<QueryRecord>, job: J)
    where
        J: FnOnce() -> Result<()> + Send + 'static,
    {
        let bus = self.notifications.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = job() {
                bus.post_error(query.id(), &e.to_string());
            }
        });
    }

    // =========================================================================
    // Annotations and classifiers
    // =========================================================================

    /// Write the query's positives as an annotation file.
    pub fn save_annotations(&self, id: &str, file: &Path) -> Result<usize> {
        let query = self.query(id)?;
        let paths = query.positive_paths();
        let bases = [self.cache_dir.as_path(), self.index.base_path()];
        let count = save_annotations(file, &paths, &bases)?;
        info!({ QUERY_ID } = %id, { IMAGE_COUNT } = count, file = %file.display(), "Annotations saved");
        Ok(count)
    }

    pub fn get_annotations(&self, file: &Path) -> Result<Vec<Annotation>> {
        load_annotations(file)
    }

    /// Write the trained classifier. Requires `Trained` or `Ranked`.
    pub fn save_classifier(&self, id: &str, file: &Path) -> Result<()> {
        let query = self.query(id)?;
        let state = query.state();
        let model = match (state, query.model()) {
            (QueryState::Trained | QueryState::Ranked, Some(model)) => model,
            _ => {
                return Err(Error::WrongQueryStatus(format!(
                    "query {} has no trained classifier ({})",
                    id, state
                )))
            }
        };
        save_classifier(file, &model, Some(&query.tag()))?;
        info!({ QUERY_ID } = %id, file = %file.display(), "Classifier saved");
        Ok(())
    }

    /// Install a saved classifier and move the query to `Trained`.
    pub fn load_classifier(&self, id: &str, file: &Path) -> Result<()> {
        let query = self.query(id)?;
        let model: LinearModel = load_classifier(file)?;
        let dim = self.index.code_size();
        if model.dim() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: model.dim(),
            });
        }
        self.enter(&query, |s| !s.is_busy(), QueryState::Training, "load a classifier into")?;
        query.set_model(model);
        query.set_state(QueryState::Trained, &self.notifications);
        info!({ QUERY_ID } = %id, { FEATURE_DIM } = dim, file = %file.display(), "Classifier loaded");
        Ok(())
    }

    // =========================================================================
    // Dataset index
    // =========================================================================

    /// Add images to the dataset index and report on the index queue.
    pub fn add_dset_images_to_index(&self, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Err(Error::InvalidRequest("no dataset images given".to_string()));
        }
        match self.updater.add_images(paths) {
            Ok(added) => {
                info!(
                    { OPERATION } = "add_dset_images",
                    { IMAGE_COUNT } = added,
                    { SUCCESS } = true,
                    "Dataset index update reported"
                );
                self.notifications.post_index_updated(added, true, "");
                Ok(added)
            }
            Err(e) => {
                warn!(
                    { OPERATION } = "add_dset_images",
                    { SUCCESS } = false,
                    { ERROR_MSG } = %e,
                    "Dataset index update failed"
                );
                self.notifications.post_index_updated(0, false, &e.to_string());
                Err(e)
            }
        }
    }
}
