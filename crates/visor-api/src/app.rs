//! Composition root: builds the extractor, indexes, downloader and manager
//! from configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use visor_core::{Error, EventBus, FeatureBackend, FeatureExtractor, NotificationBus, Result};
use visor_db::{read_features, DatasetIndex, IncrementalIndexUpdater, NegativePool};
use visor_inference::{BatchingExtractor, ExtractorConfig, FeatureExtractorPool, ProjectionBackend};
use visor_jobs::{DownloaderConfig, HttpFetcher, ImageDownloader, ImageFetcher};
use visor_search::LinearSvmTrainer;

use crate::config::VisorConfig;
use crate::ingest::{IngestTarget, QueryPostProcessor};
use crate::manager::{ManagerParts, QueryManager};
use crate::monitor::spawn_monitors;

/// Build the extractor described by `config`: a pool of projection
/// backends, wrapped in a batching layer when `batch_size > 1`.
pub fn build_extractor(config: &ExtractorConfig) -> Result<Arc<dyn FeatureExtractor>> {
    let pool = match &config.model_path {
        Some(path) => {
            let weights = read_features(path)?.feats;
            info!(model_path = %path.display(), code_size = weights.rows(), "Loading projection weights");
            FeatureExtractorPool::from_config(config, |_| {
                Ok(Box::new(ProjectionBackend::from_weights(config.grid, weights.clone())?)
                    as Box<dyn FeatureBackend>)
            })?
        }
        None => FeatureExtractorPool::from_config(config, |_| {
            Ok(Box::new(ProjectionBackend::seeded(config.seed, config.grid, config.code_size))
                as Box<dyn FeatureBackend>)
        })?,
    };

    if config.batch_size > 1 {
        Ok(Arc::new(BatchingExtractor::new(
            Arc::new(pool),
            config.batch_size,
            Duration::from_millis(config.batch_timeout_ms),
        )))
    } else {
        Ok(Arc::new(pool))
    }
}

/// The running server core.
pub struct App {
    pub manager: Arc<QueryManager>,
    pub events: Arc<EventBus>,
    downloader: Arc<ImageDownloader<IngestTarget>>,
    monitors: Vec<JoinHandle<()>>,
}

impl App {
    /// Load feature files and build everything. Must run inside a tokio runtime.
    pub fn build(config: &VisorConfig) -> Result<Self> {
        let extractor = build_extractor(&config.extractor)?;
        let index = DatasetIndex::load(&config.index.dataset_feats_file, &config.index.dataset_base_path)?;
        let negatives = NegativePool::load(&config.index.neg_feats_file, &config.index.neg_base_path)?;
        let fetcher = HttpFetcher::new(
            Duration::from_secs(config.server.download_timeout_secs),
            config.server.download_max_bytes,
        )?;
        Self::from_parts(config, extractor, index, negatives, Arc::new(fetcher))
    }

    /// Assemble from already-built parts.
    pub fn from_parts(
        config: &VisorConfig,
        extractor: Arc<dyn FeatureExtractor>,
        index: DatasetIndex,
        negatives: NegativePool,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self> {
        let code_size = extractor.code_size();
        if index.code_size() != code_size {
            return Err(Error::Config(format!(
                "dataset features have {} columns but the extractor produces {}",
                index.code_size(),
                code_size
            )));
        }
        if negatives.feats().cols() != code_size {
            return Err(Error::Config(format!(
                "negative features have {} columns but the extractor produces {}",
                negatives.feats().cols(),
                code_size
            )));
        }

        let cache_dir = config.server.image_cache_path.clone();
        std::fs::create_dir_all(&cache_dir)?;

        let index = Arc::new(index);
        let notifications = Arc::new(NotificationBus::new());
        let events = Arc::new(EventBus::new(config.server.event_bus_capacity));

        let processor = Arc::new(QueryPostProcessor::new(extractor.clone(), index.clone(), &cache_dir));
        let downloader = Arc::new(ImageDownloader::start(
            DownloaderConfig::default()
                .with_workers(config.server.download_workers)
                .with_cache_dir(cache_dir.clone()),
            fetcher,
            processor,
        )?);
        let updater = Arc::new(IncrementalIndexUpdater::new(index.clone(), extractor));

        let manager = Arc::new(QueryManager::new(ManagerParts {
            notifications: notifications.clone(),
            index: index.clone(),
            negatives: Arc::new(negatives),
            trainer: LinearSvmTrainer::new(config.svm.clone()),
            downloader: downloader.clone(),
            updater,
            page_size: config.server.page_size,
            cache_dir,
        }));
        let monitors = spawn_monitors(notifications, events.clone());

        info!(
            dataset_size = index.len(),
            code_size,
            page_size = config.server.page_size,
            "Visor core initialized"
        );

        Ok(Self {
            manager,
            events,
            downloader,
            monitors,
        })
    }

    /// Stop the downloader and the notification monitors.
    pub async fn shutdown(&self) {
        self.downloader.shutdown().await;
        for monitor in &self.monitors {
            monitor.abort();
        }
        info!("Visor core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_core::FeatureMatrix;
    use visor_db::{write_blob, FeatureData};

    fn small_config() -> ExtractorConfig {
        ExtractorConfig::default()
            .with_pool_size(2)
            .with_dims(16, 12)
            .with_grid(2)
            .with_code_size(6)
    }

    #[test]
    fn test_seeded_extractor_code_size() {
        let extractor = build_extractor(&small_config()).unwrap();
        assert_eq!(extractor.code_size(), 6);
    }

    #[test]
    fn test_batched_extractor_when_batch_size_above_one() {
        let extractor = build_extractor(&small_config().with_batch_size(4)).unwrap();
        assert_eq!(extractor.code_size(), 6);
    }

    #[test]
    fn test_extractor_from_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.feats");
        let input_len = ProjectionBackend::input_len(2);
        let weights = FeatureMatrix::from_vec(5, input_len, vec![0.1; 5 * input_len]).unwrap();
        let names: Vec<String> = (0..5).map(|i| format!("w{}", i)).collect();
        write_blob(&path, &weights, &names).unwrap();

        let mut config = small_config();
        config.model_path = Some(path);
        let extractor = build_extractor(&config).unwrap();
        assert_eq!(extractor.code_size(), 5);
    }

    #[tokio::test]
    async fn test_code_size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VisorConfig::default();
        config.server.image_cache_path = dir.path().join("cache");

        let extractor = build_extractor(&small_config()).unwrap();
        let data = |cols: usize| {
            FeatureData::new(
                FeatureMatrix::from_rows(cols, &[vec![0.0; cols]]).unwrap(),
                vec!["a.jpg".to_string()],
            )
            .unwrap()
        };
        let index = DatasetIndex::in_memory(data(4), dir.path());
        let negatives = NegativePool::new(data(6), dir.path());
        let result = App::from_parts(
            &config,
            extractor,
            index,
            negatives,
            Arc::new(HttpFetcher::default()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
