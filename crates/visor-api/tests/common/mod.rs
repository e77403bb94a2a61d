//! Shared fixture for visor-api integration tests.
//!
//! Builds an [`App`] over a synthetic in-memory dataset, a real projection
//! extractor with small dimensions, and an HTTP fetcher.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tokio::sync::broadcast;

use visor_api::{build_extractor, App, QueryManager, VisorConfig};
use visor_core::{EventEnvelope, FeatureMatrix, ServerEvent};
use visor_db::{DatasetIndex, FeatureData, NegativePool};
use visor_inference::ExtractorConfig;
use visor_jobs::HttpFetcher;

pub const DIM: usize = 6;
pub const DATASET_SIZE: usize = 250;
pub const PAGE_SIZE: usize = 100;

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub dataset_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub app: App,
}

impl Fixture {
    pub fn manager(&self) -> &Arc<QueryManager> {
        &self.app.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.app.events.subscribe()
    }
}

pub fn extractor_config() -> ExtractorConfig {
    ExtractorConfig::default()
        .with_pool_size(2)
        .with_dims(16, 12)
        .with_grid(2)
        .with_code_size(DIM)
}

/// Deterministic non-negative rows, distinct per `salt`.
pub fn synthetic_rows(rows: usize, salt: usize) -> FeatureMatrix {
    let data = (0..rows * DIM)
        .map(|k| {
            let (i, j) = (k / DIM, k % DIM);
            ((i * 7 + j * 3 + salt * 5) % 11) as f32 / 11.0
        })
        .collect();
    FeatureMatrix::from_vec(rows, DIM, data).unwrap()
}

pub fn dataset_name(row: usize) -> String {
    format!("img_{:03}.png", row)
}

/// Build a fixture. Must run inside a multi-threaded tokio runtime.
pub fn fixture() -> Fixture {
    fixture_with_negatives(synthetic_rows(40, 1))
}

pub fn fixture_with_negatives(negatives: FeatureMatrix) -> Fixture {
    build_fixture(negatives, extractor_config())
}

pub fn fixture_with_extractor(extractor: ExtractorConfig) -> Fixture {
    build_fixture(synthetic_rows(40, 1), extractor)
}

fn build_fixture(negatives: FeatureMatrix, extractor: ExtractorConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let dataset_dir = dir.path().join("dataset");
    let cache_dir = dir.path().join("cache");
    std::fs::create_dir_all(&dataset_dir).unwrap();

    let mut config = VisorConfig::default();
    config.server.image_cache_path = cache_dir.clone();
    config.server.page_size = PAGE_SIZE;
    config.server.download_workers = 4;
    config.extractor = extractor;

    let index = DatasetIndex::in_memory(
        FeatureData::new(
            synthetic_rows(DATASET_SIZE, 0),
            (0..DATASET_SIZE).map(dataset_name).collect(),
        )
        .unwrap(),
        &dataset_dir,
    );
    let negative_paths = (0..negatives.rows()).map(|i| format!("neg_{}.png", i)).collect();
    let negatives = NegativePool::new(FeatureData::new(negatives, negative_paths).unwrap(), dir.path());

    let app = App::from_parts(
        &config,
        build_extractor(&config.extractor).unwrap(),
        index,
        negatives,
        Arc::new(HttpFetcher::default()),
    )
    .unwrap();

    Fixture {
        dataset_dir,
        cache_dir,
        app,
        dir,
    }
}

pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 20, Rgb(color)))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn write_png(path: &Path, color: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, png_bytes(color)).unwrap();
}

/// Run a blocking manager call off the async workers.
pub async fn blocking<T, F>(manager: &Arc<QueryManager>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&QueryManager) -> T + Send + 'static,
{
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || f(&manager)).await.unwrap()
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<EventEnvelope>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(envelope) if pred(&envelope.payload) => return envelope.payload,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_all_processed(rx: &mut broadcast::Receiver<EventEnvelope>, query_id: &str) {
    wait_for(rx, |e| matches!(e, ServerEvent::AllImagesProcessed { id } if id == query_id)).await;
}
