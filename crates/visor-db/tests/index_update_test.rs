//! Dataset index updates observed by concurrent readers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use visor_core::{Error, FeatureBackend, FeatureExtractor, FeatureMatrix};
use visor_db::{read_features, write_blob, write_chunked, DatasetIndex, FeatureData, IncrementalIndexUpdater};
use visor_inference::mock::ConstantBackend;
use visor_inference::{ExtractorConfig, FeatureExtractorPool};

const DIM: usize = 8;

fn extractor() -> Arc<dyn FeatureExtractor> {
    let config = ExtractorConfig::default()
        .with_pool_size(2)
        .with_dims(16, 12)
        .with_grid(2)
        .with_code_size(DIM);
    Arc::new(
        FeatureExtractorPool::from_config(&config, |_| {
            Ok(Box::new(ConstantBackend::new(DIM).with_latency_ms(2)) as Box<dyn FeatureBackend>)
        })
        .unwrap(),
    )
}

fn write_image(base: &Path, rel: &str, shade: u8) {
    let path = base.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 18, Rgb([shade, 10, 10])))
        .save_with_format(&path, image::ImageFormat::Png)
        .unwrap();
}

#[test]
fn test_readers_always_see_consistent_rows() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("images");
    let file = dir.path().join("dset.feats");

    let rows: Vec<Vec<f32>> = (0..10).map(|i| vec![i as f32; DIM]).collect();
    let seed = FeatureData::new(
        FeatureMatrix::from_rows(DIM, &rows).unwrap(),
        (0..10).map(|i| format!("seed/{}.jpg", i)).collect(),
    )
    .unwrap();
    write_chunked(&file, &seed.feats, &seed.paths, 4).unwrap();

    let new_paths: Vec<String> = (0..6).map(|i| format!("new/{}.png", i)).collect();
    for (i, p) in new_paths.iter().enumerate() {
        write_image(&base, p, 20 * i as u8);
    }

    let index = Arc::new(DatasetIndex::load(&file, &base).unwrap());
    let updater = IncrementalIndexUpdater::new(index.clone(), extractor());

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let index = index.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut last = 0;
            while !done.load(Ordering::SeqCst) {
                let data = index.read();
                assert_eq!(data.feats().rows(), data.len());
                assert!(data.len() >= last);
                last = data.len();
            }
            last
        })
    };

    let (first, second) = new_paths.split_at(3);
    assert_eq!(updater.add_images(first).unwrap(), 3);
    assert_eq!(updater.add_images(second).unwrap(), 3);
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() <= 16);

    assert_eq!(index.len(), 16);
    let reloaded = read_features(&file).unwrap();
    assert_eq!(reloaded.len(), 16);
    assert_eq!(reloaded.paths[10..], new_paths[..]);
    assert!(dir.path().join("dset_11-13.feats").exists());
    assert!(dir.path().join("dset_14-16.feats").exists());

    let row = index.lookup("new/5.png").unwrap();
    assert_eq!(row.len(), DIM);
}

fn seed(n: usize) -> FeatureData {
    let rows: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32; DIM]).collect();
    FeatureData::new(
        FeatureMatrix::from_rows(DIM, &rows).unwrap(),
        (0..n).map(|i| format!("seed/{}.jpg", i)).collect(),
    )
    .unwrap()
}

fn assert_disk_matches_memory(file: &Path, index: &DatasetIndex) {
    let on_disk = read_features(file).unwrap();
    let data = index.read();
    assert_eq!(on_disk.paths, data.paths());
    assert_eq!(&on_disk.feats, data.feats());
}

#[test]
fn test_chunked_write_failure_is_recovered_by_next_update() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("images");
    let file = dir.path().join("dset.feats");
    let seeded = seed(4);
    write_chunked(&file, &seeded.feats, &seeded.paths, 2).unwrap();
    write_image(&base, "a.jpg", 10);
    write_image(&base, "b.jpg", 20);

    let index = Arc::new(DatasetIndex::load(&file, &base).unwrap());
    let updater = IncrementalIndexUpdater::new(index.clone(), extractor());

    // A directory where the chunk's temporary file should go.
    let blocker = dir.path().join("dset_5-5.feats.tmp");
    std::fs::create_dir(&blocker).unwrap();
    let err = updater.add_images(&["a.jpg".to_string()]).unwrap_err();
    assert!(matches!(err, Error::InvalidDsetIncrementalUpdate(_)));
    assert!(err.to_string().contains("unchanged"));

    // The rows are served from memory; the file still holds the old index.
    assert_eq!(index.len(), 5);
    assert_eq!(index.persisted_len(), 4);
    assert_eq!(read_features(&file).unwrap().len(), 4);

    std::fs::remove_dir(&blocker).unwrap();
    assert_eq!(updater.add_images(&["b.jpg".to_string()]).unwrap(), 1);
    assert_eq!(index.len(), 6);
    assert_eq!(index.persisted_len(), 6);
    assert!(dir.path().join("dset_5-6.feats").exists());
    assert_disk_matches_memory(&file, &index);

    // A restart sees the same index.
    let reloaded = DatasetIndex::load(&file, &base).unwrap();
    assert_eq!(reloaded.len(), 6);
    assert!(reloaded.contains("a.jpg"));
    assert!(reloaded.contains("b.jpg"));
}

#[test]
fn test_blob_write_failure_keeps_file_readable() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("images");
    let file = dir.path().join("dset.bin");
    let seeded = seed(3);
    write_blob(&file, &seeded.feats, &seeded.paths).unwrap();
    write_image(&base, "a.jpg", 10);
    write_image(&base, "b.jpg", 20);

    let index = Arc::new(DatasetIndex::load(&file, &base).unwrap());
    let updater = IncrementalIndexUpdater::new(index.clone(), extractor());

    let blocker = dir.path().join("dset.bin.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(updater.add_images(&["a.jpg".to_string()]).is_err());
    assert_eq!(read_features(&file).unwrap(), seeded);
    assert!(!dir.path().join("dset.bin.bak").exists());
    assert_eq!(index.persisted_len(), 3);

    std::fs::remove_dir(&blocker).unwrap();
    assert_eq!(updater.add_images(&["b.jpg".to_string()]).unwrap(), 1);
    assert_eq!(index.persisted_len(), 5);
    assert_disk_matches_memory(&file, &index);
}

#[test]
fn test_pending_rows_written_when_nothing_new_is_added() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("images");
    let file = dir.path().join("dset.feats");
    let seeded = seed(2);
    write_chunked(&file, &seeded.feats, &seeded.paths, 2).unwrap();
    write_image(&base, "a.jpg", 10);

    let index = Arc::new(DatasetIndex::load(&file, &base).unwrap());
    let updater = IncrementalIndexUpdater::new(index.clone(), extractor());

    let blocker = dir.path().join("dset_3-3.feats.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(updater.add_images(&["a.jpg".to_string()]).is_err());
    std::fs::remove_dir(&blocker).unwrap();

    // Already indexed in memory, so nothing is added, but the file catches up.
    assert_eq!(updater.add_images(&["a.jpg".to_string()]).unwrap(), 0);
    assert_eq!(index.persisted_len(), 3);
    assert_disk_matches_memory(&file, &index);
}
