//! Fixed-size pool of feature extractor instances.
//!
//! Instances live in an arena indexed by position; a parallel `ready`
//! bitset records which are free. Callers block on a single condition
//! variable until an instance frees up. The instance is handed out as a
//! [`ReadyInstance`] guard whose `Drop` restores the ready flag, so a
//! failing compute can never leak an instance.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use visor_core::{Error, FeatureBackend, FeatureExtractor, FeatureMatrix, Result, View};

use crate::augment::Augmenter;
use crate::config::ExtractorConfig;
use crate::extractor::ExtractorInstance;

pub struct FeatureExtractorPool {
    instances: Vec<ExtractorInstance>,
    ready: Mutex<Vec<bool>>,
    became_ready: Condvar,
    augmenter: Arc<Augmenter>,
    code_size: usize,
}

impl FeatureExtractorPool {
    /// Build a pool of `config.pool_size` instances.
    ///
    /// `make_backend` is called once per instance with its index.
    pub fn from_config<F>(config: &ExtractorConfig, mut make_backend: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Box<dyn FeatureBackend>>,
    {
        config.validate()?;
        let augmenter = Arc::new(Augmenter::from_config(config)?);
        let backends = (0..config.pool_size)
            .map(&mut make_backend)
            .collect::<Result<Vec<_>>>()?;
        Self::new(augmenter, backends)
    }

    /// Build a pool with one instance per backend.
    pub fn new(augmenter: Arc<Augmenter>, backends: Vec<Box<dyn FeatureBackend>>) -> Result<Self> {
        let Some(code_size) = backends.first().map(|b| b.code_size()) else {
            return Err(Error::Config("extractor pool needs at least one instance".to_string()));
        };
        if let Some(other) = backends.iter().find(|b| b.code_size() != code_size) {
            return Err(Error::Config(format!(
                "all pool backends must share a code size ({} vs {})",
                code_size,
                other.code_size()
            )));
        }

        let instances: Vec<_> = backends
            .into_iter()
            .enumerate()
            .map(|(i, backend)| ExtractorInstance::new(i, augmenter.clone(), backend))
            .collect();
        info!(
            pool_size = instances.len(),
            code_size,
            augmentation = %augmenter.mode(),
            "Feature extractor pool ready"
        );

        Ok(Self {
            ready: Mutex::new(vec![true; instances.len()]),
            instances,
            became_ready: Condvar::new(),
            augmenter,
            code_size,
        })
    }

    pub fn size(&self) -> usize {
        self.instances.len()
    }

    pub fn augmenter(&self) -> &Augmenter {
        &self.augmenter
    }

    /// Number of instances currently free.
    pub fn ready_count(&self) -> usize {
        self.ready.lock().iter().filter(|r| **r).count()
    }

    /// Take a free instance, blocking until one is released.
    pub fn get_ready_instance(&self) -> ReadyInstance<'_> {
        let start = Instant::now();
        let mut ready = self.ready.lock();
        loop {
            if let Some(index) = ready.iter().position(|r| *r) {
                ready[index] = false;
                let waited_ms = start.elapsed().as_millis() as u64;
                if waited_ms > 0 {
                    debug!(instance = index, waited_ms, "Extractor instance acquired after wait");
                }
                return ReadyInstance { pool: self, index };
            }
            self.became_ready.wait(&mut ready);
        }
    }

    /// Take a free instance without blocking.
    pub fn try_get_ready_instance(&self) -> Option<ReadyInstance<'_>> {
        let mut ready = self.ready.lock();
        let index = ready.iter().position(|r| *r)?;
        ready[index] = false;
        Some(ReadyInstance { pool: self, index })
    }

    /// Run already augmented views on any free instance.
    pub fn compute_views(&self, views: &[View], image_count: usize) -> Result<FeatureMatrix> {
        self.get_ready_instance().compute_views(views, image_count)
    }

    fn release(&self, index: usize) {
        self.ready.lock()[index] = true;
        self.became_ready.notify_one();
    }
}

impl FeatureExtractor for FeatureExtractorPool {
    fn compute(&self, images: &[DynamicImage]) -> Result<FeatureMatrix> {
        self.get_ready_instance().compute(images)
    }

    fn code_size(&self) -> usize {
        self.code_size
    }
}

/// Exclusive handle on one pool instance; released on drop.
pub struct ReadyInstance<'a> {
    pool: &'a FeatureExtractorPool,
    index: usize,
}

impl Deref for ReadyInstance<'_> {
    type Target = ExtractorInstance;

    fn deref(&self) -> &ExtractorInstance {
        &self.pool.instances[self.index]
    }
}

impl Drop for ReadyInstance<'_> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ConstantBackend, FailingBackend};
    use image::{GrayImage, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(pool_size: usize) -> ExtractorConfig {
        ExtractorConfig::default()
            .with_pool_size(pool_size)
            .with_dims(16, 12)
            .with_grid(2)
            .with_code_size(4)
    }

    fn image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(14, 14, Rgb([10, 20, 30])))
    }

    #[test]
    fn test_zero_pool_size_is_config_error() {
        let result = FeatureExtractorPool::from_config(&config(0), |_| {
            Ok(Box::new(ConstantBackend::new(4)) as Box<dyn FeatureBackend>)
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_mismatched_code_sizes_rejected() {
        let augmenter = Arc::new(Augmenter::new(&config(2)));
        let backends: Vec<Box<dyn FeatureBackend>> =
            vec![Box::new(ConstantBackend::new(4)), Box::new(ConstantBackend::new(5))];
        assert!(FeatureExtractorPool::new(augmenter, backends).is_err());
    }

    #[test]
    fn test_guard_releases_instance() {
        let pool = FeatureExtractorPool::from_config(&config(2), |_| {
            Ok(Box::new(ConstantBackend::new(4)) as Box<dyn FeatureBackend>)
        })
        .unwrap();
        assert_eq!(pool.ready_count(), 2);
        {
            let a = pool.get_ready_instance();
            let b = pool.get_ready_instance();
            assert_ne!(a.index(), b.index());
            assert_eq!(pool.ready_count(), 0);
            assert!(pool.try_get_ready_instance().is_none());
        }
        assert_eq!(pool.ready_count(), 2);
    }

    #[test]
    fn test_ready_flag_restored_after_invalid_image() {
        let pool = FeatureExtractorPool::from_config(&config(1), |_| {
            Ok(Box::new(ConstantBackend::new(4)) as Box<dyn FeatureBackend>)
        })
        .unwrap();
        let gray = DynamicImage::ImageLuma8(GrayImage::new(14, 14));
        assert!(matches!(pool.compute(&[gray]), Err(Error::InvalidImage(_))));
        assert_eq!(pool.ready_count(), 1);
        assert_eq!(pool.compute(&[image()]).unwrap().rows(), 1);
    }

    #[test]
    fn test_ready_flag_restored_after_backend_failure() {
        let backend = FailingBackend::new(4);
        let probe = backend.clone();
        let mut slot = Some(backend);
        let pool = FeatureExtractorPool::from_config(&config(1), |_| {
            Ok(Box::new(slot.take().unwrap_or_default()) as Box<dyn FeatureBackend>)
        })
        .unwrap();
        assert!(pool.compute(&[image()]).is_err());
        assert!(pool.compute(&[image()]).is_err());
        assert_eq!(probe.call_count(), 2);
        assert_eq!(pool.ready_count(), 1);
    }

    #[test]
    fn test_callers_block_until_instance_frees() {
        let pool = Arc::new(
            FeatureExtractorPool::from_config(&config(2), |_| {
                Ok(Box::new(ConstantBackend::new(4).with_latency_ms(30)) as Box<dyn FeatureBackend>)
            })
            .unwrap(),
        );
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                std::thread::spawn(move || {
                    let instance = pool.get_ready_instance();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    let rows = instance.compute(&[image()]).unwrap().rows();
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    rows
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.ready_count(), 2);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = Arc::new(
            FeatureExtractorPool::from_config(&config(1), |_| {
                Ok(Box::new(ConstantBackend::new(4)) as Box<dyn FeatureBackend>)
            })
            .unwrap(),
        );
        let held = pool.get_ready_instance();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get_ready_instance().index())
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.join().unwrap(), 0);
    }
}
