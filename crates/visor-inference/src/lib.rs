//! # visor-inference
//!
//! Image augmentation and pooled feature extraction for visor.
//!
//! This crate provides:
//! - Image loading and validation
//! - Deterministic view augmentation ("whole" and "aspect corners")
//! - A random-projection CPU backend
//! - A blocking pool of extractor instances, with an optional batching layer
//!
//! # Example
//!
//! ```rust,no_run
//! use visor_core::{FeatureBackend, FeatureExtractor};
//! use visor_inference::{load_image, ExtractorConfig, FeatureExtractorPool, ProjectionBackend};
//!
//! let config = ExtractorConfig::default();
//! let pool = FeatureExtractorPool::from_config(&config, |_| {
//!     Ok(Box::new(ProjectionBackend::seeded(config.seed, config.grid, config.code_size))
//!         as Box<dyn FeatureBackend>)
//! })
//! .unwrap();
//! let image = load_image(std::path::Path::new("cat.jpg")).unwrap();
//! let features = pool.compute(&[image]).unwrap();
//! assert_eq!(features.cols(), config.code_size);
//! ```

pub mod augment;
pub mod batch;
pub mod config;
pub mod extractor;
pub mod pool;
pub mod projection;

// Mock backends for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use augment::{load_image, validate_image, Augmenter};
pub use batch::BatchingExtractor;
pub use config::{AugmentationMode, ChannelOrder, ExtractorConfig};
pub use extractor::{reduce_views, ExtractorInstance};
pub use pool::{FeatureExtractorPool, ReadyInstance};
pub use projection::ProjectionBackend;
