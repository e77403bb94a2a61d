//! # visor-db
//!
//! File-backed storage for visor.
//!
//! This crate provides:
//! - The binary feature-file format (single blob or chunked index)
//! - The shared dataset index and the negative pool
//! - Incremental dataset index updates with atomic file replacement
//! - Annotation and classifier files
//! - Path relativization helpers

pub mod annotations;
pub mod classifier;
pub mod feature_file;
pub mod index;
pub mod paths;
pub mod updater;

pub use annotations::{load_annotations, save_annotations};
pub use classifier::{load_classifier, save_classifier};
pub use feature_file::{read_features, write_blob, write_chunked, FeatureData, Layout};
pub use index::{DatasetIndex, IndexData, NegativePool};
pub use paths::{relative_path, resolve_under_base};
pub use updater::IncrementalIndexUpdater;
