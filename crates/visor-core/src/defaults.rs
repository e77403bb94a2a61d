//! Centralized default constants for the visor system.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs in the other crates reference these constants in
//! their `Default` impls instead of defining their own magic numbers.

// =============================================================================
// AUGMENTATION
// =============================================================================

/// Target size of the smaller image side before corner cropping.
pub const IMAGE_DIM: u32 = 256;

/// Side length of the square view fed to the network.
pub const CROPPED_DIM: u32 = 224;

/// Multiplier applied to 0-255 pixel values before mean subtraction.
pub const IMAGE_MUL: f32 = 1.0;

/// Views per image for whole-image augmentation.
pub const WHOLE_VIEW_COUNT: usize = 1;

/// Views per image for aspect-corners augmentation (5 crops x 2 flips).
pub const ASPECT_CORNERS_VIEW_COUNT: usize = 10;

/// Longest accepted ratio of long to short image side. Resizing the short
/// side of a thinner image would blow up the long one.
pub const MAX_ASPECT_RATIO: u32 = 20;

// =============================================================================
// FEATURE EXTRACTION
// =============================================================================

/// Feature dimension produced by the default projection backend.
pub const CODE_SIZE: usize = 4096;

/// Pooling grid (per side) used by the projection backend.
pub const PROJECTION_GRID: u32 = 8;

/// Seed for the projection backend weights when no model file is given.
pub const PROJECTION_SEED: u64 = 0x5649_534f_52;

/// Number of independent extractor instances in the pool.
pub const EXTRACTOR_POOL_SIZE: usize = 2;

/// Images per shared forward pass (1 disables batching).
pub const EXTRACTOR_BATCH_SIZE: usize = 1;

/// How long a partially filled batch waits before running anyway.
pub const EXTRACTOR_BATCH_TIMEOUT_MS: u64 = 250;

// =============================================================================
// LINEAR SVM
// =============================================================================

/// Regularization strength used when enough positives are available.
pub const SVM_C: f64 = 0.1;

/// Below this many positives the few-positives C is used instead.
pub const SVM_FEW_POSITIVES_THRESHOLD: usize = 10;

/// Regularization strength used with few positives.
pub const SVM_FEW_POSITIVES_C: f64 = 1.0;

/// Stopping tolerance for the dual coordinate descent solver.
pub const SVM_EPS: f64 = 0.1;

/// Maximum outer iterations for the dual coordinate descent solver.
pub const SVM_MAX_ITER: usize = 1000;

/// Constant bias feature appended to every sample.
pub const SVM_BIAS: f32 = 1.0;

// =============================================================================
// INGESTION
// =============================================================================

/// Number of launcher tasks issuing downloads concurrently.
pub const DOWNLOAD_WORKERS: usize = 8;

/// Per-download timeout in seconds.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Maximum accepted download size in bytes.
pub const DOWNLOAD_MAX_BYTES: u64 = 20 * 1024 * 1024;

// =============================================================================
// INDEX
// =============================================================================

/// Rows per chunk when writing a chunked feature index.
pub const INDEX_CHUNK_SIZE: usize = 1000;

/// Suffix of the backup kept during an atomic index swap.
pub const INDEX_BACKUP_SUFFIX: &str = "bak";

/// Suffix of the temporary file written before an atomic index swap.
pub const INDEX_TEMP_SUFFIX: &str = "tmp";

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default number of ranked items per page.
pub const PAGE_SIZE: usize = 100;

/// Buffer capacity of the broadcast EventBus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Default directory for downloaded query images.
pub const IMAGE_CACHE_PATH: &str = "./image_cache";
