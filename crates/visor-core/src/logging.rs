//! Structured logging field name constants for visor.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Failed train/rank/index update, requires attention |
//! | WARN  | Recovered failure: rejected image, failed download, sign flip |
//! | INFO  | Lifecycle events and query state transitions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (per view, per row) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Component within a subsystem.
/// Examples: "pool", "batcher", "downloader", "post_process", "updater"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "add_trs", "train", "rank", "add_dset_images"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Query id being operated on.
pub const QUERY_ID: &str = "query_id";

/// Human-readable query tag.
pub const QUERY_TAG: &str = "tag";

/// Query state after a transition.
pub const STATE: &str = "state";

/// Download group identifier.
pub const GROUP_ID: &str = "group_id";

/// Image path or URL.
pub const SOURCE: &str = "source";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of images in a request or batch.
pub const IMAGE_COUNT: &str = "image_count";

/// Number of positive feature rows.
pub const POSITIVE_COUNT: &str = "positive_count";

/// Number of rows in the dataset index.
pub const DATASET_SIZE: &str = "dataset_size";

/// Feature dimension.
pub const FEATURE_DIM: &str = "feature_dim";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
