//! # visor-api
//!
//! The visor query server.
//!
//! This crate provides:
//! - The query registry and lifecycle state machine ([`QueryManager`])
//! - The ingestion post-processor turning training images into features
//! - Method-name RPC dispatch and its HTTP endpoint
//! - The notification relay and its SSE stream
//! - Configuration loading

pub mod app;
pub mod config;
pub mod handlers;
pub mod ingest;
pub mod manager;
pub mod monitor;
pub mod query;
pub mod rpc;

pub use app::{build_extractor, App};
pub use config::{ConfigError, ConfigResult, IndexConfig, ServerConfig, VisorConfig};
pub use handlers::{router, AppState};
pub use ingest::{IngestTarget, QueryPostProcessor};
pub use manager::{ManagerParts, QueryManager};
pub use query::QueryRecord;
pub use rpc::{dispatch, AnnotationEntry, RpcReply, RpcRequest};
