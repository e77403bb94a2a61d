//! # visor-jobs
//!
//! Asynchronous image ingestion for visor.
//!
//! This crate provides:
//! - A pool of launcher tasks fetching images concurrently
//! - A single sequential post-process worker
//! - Per-request completion accounting with exactly-once callbacks
//! - HTTP and local-file image sources
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use visor_jobs::{DownloaderConfig, HttpFetcher, ImageDownloader};
//!
//! let downloader = ImageDownloader::start(
//!     DownloaderConfig::default().with_cache_dir("/var/cache/visor"),
//!     Arc::new(HttpFetcher::default()),
//!     processor,
//! )?;
//! downloader.download_urls(&urls, "cat", extra, Some(Box::new(|| println!("done"))))?;
//! ```

pub mod downloader;
pub mod fetcher;

pub use downloader::{
    cache_file_path, CompletionCallback, DownloaderConfig, ImageDownloader, PostProcessor, Source,
};
pub use fetcher::{HttpFetcher, ImageFetcher};
