//! # visor-search
//!
//! Classifier training and dataset ranking for visor.
//!
//! This crate provides:
//! - A linear SVM trainer with a configurable regularization policy
//! - Stable descending ranking of a dataset feature matrix
//! - 1-based page retrieval over a ranking

pub mod rank;
pub mod svm;

pub use rank::{page_count, rank, ranking_page};
pub use svm::{LinearSvmTrainer, RegularizationPolicy};
