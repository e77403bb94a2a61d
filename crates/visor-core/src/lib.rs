//! # visor-core
//!
//! Core types, traits, and abstractions for the visor visual-search service.
//!
//! This crate provides the foundational data structures, the error taxonomy
//! and the notification plumbing that the other visor crates depend on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, ServerEvent};
pub use models::*;
pub use notifications::{NotificationBus, SingleSubscriberQueue};
pub use traits::*;
pub use uuid_utils::{new_v7, QueryIdGenerator};
