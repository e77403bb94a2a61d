//! Identifier generation.
//!
//! Query ids and event ids are UUIDv7: the leading 48 bits are a Unix
//! millisecond timestamp and the rest comes from the OS random source, so
//! ids sort by creation time and never collide across threads.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Process-wide generator for query ids.
///
/// Owned by the server's composition root and shared by reference.
/// `next_id` takes `&self` and is safe to call from any thread: uniqueness
/// comes from the v7 timestamp plus random bits, with no shared counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryIdGenerator;

impl QueryIdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Produce a fresh, opaque query id.
    pub fn next_id(&self) -> String {
        new_v7().simple().to_string()
    }
}
