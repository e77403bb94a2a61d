//! Batched feature extraction on top of the pool.
//!
//! Callers announce themselves, augment their own images, then join a
//! shared pending batch. The caller whose images fill the batch runs one
//! forward pass for everybody; the others wait on `filled` and then copy
//! out their own row slice. The next batch cannot start filling until
//! every member of the previous one has taken its rows; late arrivals wait
//! on `consumed`.
//!
//! Members only wait for more images while another caller is still on its
//! way in. A lone or strictly sequential caller never waits: its partial
//! batch runs as soon as nobody else is arriving. `timeout` bounds the wait
//! for arrivals that are slow to join.
//!
//! A panicking backend is turned into an error for every member of the
//! batch, so the rendezvous never stays stuck in `Computing`.
//!
//! ```text
//!   Filling --(Nth image or timeout)--> Computing --> Draining --(last reader)--> Filling
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::DynamicImage;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use visor_core::{Error, FeatureExtractor, FeatureMatrix, Result, View};

use crate::pool::FeatureExtractorPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filling,
    Computing,
    Draining,
}

struct BatchState {
    phase: Phase,
    views: Vec<View>,
    image_count: usize,
    members: usize,
    /// Callers that announced themselves but have not joined a batch yet.
    arriving: usize,
    /// Rows of the finished batch, or the error message of its forward pass.
    results: Option<std::result::Result<FeatureMatrix, String>>,
    readers_remaining: usize,
}

impl BatchState {
    fn new() -> Self {
        Self {
            phase: Phase::Filling,
            views: Vec::new(),
            image_count: 0,
            members: 0,
            arriving: 0,
            results: None,
            readers_remaining: 0,
        }
    }

    fn can_join(&self, image_count: usize, batch_size: usize) -> bool {
        self.phase == Phase::Filling
            && (self.image_count == 0 || self.image_count + image_count <= batch_size)
    }
}

/// Groups single-image `compute` calls into shared forward passes.
pub struct BatchingExtractor {
    pool: Arc<FeatureExtractorPool>,
    batch_size: usize,
    timeout: Duration,
    state: Mutex<BatchState>,
    filled: Condvar,
    consumed: Condvar,
}

impl BatchingExtractor {
    pub fn new(pool: Arc<FeatureExtractorPool>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            timeout,
            state: Mutex::new(BatchState::new()),
            filled: Condvar::new(),
            consumed: Condvar::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn prepare(&self, images: &[DynamicImage]) -> Result<Vec<View>> {
        let augmenter = self.pool.augmenter();
        let mut views = Vec::with_capacity(images.len() * augmenter.view_count());
        for image in images {
            views.extend(augmenter.prepare_views(image)?);
        }
        Ok(views)
    }

    fn compute_batched(
        &self,
        arrival: Arrival<'_>,
        views: Vec<View>,
        image_count: usize,
    ) -> Result<FeatureMatrix> {
        let mut state = self.state.lock();
        while !state.can_join(image_count, self.batch_size) {
            if state.phase == Phase::Filling {
                // Does not fit next to what is pending: send that off first.
                self.run_batch(&mut state);
            } else {
                self.consumed.wait(&mut state);
            }
        }

        arrival.join(&mut state);
        let offset = state.image_count;
        state.views.extend(views);
        state.image_count += image_count;
        state.members += 1;

        let deadline = Instant::now() + self.timeout;
        loop {
            match state.phase {
                Phase::Draining => break,
                Phase::Computing => self.filled.wait(&mut state),
                Phase::Filling if state.image_count >= self.batch_size || state.arriving == 0 => {
                    self.run_batch(&mut state);
                }
                Phase::Filling => {
                    if self.filled.wait_until(&mut state, deadline).timed_out()
                        && state.phase == Phase::Filling
                    {
                        debug!(
                            image_count = state.image_count,
                            batch_size = self.batch_size,
                            arriving = state.arriving,
                            "Flushing partial batch after timeout"
                        );
                        self.run_batch(&mut state);
                    }
                }
            }
        }

        let rows = match &state.results {
            Some(Ok(matrix)) => {
                let cols = matrix.cols();
                let slice = &matrix.as_slice()[offset * cols..(offset + image_count) * cols];
                FeatureMatrix::from_vec(image_count, cols, slice.to_vec())
            }
            Some(Err(msg)) => Err(Error::Internal(format!("batched forward pass failed: {}", msg))),
            None => Err(Error::Internal("batch finished without results".to_string())),
        };

        state.readers_remaining -= 1;
        if state.readers_remaining == 0 {
            state.results = None;
            state.phase = Phase::Filling;
            self.consumed.notify_all();
        }
        rows
    }

    /// Run the pending batch. The state lock is released during the pass.
    fn run_batch(&self, state: &mut MutexGuard<'_, BatchState>) {
        state.phase = Phase::Computing;
        let views = std::mem::take(&mut state.views);
        let image_count = std::mem::replace(&mut state.image_count, 0);
        let members = std::mem::replace(&mut state.members, 0);

        let result = MutexGuard::unlocked(state, || {
            panic::catch_unwind(AssertUnwindSafe(|| self.pool.compute_views(&views, image_count)))
                .unwrap_or_else(|_| {
                    Err(Error::Internal("backend panicked during the forward pass".to_string()))
                })
        });
        if let Err(e) = &result {
            warn!(image_count, error = %e, "Batched forward pass failed");
        }

        state.results = Some(result.map_err(|e| e.to_string()));
        state.readers_remaining = members;
        state.phase = Phase::Draining;
        self.filled.notify_all();
    }
}

/// A caller on its way into a batch. Dropped without joining (an invalid
/// image), it stops counting and wakes the members waiting on it.
struct Arrival<'a> {
    batcher: &'a BatchingExtractor,
    pending: bool,
}

impl<'a> Arrival<'a> {
    fn announce(batcher: &'a BatchingExtractor) -> Self {
        batcher.state.lock().arriving += 1;
        Self { batcher, pending: true }
    }

    /// Stop counting as arriving; the caller holds the state lock.
    fn join(mut self, state: &mut BatchState) {
        state.arriving -= 1;
        self.pending = false;
    }
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        if self.pending {
            self.batcher.state.lock().arriving -= 1;
            self.batcher.filled.notify_all();
        }
    }
}

impl FeatureExtractor for BatchingExtractor {
    fn compute(&self, images: &[DynamicImage]) -> Result<FeatureMatrix> {
        if images.is_empty() {
            return Ok(FeatureMatrix::with_cols(self.code_size()));
        }
        if self.batch_size <= 1 {
            return self.pool.compute_views(&self.prepare(images)?, images.len());
        }
        // Announce before augmenting so pending members wait for these
        // images; augment before joining so an invalid image never enters.
        let arrival = Arrival::announce(self);
        let views = self.prepare(images)?;
        self.compute_batched(arrival, views, images.len())
    }

    fn code_size(&self) -> usize {
        self.pool.code_size()
    }
}
