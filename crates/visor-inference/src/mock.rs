//! Mock inference backends for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use visor_inference::mock::ConstantBackend;
//! use visor_core::FeatureBackend;
//!
//! let backend = ConstantBackend::new(8).with_latency_ms(5);
//! assert_eq!(backend.code_size(), 8);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use visor_core::{Error, FeatureBackend, FeatureMatrix, Result, View};

/// Emits a constant row per view (the mean red value in every column).
#[derive(Clone)]
pub struct ConstantBackend {
    code_size: usize,
    reported_code_size: Option<usize>,
    latency_ms: u64,
    panics: bool,
    calls: Arc<AtomicUsize>,
    views_seen: Arc<AtomicUsize>,
}

impl ConstantBackend {
    pub fn new(code_size: usize) -> Self {
        Self {
            code_size,
            reported_code_size: None,
            latency_ms: 0,
            panics: false,
            calls: Arc::new(AtomicUsize::new(0)),
            views_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep this long inside every forward pass.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Panic inside every forward pass.
    pub fn with_panic(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Claim a different code size than the rows actually produced.
    pub fn with_reported_code_size(mut self, code_size: usize) -> Self {
        self.reported_code_size = Some(code_size);
        self
    }

    /// Number of forward passes run so far (shared between clones).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of views forwarded so far (shared between clones).
    pub fn views_seen(&self) -> usize {
        self.views_seen.load(Ordering::SeqCst)
    }
}

impl FeatureBackend for ConstantBackend {
    fn forward(&mut self, views: &[View]) -> Result<FeatureMatrix> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.views_seen.fetch_add(views.len(), Ordering::SeqCst);
        if self.latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.latency_ms));
        }
        if self.panics {
            panic!("constant backend asked to panic");
        }
        let mut out = FeatureMatrix::zeros(views.len(), self.code_size);
        for (i, view) in views.iter().enumerate() {
            let n = (view.width() * view.height()).max(1) as f32;
            let mean = view.pixels().map(|p| p[0]).sum::<f32>() / n;
            out.row_mut(i).iter_mut().for_each(|v| *v = mean + 1.0);
        }
        Ok(out)
    }

    fn code_size(&self) -> usize {
        self.reported_code_size.unwrap_or(self.code_size)
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Fails every forward pass.
#[derive(Clone, Default)]
pub struct FailingBackend {
    code_size: usize,
    calls: Arc<AtomicUsize>,
}

impl FailingBackend {
    pub fn new(code_size: usize) -> Self {
        Self {
            code_size,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureBackend for FailingBackend {
    fn forward(&mut self, _views: &[View]) -> Result<FeatureMatrix> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Internal("mock backend failure".to_string()))
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn name(&self) -> &str {
        "failing"
    }
}
