//! Feature extractor configuration.
//!
//! Deserialized from the `[extractor]` table of the server configuration.
//! Every field has a default from [`visor_core::defaults`], so an empty
//! table yields a working unbatched "whole image" extractor.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use visor_core::{defaults, Error, Result};

/// How each input image is turned into network views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AugmentationMode {
    /// One center crop of the whole image.
    #[default]
    Whole,
    /// Center plus four corner crops, unflipped and flipped.
    AspectCorners,
}

impl AugmentationMode {
    /// Number of views produced per input image.
    pub fn view_count(&self) -> usize {
        match self {
            AugmentationMode::Whole => defaults::WHOLE_VIEW_COUNT,
            AugmentationMode::AspectCorners => defaults::ASPECT_CORNERS_VIEW_COUNT,
        }
    }
}

impl FromStr for AugmentationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "whole" => Ok(Self::Whole),
            "aspect_corners" => Ok(Self::AspectCorners),
            _ => Err(Error::Config(format!("unsupported augmentation mode: {}", s))),
        }
    }
}

impl fmt::Display for AugmentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => write!(f, "whole"),
            Self::AspectCorners => write!(f, "aspect_corners"),
        }
    }
}

/// Channel order of the views handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Configuration of the extractor pool and its augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Projection weights in feature-file format (`code_size` rows).
    /// When unset, weights are drawn from `seed`.
    pub model_path: Option<PathBuf>,
    pub seed: u64,
    pub code_size: usize,
    /// Pooling grid per side used by the projection backend.
    pub grid: u32,
    pub augmentation: AugmentationMode,
    pub image_dim: u32,
    pub cropped_dim: u32,
    pub image_mul: f32,
    /// Optional mean image subtracted from every view.
    pub mean_image_path: Option<PathBuf>,
    pub channel_order: ChannelOrder,
    pub pool_size: usize,
    /// Images per shared forward pass; 1 disables batching.
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            seed: defaults::PROJECTION_SEED,
            code_size: defaults::CODE_SIZE,
            grid: defaults::PROJECTION_GRID,
            augmentation: AugmentationMode::default(),
            image_dim: defaults::IMAGE_DIM,
            cropped_dim: defaults::CROPPED_DIM,
            image_mul: defaults::IMAGE_MUL,
            mean_image_path: None,
            channel_order: ChannelOrder::default(),
            pool_size: defaults::EXTRACTOR_POOL_SIZE,
            batch_size: defaults::EXTRACTOR_BATCH_SIZE,
            batch_timeout_ms: defaults::EXTRACTOR_BATCH_TIMEOUT_MS,
        }
    }
}

impl ExtractorConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_augmentation(mut self, mode: AugmentationMode) -> Self {
        self.augmentation = mode;
        self
    }

    pub fn with_dims(mut self, image_dim: u32, cropped_dim: u32) -> Self {
        self.image_dim = image_dim;
        self.cropped_dim = cropped_dim;
        self
    }

    pub fn with_code_size(mut self, code_size: usize) -> Self {
        self.code_size = code_size;
        self
    }

    pub fn with_grid(mut self, grid: u32) -> Self {
        self.grid = grid;
        self
    }

    /// Check configuration-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("extractor pool_size must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("extractor batch_size must be at least 1".to_string()));
        }
        if self.code_size == 0 {
            return Err(Error::Config("extractor code_size must be at least 1".to_string()));
        }
        if self.cropped_dim == 0 {
            return Err(Error::Config("extractor cropped_dim must be at least 1".to_string()));
        }
        if self.augmentation == AugmentationMode::AspectCorners && self.image_dim < self.cropped_dim {
            return Err(Error::Config(format!(
                "image_dim ({}) must not be smaller than cropped_dim ({})",
                self.image_dim, self.cropped_dim
            )));
        }
        if self.grid == 0 || self.grid > self.cropped_dim {
            return Err(Error::Config(format!(
                "projection grid must be in 1..={}, got {}",
                self.cropped_dim, self.grid
            )));
        }
        if !self.image_mul.is_finite() || self.image_mul <= 0.0 {
            return Err(Error::Config(format!(
                "image_mul must be positive, got {}",
                self.image_mul
            )));
        }
        Ok(())
    }
}
