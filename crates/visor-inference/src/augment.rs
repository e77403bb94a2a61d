//! Image loading, validation and view augmentation.
//!
//! [`Augmenter::prepare_views`] is a deterministic function from one decoded
//! image to a fixed number of equally sized float views:
//!
//! | Mode             | Resize (smaller side) | Views                                   |
//! |------------------|-----------------------|-----------------------------------------|
//! | `whole`          | `cropped_dim`         | center                                  |
//! | `aspect_corners` | `image_dim`           | center, TL, BL, TR, BR; then same flipped |

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, GenericImageView, Rgb, RgbImage};
use tracing::{debug, trace};

use visor_core::{defaults, Error, Result, View};

use crate::config::{AugmentationMode, ChannelOrder, ExtractorConfig};

/// Decode an image file, guessing the format from its content.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path)?;
    image::load_from_memory(&bytes).map_err(|e| {
        Error::InvalidImage(format!("{}: {}", path.display(), e))
    })
}

/// Reject images the network cannot consume.
///
/// Accepted are 8-bit RGB and RGBA (alpha is dropped). Grayscale, 16-bit
/// and float images, images with a zero-sized side, and images thinner
/// than [`defaults::MAX_ASPECT_RATIO`] are invalid.
pub fn validate_image(image: &DynamicImage) -> Result<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::InvalidImage(format!(
            "image has an empty side ({}x{})",
            width, height
        )));
    }
    let (short, long) = (width.min(height), width.max(height));
    if u64::from(long) > u64::from(short) * u64::from(defaults::MAX_ASPECT_RATIO) {
        return Err(Error::InvalidImage(format!(
            "aspect ratio of {}x{} exceeds {}:1",
            width,
            height,
            defaults::MAX_ASPECT_RATIO
        )));
    }
    match image.color() {
        ColorType::Rgb8 | ColorType::Rgba8 => Ok(()),
        other => Err(Error::InvalidImage(format!(
            "expected 3 channels of 8-bit depth, got {} channels of {} bytes per pixel",
            other.channel_count(),
            other.bytes_per_pixel()
        ))),
    }
}

/// Turns decoded images into network views.
#[derive(Debug, Clone)]
pub struct Augmenter {
    mode: AugmentationMode,
    image_dim: u32,
    cropped_dim: u32,
    image_mul: f32,
    channel_order: ChannelOrder,
    /// Already scaled by `image_mul` and cropped to `cropped_dim`.
    mean: Option<View>,
}

impl Augmenter {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            mode: config.augmentation,
            image_dim: config.image_dim,
            cropped_dim: config.cropped_dim,
            image_mul: config.image_mul,
            channel_order: config.channel_order,
            mean: None,
        }
    }

    /// Build an augmenter and load the configured mean image, if any.
    pub fn from_config(config: &ExtractorConfig) -> Result<Self> {
        let augmenter = Self::new(config);
        match &config.mean_image_path {
            Some(path) => {
                let mean = load_image(path)
                    .map_err(|e| Error::Config(format!("cannot load mean image: {}", e)))?;
                augmenter.with_mean_image(&mean)
            }
            None => Ok(augmenter),
        }
    }

    /// Subtract `mean` from every view.
    ///
    /// The mean must be `cropped_dim` square, or `image_dim` square in which
    /// case its center crop is used.
    pub fn with_mean_image(mut self, mean: &DynamicImage) -> Result<Self> {
        let rgb = mean.to_rgb8();
        let (w, h) = rgb.dimensions();
        let cropped = if w == self.cropped_dim && h == self.cropped_dim {
            rgb
        } else if w == self.image_dim && h == self.image_dim {
            center_crop(&rgb, self.cropped_dim)
        } else {
            return Err(Error::Config(format!(
                "mean image must be {0}x{0} or {1}x{1}, got {2}x{3}",
                self.cropped_dim, self.image_dim, w, h
            )));
        };
        let mul = self.image_mul;
        self.mean = Some(View::from_fn(cropped.width(), cropped.height(), |x, y| {
            let p = cropped.get_pixel(x, y);
            Rgb([p[0] as f32 * mul, p[1] as f32 * mul, p[2] as f32 * mul])
        }));
        debug!(cropped_dim = self.cropped_dim, "Mean image loaded");
        Ok(self)
    }

    pub fn mode(&self) -> AugmentationMode {
        self.mode
    }

    pub fn view_count(&self) -> usize {
        self.mode.view_count()
    }

    pub fn cropped_dim(&self) -> u32 {
        self.cropped_dim
    }

    /// Produce exactly [`view_count`](Self::view_count) views of
    /// `cropped_dim` x `cropped_dim` for one image.
    pub fn prepare_views(&self, image: &DynamicImage) -> Result<Vec<View>> {
        validate_image(image)?;
        let rgb = image.to_rgb8();

        let views = match self.mode {
            AugmentationMode::Whole => {
                let resized = resize_smaller_side(&rgb, self.cropped_dim);
                vec![self.to_view(&center_crop(&resized, self.cropped_dim))]
            }
            AugmentationMode::AspectCorners => {
                let resized = resize_smaller_side(&rgb, self.image_dim);
                let flipped = imageops::flip_horizontal(&resized);
                let mut views = Vec::with_capacity(self.view_count());
                for source in [&resized, &flipped] {
                    for crop in five_crops(source, self.cropped_dim) {
                        views.push(self.to_view(&crop));
                    }
                }
                views
            }
        };
        trace!(view_count = views.len(), "Prepared views");
        Ok(views)
    }

    fn to_view(&self, crop: &RgbImage) -> View {
        let mul = self.image_mul;
        View::from_fn(crop.width(), crop.height(), |x, y| {
            let p = crop.get_pixel(x, y);
            let mut v = [p[0] as f32 * mul, p[1] as f32 * mul, p[2] as f32 * mul];
            if let Some(mean) = &self.mean {
                let m = mean.get_pixel(x, y);
                for c in 0..3 {
                    v[c] -= m[c];
                }
            }
            if self.channel_order == ChannelOrder::Bgr {
                v.swap(0, 2);
            }
            Rgb(v)
        })
    }
}

/// Resize so the smaller side equals `target`, keeping the aspect ratio.
fn resize_smaller_side(image: &RgbImage, target: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = if w <= h {
        let nh = (h as f64 * target as f64 / w as f64).round() as u32;
        (target, nh.max(target))
    } else {
        let nw = (w as f64 * target as f64 / h as f64).round() as u32;
        (nw.max(target), target)
    };
    if (nw, nh) == (w, h) {
        return image.clone();
    }
    imageops::resize(image, nw, nh, FilterType::Triangle)
}

fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    imageops::crop_imm(image, (w - size) / 2, (h - size) / 2, size, size).to_image()
}

/// Center, top-left, bottom-left, top-right, bottom-right.
fn five_crops(image: &RgbImage, size: u32) -> [RgbImage; 5] {
    let (w, h) = image.dimensions();
    let (right, bottom) = (w - size, h - size);
    [
        center_crop(image, size),
        imageops::crop_imm(image, 0, 0, size, size).to_image(),
        imageops::crop_imm(image, 0, bottom, size, size).to_image(),
        imageops::crop_imm(image, right, 0, size, size).to_image(),
        imageops::crop_imm(image, right, bottom, size, size).to_image(),
    ]
}
