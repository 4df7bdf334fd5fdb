//! CT scan preprocessing: decode → RGB → exact resize to the model input
//! resolution → scale to [0, 1] → leading batch axis.
//!
//! Pure bytes-to-tensor transform. No I/O, no model calls.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageOutputFormat, RgbImage};
use thiserror::Error;
use tracing::debug;

use super::PipelineError;

/// Side length of the square CT model input.
pub const CT_INPUT_SIZE: u32 = 256;

/// RGB channel count of the CT model input.
pub const CT_CHANNELS: usize = 3;

/// Maximum input image size (in bytes) before rejecting.
/// Prevents OOM on corrupt/adversarial files.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024; // 50 MB

/// Smallest plausible encoded image (minimal PNG is ~67 bytes).
const MIN_IMAGE_BYTES: usize = 67;

// ═══════════════════════════════════════════════════════════
// Tensor
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Error, PartialEq)]
#[error("tensor data length {len} does not match shape {shape:?}")]
pub struct TensorShapeError {
    pub shape: [usize; 4],
    pub len: usize,
}

/// Dense NHWC f32 tensor, the CT model's input layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self, TensorShapeError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(TensorShapeError {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// `[1, h, w, 3]` tensor with channel values scaled from [0, 255] to [0, 1].
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (w, h) = image.dimensions();
        let data = image.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
        Self {
            shape: [1, h as usize, w as usize, CT_CHANNELS],
            data,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn batch_size(&self) -> usize {
        self.shape[0]
    }

    /// Number of values in one batch item (h * w * c).
    pub fn item_len(&self) -> usize {
        self.shape[1] * self.shape[2] * self.shape[3]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Values of batch item `index`, or `None` if out of range.
    pub fn item(&self, index: usize) -> Option<&[f32]> {
        if index >= self.batch_size() {
            return None;
        }
        let len = self.item_len();
        Some(&self.data[index * len..(index + 1) * len])
    }
}

// ═══════════════════════════════════════════════════════════
// Preprocessor service
// ═══════════════════════════════════════════════════════════

/// Resize filter used for the model-input resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFilter {
    /// Nearest neighbour, the interpolation the CT model was trained with.
    Nearest,
    /// Bilinear.
    Triangle,
    /// Cubic spline.
    CatmullRom,
}

impl ResizeFilter {
    fn filter_type(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
        }
    }
}

/// Model-ready CT input.
#[derive(Debug, Clone)]
pub struct PreparedScan {
    /// `[1, size, size, 3]`, values in [0, 1].
    pub tensor: Tensor,
    /// The resized RGB image the tensor was built from. The explainer
    /// perturbs this and the report embeds it as the source image.
    pub image: RgbImage,
    pub original_width: u32,
    pub original_height: u32,
}

/// Normalizes a CT image into model-ready tensor form.
pub trait ImagePreprocessor: Send + Sync {
    /// Input bytes are borrowed and never modified.
    fn prepare(&self, image_bytes: &[u8]) -> Result<PreparedScan, PipelineError>;
}

pub struct CtScanPreprocessor {
    input_size: u32,
    filter: ResizeFilter,
}

impl Default for CtScanPreprocessor {
    fn default() -> Self {
        Self {
            input_size: CT_INPUT_SIZE,
            filter: ResizeFilter::Nearest,
        }
    }
}

impl CtScanPreprocessor {
    pub fn new(input_size: u32, filter: ResizeFilter) -> Self {
        Self { input_size, filter }
    }
}

impl ImagePreprocessor for CtScanPreprocessor {
    fn prepare(&self, image_bytes: &[u8]) -> Result<PreparedScan, PipelineError> {
        let img = decode_image(image_bytes)?;
        let (orig_w, orig_h) = img.dimensions();
        if orig_w == 0 || orig_h == 0 {
            return Err(PipelineError::InvalidImage("Image has zero size".into()));
        }

        let rgb = img.to_rgb8();
        let resized = image::imageops::resize(
            &rgb,
            self.input_size,
            self.input_size,
            self.filter.filter_type(),
        );
        if resized.dimensions() != (self.input_size, self.input_size) {
            return Err(PipelineError::InvalidImage(format!(
                "Resize produced {}x{}, expected {size}x{size}",
                resized.width(),
                resized.height(),
                size = self.input_size
            )));
        }

        let tensor = Tensor::from_rgb(&resized);

        debug!(
            original = format!("{orig_w}x{orig_h}"),
            shape = ?tensor.shape(),
            "CT image prepared for model"
        );

        Ok(PreparedScan {
            tensor,
            image: resized,
            original_width: orig_w,
            original_height: orig_h,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Pure helper functions (reusable)
// ═══════════════════════════════════════════════════════════

/// Validate image bytes before decoding.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), PipelineError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(PipelineError::InvalidImage(
            "Image data too small to be valid".into(),
        ));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(PipelineError::InvalidImage(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    validate_image_bytes(bytes)?;
    image::load_from_memory(bytes)
        .map_err(|e| PipelineError::InvalidImage(format!("Failed to decode image: {e}")))
}

pub fn decode_grayscale(bytes: &[u8]) -> Result<GrayImage, PipelineError> {
    Ok(decode_image(bytes)?.to_luma8())
}

pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    Ok(decode_image(bytes)?.to_rgb8())
}

/// Encode an RGB image as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, PipelineError> {
    write_png(DynamicImage::ImageRgb8(img.clone()))
}

/// Encode a grayscale image as PNG bytes.
pub fn encode_gray_png(img: &GrayImage) -> Result<Vec<u8>, PipelineError> {
    write_png(DynamicImage::ImageLuma8(img.clone()))
}

fn write_png(dynamic: DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| PipelineError::InvalidImage(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}
