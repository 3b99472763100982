//! Frame encoder: raw BGR24 frame -> JPEG -> wire payload
//!
//! Each payload is the JSON text sent to viewers:
//!
//! ```text
//! { "image": "<base64 jpeg>",
//!   "meta": { "frame": 12, "timestamp": 0.5, "fps": 24.0, "width": 640, "height": 360 } }
//! ```
//!
//! The JSON is serialised once per frame and shared read-only by every
//! subscriber it is broadcast to.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::frame::{Frame, Resolution};
use crate::error::{AppError, Result};

/// Default JPEG quality
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Presentation time of frame `sequence` in seconds, rounded to milliseconds
///
/// Exact ties round to even, matching decimal rounding of the exact value.
pub fn frame_timestamp(sequence: u64, fps: f64) -> f64 {
    let seconds = sequence as f64 / fps;
    format!("{:.3}", seconds)
        .parse()
        .unwrap_or_else(|_| (seconds * 1000.0).round() / 1000.0)
}

/// Metadata stamped on every payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayloadMeta {
    /// Frame sequence number within the current pass over the source
    pub frame: u64,
    /// `frame / fps`, millisecond precision
    pub timestamp: f64,
    /// Target frame rate
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl PayloadMeta {
    pub fn new(sequence: u64, fps: f64, resolution: Resolution) -> Self {
        Self {
            frame: sequence,
            timestamp: frame_timestamp(sequence, fps),
            fps,
            width: resolution.width,
            height: resolution.height,
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    image: &'a str,
    meta: &'a PayloadMeta,
}

/// One compressed, metadata-stamped frame ready for transport
///
/// Immutable once built.
#[derive(Debug)]
pub struct Payload {
    meta: PayloadMeta,
    image_size: usize,
    text: String,
}

impl Payload {
    /// Wrap already-compressed image bytes
    pub fn from_image(image: &[u8], meta: PayloadMeta) -> Result<Self> {
        let encoded = STANDARD.encode(image);
        let text = serde_json::to_string(&WireMessage {
            image: &encoded,
            meta: &meta,
        })?;

        Ok(Self {
            meta,
            image_size: image.len(),
            text,
        })
    }

    pub fn meta(&self) -> &PayloadMeta {
        &self.meta
    }

    pub fn sequence(&self) -> u64 {
        self.meta.frame
    }

    /// Size of the compressed image before base64 encoding
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Serialised wire message
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Frame encoder trait
pub trait FrameEncoder: Send {
    /// Encoder name for logging
    fn name(&self) -> &str;

    /// Compress `frame` and stamp it with metadata
    fn encode(&mut self, frame: &Frame, sequence: u64, fps: f64) -> Result<Payload>;
}

/// JPEG encoder using turbojpeg
///
/// Note: the compressor is not thread-safe; each pipeline owns its own
/// encoder.
pub struct JpegEncoder {
    quality: u8,
    compressor: turbojpeg::Compressor,
}

impl JpegEncoder {
    /// Create a new JPEG encoder with the given quality (1-100)
    pub fn new(quality: u8) -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            AppError::EncodeError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;

        let quality = quality.clamp(1, 100);
        compressor
            .set_quality(quality as i32)
            .map_err(|e| AppError::EncodeError(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| AppError::EncodeError(format!("Failed to set subsampling: {}", e)))?;

        Ok(Self {
            quality,
            compressor,
        })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress a BGR24 frame to JPEG bytes
    pub fn compress(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        let expected = frame.resolution().frame_size();
        if frame.data().len() < expected {
            return Err(AppError::EncodeError(format!(
                "BGR data too small: {} < {}",
                frame.data().len(),
                expected
            )));
        }

        let image = turbojpeg::Image {
            pixels: frame.data(),
            width: frame.width() as usize,
            pitch: frame.pitch(),
            height: frame.height() as usize,
            format: turbojpeg::PixelFormat::BGR,
        };

        self.compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::EncodeError(format!("JPEG compression failed: {}", e)))
    }
}

impl FrameEncoder for JpegEncoder {
    fn name(&self) -> &str {
        "JPEG (turbojpeg)"
    }

    fn encode(&mut self, frame: &Frame, sequence: u64, fps: f64) -> Result<Payload> {
        let jpeg = self.compress(frame)?;
        let meta = PayloadMeta::new(sequence, fps, frame.resolution());
        Payload::from_image(&jpeg, meta)
    }
}
