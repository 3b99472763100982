//! Raw video frame data structures

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per pixel of the raw BGR24 frames produced by the source
pub const BYTES_PER_PIXEL: usize = 3;

/// Frame resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size in bytes of one BGR24 frame at this resolution
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Check that both dimensions are non-zero
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A raw BGR24 frame tagged with its position in the source
///
/// The sequence number starts at 0 and restarts at 0 every time the
/// source loops.
#[derive(Debug)]
pub struct Frame {
    data: Bytes,
    resolution: Resolution,
    sequence: u64,
}

impl Frame {
    /// Create a new frame
    ///
    /// `data` must hold exactly `resolution.frame_size()` bytes.
    pub fn new(data: Bytes, resolution: Resolution, sequence: u64) -> Self {
        debug_assert_eq!(data.len(), resolution.frame_size());
        Self {
            data,
            resolution,
            sequence,
        }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(data: Vec<u8>, resolution: Resolution, sequence: u64) -> Self {
        Self::new(Bytes::from(data), resolution, sequence)
    }

    /// Pixel data, row-major, B,G,R per pixel
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Bytes per row
    pub fn pitch(&self) -> usize {
        self.resolution.width as usize * BYTES_PER_PIXEL
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
