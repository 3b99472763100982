use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::stream::relay::DEFAULT_QUEUE_SIZE;
use crate::video::encoder::DEFAULT_JPEG_QUALITY;
use crate::video::source::FfmpegOptions;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Streaming pipeline settings
    pub stream: StreamConfig,
    /// Web server settings
    pub web: WebConfig,
}

impl AppConfig {
    /// Load a JSON configuration file
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = serde_json::from_str(&content).map_err(|e| {
            AppError::Config(format!("Invalid config file {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()
    }
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Source media path or URI
    pub source: String,
    /// Target frame rate
    pub fps: f64,
    /// Relay queue capacity
    pub queue_size: usize,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// ffmpeg binary
    pub ffmpeg_path: String,
    /// ffprobe binary
    pub ffprobe_path: String,
    /// Per-subscriber send timeout in milliseconds, 0 disables it
    pub send_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source: "BigBuckBunny_640x360.mp4".to_string(),
            fps: 24.0,
            queue_size: DEFAULT_QUEUE_SIZE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            send_timeout_ms: 0,
        }
    }
}

impl StreamConfig {
    pub fn ffmpeg_options(&self) -> FfmpegOptions {
        FfmpegOptions {
            location: self.source.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffprobe_path: self.ffprobe_path.clone(),
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(AppError::Config("stream source must not be empty".to_string()));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(AppError::Config(format!(
                "fps must be a positive number, got {}",
                self.fps
            )));
        }
        crate::video::pacer::frame_interval(self.fps)?;
        if self.queue_size == 0 {
            return Err(AppError::Config("queue_size must be at least 1".to_string()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(AppError::Config(format!(
                "jpeg_quality must be within 1-100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
    /// Directory served under /static
    pub static_dir: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
            static_dir: "static".to_string(),
        }
    }
}
