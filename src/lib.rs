//! frame-relay - real-time video frame relay
//!
//! Decodes a video source, paces it at a target frame rate, compresses
//! each frame to JPEG and broadcasts it to every connected WebSocket
//! viewer.

pub mod config;
pub mod error;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;

pub use error::{AppError, Result};
