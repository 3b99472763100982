//! Frame production: decoding, encoding and pacing

pub mod encoder;
pub mod frame;
pub mod pacer;
pub mod source;

pub use encoder::{FrameEncoder, JpegEncoder, Payload, PayloadMeta};
pub use frame::{Frame, Resolution};
pub use pacer::Pacer;
pub use source::{FfmpegOptions, FfmpegSource, FrameSource, SourceCommand};
