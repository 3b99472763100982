//! Pacing scheduler
//!
//! Drives the read -> encode -> enqueue cycle at the target frame rate.
//! Each iteration measures its own processing time and sleeps for the rest
//! of the frame interval; there is no long-term clock correction, so an
//! iteration that overruns simply starts the next one immediately.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encoder::FrameEncoder;
use super::source::FrameSource;
use crate::error::{AppError, Result};
use crate::stream::pipeline::PipelineCounters;
use crate::stream::relay::RelaySender;
use crate::utils::LogThrottler;

/// Frame interval for `fps`
pub fn frame_interval(fps: f64) -> Result<Duration> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(AppError::Config(format!("invalid frame rate: {}", fps)));
    }
    Duration::try_from_secs_f64(1.0 / fps)
        .map_err(|e| AppError::Config(format!("frame rate {} out of range: {}", fps, e)))
}

/// Sole producer of the relay queue
pub struct Pacer<S, E> {
    source: S,
    encoder: E,
    relay: RelaySender,
    fps: f64,
    interval: Duration,
    counters: Arc<PipelineCounters>,
    throttler: LogThrottler,
}

impl<S, E> Pacer<S, E>
where
    S: FrameSource,
    E: FrameEncoder,
{
    pub fn new(
        source: S,
        encoder: E,
        relay: RelaySender,
        fps: f64,
        counters: Arc<PipelineCounters>,
    ) -> Result<Self> {
        let interval = frame_interval(fps)?;
        Ok(Self {
            source,
            encoder,
            relay,
            fps,
            interval,
            counters,
            throttler: LogThrottler::default(),
        })
    }

    /// Run until cancelled or until the source fails
    ///
    /// The source is closed on every exit path. Returns the fatal source
    /// error, if any.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Pacer started: {} @ {} fps, encoder {}",
            self.source.resolution(),
            self.fps,
            self.encoder.name()
        );

        let result = self.pace(&cancel).await;
        self.source.close().await;

        match &result {
            Ok(()) => info!("Pacer stopped"),
            Err(e) => warn!("Pacer stopped: {}", e),
        }
        result
    }

    async fn pace(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let started = Instant::now();

            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                frame = self.source.next_frame() => frame?,
            };
            self.counters.frames_produced.fetch_add(1, Ordering::Relaxed);

            match self.encoder.encode(&frame, frame.sequence(), self.fps) {
                Ok(payload) => {
                    if !self.relay.try_enqueue(Arc::new(payload)) {
                        let dropped =
                            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if self.throttler.should_log("frame_dropped") {
                            debug!(dropped, "Relay queue full, dropping frames");
                        }
                    }
                }
                Err(e) => {
                    self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                    if self.throttler.should_log("encode_error") {
                        warn!(sequence = frame.sequence(), "Encode failed, skipping frame: {}", e);
                    }
                }
            }

            let remaining = self.interval.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        }
    }
}
