//! Frame source backed by an external decoder process
//!
//! The decoder (ffmpeg) writes raw BGR24 frames to its stdout. The adapter
//! reads exactly one frame's worth of bytes per call and restarts the
//! process whenever the source reaches its end, so consumers see an
//! endless stream whose sequence numbers restart at 0 on every loop.
//!
//! ```text
//! ffmpeg -i <source> -f rawvideo -pix_fmt bgr24 - ──stdout──> FfmpegSource::next_frame()
//!        ^                                                            │
//!        └───────────── respawn on clean EOF (loop) ◄─────────────────┘
//! ```

use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::frame::{Frame, Resolution};
use crate::error::{AppError, Result};

/// A source of raw frames
///
/// Implementations hand out frames one at a time. `close` releases any
/// external resources and must be safe to call more than once.
#[async_trait]
pub trait FrameSource: Send {
    /// Dimensions of every frame this source produces
    fn resolution(&self) -> Resolution;

    /// Read the next frame
    ///
    /// Fails with `AppError::SourceTerminated` when no more frames can be
    /// produced.
    async fn next_frame(&mut self) -> Result<Frame>;

    /// Release the source
    async fn close(&mut self);
}

/// Locations of the external tools and the media to decode
#[derive(Debug, Clone)]
pub struct FfmpegOptions {
    /// Source path or URI
    pub location: String,
    /// ffmpeg binary
    pub ffmpeg_path: String,
    /// ffprobe binary
    pub ffprobe_path: String,
}

impl FfmpegOptions {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

/// Program and arguments used to (re)start the decoder process
#[derive(Debug, Clone)]
pub struct SourceCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SourceCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Decoder command emitting raw BGR24 frames on stdout
    pub fn ffmpeg_rawvideo(ffmpeg_path: &str, location: &str) -> Self {
        Self::new(ffmpeg_path)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-nostdin")
            .arg("-i")
            .arg(location)
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-")
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Running decoder process with its output pipe
struct DecoderProcess {
    child: Child,
    stdout: ChildStdout,
}

impl DecoderProcess {
    fn start(command: &SourceCommand) -> std::io::Result<Self> {
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("decoder stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(command.program.clone(), stderr));
        }

        debug!("Decoder process started with PID {:?}", child.id());
        Ok(Self { child, stdout })
    }

    /// Terminate the process and reap it
    async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Decoder kill request failed: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => debug!("Decoder process exited: {}", status),
            Err(e) => warn!("Failed to wait for decoder process: {}", e),
        }
    }
}

/// Log decoder diagnostics line by line
async fn forward_stderr(program: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!(decoder = %program, "{}", line);
        }
    }
}

/// Outcome of trying to fill a frame buffer
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Complete,
    /// EOF after this many bytes
    Eof(usize),
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(ReadOutcome::Eof(filled));
        }
        filled += n;
    }
    Ok(ReadOutcome::Complete)
}

/// Frame source reading raw frames from an ffmpeg child process
pub struct FfmpegSource {
    location: String,
    command: SourceCommand,
    resolution: Resolution,
    process: Option<DecoderProcess>,
    /// Sequence number of the next frame
    sequence: u64,
    /// Number of completed passes over the source
    loops: u64,
}

impl FfmpegSource {
    /// Probe `options.location` and start decoding it
    pub async fn open(options: &FfmpegOptions) -> Result<Self> {
        let resolution = probe_resolution(&options.ffprobe_path, &options.location).await?;
        info!("Probed source {} at {}", options.location, resolution);

        let command = SourceCommand::ffmpeg_rawvideo(&options.ffmpeg_path, &options.location);
        Self::from_command(options.location.clone(), command, resolution)
    }

    /// Start a source from an arbitrary command producing raw BGR24 frames
    pub fn from_command(
        location: impl Into<String>,
        command: SourceCommand,
        resolution: Resolution,
    ) -> Result<Self> {
        let location = location.into();

        if !resolution.is_valid() {
            return Err(AppError::SourceUnavailable {
                location,
                reason: format!("invalid frame dimensions {}", resolution),
            });
        }

        let process = DecoderProcess::start(&command).map_err(|e| AppError::SourceUnavailable {
            location: location.clone(),
            reason: format!("failed to start {}: {}", command.program, e),
        })?;

        Ok(Self {
            location,
            command,
            resolution,
            process: Some(process),
            sequence: 0,
            loops: 0,
        })
    }

    /// Source path or URI
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Handle a clean EOF: restart if the pass was healthy
    async fn restart_after_eof(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            return Err(AppError::SourceTerminated("source closed".to_string()));
        };

        let status = process.child.wait().await.map_err(|e| {
            AppError::SourceTerminated(format!("failed to reap decoder: {}", e))
        })?;
        check_exit_status(status)?;

        if self.sequence == 0 {
            return Err(AppError::SourceTerminated(
                "decoder produced no frames".to_string(),
            ));
        }

        self.loops += 1;
        info!(
            source = %self.location,
            frames = self.sequence,
            loops = self.loops,
            "End of source reached, looping"
        );

        let process = DecoderProcess::start(&self.command).map_err(|e| {
            AppError::SourceTerminated(format!("failed to restart {}: {}", self.command.program, e))
        })?;
        self.process = Some(process);
        self.sequence = 0;
        Ok(())
    }
}

fn check_exit_status(status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(AppError::SourceTerminated(format!(
            "decoder exited unexpectedly: {}",
            status
        )))
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        let frame_size = self.resolution.frame_size();

        loop {
            let process = self
                .process
                .as_mut()
                .ok_or_else(|| AppError::SourceTerminated("source closed".to_string()))?;

            let mut buf = BytesMut::zeroed(frame_size);
            let outcome = read_full(&mut process.stdout, &mut buf)
                .await
                .map_err(|e| AppError::SourceTerminated(format!("read failed: {}", e)))?;

            match outcome {
                ReadOutcome::Complete => {
                    let frame = Frame::new(buf.freeze(), self.resolution, self.sequence);
                    self.sequence += 1;
                    return Ok(frame);
                }
                ReadOutcome::Eof(0) => self.restart_after_eof().await?,
                ReadOutcome::Eof(n) => {
                    return Err(AppError::SourceTerminated(format!(
                        "truncated frame: got {} of {} bytes",
                        n, frame_size
                    )));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(process) = self.process.take() {
            info!(source = %self.location, loops = self.loops, "Closing frame source");
            process.shutdown().await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Extract the first video stream's dimensions from ffprobe JSON output
fn parse_probe_output(output: &[u8]) -> std::result::Result<Resolution, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(output).map_err(|e| format!("unreadable probe output: {}", e))?;

    let stream = probe
        .streams
        .first()
        .ok_or_else(|| "no video stream found".to_string())?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            Ok(Resolution::new(width, height))
        }
        _ => Err("video stream has no dimensions".to_string()),
    }
}

/// Ask ffprobe for the dimensions of the first video stream
pub async fn probe_resolution(ffprobe_path: &str, location: &str) -> Result<Resolution> {
    let unavailable = |reason: String| AppError::SourceUnavailable {
        location: location.to_string(),
        reason,
    };

    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
            location,
        ])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| unavailable(format!("failed to run {}: {}", ffprobe_path, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(unavailable(format!(
            "probe failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_probe_output(&output.stdout).map_err(unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SourceCommand {
        SourceCommand::new("sh").arg("-c").arg(script)
    }

    // 2x2 BGR24 = 12 bytes per frame
    const TINY: Resolution = Resolution::new(2, 2);

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{"programs":[],"streams":[{"width":640,"height":360}]}"#;
        assert_eq!(parse_probe_output(json).unwrap(), Resolution::new(640, 360));
    }

    #[test]
    fn test_parse_probe_output_without_stream() {
        assert!(parse_probe_output(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe_output(br#"{}"#).is_err());
        assert!(parse_probe_output(br#"{"streams":[{"width":0,"height":360}]}"#).is_err());
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[test]
    fn test_ffmpeg_command_args() {
        let cmd = SourceCommand::ffmpeg_rawvideo("ffmpeg", "clip.mp4");
        assert_eq!(cmd.program, "ffmpeg");
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-i clip.mp4"));
        assert!(joined.contains("-f rawvideo -pix_fmt bgr24 -"));
    }

    #[tokio::test]
    async fn test_reads_frames_and_loops() {
        let mut source =
            FfmpegSource::from_command("zeros", sh("head -c 24 /dev/zero"), TINY).unwrap();

        let mut sequences = Vec::new();
        for _ in 0..5 {
            let frame = source.next_frame().await.unwrap();
            assert_eq!(frame.data().len(), 12);
            sequences.push(frame.sequence());
        }

        assert_eq!(sequences, vec![0, 1, 0, 1, 0]);
        assert_eq!(source.loops, 2);
        source.close().await;
    }

    #[tokio::test]
    async fn test_truncated_frame_terminates() {
        let mut source =
            FfmpegSource::from_command("short", sh("head -c 18 /dev/zero"), TINY).unwrap();

        assert!(source.next_frame().await.is_ok());
        let err = source.next_frame().await.unwrap_err();
        assert!(matches!(err, AppError::SourceTerminated(_)));
        source.close().await;
    }

    #[tokio::test]
    async fn test_failed_exit_terminates() {
        let mut source = FfmpegSource::from_command("broken", sh("exit 3"), TINY).unwrap();
        let err = source.next_frame().await.unwrap_err();
        assert!(matches!(err, AppError::SourceTerminated(_)));
    }

    #[tokio::test]
    async fn test_empty_source_does_not_spin() {
        let mut source = FfmpegSource::from_command("empty", sh("true"), TINY).unwrap();
        let err = source.next_frame().await.unwrap_err();
        assert!(matches!(err, AppError::SourceTerminated(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut source =
            FfmpegSource::from_command("endless", sh("cat /dev/zero"), TINY).unwrap();
        assert!(source.next_frame().await.is_ok());

        source.close().await;
        source.close().await;

        let err = source.next_frame().await.unwrap_err();
        assert!(matches!(err, AppError::SourceTerminated(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let result = FfmpegSource::from_command(
            "clip.mp4",
            SourceCommand::new("/nonexistent/decoder-binary"),
            TINY,
        );
        assert!(matches!(result, Err(AppError::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_unavailable() {
        let result = probe_resolution("/nonexistent/ffprobe", "clip.mp4").await;
        assert!(matches!(result, Err(AppError::SourceUnavailable { .. })));
    }
}
