use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frame_relay::config::AppConfig;
use frame_relay::stream::{PipelineHandle, StreamPipeline};
use frame_relay::web::{self, AppState};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// frame-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "frame-relay")]
#[command(version, about = "Stream a video source to WebSocket viewers as JPEG frames", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video source path or URI (overrides config)
    #[arg(short = 's', long, value_name = "SOURCE")]
    source: Option<String>,

    /// Target frame rate (overrides config)
    #[arg(long, value_name = "FPS")]
    fps: Option<f64>,

    /// Relay queue capacity (overrides config)
    #[arg(long, value_name = "N")]
    queue_size: Option<usize>,

    /// JPEG quality 1-100 (overrides config)
    #[arg(long, value_name = "QUALITY")]
    quality: Option<u8>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Directory served under /static (overrides config)
    #[arg(long, value_name = "DIR")]
    static_dir: Option<String>,

    /// ffmpeg binary (overrides config)
    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<String>,

    /// ffprobe binary (overrides config)
    #[arg(long, value_name = "PATH")]
    ffprobe: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting frame-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    tracing::info!(
        "Source: {} @ {} fps, queue size {}",
        config.stream.source,
        config.stream.fps,
        config.stream.queue_size
    );

    let pipeline = Arc::new(
        StreamPipeline::start(&config.stream)
            .await
            .context("Failed to start stream pipeline")?,
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.http_port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.web.bind_address, config.web.http_port
            )
        })?;

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            pipeline.stop().await;
            return Err(e).with_context(|| format!("Failed to bind {}", bind_addr));
        }
    };
    tracing::info!("Listening on http://{}", bind_addr);
    tracing::info!("Viewer: http://{}/static/index.html", bind_addr);

    let state = AppState::new(pipeline.clone(), config);
    let app = web::create_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let server = async move { axum::serve(listener, app).await };

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    let result = tokio::select! {
        _ = shutdown_signal => Ok(()),
        result = pipeline.wait() => {
            result.context("Stream pipeline failed")
        }
        result = server => {
            result.context("HTTP server error")
        }
    };

    cleanup(&pipeline).await;
    tracing::info!("Server shutdown complete");
    result
}

fn load_config(args: &CliArgs) -> anyhow::Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            AppConfig::from_file(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(source) = &args.source {
        config.stream.source = source.clone();
    }
    if let Some(fps) = args.fps {
        config.stream.fps = fps;
    }
    if let Some(queue_size) = args.queue_size {
        config.stream.queue_size = queue_size;
    }
    if let Some(quality) = args.quality {
        config.stream.jpeg_quality = quality;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.stream.ffmpeg_path = ffmpeg.clone();
    }
    if let Some(ffprobe) = &args.ffprobe {
        config.stream.ffprobe_path = ffprobe.clone();
    }
    if let Some(address) = &args.address {
        config.web.bind_address = address.clone();
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(static_dir) = &args.static_dir {
        config.web.static_dir = static_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Stop the pipeline and release the source
async fn cleanup(pipeline: &PipelineHandle) {
    pipeline.stop().await;
    let stats = pipeline.stats();
    tracing::info!(
        produced = stats.frames_produced,
        dropped = stats.frames_dropped,
        broadcast = stats.payloads_broadcast,
        send_failures = stats.send_failures,
        "Pipeline stopped ({})",
        stats.state
    );
}

/// Initialize logging with the given level and verbosity
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "frame_relay=error,tower_http=error",
        LogLevel::Warn => "frame_relay=warn,tower_http=warn",
        LogLevel::Info => "frame_relay=info,tower_http=info",
        LogLevel::Verbose => "frame_relay=debug,tower_http=info",
        LogLevel::Debug => "frame_relay=debug,tower_http=debug",
        LogLevel::Trace => "frame_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
