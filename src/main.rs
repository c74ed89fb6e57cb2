//! camstream: continuous camera capture served as a multipart HTTP stream

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use camstream::capture::build_source;
use camstream::pipeline::{
    CameraLifecycleManager, CaptureWorker, FrameRelay, IdleWatchdog, TransformPipeline,
    WorkerExit, WorkerSettings,
};
use camstream::server::{self, AppState};
use camstream::{CaptureBackend, Config, FailurePolicy, CONFIG};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about = "Stream a camera as multipart/x-mixed-replace over HTTP")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Device index, path or `auto`
    #[arg(short, long)]
    device: Option<String>,
    #[arg(long, value_parser = parse_backend)]
    backend: Option<CaptureBackend>,
    /// Listen address, e.g. 0.0.0.0:5000
    #[arg(short, long)]
    bind: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    /// JPEG quality, 1-100
    #[arg(short, long)]
    quality: Option<u8>,
    /// Suspend capture after this long without viewers; 0 disables
    #[arg(long)]
    idle_timeout_ms: Option<u64>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    backoff_ms: Option<u64>,
    #[arg(long, value_parser = parse_failure_policy)]
    failure_policy: Option<FailurePolicy>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(device) = self.device {
            config.capture.device = device;
        }
        if let Some(backend) = self.backend {
            config.capture.backend = backend;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(quality) = self.quality {
            config.transform.jpeg_quality = quality;
        }
        if let Some(timeout) = self.idle_timeout_ms {
            config.idle.timeout_ms = timeout;
        }
        if let Some(retries) = self.max_retries {
            config.lifecycle.max_recovery_attempts = retries;
        }
        if let Some(backoff) = self.backoff_ms {
            config.lifecycle.backoff_initial_ms = backoff;
        }
        if let Some(policy) = self.failure_policy {
            config.lifecycle.on_failure = policy;
        }
    }
}

fn parse_backend(value: &str) -> Result<CaptureBackend, String> {
    match value {
        "v4l2" => Ok(CaptureBackend::V4l2),
        "gstreamer" => Ok(CaptureBackend::Gstreamer),
        "test" => Ok(CaptureBackend::Test),
        other => Err(format!("unknown backend `{other}` (v4l2, gstreamer, test)")),
    }
}

fn parse_failure_policy(value: &str) -> Result<FailurePolicy, String> {
    match value {
        "fail-fast" => Ok(FailurePolicy::FailFast),
        "retry-slowly" => Ok(FailurePolicy::RetrySlowly),
        other => Err(format!("unknown failure policy `{other}` (fail-fast, retry-slowly)")),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();
    #[cfg(not(feature = "profiling"))]
    registry.init();
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                },
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        info!("Shutdown requested");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    CONFIG.store(Arc::new(config));
    let config = CONFIG.load_full();

    info!("camstream launching ({:?} backend)", config.capture.backend);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let source = build_source(&config.capture)?;
    let manager =
        CameraLifecycleManager::new(source, config.capture.clone(), config.lifecycle.clone());
    let monitor = manager.monitor();
    let pipeline = TransformPipeline::from_config(&config.transform, config.stream.encoding);
    let watchdog = Arc::new(IdleWatchdog::new(config.idle.threshold()));
    let relay = Arc::new(FrameRelay::new(watchdog));

    let worker = CaptureWorker::new(
        manager,
        pipeline,
        relay.clone(),
        cancel.clone(),
        WorkerSettings::from_config(&config),
    )
    .spawn()?;

    // The server stops whenever the worker does, whatever the reason
    let worker_exit = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let exit = worker
                .join()
                .map_err(|_| eyre!("capture worker panicked"));
            cancel.cancel();
            exit
        })
    };

    let state = AppState::new(relay, monitor, &config, cancel.clone());
    let served = server::serve(state, &config).await;
    if let Err(e) = &served {
        error!("HTTP server error: {}", e);
        cancel.cancel();
    }

    let exit = worker_exit.await??;
    served?;
    info!("camstream shutting down");
    Ok(match exit {
        WorkerExit::Shutdown => ExitCode::SUCCESS,
        WorkerExit::CameraFailed { frames_published } => {
            error!("Camera failed after {} published frames", frames_published);
            ExitCode::FAILURE
        }
    })
}
