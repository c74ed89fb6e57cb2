//! HTTP surface: the multipart stream plus a few small helper routes.

pub mod session;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use session::{SessionRegistry, SessionSettings, StreamFormat, StreamSession};

use crate::pipeline::{Activity, FrameRelay, LifecycleMonitor};
use crate::{Config, PipelineStats};

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<FrameRelay>,
    pub sessions: Arc<SessionRegistry>,
    pub monitor: LifecycleMonitor,
    pub settings: Arc<SessionSettings>,
    /// Where `video_feed` is mounted
    pub stream_path: Arc<str>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        relay: Arc<FrameRelay>,
        monitor: LifecycleMonitor,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            relay,
            sessions: Arc::new(SessionRegistry::new()),
            monitor,
            settings: Arc::new(SessionSettings {
                format: StreamFormat::from_config(&config.stream),
                keepalive: config.stream.keepalive(),
                on_failure: config.lifecycle.on_failure,
            }),
            stream_path: config.stream.path.as_str().into(),
            cancel,
        }
    }

    pub fn open_session(&self) -> StreamSession {
        StreamSession::new(
            self.relay.clone(),
            &self.sessions,
            self.monitor.clone(),
            self.settings.clone(),
            self.cancel.clone(),
        )
    }

    pub fn stats(&self) -> PipelineStats {
        let camera = self.monitor.status();
        PipelineStats {
            frames_published: self.relay.published(),
            frames_dropped: self.relay.dropped(),
            current_version: self.relay.version(),
            active_sessions: self.sessions.active(),
            idle: self.relay.watchdog().check_idle() == Activity::Idle,
            camera: (*camera).clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let stream_path = state.stream_path.clone();
    Router::new()
        .route("/", get(index))
        .route(&stream_path, get(video_feed))
        .route("/frame.jpg", get(snapshot))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(state: AppState, config: &Config) -> std::io::Result<()> {
    let cancel = state.cancel.clone();
    let app = router(state);
    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(
        "Streaming on http://{}{}",
        listener.local_addr()?,
        config.stream.path
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn index(State(state): State<AppState>) -> String {
    format!("Go to {} to view the camera stream.", state.stream_path)
}

/// Stream frames as `multipart/x-mixed-replace` until the client goes away.
async fn video_feed(State(state): State<AppState>) -> Response {
    let session = state.open_session();
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(session.run(tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, state.settings.format.content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Latest frame as a single image. Wakes a suspended camera and waits one keepalive for it.
async fn snapshot(State(state): State<AppState>) -> Response {
    let frame = if state.relay.watchdog().is_suspended() {
        state
            .relay
            .wait_for_next(state.relay.version(), state.settings.keepalive)
            .await
            .ok()
    } else {
        state.relay.watchdog().on_activity();
        state.relay.latest()
    };

    match frame {
        Some((frame, version)) => (
            [
                (header::CONTENT_TYPE, state.settings.format.mime.to_string()),
                (header::HeaderName::from_static("x-frame-version"), version.to_string()),
            ],
            frame.data,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.stats())
}
