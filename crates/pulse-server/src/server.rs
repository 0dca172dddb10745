use std::any::Any;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::{DateTime, Utc};
use pulse_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::channel::{self, ChannelStore};
use crate::config::ServerConfig;
use crate::handlers;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ChannelStore>,
    pub metrics: Arc<MetricsRecorder>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            store: Arc::new(ChannelStore::new(
                config.channel_settings(),
                Arc::clone(&metrics),
            )),
            metrics,
            started_at: Utc::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/events", any(handlers::subscribe_default))
        .route("/events/sse", any(handlers::subscribe_default))
        .route("/calculator/sse", any(handlers::subscribe_default))
        .route("/channels/{channel}/events", any(handlers::subscribe_channel))
        .route("/broadcast", any(handlers::broadcast_default))
        .route("/channels/{channel}/broadcast", any(handlers::broadcast_channel))
        .route("/clients/{id}/send", any(handlers::send_default))
        .route(
            "/channels/{channel}/clients/{id}/send",
            any(handlers::send_channel),
        )
        .route("/", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .fallback(handlers::not_found)
        .with_state(state);
    with_layers(router)
}

fn with_layers(router: Router) -> Router {
    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "Request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&config, metrics);
    let store = Arc::clone(&state.store);

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    let cleanup = channel::start_cleanup_task(
        Arc::clone(&store),
        config.cleanup_interval(),
        config.channel_idle_timeout(),
    );

    tracing::info!(
        host = %config.host,
        port = local_addr.port(),
        fan_out = ?config.fan_out,
        "Pulse server started"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone().cancelled_owned();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
        {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        store,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`; owns the server and cleanup tasks.
pub struct ServerHandle {
    pub port: u16,
    store: Arc<ChannelStore>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    /// Close every channel, then stop accepting requests and wait for the
    /// server task to finish.
    pub async fn shutdown(self) {
        let closed = self.store.close_all();
        tracing::info!(closed_connections = closed, "Shutting down");
        self.cleanup.abort();
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task ended abnormally");
        }
    }
}
