use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use koukoku_engine::Engine;
use koukoku_store::SqliteItemLog;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientRegistry};
use crate::event_bridge;
use crate::handlers;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    /// Expected `Authorization: TOKEN <token>` value for sends.
    pub token: Option<String>,
    /// Answer sends with success without relaying them.
    pub dry_run: bool,
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 80,
            token: None,
            dry_run: false,
            max_send_queue: 256,
            request_timeout_secs: 300,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub log: Arc<SqliteItemLog>,
    pub client_registry: Arc<ClientRegistry>,
    pub token: Option<Arc<str>>,
    pub dry_run: bool,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/say", post(handlers::say_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ping", get(handlers::ping_handler))
        .route("/history", get(handlers::history_handler))
        .fallback(handlers::fallback_handler)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle that stops the server when asked.
pub async fn start(
    config: ServerConfig,
    engine: Arc<Engine>,
    log: Arc<SqliteItemLog>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge_handle =
        event_bridge::create_bridge(Arc::clone(&client_registry), engine.subscribe());

    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), Duration::from_secs(60));

    let app_state = AppState {
        engine,
        log,
        client_registry,
        token: config.token.map(Arc::from),
        dry_run: config.dry_run,
    };

    let router = build_router(app_state, Duration::from_secs(config.request_timeout_secs));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), dry_run = config.dry_run, "relay server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        bridge: bridge_handle,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    bridge: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.cleanup.abort();
        self.bridge.abort();
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "server task ended abnormally"),
            Err(_) => {
                tracing::warn!("in-flight requests outlived shutdown grace, aborting");
                self.server.abort();
            }
        }
        tracing::info!("relay server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, rx) = state.client_registry.register();
    tracing::info!(subscriber = %id, "feed subscriber connected");
    client::handle_ws_connection(socket, id, rx, state.client_registry).await;
}
