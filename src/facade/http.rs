use crate::bus::EventBus;
use crate::facade::rpc::McpFacade;
use anyhow::{Context, Result};
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_QUERY: &str = "apikey";

/// Shared state for the HTTP façade.
#[derive(Clone)]
pub struct HttpState {
    facade: Arc<McpFacade>,
    bus: EventBus,
    /// `None` disables auth (explicit empty key, or the Unix-socket
    /// listener whose trust boundary is filesystem permissions).
    api_key: Option<Arc<String>>,
    hsts: bool,
}

impl HttpState {
    pub fn new(facade: Arc<McpFacade>, bus: EventBus, api_key: Option<String>, hsts: bool) -> Self {
        let api_key = api_key.filter(|key| !key.is_empty()).map(Arc::new);
        Self {
            facade,
            bus,
            api_key,
            hsts,
        }
    }

    /// The same surface with auth stripped, for the local-IPC socket.
    pub fn without_auth(&self) -> Self {
        Self {
            facade: self.facade.clone(),
            bus: self.bus.clone(),
            api_key: None,
            hsts: false,
        }
    }

    fn authorize(&self, headers: &HeaderMap, raw_query: Option<&str>) -> Result<(), StatusCode> {
        let Some(expected) = &self.api_key else {
            return Ok(());
        };

        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
            .or_else(|| {
                raw_query.and_then(|query| {
                    url::form_urlencoded::parse(query.as_bytes())
                        .find(|(key, _)| key == API_KEY_QUERY)
                        .map(|(_, value)| value.to_string())
                })
            });

        match presented {
            Some(presented)
                if presented.as_bytes().ct_eq(expected.as_bytes()).into() =>
            {
                Ok(())
            }
            Some(_) => {
                warn!("request with wrong API key rejected");
                Err(StatusCode::UNAUTHORIZED)
            }
            None => Err(StatusCode::UNAUTHORIZED),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/events", get(events_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

/// POST /mcp: JSON-RPC in, JSON-RPC out. Notification-only payloads get
/// 202 with an empty body.
async fn mcp_handler(
    State(state): State<HttpState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(status) = state.authorize(&headers, query.as_deref()) {
        return hsts_wrap(state.hsts, status.into_response());
    }

    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return hsts_wrap(
                state.hsts,
                (StatusCode::OK, Json(McpFacade::parse_error())).into_response(),
            );
        }
    };

    let response = match state.facade.handle_value(payload).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    hsts_wrap(state.hsts, response)
}

/// GET /events is an SSE stream: one `snapshot` event, then live deltas. A
/// lagging consumer is disconnected rather than allowed to backpressure
/// the bus.
async fn events_handler(
    State(state): State<HttpState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers, query.as_deref()) {
        return hsts_wrap(state.hsts, status.into_response());
    }

    let (snapshot, rx) = state.bus.subscribe();
    let first = Event::default()
        .event("snapshot")
        .data(serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()));

    let deltas = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(data) = serde_json::to_string(&event) else {
                        continue;
                    };
                    let sse_event = Event::default().event(event.kind()).data(data);
                    return Some((sse_event, rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("SSE subscriber lagged by {} events; disconnecting", missed);
                    return None;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let events: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(stream::once(async move { first }).chain(deltas).map(Ok));

    let response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    hsts_wrap(state.hsts, response)
}

fn hsts_wrap(enabled: bool, mut response: Response) -> Response {
    if enabled {
        response.headers_mut().insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

/// Serve the façade over TCP (with optional TLS/mTLS) and, on Unix, over a
/// local-IPC socket that bypasses API-key auth.
pub async fn serve_http(
    state: HttpState,
    listen: SocketAddr,
    socket_path: Option<std::path::PathBuf>,
    tls: Option<axum_server::tls_rustls::RustlsConfig>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    #[cfg(unix)]
    if let Some(path) = socket_path {
        let app = build_router(state.without_auth());
        let _ = std::fs::remove_file(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match tokio::net::UnixListener::bind(&path) {
            Ok(listener) => {
                info!("local IPC socket listening on {}", path.display());
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        warn!("unix socket façade stopped: {}", e);
                    }
                });
            }
            Err(e) => warn!("could not bind IPC socket {}: {}", path.display(), e),
        }
    }
    #[cfg(not(unix))]
    let _ = socket_path;

    let app = build_router(state);
    match tls {
        Some(tls_config) => {
            info!("MCP façade listening on https://{}", listen);
            let server = axum_server::bind_rustls(listen, tls_config)
                .serve(app.into_make_service());
            tokio::select! {
                result = server => result.context("TLS façade failed")?,
                _ = shutdown.changed() => {}
            }
        }
        None => {
            use std::future::IntoFuture;
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("cannot bind {}", listen))?;
            info!("MCP façade listening on http://{}", listen);
            let server = axum::serve(listener, app).into_future();
            tokio::select! {
                result = server => result.context("façade failed")?,
                _ = shutdown.changed() => {}
            }
        }
    }
    Ok(())
}
