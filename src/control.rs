//! HTTP + WebSocket control surface for the watch loop.

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, WatchError};
use crate::events::RecvError;
use crate::ledger::LedgerFilter;
use crate::watch::{WatchController, WatchSnapshot};

/// Entries returned by `/api/ledger` when no limit is given.
const DEFAULT_LEDGER_PAGE: usize = 100;
const MAX_LEDGER_PAGE: usize = 1000;

/// Control-plane frames sent to WebSocket clients, alongside the
/// processing events themselves.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    StatusSync { status: WatchSnapshot },
}

/// Build the router. State is the shared watch controller.
pub fn routes(controller: WatchController) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/watch/status", get(status))
        .route("/api/watch/start", post(start))
        .route("/api/watch/stop", post(stop))
        .route("/api/watch/refresh", post(refresh))
        .route("/api/ledger", get(ledger))
        .route("/api/ledger/sessions", get(ledger_sessions))
        .route("/api/ledger/download", get(ledger_download))
        .layer(CorsLayer::permissive())
        .with_state(controller)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-router"
    }))
}

// ── Watch control ───────────────────────────────────────────────────────

async fn status(State(controller): State<WatchController>) -> Json<WatchSnapshot> {
    Json(controller.status())
}

async fn start(State(controller): State<WatchController>) -> Response {
    snapshot_or_error(controller.start())
}

async fn stop(State(controller): State<WatchController>) -> Response {
    snapshot_or_error(controller.stop())
}

async fn refresh(State(controller): State<WatchController>) -> Response {
    snapshot_or_error(controller.run_once())
}

fn snapshot_or_error(result: Result<WatchSnapshot, WatchError>) -> Response {
    match result {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => {
            let code = match &e {
                WatchError::AlreadyRunning { .. } | WatchError::NotRunning => StatusCode::CONFLICT,
                WatchError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            warn!(error = %e, "Watch control request rejected");
            (code, Json(serde_json::json!({"error": e.to_string()}))).into_response()
        }
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────

async fn ledger(
    State(controller): State<WatchController>,
    Query(filter): Query<LedgerFilter>,
) -> Response {
    let n = filter.limit.unwrap_or(DEFAULT_LEDGER_PAGE).min(MAX_LEDGER_PAGE);
    match controller.ledger().recent(filter, n).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => ledger_error(e),
    }
}

async fn ledger_sessions(State(controller): State<WatchController>) -> Response {
    match controller.ledger().sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => ledger_error(e),
    }
}

/// Matching entries as a JSON Lines attachment.
async fn ledger_download(
    State(controller): State<WatchController>,
    Query(filter): Query<LedgerFilter>,
) -> Response {
    let filename = match filter.session_id {
        Some(id) => format!("ledger-{id}.jsonl"),
        None => "ledger.jsonl".to_string(),
    };
    match controller.ledger().export(filter).await {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            body,
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

fn ledger_error(e: LedgerError) -> Response {
    error!(error = %e, "Ledger query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(controller): State<WatchController>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, controller))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WS frame");
            true
        }
    }
}

async fn send_status(socket: &mut WebSocket, controller: &WatchController) -> bool {
    let sync = ControlFrame::StatusSync {
        status: controller.status(),
    };
    send_json(socket, &sync).await
}

async fn handle_socket(mut socket: WebSocket, controller: WatchController) {
    // Subscribe before the initial sync so nothing published in between is lost.
    let events = controller.subscribe().into_stream();
    let mut events = std::pin::pin!(events);

    if !send_status(&mut socket, &controller).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            item = events.next() => {
                match item {
                    Some(Ok(event)) => {
                        if !send_json(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Some(Err(RecvError::Lagged(n))) => {
                        warn!(missed = n, "WS client lagged behind event bus");
                        if !send_status(&mut socket, &controller).await {
                            break;
                        }
                    }
                    Some(Err(RecvError::Closed)) | None => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{RoutingConfig, WatchConfig};
    use crate::testing::{MemoryMailbox, RecordingOutbound, memory_pipeline, sample_routing};

    fn controller(routing: RoutingConfig, dir: &TempDir) -> WatchController {
        let pipeline = memory_pipeline(
            &MemoryMailbox::new(),
            &RecordingOutbound::new(),
            routing,
            &dir.path().join("ledger.jsonl"),
        );
        WatchController::new(
            pipeline,
            WatchConfig {
                poll_interval: Duration::from_millis(20),
                ..WatchConfig::default()
            },
        )
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn stop_without_session_is_conflict() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(routes(controller(sample_routing(), &dir)), "POST", "/api/watch/stop").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "No watch session is running");
    }

    #[tokio::test]
    async fn bad_config_is_unprocessable() {
        let dir = TempDir::new().unwrap();
        let routing = RoutingConfig {
            review_threshold: 1.5,
            ..sample_routing()
        };
        let (status, _) = call(routes(controller(routing, &dir)), "POST", "/api/watch/start").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn empty_ledger_is_empty_list() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(routes(controller(sample_routing(), &dir)), "GET", "/api/ledger").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn start_then_status_reports_running() {
        let dir = TempDir::new().unwrap();
        let ctrl = controller(sample_routing(), &dir);
        let app = routes(ctrl.clone());

        let (status, _) = call(app.clone(), "POST", "/api/watch/start").await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(app, "GET", "/api/watch/status").await;
        assert_eq!(body["status"], "running");

        ctrl.stop().unwrap();
        ctrl.wait().await;
    }

    #[tokio::test]
    async fn empty_ledger_has_no_sessions() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(routes(controller(sample_routing(), &dir)), "GET", "/api/ledger/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn download_names_the_session() {
        let dir = TempDir::new().unwrap();
        let id = uuid::Uuid::new_v4();
        let resp = routes(controller(sample_routing(), &dir))
            .oneshot(
                Request::builder()
                    .uri(format!("/api/ledger/download?session_id={id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/x-ndjson");
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert_eq!(disposition, format!("attachment; filename=\"ledger-{id}.jsonl\""));
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn status_sync_frame_shape() {
        let dir = TempDir::new().unwrap();
        let frame = ControlFrame::StatusSync {
            status: controller(sample_routing(), &dir).status(),
        };
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["type"], "status_sync");
        assert_eq!(json["status"]["status"], "stopped");
    }
}
