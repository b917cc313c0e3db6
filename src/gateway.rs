//! HTTP gateway for remote operations.
//!
//! `POST /api/egress` takes the same JSON arguments as the `egress_control`
//! tool and answers with its `{success, message, data}` response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tools::egress_control::EgressControlTool;

#[derive(Clone)]
struct AppState {
    tool: Arc<EgressControlTool>,
}

async fn handle_operation(
    State(state): State<AppState>,
    Json(args): Json<Value>,
) -> axum::response::Response {
    if !args.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "request body must be a JSON object",
                "data": null
            })),
        )
            .into_response();
    }
    let resp = state.tool.dispatch(&args).await;
    (StatusCode::OK, Json(resp)).into_response()
}

async fn handle_status(State(state): State<AppState>) -> axum::response::Response {
    let resp = state.tool.dispatch(&json!({ "action": "get_status" })).await;
    (StatusCode::OK, Json(resp)).into_response()
}

async fn handle_liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(tool: Arc<EgressControlTool>) -> Router {
    Router::new()
        .route("/health", get(handle_liveness))
        .route("/api/egress", post(handle_operation))
        .route("/api/egress/status", get(handle_status))
        .with_state(AppState { tool })
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    tool: Arc<EgressControlTool>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gateway: listening on {}", listener.local_addr()?);
    axum::serve(listener, router(tool))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("gateway: stopped");
    Ok(())
}
