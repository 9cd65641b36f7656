//! HTTP endpoints for event-driven mode.
//!
//! Pub/Sub push subscriptions and storage notifications are delivered as
//! HTTP POSTs; each request runs one trigger handler to completion.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/pubsub/push` | Pub/Sub push envelope carrying `{text, doc_title}` |
//! | `POST` | `/events/storage` | Object-finalize notification for an uploaded scan |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "missing_blob", "message": "missing blob: json/case3-*" } }
//! ```
//!
//! A non-2xx status makes Pub/Sub redeliver the message.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use casefile_core::error::{classify, ErrorKind};
use casefile_core::message::PipelineMessage;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::context::PipelineContext;
use crate::trigger;

#[derive(Clone)]
struct AppState {
    ctx: Arc<PipelineContext>,
}

/// Routes over a shared run context.
pub fn router(ctx: Arc<PipelineContext>) -> Router {
    Router::new()
        .route("/pubsub/push", post(handle_pubsub_push))
        .route("/events/storage", post(handle_storage_event))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { ctx })
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(ctx: Arc<PipelineContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let app = router(ctx);

    println!("casefile listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let kind = classify(&err);
        let status = match kind {
            ErrorKind::MissingBlob => StatusCode::NOT_FOUND,
            ErrorKind::StageTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Engine => StatusCode::BAD_GATEWAY,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Configuration | ErrorKind::AssertionFailure | ErrorKind::Other => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let code = match kind {
            ErrorKind::Other => "internal",
            other => other.as_str(),
        };
        AppError {
            status,
            code: code.to_string(),
            message: format!("{:#}", err),
        }
    }
}

// ============ POST /pubsub/push ============

#[derive(Deserialize)]
struct PushEnvelope {
    message: PushMessage,
    #[serde(default)]
    subscription: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Serialize)]
struct HandledResponse {
    status: String,
    doc_title: Option<String>,
}

async fn handle_pubsub_push(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> Result<Json<HandledResponse>, AppError> {
    let data = envelope
        .message
        .data
        .ok_or_else(|| bad_request("push message has no data"))?;
    PipelineMessage::decode(&data).map_err(|e| bad_request(format!("{:#}", e)))?;
    tracing::debug!(
        message_id = envelope.message.message_id.as_deref().unwrap_or("-"),
        subscription = envelope.subscription.as_deref().unwrap_or("-"),
        "push received"
    );

    let title = trigger::handle_translation_message(&state.ctx, &data).await?;
    Ok(Json(HandledResponse {
        status: "processed".to_string(),
        doc_title: Some(title.to_string()),
    }))
}

// ============ POST /events/storage ============

/// The fields of a storage object resource this endpoint reads.
#[derive(Deserialize)]
struct StorageObject {
    name: String,
    #[serde(default)]
    bucket: Option<String>,
}

async fn handle_storage_event(
    State(state): State<AppState>,
    Json(object): Json<StorageObject>,
) -> Result<Json<HandledResponse>, AppError> {
    if let Some(bucket) = &object.bucket {
        if bucket != state.ctx.objects.bucket() {
            return Err(bad_request(format!(
                "event for bucket {} but serving {}",
                bucket,
                state.ctx.objects.bucket()
            )));
        }
    }

    let handled = trigger::handle_pdf_uploaded(&state.ctx, &object.name).await?;
    Ok(Json(HandledResponse {
        status: if handled.is_some() { "processed" } else { "ignored" }.to_string(),
        doc_title: handled.map(|t| t.to_string()),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
