//! Callback handlers. Each forwards an authorized job report to the coordinator.

use axum::Extension;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::state::CallbackState;
use crate::auth::AuthorizedRun;
use crate::core::types::RunStatusUpdate;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusRequest {
    pub run_id: String,
    pub status: String,
    #[serde(default)]
    pub add: u32,
    #[serde(default)]
    pub change: u32,
    #[serde(default)]
    pub destroy: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub run_id: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    success: bool,
}

type Reply = Result<Json<Ack>, StatusCode>;

pub(super) async fn health() -> &'static str {
    "ok"
}

/// POST /v1/runs/status - forward a status and change summary.
pub(super) async fn update_run_status(
    State(state): State<CallbackState>,
    Extension(caller): Extension<AuthorizedRun>,
    payload: Result<Json<RunStatusRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = payload.map_err(reject)?;
    ensure_same_run(&caller, &request.run_id)?;
    if request.status.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let update = RunStatusUpdate {
        status: request.status,
        add: request.add,
        change: request.change,
        destroy: request.destroy,
    };
    forward(
        state
            .coordinator
            .update_run_status(&request.run_id, &update)
            .await,
        "update run status",
    )
}

/// POST /v1/plans/upload - store the base64 plan file.
pub(super) async fn upload_plan(
    State(state): State<CallbackState>,
    Extension(caller): Extension<AuthorizedRun>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = payload.map_err(reject)?;
    ensure_same_run(&caller, &request.run_id)?;
    forward(
        state
            .coordinator
            .upload_plan(&request.run_id, &request.content)
            .await,
        "upload plan",
    )
}

/// POST /v1/logs/stream - append a live log chunk.
pub(super) async fn stream_logs(
    State(state): State<CallbackState>,
    Extension(caller): Extension<AuthorizedRun>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = payload.map_err(reject)?;
    ensure_same_run(&caller, &request.run_id)?;
    forward(
        state
            .coordinator
            .append_logs(&request.run_id, &request.content)
            .await,
        "stream logs",
    )
}

/// POST /v1/logs/upload - replace the stored log.
pub(super) async fn upload_logs(
    State(state): State<CallbackState>,
    Extension(caller): Extension<AuthorizedRun>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = payload.map_err(reject)?;
    ensure_same_run(&caller, &request.run_id)?;
    forward(
        state
            .coordinator
            .upload_logs(&request.run_id, &request.content)
            .await,
        "upload logs",
    )
}

fn reject(rejection: JsonRejection) -> StatusCode {
    debug!(error = %rejection, "rejected callback body");
    StatusCode::BAD_REQUEST
}

/// A token only speaks for the run it was minted for.
fn ensure_same_run(caller: &AuthorizedRun, body_run_id: &str) -> Result<(), StatusCode> {
    if caller.0 == body_run_id {
        Ok(())
    } else {
        warn!(
            header_run_id = %caller.0,
            body_run_id,
            "callback body names a different run"
        );
        Err(StatusCode::FORBIDDEN)
    }
}

fn forward(result: anyhow::Result<()>, what: &str) -> Reply {
    match result {
        Ok(()) => Ok(Json(Ack { success: true })),
        Err(err) => {
            warn!(error = %format!("{err:#}"), what, "coordinator rejected callback");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}
