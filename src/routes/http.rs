//! HTTP endpoint handlers. These are thin wrappers that forward to the
//! session controller and reply with the refreshed snapshot (or a typed
//! error). Each handler is instrumented with basic parameter info.

use std::sync::Arc;
use axum::{
  extract::State,
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use tracing::{info, instrument};

use crate::protocol::*;
use crate::session::CommandError;
use crate::state::AppState;

/// Shared reply shape: snapshot on success, status + message on error.
/// Cancelled outcomes never reach here; the controller swallows them.
async fn respond(state: &AppState, res: Result<(), CommandError>) -> Response {
  match res {
    Ok(()) => Json(state.snapshot().await).into_response(),
    Err(e) => {
      let status = match &e {
        CommandError::WrongPhase { .. } => StatusCode::CONFLICT,
        CommandError::EmptyText
        | CommandError::NoGoal
        | CommandError::IndexOutOfRange { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CommandError::Evaluator(_) => StatusCode::BAD_GATEWAY,
      };
      (status, Json(ErrorOut { message: e.to_string() })).into_response()
    }
  }
}

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(state.snapshot().await)
}

#[instrument(level = "info", skip(state, body), fields(topic = %body.topic))]
pub async fn http_post_goal(
  State(state): State<Arc<AppState>>,
  Json(body): Json<SelectGoalIn>,
) -> impl IntoResponse {
  let res = state.controller.select_goal(&body.topic).await;
  info!(target: "session", topic = %body.topic, ok = res.is_ok(), "HTTP select_goal handled");
  respond(&state, res).await
}

#[instrument(level = "info", skip(state, body), fields(text_len = body.text.len()))]
pub async fn http_post_step(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StepIn>,
) -> impl IntoResponse {
  let res = state.controller.submit_step(&body.text).await;
  respond(&state, res).await
}

#[instrument(level = "info", skip(state, body), fields(text_len = body.text.len()))]
pub async fn http_post_final_answer(
  State(state): State<Arc<AppState>>,
  Json(body): Json<FinalAnswerIn>,
) -> impl IntoResponse {
  let res = state.controller.submit_final_answer(&body.text).await;
  respond(&state, res).await
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_move_to_final(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let res = state.controller.move_to_final_answer().await;
  respond(&state, res).await
}

#[instrument(level = "info", skip(state), fields(index = body.index))]
pub async fn http_post_reveal(
  State(state): State<Arc<AppState>>,
  Json(body): Json<RevealIn>,
) -> impl IntoResponse {
  let res = state.controller.reveal_step(body.index).await;
  respond(&state, res).await
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_reveal_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let res = state.controller.reveal_all_steps().await;
  respond(&state, res).await
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_reset(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  state.controller.reset().await;
  Json(state.snapshot().await)
}
