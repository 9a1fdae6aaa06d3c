//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! forwarded to the session controller. We reply with a single JSON message
//! per request: the refreshed session snapshot, or an error.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tracing::{info, error, instrument, debug};

use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::session::CommandError;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "galileo_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "galileo_backend", "WebSocket connected");
  while let Some(Ok(msg)) = socket.recv().await {
    match msg {
      Message::Text(txt) => {
        // Parse, dispatch, serialize response.
        let reply_msg = match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(incoming) => {
            debug!(target = "galileo_backend", "WS received: {:?}", &incoming);
            handle_client_ws(incoming, &state).await
          }
          Err(e) => ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) },
        };

        let out = serde_json::to_string(&reply_msg).unwrap_or_else(|e| {
          serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
        });

        if let Err(e) = socket.send(Message::Text(out)).await {
          error!(target: "galileo_backend", error = %e, "WS send error");
          break;
        }
      }
      Message::Ping(payload) => { let _ = socket.send(Message::Pong(payload)).await; }
      Message::Close(_) => break,
      _ => {}
    }
  }
  info!(target: "galileo_backend", "WebSocket disconnected");
}

/// Run one command and fold the outcome into a reply. Cancelled evaluator
/// outcomes never surface; the controller already swallowed them.
async fn reply_with_snapshot(state: &AppState, res: Result<(), CommandError>) -> ServerWsMessage {
  match res {
    Ok(()) => ServerWsMessage::Session { session: state.snapshot().await },
    Err(e) => ServerWsMessage::Error { message: e.to_string() },
  }
}

#[instrument(level = "info", skip(state))]
async fn handle_client_ws(msg: ClientWsMessage, state: &AppState) -> ServerWsMessage {
  match msg {
    ClientWsMessage::Ping => ServerWsMessage::Pong,

    ClientWsMessage::GetState =>
      ServerWsMessage::Session { session: state.snapshot().await },

    ClientWsMessage::SelectGoal { topic } => {
      let res = state.controller.select_goal(&topic).await;
      info!(target: "session", %topic, ok = res.is_ok(), "WS select_goal handled");
      reply_with_snapshot(state, res).await
    }

    ClientWsMessage::SubmitStep { text } => {
      let res = state.controller.submit_step(&text).await;
      reply_with_snapshot(state, res).await
    }

    ClientWsMessage::SubmitFinalAnswer { text } => {
      let res = state.controller.submit_final_answer(&text).await;
      reply_with_snapshot(state, res).await
    }

    ClientWsMessage::MoveToFinalAnswer => {
      let res = state.controller.move_to_final_answer().await;
      reply_with_snapshot(state, res).await
    }

    ClientWsMessage::RevealStep { index } => {
      let res = state.controller.reveal_step(index).await;
      reply_with_snapshot(state, res).await
    }

    ClientWsMessage::RevealAllSteps => {
      let res = state.controller.reveal_all_steps().await;
      reply_with_snapshot(state, res).await
    }

    ClientWsMessage::Reset => {
      state.controller.reset().await;
      ServerWsMessage::Session { session: state.snapshot().await }
    }
  }
}
