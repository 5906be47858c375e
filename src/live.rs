use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::auth;
use crate::hub::{live_json, CONNECTION_BUFFER};

#[derive(Deserialize)]
pub struct LiveQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum ClientMessage {
    JoinSession {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    LeaveSession {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

/// Authenticates before upgrading; an unauthenticated client never gets a
/// socket, let alone a subscription.
pub async fn ws_upgrade(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveQuery>,
    headers: HeaderMap,
) -> Response {
    let user_id = match auth::authenticate(&state.settings.token_secret, query.token.as_deref(), &headers) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("Live connection rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response();
        }
    };

    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_ws(socket, state, user_id)),
        None => (StatusCode::UPGRADE_REQUIRED, Json(json!({"error": "WebSocket upgrade required"}))).into_response(),
    }
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let conn_id = Uuid::new_v4();
    info!("Live client {} connected as {}", conn_id, user_id);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CONNECTION_BUFFER);

    // Forward hub frames and replies to this client.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = handle_client_frame(&recv_state, &user_id, conn_id, &tx, &text).await;
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.disconnect(conn_id).await;
    info!("Live client {} disconnected", conn_id);
}

/// Applies one client frame and returns the reply frame.
async fn handle_client_frame(
    state: &AppState,
    user_id: &str,
    conn_id: Uuid,
    tx: &mpsc::Sender<String>,
    text: &str,
) -> String {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => return live_json("error", json!({"message": format!("Unrecognized message: {}", e)})),
    };

    match message {
        ClientMessage::JoinSession { job_id } => {
            // Membership is explicit and limited to the caller's own jobs.
            match state.repo.get_owned_job(&job_id, user_id).await {
                Ok(Some(job)) => {
                    state.hub.join(&job_id, conn_id, tx.clone()).await;
                    live_json("session_joined", json!({"jobId": job_id, "status": job.status}))
                }
                Ok(None) => live_json("error", json!({"jobId": job_id, "message": "Job not found"})),
                Err(e) => {
                    warn!("[{}] Live join lookup failed: {}", job_id, e);
                    live_json("error", json!({"jobId": job_id, "message": "Temporarily unavailable"}))
                }
            }
        }
        ClientMessage::LeaveSession { job_id } => {
            state.hub.leave(&job_id, conn_id).await;
            live_json("session_left", json!({"jobId": job_id}))
        }
    }
}
