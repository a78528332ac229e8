use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::domain::SessionToken;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::app_state::AppState;

pub(crate) async fn serve_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    token: SessionToken,
    replay_history: bool,
) {
    let (mut sender, mut receiver) = socket.split();

    let user = match server_api::authenticate(&state.api, &token).await {
        Ok(user) => user,
        Err(err) => {
            warn!(detail = %err.detail, "rejecting websocket");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "Invalid token".into(),
                })))
                .await;
            return;
        }
    };

    // Subscribe before replaying so lines posted meanwhile are not lost.
    let mut lines_rx = state.lines.subscribe();
    let active = state.connected();
    info!(user_id = user.user_id.0, active, "client connected");

    // Broadcast lines at or below this id were already sent as history.
    let mut replayed_up_to = None;
    if replay_history {
        match server_api::replay_lines(&state.api, state.history_replay_limit).await {
            Ok(lines) => {
                replayed_up_to = lines.iter().map(|chat| chat.message_id.0).max();
                for chat in lines {
                    if sender.send(Message::Text(chat.line)).await.is_err() {
                        break;
                    }
                }
            }
            Err(err) => error!(detail = %err.detail, "failed to load history for replay"),
        }
    }

    let user_id = user.user_id.0;
    let send_task = tokio::spawn(async move {
        loop {
            match lines_rx.recv().await {
                Ok(chat) => {
                    if replayed_up_to.is_some_and(|last| chat.message_id.0 <= last) {
                        continue;
                    }
                    if sender.send(Message::Text(chat.line)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id, skipped, "socket fell behind; dropped lines");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                match server_api::post_message(&state.api, &user, &text).await {
                    Ok(chat) => {
                        let _ = state.lines.send(chat);
                    }
                    Err(err) => error!(user_id, detail = %err.detail, "failed to store message"),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    let active = state.disconnected();
    info!(user_id, active, "client disconnected");

    if state.end_session_on_disconnect {
        if let Err(err) = server_api::end_session(&state.api, &token).await {
            error!(user_id, detail = %err.detail, "failed to end session");
        }
    }
}
