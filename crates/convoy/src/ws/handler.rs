//! WebSocket handler for client connections.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::RngCore;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::AppState;

use super::types::{WsCommand, WsEvent};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Per-connection event buffer.
const EVENT_BUFFER_SIZE: usize = 256;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle one WebSocket connection.
///
/// The connection carries at most one bound conversation and at most one
/// in-flight assistant process at a time.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    };
    info!("client connected ({connection_id})");

    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<WsEvent>(EVENT_BUFFER_SIZE);

    if let Err(e) = sender
        .send(Message::Text(
            serde_json::to_string(&WsEvent::Connected)
                .unwrap_or_default()
                .into(),
        ))
        .await
    {
        warn!("failed to send connected message to {connection_id}: {e}");
        return;
    }

    // Forward orchestrator events to the client, with periodic pings.
    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("failed to serialize event: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    let Ok(json) = serde_json::to_string(&WsEvent::Ping) else { break };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("send loop ended for {send_connection_id}");
    });

    // The conversation this connection is bound to, if any.
    let mut current_conversation: Option<String> = None;

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                match serde_json::from_str::<WsCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &state,
                            &connection_id,
                            &mut current_conversation,
                            cmd,
                            &event_tx,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!("unparseable command from {connection_id}: {e} - {text}");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary/ping/pong frames carry no commands.
            }
            Err(e) => {
                warn!("websocket error on {connection_id}: {e}");
                break;
            }
        }
    }

    state.orchestrator.disconnect(&connection_id);
    send_task.abort();
    info!("client disconnected ({connection_id})");
}

async fn handle_command(
    state: &AppState,
    connection_id: &str,
    current_conversation: &mut Option<String>,
    cmd: WsCommand,
    events: &mpsc::Sender<WsEvent>,
) {
    match cmd {
        WsCommand::Pong => {}

        WsCommand::JoinConversation { conversation_id } => {
            match state.orchestrator.conversation_exists(&conversation_id).await {
                Ok(true) => {
                    info!("{connection_id} joined conversation {conversation_id}");
                    *current_conversation = Some(conversation_id.clone());
                    let _ = events
                        .send(WsEvent::ConversationJoined { conversation_id })
                        .await;
                }
                Ok(false) => {
                    let _ = events
                        .send(WsEvent::Error {
                            message: format!("conversation not found: {conversation_id}"),
                        })
                        .await;
                }
                Err(e) => {
                    warn!("conversation lookup failed for {connection_id}: {e}");
                    let _ = events
                        .send(WsEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        WsCommand::CreateConversation => match state.orchestrator.create_conversation().await {
            Ok(conversation_id) => {
                *current_conversation = Some(conversation_id.clone());
                let _ = events
                    .send(WsEvent::ConversationCreated { conversation_id })
                    .await;
            }
            Err(e) => {
                let _ = events
                    .send(WsEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        },

        WsCommand::SendPrompt { prompt } => {
            let result = state
                .orchestrator
                .send_prompt(
                    connection_id,
                    current_conversation.as_deref(),
                    &prompt,
                    events.clone(),
                )
                .await;
            if let Err(e) = result {
                warn!("send_prompt failed for {connection_id}: {e}");
                let _ = events
                    .send(WsEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }

        WsCommand::StopPrompt => {
            state.orchestrator.stop_prompt(connection_id, events).await;
        }

        WsCommand::SetWorkingDirectory {
            conversation_id,
            working_directory,
        } => {
            match state
                .orchestrator
                .set_working_directory(&conversation_id, &working_directory)
                .await
            {
                Ok(created) => {
                    let _ = events
                        .send(WsEvent::WorkingDirectorySet {
                            conversation_id,
                            working_directory,
                            created,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = events
                        .send(WsEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        WsCommand::CloneRepository {
            conversation_id: _,
            repository,
            project_name,
            branch,
        } => {
            match state
                .orchestrator
                .clone_repository(&repository, &project_name, branch.as_deref())
                .await
            {
                Ok(path) => {
                    let _ = events
                        .send(WsEvent::RepositoryCloned {
                            repository,
                            project_name,
                            path: path.display().to_string(),
                            branch,
                        })
                        .await;
                }
                Err(e) => {
                    warn!("clone failed for {connection_id}: {e}");
                    let _ = events
                        .send(WsEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }
}
