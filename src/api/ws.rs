//! Push channel (WebSocket)
//!
//! One connection per user, authenticated on connect with the same bearer
//! token as the request API (header or `?token=` query parameter, since
//! browsers cannot set headers on WebSocket upgrades). Every inbound frame
//! names a `session_id` that the server resolves against the connected
//! user; the client's claimed identity is never trusted.

use super::{resolve_token, ApiState};
use crate::bridge::ServerFrame;
use crate::db::SessionState;
use crate::noderpc::SamplingParams;
use crate::session::SessionEvent;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Client-to-server push frame
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Attach to a session after paying its invoice
    StartSession {
        /// Session id
        session_id: String,
    },
    /// Re-attach to a running session after a reconnect
    ResumeSession {
        /// Session id
        session_id: String,
    },
    /// Send a prompt to the session's node
    ChatMessage {
        /// Session id
        session_id: String,
        /// Prompt text
        prompt: String,
        /// Sampling parameters; defaults apply for omitted fields
        #[serde(default)]
        params: SamplingParams,
    },
    /// End the session early
    EndSession {
        /// Session id
        session_id: String,
    },
}

/// Query parameters accepted on the upgrade request
#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    /// Bearer token, for clients that cannot set headers
    pub token: Option<String>,
}

/// WebSocket upgrade endpoint
pub async fn ws_handler(
    State(state): State<ApiState>,
    Query(params): Query<WsAuthParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Authenticate on connect; an anonymous socket never upgrades
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(params.token);

    let user = match token {
        Some(token) => match resolve_token(&state, &token).await {
            Ok(user) => user,
            Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
        },
        None => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let user_id = user.id;
    ws.on_upgrade(move |socket| handle_socket(state, user_id, socket))
}

/// Serve one connected client
async fn handle_socket(state: ApiState, user_id: i64, socket: WebSocket) {
    info!("WS: user {} connected", user_id);

    let hub = state.app.bridge.hub();
    let (conn_id, mut outbound) = hub.register(user_id).await;
    let (mut sink, mut stream) = socket.split();

    // Writer: pump queued server frames onto the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Reader: dispatch client frames until the socket closes
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => dispatch_frame(&state, user_id, frame).await,
                Err(e) => {
                    debug!("WS: bad frame from user {}: {}", user_id, e);
                    hub.push(
                        user_id,
                        ServerFrame::Error {
                            message: "Malformed frame".to_string(),
                        },
                    )
                    .await;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by the protocol layer; binary is ignored
            Ok(_) => {}
        }
    }

    hub.unregister(user_id, conn_id).await;
    writer.abort();
    info!("WS: user {} disconnected", user_id);
}

/// Route one client frame to the owning component
async fn dispatch_frame(state: &ApiState, user_id: i64, frame: ClientFrame) {
    let hub = state.app.bridge.hub();
    let orchestrator = &state.app.orchestrator;

    match frame {
        ClientFrame::StartSession { session_id } => {
            let session = match orchestrator.load_owned_session(&session_id, user_id).await {
                Ok(session) => session,
                Err(e) => {
                    hub.push(user_id, ServerFrame::Error { message: e.to_string() }).await;
                    return;
                }
            };
            match session.state {
                SessionState::PendingPayment => {
                    match orchestrator.check_payment(&session_id, user_id).await {
                        Ok(true) => {} // payment observed; progress frames follow
                        Ok(false) => {
                            hub.push(
                                user_id,
                                ServerFrame::Error {
                                    message: "Payment not received".to_string(),
                                },
                            )
                            .await;
                        }
                        Err(e) => {
                            hub.push(user_id, ServerFrame::Error { message: e.to_string() })
                                .await;
                        }
                    }
                }
                SessionState::Starting => {
                    hub.push(
                        user_id,
                        ServerFrame::ModelStatus {
                            session_id,
                            status: "loading".to_string(),
                            message: "Model is loading".to_string(),
                        },
                    )
                    .await;
                }
                SessionState::Active => {
                    push_attached(&hub, user_id, &session).await;
                }
                _ => {
                    hub.push(
                        user_id,
                        ServerFrame::Error {
                            message: "Session has ended".to_string(),
                        },
                    )
                    .await;
                }
            }
        }

        ClientFrame::ResumeSession { session_id } => {
            match orchestrator.load_owned_session(&session_id, user_id).await {
                Ok(session) if session.state == SessionState::Active => {
                    push_attached(&hub, user_id, &session).await;
                }
                Ok(_) => {
                    hub.push(
                        user_id,
                        ServerFrame::Error {
                            message: "Session is not active".to_string(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    hub.push(user_id, ServerFrame::Error { message: e.to_string() }).await;
                }
            }
        }

        ClientFrame::ChatMessage {
            session_id,
            prompt,
            params,
        } => {
            // Ownership is validated here; the bridge re-validates state and
            // expiry against the row when the stream actually starts
            let session = match orchestrator.load_owned_session(&session_id, user_id).await {
                Ok(session) => session,
                Err(e) => {
                    hub.push(user_id, ServerFrame::Error { message: e.to_string() }).await;
                    return;
                }
            };
            let Some(node) = state.app.registry.get(&session.node_id).await else {
                hub.push(
                    user_id,
                    ServerFrame::Error {
                        message: "Node not available".to_string(),
                    },
                )
                .await;
                return;
            };

            // Cheap pre-check; the bridge claims the slot atomically anyway
            if state.app.bridge.is_streaming(&session_id).await {
                hub.push(
                    user_id,
                    ServerFrame::Error {
                        message: "busy".to_string(),
                    },
                )
                .await;
                return;
            }

            let bridge = state.app.bridge.clone();
            tokio::spawn(async move {
                bridge
                    .handle_chat_message(user_id, &session_id, &node.endpoint, prompt, params)
                    .await;
            });
        }

        ClientFrame::EndSession { session_id } => {
            match orchestrator.load_owned_session(&session_id, user_id).await {
                Ok(_) => {
                    orchestrator.post(&session_id, SessionEvent::EndRequested).await;
                }
                Err(e) => {
                    warn!("WS: end_session rejected for user {}: {}", user_id, e);
                    hub.push(user_id, ServerFrame::Error { message: e.to_string() }).await;
                }
            }
        }
    }
}

/// Replay the attach frames for an active session
async fn push_attached(
    hub: &std::sync::Arc<crate::bridge::PushHub>,
    user_id: i64,
    session: &crate::db::SessionModel,
) {
    if let Some(expires_at) = session.expires_at {
        hub.push(
            user_id,
            ServerFrame::SessionStarted {
                session_id: session.id.clone(),
                node_id: session.node_id.clone(),
                expires_at,
            },
        )
        .await;
        hub.push(
            user_id,
            ServerFrame::SessionReady {
                session_id: session.id.clone(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_with_type_tag() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "start_session", "session_id": "s1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::StartSession { session_id } if session_id == "s1"));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "chat_message", "session_id": "s1", "prompt": "hello",
                "params": {"temperature": 0.3, "max_tokens": 64}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::ChatMessage { prompt, params, .. } => {
                assert_eq!(prompt, "hello");
                assert_eq!(params.temperature, 0.3);
                assert_eq!(params.max_tokens, 64);
            }
            _ => panic!("wrong frame"),
        }

        // Omitted params fall back to the defaults
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "chat_message", "session_id": "s1", "prompt": "hi"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::ChatMessage { params, .. } => {
                assert_eq!(params.top_k, 40);
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "sudo", "session_id": "s1"}"#)
            .is_err());
    }
}
