//! Streaming bridge
//!
//! Per-active-session pipe between a user's push channel and the node's
//! generation stream. Every inbound chat message is validated against the
//! session's state and expiry, forwarded to the node with the full sampling
//! parameter set, and the token frames are relayed back in order.
//!
//! Tokens flow through the user's bounded outbound queue; when the client
//! cannot keep up the generation is cancelled rather than dropping tokens
//! silently.

use crate::config::Config;
use crate::db::{Database, SessionQueries, SessionState};
use crate::noderpc::{NodeRpcClient, SamplingParams};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Server-to-client push frame
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session paid and node assigned
    SessionStarted {
        session_id: String,
        node_id: String,
        expires_at: DateTime<Utc>,
    },
    /// Model load progress
    ModelStatus {
        session_id: String,
        status: String,
        message: String,
    },
    /// Model loaded, chat is open
    SessionReady { session_id: String },
    /// One generated token
    AiToken {
        session_id: String,
        token: String,
        is_final: bool,
    },
    /// Cumulative response, emitted after the final token
    AiResponse {
        session_id: String,
        response: String,
        streaming_complete: bool,
    },
    /// Session reached a terminal state
    SessionEnded { session_id: String },
    /// A node returned to the idle pool
    NodeFreed { node_id: String },
    /// Request-scoped error
    Error { message: String },
}

/// Outcome of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued
    Sent,
    /// The client's queue is full
    Full,
    /// No connection for this user
    Gone,
}

/// Registry of connected push channels, one queue per user
pub struct PushHub {
    connections: RwLock<HashMap<i64, (u64, mpsc::Sender<ServerFrame>)>>,
    next_conn_id: std::sync::atomic::AtomicU64,
    queue_size: usize,
}

impl PushHub {
    /// Create a hub with the configured per-connection queue size
    pub fn new(queue_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: std::sync::atomic::AtomicU64::new(1),
            queue_size,
        }
    }

    /// Register a user's connection, replacing any previous one.
    ///
    /// The returned connection id must be passed back to [`unregister`]
    /// so a stale socket cannot tear down its replacement.
    ///
    /// [`unregister`]: PushHub::unregister
    pub async fn register(&self, user_id: i64) -> (u64, mpsc::Receiver<ServerFrame>) {
        let conn_id = self
            .next_conn_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_size);
        let previous = self.connections.write().await.insert(user_id, (conn_id, tx));
        if previous.is_some() {
            debug!("PushHub: replaced existing connection for user {}", user_id);
        }
        (conn_id, rx)
    }

    /// Drop a user's connection if it is still the registered one
    pub async fn unregister(&self, user_id: i64, conn_id: u64) {
        let mut connections = self.connections.write().await;
        if connections.get(&user_id).map(|(id, _)| *id) == Some(conn_id) {
            connections.remove(&user_id);
        }
    }

    /// Queue a frame without blocking
    pub async fn push(&self, user_id: i64, frame: ServerFrame) -> PushOutcome {
        let connections = self.connections.read().await;
        let Some((_, tx)) = connections.get(&user_id) else {
            return PushOutcome::Gone;
        };
        match tx.try_send(frame) {
            Ok(()) => PushOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => PushOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Gone,
        }
    }
}

/// The streaming bridge
pub struct StreamingBridge {
    config: Arc<Config>,
    db: Database,
    rpc: NodeRpcClient,
    hub: Arc<PushHub>,
    /// Sessions with a generation in flight; one per session
    in_flight: Mutex<HashSet<String>>,
}

impl StreamingBridge {
    /// Create the bridge
    pub fn new(config: Arc<Config>, db: Database, rpc: NodeRpcClient, hub: Arc<PushHub>) -> Self {
        Self {
            config,
            db,
            rpc,
            hub,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Shared push hub
    pub fn hub(&self) -> Arc<PushHub> {
        self.hub.clone()
    }

    /// Whether a generation is currently streaming for the session
    pub async fn is_streaming(&self, session_id: &str) -> bool {
        self.in_flight.lock().await.contains(session_id)
    }

    /// Handle one inbound chat message.
    ///
    /// Validates the session, claims the single in-flight slot, streams the
    /// node's tokens back to the user and releases the slot on every exit
    /// path.
    pub async fn handle_chat_message(
        &self,
        user_id: i64,
        session_id: &str,
        node_endpoint: &str,
        prompt: String,
        params: SamplingParams,
    ) {
        // Validate against the current session row, not a cached view
        let session = match SessionQueries::new(&self.db).get_by_id(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.error_to(user_id, "Unknown session").await;
                return;
            }
            Err(e) => {
                warn!("Bridge: session lookup failed: {}", e);
                self.error_to(user_id, "Internal error").await;
                return;
            }
        };

        if session.user_id != user_id {
            self.error_to(user_id, "Not your session").await;
            return;
        }
        if session.state != SessionState::Active {
            self.error_to(user_id, "Session is not active").await;
            return;
        }
        let Some(expires_at) = session.expires_at else {
            self.error_to(user_id, "Session is not active").await;
            return;
        };
        if Utc::now() >= expires_at {
            self.error_to(user_id, "Session has expired").await;
            return;
        }

        // One generation at a time per session
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(session_id.to_string()) {
                self.error_to(user_id, "busy").await;
                return;
            }
        }

        let outcome = self
            .stream_generation(user_id, session_id, node_endpoint, expires_at, &prompt, &params)
            .await;

        self.in_flight.lock().await.remove(session_id);

        if let Err(message) = outcome {
            self.error_to(user_id, &message).await;
        }
    }

    /// Drive one generation stream end to end
    async fn stream_generation(
        &self,
        user_id: i64,
        session_id: &str,
        node_endpoint: &str,
        expires_at: DateTime<Utc>,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<(), String> {
        let mut stream = self
            .rpc
            .generate(node_endpoint, session_id, prompt, params)
            .await
            .map_err(|e| {
                warn!("Bridge: generate call failed for {}: {}", session_id, e);
                "Node did not accept the request".to_string()
            })?;

        let idle = std::time::Duration::from_secs(self.config.sessions.token_idle_timeout_secs);
        let mut response = String::new();
        let mut tokens = 0u64;

        loop {
            // Dropping the stream cancels the generation on the node side
            if Utc::now() >= expires_at {
                debug!("Bridge: session {} expired mid-generation", session_id);
                return Ok(());
            }

            let frame = match tokio::time::timeout(idle, stream.next_frame()).await {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!("Bridge: stream error for {}: {}", session_id, e);
                    return Err("Node stream failed".to_string());
                }
                Err(_) => {
                    warn!(
                        "Bridge: no token for {} within {}s, cancelling",
                        session_id, self.config.sessions.token_idle_timeout_secs
                    );
                    return Err("Generation stalled".to_string());
                }
            };

            // Re-check expiry so no token frame is delivered past expires_at
            if Utc::now() >= expires_at {
                return Ok(());
            }

            response.push_str(&frame.token);
            tokens += 1;

            match self
                .hub
                .push(
                    user_id,
                    ServerFrame::AiToken {
                        session_id: session_id.to_string(),
                        token: frame.token,
                        is_final: frame.is_final,
                    },
                )
                .await
            {
                PushOutcome::Sent => {}
                PushOutcome::Full => {
                    warn!("Bridge: client queue full for {}, cancelling", session_id);
                    return Err("backpressure".to_string());
                }
                PushOutcome::Gone => {
                    debug!("Bridge: client gone for {}, cancelling", session_id);
                    return Ok(());
                }
            }

            if frame.is_final {
                break;
            }
        }

        info!(
            "Bridge: generation complete for {} ({} tokens)",
            session_id, tokens
        );

        self.hub
            .push(
                user_id,
                ServerFrame::AiResponse {
                    session_id: session_id.to_string(),
                    response,
                    streaming_complete: true,
                },
            )
            .await;
        Ok(())
    }

    async fn error_to(&self, user_id: i64, message: &str) {
        self.hub
            .push(
                user_id,
                ServerFrame::Error {
                    message: message.to_string(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_push_outcomes() {
        let hub = PushHub::new(2);
        assert_eq!(
            hub.push(1, ServerFrame::SessionReady { session_id: "s".into() }).await,
            PushOutcome::Gone
        );

        let (_conn, mut rx) = hub.register(1).await;
        assert_eq!(
            hub.push(1, ServerFrame::SessionReady { session_id: "s".into() }).await,
            PushOutcome::Sent
        );
        assert_eq!(
            hub.push(1, ServerFrame::SessionReady { session_id: "s".into() }).await,
            PushOutcome::Sent
        );
        // Queue of two is now full
        assert_eq!(
            hub.push(1, ServerFrame::SessionReady { session_id: "s".into() }).await,
            PushOutcome::Full
        );

        rx.recv().await.unwrap();
        assert_eq!(
            hub.push(1, ServerFrame::SessionReady { session_id: "s".into() }).await,
            PushOutcome::Sent
        );
    }

    #[tokio::test]
    async fn hub_replaces_connection_per_user() {
        let hub = PushHub::new(4);
        let (old_conn, _old) = hub.register(1).await;
        let (new_conn, mut new) = hub.register(1).await;

        hub.push(1, ServerFrame::NodeFreed { node_id: "n".into() }).await;
        // The frame lands on the replacement connection
        assert!(matches!(
            new.recv().await,
            Some(ServerFrame::NodeFreed { .. })
        ));

        // The stale socket cannot tear down its replacement
        hub.unregister(1, old_conn).await;
        assert_eq!(
            hub.push(1, ServerFrame::NodeFreed { node_id: "n".into() }).await,
            PushOutcome::Sent
        );

        hub.unregister(1, new_conn).await;
        assert_eq!(
            hub.push(1, ServerFrame::NodeFreed { node_id: "n".into() }).await,
            PushOutcome::Gone
        );
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        let frame = ServerFrame::AiToken {
            session_id: "s1".into(),
            token: "Hi".into(),
            is_final: false,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "ai_token");
        assert_eq!(value["token"], "Hi");

        let frame = ServerFrame::SessionStarted {
            session_id: "s1".into(),
            node_id: "n1".into(),
            expires_at: Utc::now(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "session_started");
        assert_eq!(value["node_id"], "n1");
    }
}
