//! HTTP client for node agents
//!
//! The coordinator drives each node's agent over plain HTTP: load a model,
//! poll its load progress, stream a generation, stop the session. The agent
//! is an external collaborator; every call carries a deadline and failures
//! map to `NodeUnavailable` so the orchestrator can refund and release.

use crate::{CoordinatorError, CoordResult};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Model load progress reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLoadStatus {
    /// Fetching weights from the hub
    Downloading,
    /// Loading weights into memory
    Loading,
    /// Accepting generation requests
    Ready,
    /// Load failed; terminal
    Failed,
}

/// Status report for a loading model
#[derive(Debug, Clone, Deserialize)]
pub struct ModelStatusReport {
    /// Current phase
    pub status: ModelLoadStatus,
    /// Human readable progress message
    #[serde(default)]
    pub message: String,
}

/// One token frame from a generation stream
#[derive(Debug, Clone, Deserialize)]
pub struct TokenFrame {
    /// Token text
    pub token: String,
    /// Set on the last frame of a generation
    #[serde(default)]
    pub is_final: bool,
}

/// Full sampling parameter set forwarded with every prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_typical_p")]
    pub typical_p: f32,
    #[serde(default)]
    pub xtc_probability: f32,
    #[serde(default = "default_xtc_threshold")]
    pub xtc_threshold: f32,
    #[serde(default)]
    pub dry_multiplier: f32,
    #[serde(default = "default_dry_base")]
    pub dry_base: f32,
    #[serde(default = "default_dry_allowed_length")]
    pub dry_allowed_length: i32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    /// Sampler application order; empty means the node's default chain
    #[serde(default)]
    pub sampler_order: Vec<String>,
    /// RNG seed; None draws a fresh seed per generation
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            typical_p: default_typical_p(),
            xtc_probability: 0.0,
            xtc_threshold: default_xtc_threshold(),
            dry_multiplier: 0.0,
            dry_base: default_dry_base(),
            dry_allowed_length: default_dry_allowed_length(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            sampler_order: Vec::new(),
            seed: None,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_min_p() -> f32 {
    0.05
}

fn default_typical_p() -> f32 {
    1.0
}

fn default_xtc_threshold() -> f32 {
    0.1
}

fn default_dry_base() -> f32 {
    1.75
}

fn default_dry_allowed_length() -> i32 {
    2
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_repeat_last_n() -> i32 {
    64
}

fn default_max_tokens() -> u32 {
    1_024
}

#[derive(Serialize)]
struct LoadModelRequest<'a> {
    session_id: &'a str,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hf_repo: Option<&'a str>,
    context_length: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    session_id: &'a str,
    prompt: &'a str,
    #[serde(flatten)]
    params: &'a SamplingParams,
}

#[derive(Serialize)]
struct StopSessionRequest<'a> {
    session_id: &'a str,
}

/// Map a transport-level failure against a node agent
fn map_node_error(e: reqwest::Error) -> CoordinatorError {
    if e.is_timeout() {
        CoordinatorError::NodeUnavailable("node agent timed out".to_string())
    } else if e.is_connect() {
        CoordinatorError::NodeUnavailable("cannot reach node agent".to_string())
    } else {
        CoordinatorError::NodeUnavailable(format!("node agent request failed: {e}"))
    }
}

/// HTTP client for node agents
#[derive(Clone)]
pub struct NodeRpcClient {
    /// Client with a hard per-request deadline, for control calls
    control: reqwest::Client,
    /// Client without a whole-request deadline, for generation streams
    streaming: reqwest::Client,
}

impl NodeRpcClient {
    /// Build a client pair with the configured control-call deadline
    pub fn new(rpc_timeout_secs: u64) -> CoordResult<Self> {
        let timeout = std::time::Duration::from_secs(rpc_timeout_secs);
        let control = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::Internal(format!("HTTP client build failed: {e}")))?;
        // Generations run for minutes; only the connection setup is bounded
        // here, per-token progress is enforced by the caller.
        let streaming = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::Internal(format!("HTTP client build failed: {e}")))?;
        Ok(Self { control, streaming })
    }

    /// Instruct a node to load a model for a session
    pub async fn load_model(
        &self,
        endpoint: &str,
        session_id: &str,
        model: &str,
        hf_repo: Option<&str>,
        context_length: u32,
    ) -> CoordResult<()> {
        info!(
            "NodeRPC: load_model on {}: session={}, model={}, hf_repo={:?}, ctx={}",
            endpoint, session_id, model, hf_repo, context_length
        );

        let response = self
            .control
            .post(format!("{}/api/load_model", endpoint.trim_end_matches('/')))
            .json(&LoadModelRequest {
                session_id,
                model,
                hf_repo,
                context_length,
            })
            .send()
            .await
            .map_err(map_node_error)?;

        check_node_status(response).await.map(|_| ())
    }

    /// Poll model load progress for a session
    pub async fn model_status(
        &self,
        endpoint: &str,
        session_id: &str,
    ) -> CoordResult<ModelStatusReport> {
        let response = self
            .control
            .get(format!(
                "{}/api/model_status/{}",
                endpoint.trim_end_matches('/'),
                session_id
            ))
            .send()
            .await
            .map_err(map_node_error)?;

        let response = check_node_status(response).await?;
        response.json().await.map_err(map_node_error)
    }

    /// Stop a running session on a node
    pub async fn stop_session(&self, endpoint: &str, session_id: &str) -> CoordResult<()> {
        debug!("NodeRPC: stop_session on {}: session={}", endpoint, session_id);

        let response = self
            .control
            .post(format!("{}/api/stop_session", endpoint.trim_end_matches('/')))
            .json(&StopSessionRequest { session_id })
            .send()
            .await
            .map_err(map_node_error)?;

        check_node_status(response).await.map(|_| ())
    }

    /// Start a generation and return the token stream.
    ///
    /// The node answers with newline-delimited JSON frames; the last frame
    /// carries `is_final: true`.
    pub async fn generate(
        &self,
        endpoint: &str,
        session_id: &str,
        prompt: &str,
        params: &SamplingParams,
    ) -> CoordResult<TokenStream> {
        debug!("NodeRPC: generate on {}: session={}", endpoint, session_id);

        let response = self
            .streaming
            .post(format!("{}/api/generate", endpoint.trim_end_matches('/')))
            .json(&GenerateRequest {
                session_id,
                prompt,
                params,
            })
            .send()
            .await
            .map_err(map_node_error)?;

        let response = check_node_status(response).await?;
        Ok(TokenStream::new(response))
    }
}

/// Reject non-success agent responses with their message
async fn check_node_status(response: reqwest::Response) -> CoordResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown node error")
            .to_string(),
        Err(_) => "unknown node error".to_string(),
    };
    Err(CoordinatorError::NodeUnavailable(format!(
        "node agent rejected request ({status}): {message}"
    )))
}

/// Incremental reader over a node's NDJSON generation stream
pub struct TokenStream {
    body: futures_util::stream::BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    done: bool,
}

impl TokenStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            body: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Next token frame, or `None` once the stream is exhausted.
    ///
    /// Callers are expected to wrap this in their own idle deadline.
    pub async fn next_frame(&mut self) -> CoordResult<Option<TokenFrame>> {
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                return Ok(Some(frame));
            }
            if self.done {
                return Ok(None);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(map_node_error(e)),
                None => self.done = true,
            }
        }
    }

    /// Pop one complete line out of the buffer, if present
    fn take_buffered_frame(&mut self) -> CoordResult<Option<TokenFrame>> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let frame: TokenFrame = serde_json::from_str(line).map_err(|e| {
                CoordinatorError::NodeUnavailable(format!("bad token frame from node: {e}"))
            })?;
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_params_defaults_are_sane() {
        let params = SamplingParams::default();
        assert!(params.temperature > 0.0);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.max_tokens, 1_024);
        assert!(params.seed.is_none());
        assert!(params.sampler_order.is_empty());
    }

    #[test]
    fn sampling_params_deserialize_with_partial_fields() {
        let params: SamplingParams =
            serde_json::from_str(r#"{"temperature": 0.2, "seed": 42}"#).unwrap();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.seed, Some(42));
        // Unspecified fields fall back to defaults
        assert_eq!(params.top_p, 0.95);
    }

    #[test]
    fn generate_request_flattens_params() {
        let params = SamplingParams::default();
        let request = GenerateRequest {
            session_id: "s1",
            prompt: "hello",
            params: &params,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["prompt"], "hello");
        // Flattened sampling fields sit at the top level
        assert!(value["temperature"].is_number());
        assert!(value["repeat_penalty"].is_number());
    }

    #[test]
    fn token_frame_parses_minimal_line() {
        let frame: TokenFrame = serde_json::from_str(r#"{"token": "Hi"}"#).unwrap();
        assert_eq!(frame.token, "Hi");
        assert!(!frame.is_final);
    }
}
