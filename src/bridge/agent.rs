//! Client for the coding agent running next to the bridge.
//!
//! The agent is an `opencode serve` instance. A prompt is submitted
//! asynchronously and its progress is read back from the server's SSE event
//! feed, filtered to the bridge's session, until the session goes idle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One streamed event of an agent response.
pub type AgentChunk = Value;

pub const DEFAULT_PROVIDER: &str = "anthropic";
pub const DEFAULT_OPENCODE_BASE_URL: &str = "http://127.0.0.1:4096";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub message_id: String,
    pub content: String,
    pub model: Option<String>,
}

pub trait AgentClient: Send + Sync {
    /// Submit a prompt and stream the agent's response. Setup failures are
    /// reported as the first stream item.
    fn stream_response(&self, request: &PromptRequest) -> BoxStream<'static, Result<AgentChunk>>;
}

/// [`AgentClient`] for OpenCode's HTTP server.
#[derive(Clone)]
pub struct OpenCodeClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    session_id: Arc<Mutex<Option<String>>>,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        // No overall timeout: the event feed stays open for the whole prompt.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build OpenCode client with custom settings: {e}, using default");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(30),
            session_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session used for every prompt, created on first use.
    async fn ensure_session(&self) -> Result<String> {
        let mut session = self.session_id.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }

        let response = self
            .http
            .post(format!("{}/session", self.base_url))
            .timeout(self.request_timeout)
            .json(&json!({}))
            .send()
            .await
            .context("Failed to create OpenCode session")?;
        if !response.status().is_success() {
            bail!("OpenCode session create failed with status {}", response.status());
        }
        let value: Value = response
            .json()
            .await
            .context("Invalid OpenCode session response")?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("OpenCode session response missing id: {value}"))?
            .to_string();

        info!(opencode_session_id = %id, "Created OpenCode session");
        *session = Some(id.clone());
        Ok(id)
    }

    async fn open_prompt(
        &self,
        request: &PromptRequest,
    ) -> Result<BoxStream<'static, Result<AgentChunk>>> {
        let session_id = self.ensure_session().await?;

        // Subscribe before submitting so no event of this prompt is missed.
        let events = self
            .http
            .get(format!("{}/event", self.base_url))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("OpenCode event stream connection failed")?;
        if !events.status().is_success() {
            bail!("OpenCode event stream failed with status {}", events.status());
        }

        let mut body = json!({
            "parts": [{ "type": "text", "text": request.content }]
        });
        if let Some((provider, model)) = request.model.as_deref().and_then(parse_model) {
            body["model"] = json!({ "providerID": provider, "modelID": model });
        }

        let response = self
            .http
            .post(format!("{}/session/{}/prompt_async", self.base_url, session_id))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .context("Failed to submit prompt to OpenCode")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("OpenCode prompt failed {status}: {text}");
        }
        debug!(
            message_id = %request.message_id,
            opencode_session_id = %session_id,
            "Prompt submitted"
        );

        Ok(session_events(events.bytes_stream(), session_id))
    }
}

impl AgentClient for OpenCodeClient {
    fn stream_response(&self, request: &PromptRequest) -> BoxStream<'static, Result<AgentChunk>> {
        let client = self.clone();
        let request = request.clone();
        stream::once(async move { client.open_prompt(&request).await })
            .map(|opened| match opened {
                Ok(events) => events,
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .flatten()
            .boxed()
    }
}

/// Split `provider/model`; a bare model id gets the default provider.
pub fn parse_model(model: &str) -> Option<(String, String)> {
    let model = model.trim();
    if model.is_empty() {
        return None;
    }
    match model.split_once('/') {
        Some((provider, id)) => Some((provider.to_string(), id.to_string())),
        None => Some((DEFAULT_PROVIDER.to_string(), model.to_string())),
    }
}

/// Session an OpenCode event belongs to, if any.
fn event_session_id(value: &Value) -> Option<&str> {
    let properties = value.get("properties")?;
    properties
        .get("sessionID")
        .or_else(|| properties.get("part").and_then(|part| part.get("sessionID")))
        .or_else(|| properties.get("info").and_then(|info| info.get("sessionID")))
        .and_then(Value::as_str)
}

/// Accumulates SSE bytes and yields the `data:` payload of each complete event.
///
/// Bytes are buffered until a full line is available, so multi-byte characters
/// split across chunks decode intact.
#[derive(Debug, Default)]
struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>>>,
    accumulator: SseAccumulator,
    pending: VecDeque<String>,
    session_id: String,
    finished: bool,
}

/// Turn a raw SSE body into the events of one session, ending at
/// `session.idle`. A feed that closes before that is an error.
fn session_events<S, B, E>(bytes: S, session_id: String) -> BoxStream<'static, Result<AgentChunk>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = SseState {
        bytes: bytes
            .map(|chunk| chunk.map(|b| b.as_ref().to_vec()).map_err(anyhow::Error::from))
            .boxed(),
        accumulator: SseAccumulator::default(),
        pending: VecDeque::new(),
        session_id,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            while let Some(payload) = state.pending.pop_front() {
                let value: Value = match serde_json::from_str(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(error = %e, "Skipping undecodable OpenCode event");
                        continue;
                    }
                };
                if event_session_id(&value) != Some(state.session_id.as_str()) {
                    continue;
                }
                if value.get("type").and_then(Value::as_str) == Some("session.idle") {
                    state.finished = true;
                    return None;
                }
                return Some((Ok(value), state));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.accumulator.push(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e.context("OpenCode event stream failed")), state));
                }
                None => {
                    state.finished = true;
                    return Some((
                        Err(anyhow!("OpenCode event stream closed before the session went idle")),
                        state,
                    ));
                }
            }
        }
    })
    .boxed()
}
