//! Mock inference backend (OpenAI-compatible, as served by LM Studio).
//!
//! Three operations are emulated:
//!
//! - `GET /v1/models`: a fixed three-entry catalog
//! - `POST /v1/chat/completions`: single-shot, or SSE chunks when `stream: true`
//! - `POST /v1/embeddings`: one deterministic vector per input
//!
//! Reply content is picked by keyword from the latest user message so scenarios
//! can steer the backend: a prompt mentioning "error" gets the error-flavoured
//! reply, "hello" the greeting, and so on.
//!
//! Streaming is split in two layers. [`ChunkSequence`] is a finite, restartable
//! iterator with no notion of time; the HTTP handler adds the optional
//! inter-chunk delay on top. Tests drive the sequence directly.

use crate::server::MockServer;
use crate::{MockAdapter, MockError, MockKind};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Models reported by `/v1/models`.
pub const MODEL_CATALOG: &[&str] = &[
    "mock-llama-3-8b-instruct",
    "mock-mistral-7b-instruct",
    "mock-nomic-embed-text-v1.5",
];

/// Length of every embedding vector.
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// A canned assistant reply and the keyword that selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CannedReply {
    /// Lowercase substring matched against the latest user message.
    /// `None` marks the fallback reply.
    pub keyword: Option<&'static str>,
    /// Full reply text.
    pub content: &'static str,
}

const CANNED_REPLIES: &[CannedReply] = &[
    CannedReply {
        keyword: Some("error"),
        content: "I'm sorry, but I encountered an error while processing your request. \
                  Please try again later.",
    },
    CannedReply {
        keyword: Some("hello"),
        content: "Hello! I am the mock assistant. How can I help you today?",
    },
    CannedReply {
        keyword: Some("summar"),
        content: "Summary: the provided content covers three main points, \
                  each supported by a short example.",
    },
];

const DEFAULT_REPLY: CannedReply = CannedReply {
    keyword: None,
    content: "This is a mock response from the inference backend. \
              The harness substituted it for the real model.",
};

/// A single chat message as sent by OpenAI-compatible clients.
///
/// `content` is kept as raw JSON: clients send a string, `null` (assistant
/// turns with tool calls) or an array of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    /// Message with plain-text content.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
        }
    }

    /// Text of the message. Array content joins the `text` of its parts with
    /// newlines; `null` and other shapes read as empty.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// Picks the canned reply for a conversation.
///
/// Only the most recent `user` message is inspected; matching is
/// case-insensitive and the first keyword hit wins.
pub fn select_reply(messages: &[ChatMessage]) -> CannedReply {
    let latest = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.text().to_lowercase())
        .unwrap_or_default();

    CANNED_REPLIES
        .iter()
        .find(|reply| reply.keyword.is_some_and(|k| latest.contains(k)))
        .copied()
        .unwrap_or(DEFAULT_REPLY)
}

/// One unit of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A piece of reply text.
    Delta(String),
    /// End-of-stream marker; always the final item.
    Done,
}

/// Word-boundary chunking of a reply, ending with [`Chunk::Done`].
///
/// Each delta is a word plus the whitespace that follows it, so concatenating
/// the deltas reproduces the original text byte for byte.
#[derive(Debug, Clone)]
pub struct ChunkSequence {
    pieces: Vec<String>,
    cursor: usize,
}

impl ChunkSequence {
    /// Splits `text` into deltas.
    pub fn new(text: &str) -> Self {
        Self {
            pieces: text
                .split_inclusive(char::is_whitespace)
                .map(str::to_string)
                .collect(),
            cursor: 0,
        }
    }

    /// Rewinds to the first chunk.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// Total number of items, including the end marker.
    pub fn total_chunks(&self) -> usize {
        self.pieces.len() + 1
    }
}

impl Iterator for ChunkSequence {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let item = match self.cursor.cmp(&self.pieces.len()) {
            std::cmp::Ordering::Less => Chunk::Delta(self.pieces[self.cursor].clone()),
            std::cmp::Ordering::Equal => Chunk::Done,
            std::cmp::Ordering::Greater => return None,
        };
        self.cursor += 1;
        Some(item)
    }
}

/// Embeds each input as a pseudo-random unit-range vector.
///
/// The generator is seeded from a SHA-256 of the text, so the same input
/// always maps to the same vector.
pub fn embed(inputs: &[String]) -> Vec<Vec<f32>> {
    inputs.iter().map(|text| embed_one(text)).collect()
}

fn embed_one(text: &str) -> Vec<f32> {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&Sha256::digest(text.as_bytes()));
    let mut rng = StdRng::from_seed(seed);
    (0..EMBEDDING_DIMENSIONS)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect()
}

/// Runtime knobs for the inference mock.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceSettings {
    /// Delay between streamed chunks. Zero streams as fast as possible.
    pub chunk_delay: Duration,
}

/// A request observed by the mock, for assertions in scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedRequest {
    pub endpoint: String,
    pub model: String,
    /// Latest user message (chat) or the joined inputs (embeddings).
    pub prompt: String,
    pub streamed: bool,
}

#[derive(Debug, Clone)]
struct InferenceState {
    settings: InferenceSettings,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
}

impl InferenceState {
    fn record(&self, request: RecordedRequest) {
        if let Ok(mut requests) = self.requests.write() {
            requests.push(request);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct EmbeddingsRequest {
    model: Option<String>,
    input: EmbeddingInput,
}

fn invalid_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": message,
                "type": "invalid_request_error",
            }
        })),
    )
        .into_response()
}

async fn list_models() -> Json<Value> {
    let data: Vec<Value> = MODEL_CATALOG
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "trellis-mock" }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn chat_completions(
    State(state): State<InferenceState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    if request.messages.is_empty() {
        return invalid_request("'messages' must contain at least one message");
    }

    let reply = select_reply(&request.messages);
    let model = request
        .model
        .unwrap_or_else(|| MODEL_CATALOG[0].to_string());
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(ChatMessage::text)
        .unwrap_or_default();

    state.record(RecordedRequest {
        endpoint: "chat/completions".to_string(),
        model: model.clone(),
        prompt,
        streamed: request.stream,
    });

    let id = format!("chatcmpl-mock-{}", Utc::now().timestamp_millis());
    let created = Utc::now().timestamp();

    if request.stream {
        return stream_completion(id, model, created, reply.content, state.settings.chunk_delay)
            .into_response();
    }

    let completion_tokens = reply.content.split_whitespace().count();
    Json(json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": reply.content },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": completion_tokens,
            "total_tokens": completion_tokens,
        },
    }))
    .into_response()
}

/// SSE `data:` payloads for one chunk. The end marker expands to the
/// `finish_reason` chunk followed by the literal `[DONE]`.
fn sse_payloads(id: &str, model: &str, created: i64, chunk: Chunk) -> Vec<String> {
    let frame = |delta: Value, finish: Value| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }],
        })
        .to_string()
    };

    match chunk {
        Chunk::Delta(text) => vec![frame(json!({ "content": text }), Value::Null)],
        Chunk::Done => vec![frame(json!({}), json!("stop")), "[DONE]".to_string()],
    }
}

fn stream_completion(
    id: String,
    model: String,
    created: i64,
    content: &str,
    delay: Duration,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let payloads = ChunkSequence::new(content)
        .flat_map(move |chunk| sse_payloads(&id, &model, created, chunk));

    let stream = futures::stream::iter(payloads).then(move |payload| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Event::default().data(payload))
    });

    Sse::new(stream)
}

async fn embeddings(
    State(state): State<InferenceState>,
    Json(request): Json<EmbeddingsRequest>,
) -> Response {
    let inputs = match request.input {
        EmbeddingInput::One(text) => vec![text],
        EmbeddingInput::Many(texts) => texts,
    };
    if inputs.is_empty() {
        return invalid_request("'input' must not be empty");
    }

    let model = request
        .model
        .unwrap_or_else(|| MODEL_CATALOG[2].to_string());
    state.record(RecordedRequest {
        endpoint: "embeddings".to_string(),
        model: model.clone(),
        prompt: inputs.join("\n"),
        streamed: false,
    });

    let data: Vec<Value> = embed(&inputs)
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            json!({ "object": "embedding", "index": index, "embedding": embedding })
        })
        .collect();
    let tokens: usize = inputs.iter().map(|t| t.split_whitespace().count()).sum();

    Json(json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": { "prompt_tokens": tokens, "total_tokens": tokens },
    }))
    .into_response()
}

/// The inference adapter: canned completions and embeddings over HTTP.
#[derive(Debug)]
pub struct InferenceMock {
    state: InferenceState,
    server: Option<MockServer>,
}

impl Default for InferenceMock {
    fn default() -> Self {
        Self::new(InferenceSettings::default())
    }
}

impl InferenceMock {
    /// Creates a stopped adapter.
    pub fn new(settings: InferenceSettings) -> Self {
        Self {
            state: InferenceState {
                settings,
                requests: Arc::new(RwLock::new(Vec::new())),
            },
            server: None,
        }
    }

    /// Router exposing the OpenAI-compatible surface.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/models", get(list_models))
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/embeddings", post(embeddings))
            .with_state(self.state.clone())
    }

    pub fn settings(&self) -> InferenceSettings {
        self.state.settings
    }

    /// Base URL once started (e.g. `http://127.0.0.1:41234`).
    pub fn base_url(&self) -> Option<String> {
        self.server.as_ref().map(MockServer::base_url)
    }

    /// Requests received since the last reset.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MockAdapter for InferenceMock {
    fn kind(&self) -> MockKind {
        MockKind::Inference
    }

    async fn start(&mut self, bind: SocketAddr) -> Result<SocketAddr, MockError> {
        if self.server.is_some() {
            return Err(MockError::AlreadyRunning(self.kind()));
        }
        let server = MockServer::bind(self.kind(), bind, self.router()).await?;
        let addr = server.local_addr();
        self.server = Some(server);
        Ok(addr)
    }

    async fn stop(&mut self) -> Result<(), MockError> {
        match self.server.take() {
            Some(mut server) => server.shutdown().await,
            None => Ok(()),
        }
    }

    fn reset(&self) {
        if let Ok(mut requests) = self.state.requests.write() {
            requests.clear();
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(MockServer::local_addr)
    }
}
