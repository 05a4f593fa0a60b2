use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::error::AppError;
use crate::{log_error, log_info, log_warn};

/// Lazy, finite, single-use sequence of assistant text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: i64,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderModel {
    pub id: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub owned_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Runtime state reported by the server's native model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub id: String,
    #[serde(default = "not_loaded")]
    pub state: String,
    #[serde(default, alias = "estimatedVram")]
    pub estimated_vram: Option<f64>,
}

fn not_loaded() -> String {
    "not-loaded".to_string()
}

impl LoadedModel {
    pub fn is_loaded(&self) -> bool {
        self.state == "loaded"
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Base URL recorded on models discovered through this provider.
    fn endpoint(&self) -> &str;

    /// Model inventory. Empty when the provider is unreachable.
    async fn list_models(&self) -> Vec<ProviderModel>;

    /// Models currently resident in the provider. Empty when unavailable.
    async fn list_loaded_models(&self) -> Vec<LoadedModel>;

    async fn test_connection(&self) -> bool;

    async fn complete(&self, request: ChatCompletionRequest) -> Result<ChatCompletion, AppError>;

    /// Open a streaming completion. Connection and status failures surface
    /// here, before any fragment is produced.
    async fn stream_complete(
        &self,
        request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, AppError>;
}

pub struct LmStudioClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl LmStudioClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, AppError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The native REST surface lives beside the OpenAI-compatible `/v1` root.
    fn native_models_url(&self) -> String {
        let root = self.base_url.strip_suffix("/v1").unwrap_or(&self.base_url);
        format!("{root}/api/v0/models")
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(url))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.post(self.url(path)))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn fetch_list<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<Vec<T>, AppError> {
        let response = self.get(url).timeout(self.timeout).send().await?;
        let response = ensure_success(response).await?;
        let list: ModelList<T> = response.json().await?;
        Ok(list.data)
    }
}

#[async_trait]
impl CompletionProvider for LmStudioClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn list_models(&self) -> Vec<ProviderModel> {
        match self.fetch_list::<ProviderModel>(self.url("/models")).await {
            Ok(models) => models,
            Err(e) => {
                log_error!("lmchat.provider", "Failed to list provider models: {}", e);
                Vec::new()
            }
        }
    }

    async fn list_loaded_models(&self) -> Vec<LoadedModel> {
        match self.fetch_list::<LoadedModel>(self.native_models_url()).await {
            Ok(models) => models,
            Err(e) => {
                log_warn!("lmchat.provider", "Loaded-model query unavailable: {}", e);
                Vec::new()
            }
        }
    }

    async fn test_connection(&self) -> bool {
        match self.get(self.url("/models")).timeout(self.timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log_warn!("lmchat.provider", "Provider connection test failed: {}", e);
                false
            }
        }
    }

    async fn complete(
        &self,
        mut request: ChatCompletionRequest,
    ) -> Result<ChatCompletion, AppError> {
        request.stream = false;
        let response = self
            .post("/chat/completions")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body: CompletionResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| {
                AppError::Transport("Provider returned no completion choices".to_string())
            })?;

        Ok(ChatCompletion {
            content,
            model: body.model,
            usage: body.usage,
        })
    }

    async fn stream_complete(
        &self,
        mut request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, AppError> {
        request.stream = true;
        log_info!(
            "lmchat.provider",
            "Opening completion stream: model={}, messages={}",
            request.model,
            request.messages.len()
        );

        let send = self.post("/chat/completions").json(&request).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled("completion request".to_string()));
            }
            response = send => response?,
        };
        let response = ensure_success(response).await?;

        Ok(fragment_stream(response.bytes_stream(), cancel))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(AppError::Transport(format!(
        "Provider returned {status}: {snippet}"
    )))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Data(String),
    Done,
}

/// Accumulates raw body bytes and yields complete `data:` lines.
///
/// Bytes are held until a newline arrives so a payload or a multibyte
/// character split between two reads is decoded whole.
#[derive(Debug, Default)]
pub struct StreamLineBuffer {
    pending: Vec<u8>,
}

impl StreamLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamLine> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = parse_line(&String::from_utf8_lossy(&raw)) {
                lines.push(line);
            }
        }
        lines
    }

    /// Interpret an unterminated trailing line once the body has ended.
    pub fn flush(&mut self) -> Option<StreamLine> {
        let raw = std::mem::take(&mut self.pending);
        parse_line(&String::from_utf8_lossy(&raw))
    }
}

fn parse_line(raw: &str) -> Option<StreamLine> {
    let line = raw.trim();
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        Some(StreamLine::Done)
    } else if payload.is_empty() {
        None
    } else {
        Some(StreamLine::Data(payload.to_string()))
    }
}

/// Text carried by one chunk payload, if any.
pub fn parse_fragment(payload: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: ChatCompletionChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty()))
}

type BodyStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct FragmentState<E> {
    body: BodyStream<E>,
    lines: StreamLineBuffer,
    ready: VecDeque<String>,
    finished: bool,
    cancel: CancellationToken,
}

impl<E> FragmentState<E> {
    fn absorb(&mut self, lines: impl IntoIterator<Item = StreamLine>) {
        for line in lines {
            match line {
                StreamLine::Done => {
                    self.finished = true;
                    return;
                }
                StreamLine::Data(payload) => match parse_fragment(&payload) {
                    Ok(Some(text)) => self.ready.push_back(text),
                    Ok(None) => {}
                    Err(e) => {
                        log_warn!("lmchat.provider", "Skipping malformed stream payload: {}", e);
                    }
                },
            }
        }
    }
}

/// Turn a raw response body into a fragment stream.
pub fn fragment_stream<S, E>(body: S, cancel: CancellationToken) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = FragmentState {
        body: Box::pin(body) as BodyStream<E>,
        lines: StreamLineBuffer::new(),
        ready: VecDeque::new(),
        finished: false,
        cancel,
    };

    let fragments = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.ready.pop_front() {
                return Some((Ok(text), state));
            }
            if state.finished {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return None,
                next = state.body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    let lines = state.lines.feed(&bytes);
                    state.absorb(lines);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = AppError::Transport(format!("Stream interrupted: {e}"));
                    return Some((Err(err), state));
                }
                None => {
                    let tail = state.lines.flush();
                    state.absorb(tail);
                    state.finished = true;
                }
            }
        }
    });

    Box::pin(fragments)
}
