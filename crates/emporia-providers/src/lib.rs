use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use emporia_types::ToolSchema;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Incremental output from a streaming completion. Tool-call frames are
/// keyed by the wire `index` because continuation frames omit id and name.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallDelta { index: usize, args_delta: String },
    Done { finish_reason: String },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Black-box model capability: given messages and tool schemas, produce text
/// or structured tool-call requests, incrementally.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn complete(&self, messages: Vec<ChatMessage>, model_override: Option<&str>)
        -> anyhow::Result<String>;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        // Non-streaming providers degrade to a single delta.
        let response = self.complete(messages, model_override).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(response)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("id", &self.id()).finish()
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn Provider>>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            providers: Arc::new(build_providers(&config)),
            default_provider: config.default_provider,
        }
    }

    /// Registry with an explicit provider set, used by tests and the loop's
    /// scripted fixtures.
    pub fn with_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: Arc::new(providers),
            default_provider: None,
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub async fn complete_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> anyhow::Result<String> {
        let provider = self.select_provider(provider_id)?;
        provider.complete(messages, model_id).await
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_id)?;
        provider.stream(messages, model_id, tools, cancel).await
    }

    fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        if let Some(id) = provider_id {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                self.list_ids().join(", ")
            );
        }

        if let Some(default_id) = self.default_provider.as_deref() {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == default_id) {
                return Ok(provider.clone());
            }
        }

        let Some(provider) = self.providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

const OPENAI_COMPATIBLE: [(&str, &str, &str, bool); 4] = [
    ("openai", "https://api.openai.com/v1", "gpt-4o-mini", true),
    (
        "openrouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    ),
    (
        "groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    ),
    ("ollama", "http://127.0.0.1:11434/v1", "llama3.1:8b", false),
];

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for (id, default_url, default_model, use_api_key) in OPENAI_COMPATIBLE {
        let Some(entry) = config.providers.get(id) else {
            continue;
        };
        providers.push(Arc::new(OpenAiCompatibleProvider {
            id: id.to_string(),
            base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
            api_key: if use_api_key {
                entry
                    .api_key
                    .as_deref()
                    .filter(|key| !is_placeholder_api_key(key))
                    .map(str::to_string)
                    .or_else(|| env_api_key_for_provider(id))
            } else {
                None
            },
            default_model: entry
                .default_model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            client: Client::new(),
        }));
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Zero-config stand-in so development without credentials still answers.
struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn id(&self) -> &str {
        "local"
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("Echo: {last}"))
    }
}

struct OpenAiCompatibleProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    fn request_body(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
        stream: bool,
    ) -> serde_json::Value {
        let wire_messages = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": stream,
        });

        let wire_tools = tools
            .unwrap_or_default()
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        body
    }

    fn model_or_default<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let model = self.model_or_default(model_override);
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(url)
            .json(&self.request_body(model, &messages, None, false));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_error(&value) {
            anyhow::bail!(detail);
        }
        if let Some(text) = extract_completion_text(&value) {
            return Ok(text);
        }
        anyhow::bail!(
            "provider returned no completion content for model `{}` (response: {})",
            model,
            truncate_for_error(&value.to_string(), 500)
        );
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = self.model_or_default(model_override);
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(model, &messages, tools.as_deref(), true);

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                    };
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                            };
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }
                        for chunk in chunks_from_stream_value(&value) {
                            yield chunk;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Decode one parsed SSE frame into stream chunks. Factored out of the
/// stream so the wire decoding has direct tests.
fn chunks_from_stream_value(value: &serde_json::Value) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    let choices = value
        .get("choices")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for choice in choices {
        let delta = choice.get("delta").cloned().unwrap_or_default();

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                out.push(StreamChunk::TextDelta(text.to_string()));
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for (position, call) in tool_calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
                    .unwrap_or(position);
                let function = call.get("function").cloned().unwrap_or_default();
                let name = function
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let args_delta = function
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();

                if !name.is_empty() {
                    out.push(StreamChunk::ToolCallStart {
                        index,
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: name.to_string(),
                    });
                }
                if !args_delta.is_empty() {
                    out.push(StreamChunk::ToolCallDelta {
                        index,
                        args_delta: args_delta.to_string(),
                    });
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !reason.is_empty() {
                out.push(StreamChunk::Done {
                    finish_reason: reason.to_string(),
                });
            }
        }
    }

    out
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_completion_text(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
