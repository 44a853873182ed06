//! Ollama API provider.
//!
//! Calls `POST {host}/api/chat` with an Ollama-native request format.
//!
//! Key differences from the hosted providers:
//! - System prompt is sent as a `role: "system"` message.
//! - Tool definitions use the OpenAI-style `{type: "function", function: {...}}` format.
//! - Tool call arguments are JSON objects, and calls carry no ids.
//! - Tool results use `role: "tool"` messages.
//! - Images are base64 strings in the message's `images` field; URLs are not accepted.
//! - Tuning goes into `options` (`num_predict` for the token limit).
//! - `stream` must always be sent; streaming responses are NDJSON.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::client::{
    into_deltas, log_usage, provider_error, DeltaStream, ProviderAdapter, StreamFailure,
};
use super::openai::ToolDef;
use super::transport::{Framing, HttpRequest, Transport};
use super::{
    ContentBlock, ImageSource, Message, MessageContent, StopReason, StreamDelta, ToolCall,
    UnifiedResponse, Usage,
};
use crate::agent::EffectiveConfig;
use crate::error::ProviderError;
use crate::skills::SkillSchema;

/// Default Ollama API base URL.
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

// ── Ollama API request types ─────────────────────────────

/// Ollama `/api/chat` request body.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef>>,
    options: OllamaOptions,
}

/// Ollama message in the conversation.
#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

impl OllamaMessage {
    fn new(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
            images: Vec::new(),
            tool_calls: None,
        }
    }
}

/// Ollama tool call in assistant messages.
#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaFunctionCall {
    name: String,
    arguments: Value,
}

/// Ollama generation options.
#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

// ── Ollama API response types ────────────────────────────

/// Ollama `/api/chat` response (and each NDJSON stream line).
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

// ── OllamaAdapter ───────────────────────────────────────

pub struct OllamaAdapter {
    host: String,
    transport: Arc<dyn Transport>,
}

impl OllamaAdapter {
    /// If `host` is `None`, defaults to `http://localhost:11434`.
    pub fn new(host: Option<&str>, transport: Arc<dyn Transport>) -> Self {
        // Strip trailing slash for consistent URL construction
        let host = host
            .unwrap_or(DEFAULT_OLLAMA_HOST)
            .trim_end_matches('/')
            .to_string();
        Self { host, transport }
    }

    fn http_request(&self, body: &Value) -> HttpRequest {
        HttpRequest {
            url: format!("{}/api/chat", self.host),
            headers: Vec::new(),
            body: body.clone(),
            framing: Framing::Ndjson,
        }
    }
}

/// Synthesizes ids, since Ollama doesn't provide them. Numbering starts
/// at `first`.
fn tool_calls(calls: Option<Vec<OllamaToolCall>>, first: usize) -> Vec<ToolCall> {
    calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, tc)| ToolCall {
            id: format!("ollama_tool_{}", first + i),
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect()
}

fn stop_reason(done_reason: Option<&str>) -> StopReason {
    match done_reason {
        Some("stop") | None => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

/// Decodes NDJSON lines. Each line carries whole tool calls, so calls
/// are numbered across the stream rather than per line.
#[derive(Debug, Default)]
struct LineDecoder {
    calls_seen: usize,
}

impl LineDecoder {
    fn decode(&mut self, event: &Value) -> Result<Vec<StreamDelta>, StreamFailure> {
        let chunk: OllamaChatResponse = serde_json::from_value(event.clone())
            .map_err(|e| StreamFailure::Fatal(e.to_string()))?;
        if let Some(error) = chunk.error {
            return Err(StreamFailure::Fatal(error));
        }

        let mut deltas = Vec::new();
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                deltas.push(StreamDelta::Text(message.content));
            }
            for call in tool_calls(message.tool_calls, self.calls_seen) {
                deltas.push(StreamDelta::ToolCall {
                    index: self.calls_seen,
                    id: Some(call.id),
                    name: Some(call.name),
                    arguments: call.arguments.to_string(),
                });
                self.calls_seen += 1;
            }
        }
        if chunk.done {
            deltas.push(StreamDelta::Usage(Usage {
                input_tokens: chunk.prompt_eval_count.unwrap_or(0),
                output_tokens: chunk.eval_count.unwrap_or(0),
            }));
            deltas.push(StreamDelta::Stop(stop_reason(chunk.done_reason.as_deref())));
        }
        Ok(deltas)
    }
}

// ── Message translation helpers ──────────────────────────

/// Translates a shared `Message` into one or more `OllamaMessage`s.
///
/// - `ToolUse` blocks in assistant messages → `tool_calls` field
/// - `ToolResult` blocks → one `role: "tool"` message each
/// - Base64 images → `images` field; URL images are skipped
fn translate_message(msg: &Message, out: &mut Vec<OllamaMessage>) {
    let blocks = match &msg.content {
        MessageContent::Text(text) => {
            out.push(OllamaMessage::new(msg.role.as_str(), text.clone()));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut text_parts = Vec::new();
    let mut images = Vec::new();
    let mut tool_use_calls = Vec::new();
    let mut tool_results = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::Image(image) => match &image.source {
                ImageSource::Base64 { data, .. } => images.push(data.clone()),
                ImageSource::Url(url) => {
                    warn!("Ollama only accepts inline images; skipping {url}");
                }
            },
            ContentBlock::ToolUse { name, input, .. } => {
                // Arguments may still be the provider's raw JSON text.
                let arguments = match input {
                    Value::String(text) => serde_json::from_str(text).unwrap_or(Value::Null),
                    other => other.clone(),
                };
                tool_use_calls.push(OllamaToolCall {
                    function: OllamaFunctionCall {
                        name: name.clone(),
                        arguments,
                    },
                });
            }
            ContentBlock::ToolResult { content, .. } => tool_results.push(content.clone()),
        }
    }

    if !tool_use_calls.is_empty() {
        out.push(OllamaMessage {
            tool_calls: Some(tool_use_calls),
            ..OllamaMessage::new("assistant", text_parts.join("\n"))
        });
        return;
    }

    if !tool_results.is_empty() {
        for result in tool_results {
            out.push(OllamaMessage::new("tool", result));
        }
        return;
    }

    out.push(OllamaMessage {
        images,
        ..OllamaMessage::new(msg.role.as_str(), text_parts.join("\n"))
    });
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn tool_declaration(&self, schema: &SkillSchema) -> Value {
        ToolDef::from_schema(schema).to_value()
    }

    fn decode_tool_declaration(&self, declaration: &Value) -> Option<SkillSchema> {
        ToolDef::decode(declaration)
    }

    fn build_request(
        &self,
        config: &EffectiveConfig,
        skills: &[SkillSchema],
        messages: &[Message],
    ) -> Result<Value, ProviderError> {
        let mut ollama_messages = Vec::with_capacity(messages.len() + 1);
        if !config.role_setup.is_empty() {
            ollama_messages.push(OllamaMessage::new("system", config.role_setup.clone()));
        }
        for msg in messages {
            translate_message(msg, &mut ollama_messages);
        }

        if config.tool_choice.is_some() {
            debug!("Ollama has no tool_choice; ignoring it");
        }

        let tuning = &config.tuning;
        let request = OllamaChatRequest {
            model: config.model.clone(),
            messages: ollama_messages,
            stream: config.stream,
            tools: (!skills.is_empty()).then(|| skills.iter().map(ToolDef::from_schema).collect()),
            options: OllamaOptions {
                num_predict: tuning.max_tokens,
                temperature: tuning.temperature,
                presence_penalty: tuning.presence_penalty,
                frequency_penalty: tuning.frequency_penalty,
                stop: tuning.stop.clone().filter(|s| !s.is_empty()),
                seed: tuning.seed,
            },
        };

        debug!(
            "Built Ollama request ({}) with {} messages{}",
            config.model,
            messages.len(),
            if skills.is_empty() { "" } else { " + tools" }
        );

        serde_json::to_value(&request).map_err(|e| ProviderError::fatal(self.name(), e.to_string()))
    }

    fn parse_response(&self, payload: Value) -> Result<UnifiedResponse, ProviderError> {
        let resp: OllamaChatResponse = serde_json::from_value(payload.clone())
            .map_err(|e| ProviderError::fatal(self.name(), format!("unexpected response: {e}")))?;
        if let Some(error) = resp.error {
            return Err(ProviderError::fatal(self.name(), error));
        }
        let message = resp
            .message
            .ok_or_else(|| ProviderError::fatal(self.name(), "response has no message"))?;

        let tool_calls = tool_calls(message.tool_calls, 0);

        // When tool_calls are present the reason is ToolUse regardless of done_reason
        let stop_reason = if tool_calls.is_empty() {
            stop_reason(resp.done_reason.as_deref())
        } else {
            StopReason::ToolUse
        };

        let response = UnifiedResponse {
            text: (!message.content.is_empty()).then_some(message.content),
            tool_calls,
            stop_reason,
            usage: Usage {
                input_tokens: resp.prompt_eval_count.unwrap_or(0),
                output_tokens: resp.eval_count.unwrap_or(0),
            },
            raw: payload,
        };
        log_usage(self.name(), &response);
        Ok(response)
    }

    async fn send(&self, request: &Value) -> Result<Value, ProviderError> {
        self.transport
            .post(self.http_request(request))
            .await
            .map_err(|e| provider_error(self.name(), e))
    }

    async fn stream(&self, request: &Value) -> Result<DeltaStream, ProviderError> {
        let events = self
            .transport
            .post_stream(self.http_request(request))
            .await
            .map_err(|e| provider_error(self.name(), e))?;
        let mut decoder = LineDecoder::default();
        Ok(into_deltas(self.name(), events, move |event: &Value| {
            decoder.decode(event)
        }))
    }

    fn description(&self) -> String {
        format!("ollama ({})", self.host)
    }
}
