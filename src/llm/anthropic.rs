//! Anthropic Messages API provider.
//!
//! Calls `POST {base}/v1/messages` with `x-api-key` authentication.
//!
//! Key differences from the OpenAI shape:
//! - The system prompt is a top-level `system` field.
//! - Tools are `{name, description, input_schema}`.
//! - `max_tokens` is mandatory; penalties and `seed` do not exist.
//! - Stop sequences are sent as `stop_sequences`.
//! - Tool results are `tool_result` blocks inside a user message.
//! - Streaming is SSE with `content_block_*` and `message_delta` events.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::client::{
    into_deltas, log_usage, provider_error, DeltaStream, ProviderAdapter, StreamFailure,
};
use super::transport::{Framing, HttpRequest, Transport};
use super::{
    ContentBlock, ImageSource, Message, MessageContent, StopReason, StreamDelta, ToolCall,
    ToolChoice, UnifiedResponse, Usage,
};
use crate::agent::EffectiveConfig;
use crate::error::ProviderError;
use crate::skills::SkillSchema;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

// ── Request types ────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    /// A plain string or an array of content blocks.
    content: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolDefinition {
    name: String,
    #[serde(default)]
    description: String,
    input_schema: Value,
}

// ── Response types ───────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ── AnthropicAdapter ─────────────────────────────────

pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    transport: Arc<dyn Transport>,
}

impl AnthropicAdapter {
    pub fn new(api_key: &str, host: Option<&str>, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: host
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            transport,
        }
    }

    fn http_request(&self, body: &Value) -> HttpRequest {
        HttpRequest {
            url: format!("{}/v1/messages", self.base_url),
            headers: vec![
                ("x-api-key".to_string(), self.api_key.clone()),
                ("anthropic-version".to_string(), API_VERSION.to_string()),
            ],
            body: body.clone(),
            framing: Framing::Sse,
        }
    }
}

fn translate_message(msg: &Message) -> WireMessage {
    let content = match &msg.content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => Value::Array(blocks.iter().map(translate_block).collect()),
    };
    WireMessage {
        role: msg.role.as_str(),
        content,
    }
}

fn translate_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image(image) => match &image.source {
            ImageSource::Url(url) => json!({
                "type": "image",
                "source": {"type": "url", "url": url}
            }),
            ImageSource::Base64 { media_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            }),
        },
        ContentBlock::ToolUse { id, name, input } => {
            // Arguments may still be the provider's raw JSON text.
            let input = match input {
                Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| json!({})),
                other => other.clone(),
            };
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content}),
    }
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::Skill(name) => json!({"type": "tool", "name": name}),
    }
}

fn stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

/// Decodes one SSE event. Block indexes double as tool call indexes.
fn decode_event(event: &Value) -> Result<Vec<StreamDelta>, StreamFailure> {
    let index = event["index"].as_u64().unwrap_or(0) as usize;
    let deltas = match event["type"].as_str().unwrap_or_default() {
        "message_start" => vec![StreamDelta::Usage(Usage {
            input_tokens: event["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: 0,
        })],
        "content_block_start" => {
            let block = &event["content_block"];
            if block["type"] == "tool_use" {
                vec![StreamDelta::ToolCall {
                    index,
                    id: block["id"].as_str().map(str::to_string),
                    name: block["name"].as_str().map(str::to_string),
                    arguments: String::new(),
                }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let delta = &event["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => vec![StreamDelta::Text(
                    delta["text"].as_str().unwrap_or_default().to_string(),
                )],
                Some("input_json_delta") => vec![StreamDelta::ToolCall {
                    index,
                    id: None,
                    name: None,
                    arguments: delta["partial_json"].as_str().unwrap_or_default().to_string(),
                }],
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut deltas = vec![StreamDelta::Usage(Usage {
                input_tokens: 0,
                output_tokens: event["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            })];
            if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                deltas.push(StreamDelta::Stop(stop_reason(Some(reason))));
            }
            deltas
        }
        "error" => {
            let error = &event["error"];
            let message = error["message"].as_str().unwrap_or("stream error").to_string();
            return Err(match error["type"].as_str() {
                Some("overloaded_error") | Some("rate_limit_error") | Some("api_error") => {
                    StreamFailure::Recoverable(message)
                }
                _ => StreamFailure::Fatal(message),
            });
        }
        // ping, content_block_stop, message_stop
        _ => vec![],
    };
    Ok(deltas)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn tool_declaration(&self, schema: &SkillSchema) -> Value {
        json!({
            "name": schema.name,
            "description": schema.description,
            "input_schema": schema.parameters_schema(),
        })
    }

    fn decode_tool_declaration(&self, declaration: &Value) -> Option<SkillSchema> {
        let def: ToolDefinition = serde_json::from_value(declaration.clone()).ok()?;
        SkillSchema::from_parameters_schema(&def.name, &def.description, &def.input_schema)
    }

    fn build_request(
        &self,
        config: &EffectiveConfig,
        skills: &[SkillSchema],
        messages: &[Message],
    ) -> Result<Value, ProviderError> {
        let tools: Option<Vec<ToolDefinition>> = (!skills.is_empty()).then(|| {
            skills
                .iter()
                .map(|schema| ToolDefinition {
                    name: schema.name.clone(),
                    description: schema.description.clone(),
                    input_schema: schema.parameters_schema(),
                })
                .collect()
        });
        let tool_choice = config
            .tool_choice
            .as_ref()
            .filter(|_| tools.is_some())
            .map(tool_choice_value);

        let tuning = &config.tuning;
        if tuning.presence_penalty.is_some() || tuning.frequency_penalty.is_some() || tuning.seed.is_some() {
            debug!("Anthropic ignores penalties and seed");
        }

        let request = MessagesRequest {
            model: config.model.clone(),
            max_tokens: tuning.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: config.role_setup.clone(),
            messages: messages.iter().map(translate_message).collect(),
            temperature: tuning.temperature,
            stop_sequences: tuning.stop.clone().filter(|s| !s.is_empty()),
            stream: config.stream,
            tools,
            tool_choice,
        };

        debug!(
            "Built Claude request ({}) with {} messages{}",
            config.model,
            messages.len(),
            if skills.is_empty() { "" } else { " + tools" }
        );

        serde_json::to_value(&request).map_err(|e| ProviderError::fatal(self.name(), e.to_string()))
    }

    fn parse_response(&self, payload: Value) -> Result<UnifiedResponse, ProviderError> {
        let resp: MessagesResponse = serde_json::from_value(payload.clone())
            .map_err(|e| ProviderError::fatal(self.name(), format!("unexpected response: {e}")))?;

        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in resp.content {
            match block {
                ResponseBlock::Text { text } => texts.push(text),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ResponseBlock::Unknown => {}
            }
        }
        let text = texts.join("\n");

        let stop_reason = if tool_calls.is_empty() {
            stop_reason(resp.stop_reason.as_deref())
        } else {
            StopReason::ToolUse
        };

        let usage = resp
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        let response = UnifiedResponse {
            text: (!text.is_empty()).then_some(text),
            tool_calls,
            stop_reason,
            usage,
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
        Ok(into_deltas(self.name(), events, decode_event))
    }

    fn description(&self) -> String {
        format!("anthropic ({})", self.base_url)
    }
}
