//! OpenAI chat-completions provider (also serves Groq).
//!
//! Calls `POST {base}/chat/completions` with bearer authentication.
//!
//! Wire notes:
//! - The system prompt is the first message, with `role: "system"`.
//! - Tools are `{type: "function", function: {name, description, parameters}}`.
//! - Tool call arguments travel as a JSON *string*.
//! - Tool results are `role: "tool"` messages carrying `tool_call_id`.
//! - Images are `image_url` content parts with a `detail` hint.
//! - Streaming is SSE; each event holds `choices[0].delta`, ending with `[DONE]`.

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
    ContentBlock, Message, MessageContent, StopReason, StreamDelta, ToolCall, ToolChoice,
    UnifiedResponse, Usage,
};
use crate::agent::EffectiveConfig;
use crate::error::ProviderError;
use crate::skills::SkillSchema;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

// ── Request types ────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    /// A string, an array of content parts, or null next to `tool_calls`.
    content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OutgoingToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: &'static str, content: Value) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OutgoingToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: FunctionCall,
}

/// OpenAI-style tool definition, shared with Ollama.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ToolDef {
    #[serde(rename = "type")]
    tool_type: String,
    function: FunctionDef,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionDef {
    name: String,
    #[serde(default)]
    description: String,
    parameters: Value,
}

impl ToolDef {
    pub(crate) fn from_schema(schema: &SkillSchema) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters_schema(),
            },
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        json!({
            "type": self.tool_type,
            "function": {
                "name": self.function.name,
                "description": self.function.description,
                "parameters": self.function.parameters,
            }
        })
    }

    pub(crate) fn decode(declaration: &Value) -> Option<SkillSchema> {
        let def: ToolDef = serde_json::from_value(declaration.clone()).ok()?;
        if def.tool_type != "function" {
            return None;
        }
        SkillSchema::from_parameters_schema(
            &def.function.name,
            &def.function.description,
            &def.function.parameters,
        )
    }
}

// ── Response types ───────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ── OpenAiAdapter ────────────────────────────────────

pub struct OpenAiAdapter {
    name: &'static str,
    base_url: String,
    api_key: String,
    images: bool,
    transport: Arc<dyn Transport>,
}

impl OpenAiAdapter {
    pub fn openai(api_key: &str, host: Option<&str>, transport: Arc<dyn Transport>) -> Self {
        Self::with_base("openai", OPENAI_BASE_URL, api_key, host, true, transport)
    }

    /// Groq speaks the same protocol but takes no image input.
    pub fn groq(api_key: &str, host: Option<&str>, transport: Arc<dyn Transport>) -> Self {
        Self::with_base("groq", GROQ_BASE_URL, api_key, host, false, transport)
    }

    fn with_base(
        name: &'static str,
        default_base: &str,
        api_key: &str,
        host: Option<&str>,
        images: bool,
        transport: Arc<dyn Transport>,
    ) -> Self {
        // Strip trailing slash for consistent URL construction
        let base_url = host.unwrap_or(default_base).trim_end_matches('/').to_string();
        Self {
            name,
            base_url,
            api_key: api_key.to_string(),
            images,
            transport,
        }
    }

    fn http_request(&self, body: &Value) -> HttpRequest {
        HttpRequest {
            url: format!("{}/chat/completions", self.base_url),
            headers: vec![(
                "authorization".to_string(),
                format!("Bearer {}", self.api_key),
            )],
            body: body.clone(),
            framing: Framing::Sse,
        }
    }

    /// Translates one unified message, appending to `out`.
    fn translate_message(&self, msg: &Message, out: &mut Vec<ChatMessage>) -> Result<(), ProviderError> {
        let role = msg.role.as_str();
        let blocks = match &msg.content {
            MessageContent::Text(text) => {
                out.push(ChatMessage::new(role, Value::String(text.clone())));
                return Ok(());
            }
            MessageContent::Blocks(blocks) => blocks,
        };

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => parts.push(json!({"type": "text", "text": text})),
                ContentBlock::Image(image) => {
                    if !self.images {
                        return Err(ProviderError::fatal(self.name, "image input is not supported"));
                    }
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": image.as_url(), "detail": image.detail}
                    }));
                }
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(OutgoingToolCall {
                    id: id.clone(),
                    call_type: "function",
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: arguments_string(input),
                    },
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => out.push(ChatMessage {
                    tool_call_id: Some(tool_use_id.clone()),
                    ..ChatMessage::new("tool", Value::String(content.clone()))
                }),
            }
        }

        if !tool_calls.is_empty() {
            let text = parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n");
            out.push(ChatMessage {
                tool_calls: Some(tool_calls),
                ..ChatMessage::new(role, if text.is_empty() { Value::Null } else { Value::String(text) })
            });
        } else if !parts.is_empty() {
            out.push(ChatMessage::new(role, Value::Array(parts)));
        }
        Ok(())
    }
}

/// OpenAI wants arguments as a JSON string; pass strings through.
fn arguments_string(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Skill(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

pub(crate) fn stop_reason(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("stop") | None => StopReason::EndTurn,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
    }
}

/// Decodes one SSE chunk.
fn decode_chunk(event: &Value) -> Result<Vec<StreamDelta>, StreamFailure> {
    if let Some(error) = event.get("error") {
        let message = error["message"].as_str().unwrap_or("stream error").to_string();
        return Err(match error["type"].as_str() {
            Some("server_error") | Some("rate_limit_exceeded") => StreamFailure::Recoverable(message),
            _ => StreamFailure::Fatal(message),
        });
    }

    let mut deltas = Vec::new();
    if let Some(choice) = event["choices"].get(0) {
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            deltas.push(StreamDelta::Text(text.to_string()));
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for (pos, call) in calls.iter().enumerate() {
                deltas.push(StreamDelta::ToolCall {
                    index: call["index"].as_u64().map(|i| i as usize).unwrap_or(pos),
                    id: call["id"].as_str().map(str::to_string),
                    name: call["function"]["name"].as_str().map(str::to_string),
                    arguments: call["function"]["arguments"].as_str().unwrap_or("").to_string(),
                });
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            deltas.push(StreamDelta::Stop(stop_reason(Some(reason))));
        }
    }
    if let Some(usage) = event.get("usage").filter(|u| u.is_object()) {
        deltas.push(StreamDelta::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }
    Ok(deltas)
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports_images(&self) -> bool {
        self.images
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
        let mut chat_messages = Vec::with_capacity(messages.len() + 1);
        if !config.role_setup.is_empty() {
            chat_messages.push(ChatMessage::new("system", Value::String(config.role_setup.clone())));
        }
        for msg in messages {
            self.translate_message(msg, &mut chat_messages)?;
        }

        let tools: Option<Vec<ToolDef>> =
            (!skills.is_empty()).then(|| skills.iter().map(ToolDef::from_schema).collect());
        let tool_choice = config
            .tool_choice
            .as_ref()
            .filter(|_| tools.is_some())
            .map(tool_choice_value);

        let tuning = &config.tuning;
        let request = ChatRequest {
            model: config.model.clone(),
            messages: chat_messages,
            temperature: tuning.temperature,
            max_tokens: tuning.max_tokens,
            presence_penalty: tuning.presence_penalty,
            frequency_penalty: tuning.frequency_penalty,
            stop: tuning.stop.clone().filter(|s| !s.is_empty()),
            seed: tuning.seed,
            stream: config.stream,
            tools,
            tool_choice,
        };

        debug!(
            "Built {} request ({}) with {} messages{}",
            self.name,
            config.model,
            messages.len(),
            if skills.is_empty() { "" } else { " + tools" }
        );

        serde_json::to_value(&request).map_err(|e| ProviderError::fatal(self.name, e.to_string()))
    }

    fn parse_response(&self, payload: Value) -> Result<UnifiedResponse, ProviderError> {
        let resp: ChatResponse = serde_json::from_value(payload.clone())
            .map_err(|e| ProviderError::fatal(self.name, format!("unexpected response: {e}")))?;
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::fatal(self.name, "response has no choices"))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: Value::String(tc.function.arguments),
            })
            .collect();

        let stop_reason = if tool_calls.is_empty() {
            stop_reason(choice.finish_reason.as_deref())
        } else {
            StopReason::ToolUse
        };

        let usage = resp
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let response = UnifiedResponse {
            text: choice.message.content.filter(|t| !t.is_empty()),
            tool_calls,
            stop_reason,
            usage,
            raw: payload,
        };
        log_usage(self.name, &response);
        Ok(response)
    }

    async fn send(&self, request: &Value) -> Result<Value, ProviderError> {
        self.transport
            .post(self.http_request(request))
            .await
            .map_err(|e| provider_error(self.name, e))
    }

    async fn stream(&self, request: &Value) -> Result<DeltaStream, ProviderError> {
        let events = self
            .transport
            .post_stream(self.http_request(request))
            .await
            .map_err(|e| provider_error(self.name, e))?;
        Ok(into_deltas(self.name, events, decode_chunk))
    }

    fn description(&self) -> String {
        format!("{} ({})", self.name, self.base_url)
    }
}
