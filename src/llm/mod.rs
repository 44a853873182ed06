//! Unified request/response model shared by every provider adapter.

pub mod anthropic;
pub mod client;
pub mod images;
pub mod ollama;
pub mod openai;
pub mod transport;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ConfigurationError;

pub use anthropic::AnthropicAdapter;
pub use client::{DeltaStream, ProviderAdapter};
pub use images::{ImageInput, ImageSource};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use transport::{Framing, HttpRequest, HttpTransport, Transport, TransportError};

// ── Messages ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    Image(ImageInput),
    /// A tool call previously made by the assistant.
    ToolUse { id: String, name: String, input: Value },
    /// The result of a tool call, sent back by the user side.
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user prompt followed by its images. Plain text when there are none.
    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageInput>) -> Self {
        if images.is_empty() {
            return Self::user(text);
        }
        let mut blocks = vec![ContentBlock::Text { text: text.into() }];
        blocks.extend(images.into_iter().map(ContentBlock::Image));
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// The assistant turn that requested `calls`, for re-submission.
    pub fn assistant_tool_use(text: Option<&str>, calls: &[ToolCall]) -> Self {
        let mut blocks = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        blocks.extend(calls.iter().map(|call| ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        }));
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// `(tool_use_id, content)` pairs as one user turn.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(
                results
                    .into_iter()
                    .map(|(tool_use_id, content)| ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    })
                    .collect(),
            ),
        }
    }

    pub fn has_images(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => {
                blocks.iter().any(|b| matches!(b, ContentBlock::Image(_)))
            }
        }
    }
}

// ── Responses ────────────────────────────────────────

/// A tool call detected in a provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument payload: a JSON object, or a string holding one.
    pub arguments: Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Provider-neutral view of one response.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// The provider's native payload, untouched.
    pub raw: Value,
}

impl UnifiedResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ── Streaming ────────────────────────────────────────

/// One decoded streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    /// A fragment of tool call `index`. `id` and `name` arrive once;
    /// `arguments` fragments are concatenated.
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Stop(StopReason),
    Usage(Usage),
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds stream deltas back into a [`UnifiedResponse`].
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Text(text) => self.text.push_str(text),
            StreamDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.calls.entry(*index).or_default();
                if let Some(id) = id {
                    call.id = Some(id.clone());
                }
                if let Some(name) = name {
                    call.name.push_str(name);
                }
                call.arguments.push_str(arguments);
            }
            StreamDelta::Stop(reason) => self.stop_reason = Some(reason.clone()),
            StreamDelta::Usage(usage) => {
                self.usage.input_tokens += usage.input_tokens;
                self.usage.output_tokens += usage.output_tokens;
            }
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn finish(self) -> UnifiedResponse {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name,
                arguments: Value::String(call.arguments),
            })
            .collect();
        let stop_reason = match self.stop_reason {
            Some(reason) => reason,
            None if !tool_calls.is_empty() => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };
        UnifiedResponse {
            text: (!self.text.is_empty()).then_some(self.text),
            tool_calls,
            stop_reason,
            usage: self.usage,
            raw: Value::Null,
        }
    }
}

// ── Providers ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Groq,
    Ollama,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }
}

impl FromStr for Provider {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "groq" => Ok(Self::Groq),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigurationError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the model may pick tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Skill(String),
}

impl FromStr for ToolChoice {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "required" | "any" => Ok(Self::Required),
            "" => Err(ConfigurationError::InvalidValue {
                option: "tool_choice".to_string(),
                reason: "empty".to_string(),
            }),
            name => Ok(Self::Skill(name.to_string())),
        }
    }
}

/// Builds the adapter for `provider`.
///
/// `host` overrides the provider's default base URL.
pub fn create_adapter(
    provider: Provider,
    api_key: &str,
    host: Option<&str>,
    transport: Arc<dyn Transport>,
) -> Arc<dyn ProviderAdapter> {
    match provider {
        Provider::OpenAi => Arc::new(OpenAiAdapter::openai(api_key, host, transport)),
        Provider::Groq => Arc::new(OpenAiAdapter::groq(api_key, host, transport)),
        Provider::Anthropic => Arc::new(AnthropicAdapter::new(api_key, host, transport)),
        Provider::Ollama => Arc::new(OllamaAdapter::new(host, transport)),
    }
}
