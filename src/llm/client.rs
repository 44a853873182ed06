//! `ProviderAdapter` trait: one implementation per LLM provider.
//!
//! Adapters translate the unified request model into the provider's wire
//! format and normalize its responses back into [`UnifiedResponse`]. They
//! are selected from the `[llm] provider` config field, so call sites
//! never branch on the provider.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use super::transport::{EventStream, TransportError};
use super::{Message, StreamDelta, UnifiedResponse};
use crate::agent::EffectiveConfig;
use crate::error::ProviderError;
use crate::skills::SkillSchema;

/// Decoded deltas of a streaming response, in arrival order.
pub type DeltaStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short provider name, used to tag errors (`"openai"`, `"anthropic"`, …).
    fn name(&self) -> &'static str;

    /// Whether user messages may carry images.
    fn supports_images(&self) -> bool {
        true
    }

    /// Encodes one skill in the provider's function-calling grammar.
    fn tool_declaration(&self, schema: &SkillSchema) -> Value;

    /// Decodes a declaration produced by [`tool_declaration`](Self::tool_declaration).
    fn decode_tool_declaration(&self, declaration: &Value) -> Option<SkillSchema>;

    /// Builds the native request payload.
    ///
    /// With no skills the tools field is omitted entirely.
    fn build_request(
        &self,
        config: &EffectiveConfig,
        skills: &[SkillSchema],
        messages: &[Message],
    ) -> Result<Value, ProviderError>;

    /// Normalizes a native response payload.
    fn parse_response(&self, payload: Value) -> Result<UnifiedResponse, ProviderError>;

    /// Sends a request built by `build_request` and returns the raw response.
    async fn send(&self, request: &Value) -> Result<Value, ProviderError>;

    /// Sends a streaming request and yields its deltas.
    async fn stream(&self, request: &Value) -> Result<DeltaStream, ProviderError>;

    /// Human-readable description for status output.
    fn description(&self) -> String {
        self.name().to_string()
    }
}

/// Maps a transport failure onto the provider error taxonomy.
pub(crate) fn provider_error(provider: &str, err: TransportError) -> ProviderError {
    let status = err.status();
    let message = err.to_string();
    if err.is_retriable() {
        ProviderError::Recoverable {
            provider: provider.to_string(),
            status,
            message,
        }
    } else {
        ProviderError::Fatal {
            provider: provider.to_string(),
            status,
            message,
        }
    }
}

/// An error event reported inside a stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamFailure {
    /// Overload or rate limiting; the request may be retried.
    Recoverable(String),
    Fatal(String),
}

impl StreamFailure {
    fn into_provider_error(self, provider: &str) -> ProviderError {
        match self {
            Self::Recoverable(message) => ProviderError::recoverable(provider, message),
            Self::Fatal(message) => ProviderError::fatal(provider, message),
        }
    }
}

/// Turns a transport event stream into a delta stream using a per-event
/// decoder. The decoder sees events in order and may keep state across
/// them. Decoder errors are yielded in place of the event.
pub(crate) fn into_deltas<D>(provider: &'static str, events: EventStream, mut decode: D) -> DeltaStream
where
    D: FnMut(&Value) -> Result<Vec<StreamDelta>, StreamFailure> + Send + 'static,
{
    events
        .flat_map(move |event| {
            let batch: Vec<Result<StreamDelta, ProviderError>> = match event {
                Ok(value) => match decode(&value) {
                    Ok(deltas) => deltas.into_iter().map(Ok).collect(),
                    Err(failure) => vec![Err(failure.into_provider_error(provider))],
                },
                Err(err) => vec![Err(provider_error(provider, err))],
            };
            stream::iter(batch)
        })
        .boxed()
}

pub(crate) fn log_usage(provider: &str, response: &UnifiedResponse) {
    let input_tokens = response.usage.input_tokens;
    let output_tokens = response.usage.output_tokens;
    info!("LLM response ({provider}): {input_tokens} in / {output_tokens} out tokens");
    if response.has_tool_calls() {
        debug!("{provider} requested {} tool call(s)", response.tool_calls.len());
    }
}
