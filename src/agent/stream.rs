//! Streaming runs.
//!
//! Text deltas are forwarded as they arrive. Tool calls can't be acted on
//! until their arguments are complete, so the stream is consumed to the end
//! and the accumulated response is dispatched afterwards; its output is the
//! last chunk.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use super::dispatch::{dispatch, RunContext, RunOutput};
use crate::error::AgentError;
use crate::llm::{DeltaStream, StreamAccumulator, StreamDelta, UnifiedResponse};

/// One item of a streaming run.
#[derive(Debug)]
pub enum StreamChunk {
    Text(String),
    /// Dispatch result for a stream that ended with tool calls.
    Dispatch(RunOutput),
    /// The accumulated response, for `return_full_response` runs.
    Response(UnifiedResponse),
}

pub type RunStream = BoxStream<'static, Result<StreamChunk, AgentError>>;

struct StreamState {
    deltas: DeltaStream,
    accumulator: StreamAccumulator,
    /// Taken once the provider stream is exhausted or failed.
    ctx: Option<RunContext>,
}

pub(crate) async fn open(ctx: RunContext, request: &Value) -> Result<RunStream, AgentError> {
    let deltas = ctx.adapter.stream(request).await?;
    let state = StreamState {
        deltas,
        accumulator: StreamAccumulator::new(),
        ctx: Some(ctx),
    };

    Ok(stream::unfold(state, |mut state| async move {
        loop {
            if state.ctx.is_none() {
                return None;
            }
            match state.deltas.next().await {
                Some(Ok(delta)) => {
                    state.accumulator.push(&delta);
                    if let StreamDelta::Text(text) = delta {
                        return Some((Ok(StreamChunk::Text(text)), state));
                    }
                }
                Some(Err(e)) => {
                    state.ctx = None;
                    return Some((Err(e.into()), state));
                }
                None => {
                    let ctx = state.ctx.take()?;
                    let response = std::mem::take(&mut state.accumulator).finish();
                    if ctx.config.return_full_response {
                        return Some((Ok(StreamChunk::Response(response)), state));
                    }
                    if !response.has_tool_calls() {
                        debug!("Text-only stream finished");
                        return None;
                    }
                    let output = dispatch(ctx, response).await.map(StreamChunk::Dispatch);
                    return Some((output, state));
                }
            }
        }
    })
    .boxed())
}
