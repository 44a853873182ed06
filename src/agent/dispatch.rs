//! Tool-call dispatch: what happens after the model asks for a skill.
//!
//! - `WaitResponse` runs every requested skill (inline, or on a spawned
//!   task that is joined before continuing), appends the results to the
//!   conversation and makes one follow-up request for the final answer.
//!   A failing skill aborts the run with `SkillExecutionError`.
//! - `ExecutionOnly` runs the skills and returns at once. Results and
//!   failures arrive on the [`ExecutionReceipt`] side channel; nothing is
//!   raised to the caller.
//! - `GetArgs` only validates the arguments. Skill bodies never run.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::params::{EffectiveConfig, ExecutionMode};
use super::stream::RunStream;
use crate::error::{AgentError, ArgumentValidationError, SkillExecutionError};
use crate::llm::{Message, ProviderAdapter, ToolCall, UnifiedResponse};
use crate::skills::{Arguments, SkillDescriptor, SkillSchema};

/// Everything a run carries from request building to dispatch.
///
/// `skills` is the set captured when the request was built; registry
/// changes after that point don't affect the run.
pub(crate) struct RunContext {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub config: EffectiveConfig,
    pub skills: Vec<Arc<SkillDescriptor>>,
    pub schemas: Vec<SkillSchema>,
    pub messages: Vec<Message>,
}

/// A tool call whose arguments passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: Arguments,
}

/// Completion report of one `ExecutionOnly` skill.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillOutcome {
    pub name: String,
    pub call_id: String,
    pub result: Result<Value, SkillExecutionError>,
}

/// Handle returned by an `ExecutionOnly` run.
///
/// The skills may still be running when the run returns. Each one reports
/// exactly once; the channel closes after the last report.
#[derive(Debug)]
pub struct ExecutionReceipt {
    pub dispatched: Vec<ToolInvocation>,
    outcomes: mpsc::UnboundedReceiver<SkillOutcome>,
}

impl ExecutionReceipt {
    /// Next finished skill, or `None` once all have reported.
    pub async fn next_outcome(&mut self) -> Option<SkillOutcome> {
        self.outcomes.recv().await
    }

    pub async fn wait_all(mut self) -> Vec<SkillOutcome> {
        let mut outcomes = Vec::with_capacity(self.dispatched.len());
        while let Some(outcome) = self.outcomes.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Result of `Agent::run()`.
pub enum RunOutput {
    /// Final model text. For `WaitResponse` runs with tool calls, the
    /// answer produced after the skill results were sent back.
    Text(String),
    /// `GetArgs`: validated arguments, in call order.
    Arguments(Vec<ToolInvocation>),
    /// `ExecutionOnly`: skills were started.
    Dispatched(ExecutionReceipt),
    /// `return_full_response`: the normalized response, undispatched.
    Response(UnifiedResponse),
    /// Streaming run.
    Stream(RunStream),
}

impl RunOutput {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Debug for RunOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Arguments(calls) => f.debug_tuple("Arguments").field(calls).finish(),
            Self::Dispatched(receipt) => f.debug_tuple("Dispatched").field(&receipt.dispatched).finish(),
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────

/// Branches on the execution mode for a response that carries tool calls.
pub(crate) async fn dispatch(
    ctx: RunContext,
    response: UnifiedResponse,
) -> Result<RunOutput, AgentError> {
    let calls = validate_calls(&ctx.skills, &response.tool_calls)?;
    debug!(
        "TOOL_CALL_DETECTED: {} call(s), mode {}",
        calls.len(),
        ctx.config.mode
    );

    match ctx.config.mode {
        ExecutionMode::GetArgs => Ok(RunOutput::Arguments(
            calls.into_iter().map(|(_, invocation)| invocation).collect(),
        )),
        ExecutionMode::ExecutionOnly => {
            let receipt = execute_detached(calls, ctx.config.async_execution).await;
            Ok(RunOutput::Dispatched(receipt))
        }
        ExecutionMode::WaitResponse => {
            let async_execution = ctx.config.async_execution;
            let mut results = Vec::with_capacity(calls.len());
            let mut executed = Vec::with_capacity(calls.len());
            for (skill, invocation) in calls {
                let value = execute(skill, invocation.arguments.clone(), async_execution).await?;
                info!("Skill '{}' returned {}", invocation.name, preview(&value));
                results.push((invocation.call_id.clone(), result_text(&value)));
                executed.push(invocation);
            }
            follow_up(ctx, response.text.as_deref(), &executed, results).await
        }
    }
}

/// Decodes and type-checks every call before anything runs.
fn validate_calls(
    skills: &[Arc<SkillDescriptor>],
    tool_calls: &[ToolCall],
) -> Result<Vec<(Arc<SkillDescriptor>, ToolInvocation)>, ArgumentValidationError> {
    tool_calls
        .iter()
        .map(|call| {
            let skill = skills
                .iter()
                .find(|s| s.name() == call.name)
                .ok_or_else(|| ArgumentValidationError::UnknownSkill(call.name.clone()))?;
            let arguments = skill.coerce_arguments(&call.arguments)?;
            Ok((
                skill.clone(),
                ToolInvocation {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments,
                },
            ))
        })
        .collect()
}

/// Runs one skill and waits for it, on a spawned task if requested.
async fn execute(
    skill: Arc<SkillDescriptor>,
    args: Arguments,
    async_execution: bool,
) -> Result<Value, SkillExecutionError> {
    if !async_execution {
        return skill.invoke(args).await;
    }
    let name = skill.name().to_string();
    match tokio::spawn(async move { skill.invoke(args).await }).await {
        Ok(result) => result,
        Err(e) => Err(SkillExecutionError {
            skill: name,
            message: format!("skill task failed: {e}"),
        }),
    }
}

async fn execute_detached(
    calls: Vec<(Arc<SkillDescriptor>, ToolInvocation)>,
    async_execution: bool,
) -> ExecutionReceipt {
    let (tx, outcomes) = mpsc::unbounded_channel();
    let mut dispatched = Vec::with_capacity(calls.len());

    for (skill, invocation) in calls {
        let report = report_outcome(skill, invocation.clone(), tx.clone());
        if async_execution {
            tokio::spawn(report);
        } else {
            report.await;
        }
        dispatched.push(invocation);
    }

    ExecutionReceipt {
        dispatched,
        outcomes,
    }
}

async fn report_outcome(
    skill: Arc<SkillDescriptor>,
    invocation: ToolInvocation,
    tx: mpsc::UnboundedSender<SkillOutcome>,
) {
    let result = skill.invoke(invocation.arguments).await;
    match &result {
        Ok(value) => debug!("Skill '{}' finished: {}", invocation.name, preview(value)),
        Err(e) => error!("{e}"),
    }
    // The receipt may already be dropped
    let _ = tx.send(SkillOutcome {
        name: invocation.name,
        call_id: invocation.call_id,
        result,
    });
}

/// Sends the skill results back and returns the model's final text.
async fn follow_up(
    mut ctx: RunContext,
    text: Option<&str>,
    executed: &[ToolInvocation],
    results: Vec<(String, String)>,
) -> Result<RunOutput, AgentError> {
    let calls: Vec<ToolCall> = executed
        .iter()
        .map(|invocation| ToolCall {
            id: invocation.call_id.clone(),
            name: invocation.name.clone(),
            arguments: invocation.arguments.clone().into_value(),
        })
        .collect();
    ctx.messages.push(Message::assistant_tool_use(text, &calls));
    ctx.messages.push(Message::tool_results(results));

    // A forced tool choice would make the model call the skill again
    let mut config = ctx.config.clone();
    config.stream = false;
    config.tool_choice = None;

    let request = ctx.adapter.build_request(&config, &ctx.schemas, &ctx.messages)?;
    let raw = ctx.adapter.send(&request).await?;
    let response = ctx.adapter.parse_response(raw)?;
    if response.has_tool_calls() {
        warn!(
            "Follow-up response asked for {} more tool call(s), ignoring",
            response.tool_calls.len()
        );
    }
    Ok(RunOutput::Text(response.text.unwrap_or_default()))
}

/// Tool results go back to the model as text.
fn result_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn preview(value: &Value) -> String {
    let text = result_text(value);
    if text.chars().count() > 80 {
        format!("{}…", text.chars().take(80).collect::<String>())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::SkillBuilder;
    use serde_json::json;

    fn skills() -> Vec<Arc<SkillDescriptor>> {
        let add = SkillBuilder::new("add")
            .description("adds two integers")
            .param("a", "int", "first addend")
            .param("b", "int", "second addend")
            .handler(|args| Ok(json!(args.int("a")? + args.int("b")?)))
            .build()
            .unwrap();
        let fail = SkillBuilder::new("fail")
            .description("always fails")
            .handler(|_| Err(anyhow::anyhow!("boom")))
            .build()
            .unwrap();
        vec![Arc::new(add), Arc::new(fail)]
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    // ── Validation ──────────────────────────────────

    #[test]
    fn test_validate_calls_coerces_string_payloads() {
        let calls = validate_calls(&skills(), &[call("c1", "add", json!("{\"a\": \"2\", \"b\": 3}"))])
            .unwrap();
        assert_eq!(calls[0].1.arguments.int("a").unwrap(), 2);
        assert_eq!(calls[0].1.call_id, "c1");
    }

    #[test]
    fn test_validate_calls_rejects_unexposed_skill() {
        let err = validate_calls(&skills(), &[call("c1", "rm_rf", json!({}))]).unwrap_err();
        assert_eq!(err, ArgumentValidationError::UnknownSkill("rm_rf".to_string()));
    }

    #[test]
    fn test_validate_calls_fails_on_any_bad_call() {
        let err = validate_calls(
            &skills(),
            &[
                call("c1", "add", json!({"a": 1, "b": 2})),
                call("c2", "add", json!({"a": "two", "b": 2})),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ArgumentValidationError::TypeMismatch { .. }));
    }

    // ── Execution ───────────────────────────────────

    #[tokio::test]
    async fn test_execute_inline_and_spawned() {
        let skills = skills();
        let args = validate_calls(&skills, &[call("c1", "add", json!({"a": 2, "b": 3}))])
            .unwrap()
            .remove(0)
            .1
            .arguments;
        assert_eq!(execute(skills[0].clone(), args.clone(), false).await.unwrap(), json!(5));
        assert_eq!(execute(skills[0].clone(), args, true).await.unwrap(), json!(5));

        let err = execute(skills[1].clone(), Arguments::default(), true).await.unwrap_err();
        assert_eq!(err.skill, "fail");
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn test_execute_detached_reports_every_outcome() {
        let calls = validate_calls(
            &skills(),
            &[call("c1", "add", json!({"a": 1, "b": 1})), call("c2", "fail", json!({}))],
        )
        .unwrap();
        let receipt = execute_detached(calls, true).await;
        assert_eq!(receipt.dispatched.len(), 2);

        let mut outcomes = receipt.wait_all().await;
        outcomes.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        assert_eq!(outcomes[0].result, Ok(json!(2)));
        assert_eq!(outcomes[1].name, "fail");
        assert!(outcomes[1].result.is_err());
    }

    #[test]
    fn test_result_text() {
        assert_eq!(result_text(&json!("plain")), "plain");
        assert_eq!(result_text(&json!(5)), "5");
        assert_eq!(result_text(&json!({"ok": true})), "{\"ok\":true}");
        assert!(preview(&json!("x".repeat(200))).ends_with('…'));
    }
}
