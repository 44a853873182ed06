use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use super::dispatch::{dispatch, RunContext, RunOutput};
use super::params::{AgentConfig, EffectiveConfig, RunRequest, Tuning, DEFAULT_IMAGE_DETAIL};
use super::stream;
use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::error::{AgentError, ConfigurationError, ValidationError};
use crate::llm::{
    create_adapter, images, HttpTransport, ImageInput, Message, Provider, ProviderAdapter,
    ToolChoice, Transport,
};
use crate::skills::{
    ConflictPolicy, Registration, SharedSkillManager, SkillDescriptor, SkillManager,
};

/// Request timeout of the default HTTP transport.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// The run orchestrator.
///
/// Holds the agent defaults, a skill manager (possibly shared with other
/// agents) and the provider adapter. `run()` takes `&self`, so one agent
/// can serve concurrent runs.
pub struct Agent {
    config: AgentConfig,
    manager: SharedSkillManager,
    adapter: Arc<dyn ProviderAdapter>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn manager(&self) -> &SharedSkillManager {
        &self.manager
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    /// Replaces the system prompt used by future runs.
    pub fn modify_role(&mut self, role_setup: impl Into<String>) {
        self.config.role_setup = role_setup.into();
        debug!("Role setup updated");
    }

    pub fn add_skill(
        &self,
        skill: impl Into<Arc<SkillDescriptor>>,
        policy: ConflictPolicy,
    ) -> Result<Registration, ValidationError> {
        self.manager
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(skill, policy)
    }

    pub fn remove_skill(&self, name: &str) -> Option<Arc<SkillDescriptor>> {
        self.manager
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn skill_names(&self) -> Vec<String> {
        self.manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names()
    }

    /// Runs one prompt through the provider and dispatches any tool calls
    /// according to the request's execution mode.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutput, AgentError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", id = %run_id, provider = self.adapter.name());
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: RunRequest) -> Result<RunOutput, AgentError> {
        let config = EffectiveConfig::resolve(&self.config, &request)?;

        // The exposed skill set is fixed here for the rest of the run
        let skills = self.select_skills(&config)?;
        if let Some(ToolChoice::Skill(name)) = &config.tool_choice {
            if !skills.iter().any(|s| s.name() == name) {
                return Err(ConfigurationError::UnknownSkill(name.clone()).into());
            }
        }

        let images = self.load_images(&config).await?;
        let messages = vec![Message::user_with_images(request.prompt, images)];
        let schemas = skills.iter().map(|s| s.schema().clone()).collect::<Vec<_>>();

        debug!(
            "BUILD_REQUEST: model {}, {} skill(s), mode {}",
            config.model,
            schemas.len(),
            config.mode
        );
        let payload = self.adapter.build_request(&config, &schemas, &messages)?;

        let ctx = RunContext {
            adapter: self.adapter.clone(),
            config,
            skills,
            schemas,
            messages,
        };

        if ctx.config.stream {
            debug!("AWAIT_PROVIDER (streaming)");
            return Ok(RunOutput::Stream(stream::open(ctx, &payload).await?));
        }

        debug!("AWAIT_PROVIDER");
        let raw = self.adapter.send(&payload).await?;
        let response = self.adapter.parse_response(raw)?;

        if ctx.config.return_full_response {
            return Ok(RunOutput::Response(response));
        }
        if !response.has_tool_calls() {
            debug!("NO_TOOL_CALL");
            return Ok(RunOutput::Text(response.text.unwrap_or_default()));
        }
        dispatch(ctx, response).await
    }

    fn select_skills(
        &self,
        config: &EffectiveConfig,
    ) -> Result<Vec<Arc<SkillDescriptor>>, ConfigurationError> {
        self.manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .select(config.skills.as_deref())
    }

    async fn load_images(&self, config: &EffectiveConfig) -> Result<Vec<ImageInput>, ConfigurationError> {
        if config.images.is_empty() {
            return Ok(Vec::new());
        }
        if !self.adapter.supports_images() {
            return Err(ConfigurationError::ImagesUnsupported(
                self.adapter.name().to_string(),
            ));
        }
        let mut loaded = Vec::with_capacity(config.images.len());
        for reference in &config.images {
            loaded.push(images::load(reference, &config.image_detail).await?);
        }
        Ok(loaded)
    }
}

// ── Builder ──────────────────────────────────────────

/// Builds an [`Agent`] from enumerated options.
///
/// Options can be set through typed setters or by key with
/// [`option`](Self::option); unknown keys are rejected.
#[derive(Default)]
pub struct AgentBuilder {
    provider: Option<Provider>,
    api_key: Option<String>,
    model: Option<String>,
    host: Option<String>,
    role_setup: Option<String>,
    tuning: Tuning,
    images: Vec<String>,
    image_detail: Option<String>,
    stream: bool,
    skills: Option<Vec<String>>,
    manager: Option<SharedSkillManager>,
    adapter: Option<Arc<dyn ProviderAdapter>>,
    transport: Option<Arc<dyn Transport>>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl AgentBuilder {
    /// Builder pre-filled from the `[llm]`, `[agent]` and `[transport]`
    /// sections of a config file.
    pub fn from_config(config: &Config, manager: SharedSkillManager) -> Result<Self, ConfigurationError> {
        let provider: Provider = config.llm.provider.parse()?;
        let agent = &config.agent;
        let mut builder = Self::default()
            .provider(provider)
            .api_key(config.llm.api_key.clone())
            .model(config.llm.model.clone())
            .role_setup(agent.role_setup.clone())
            .tuning(agent.tuning())
            .images(agent.images.clone())
            .image_detail(agent.image_detail.clone())
            .stream(agent.stream)
            .manager(manager)
            .retry(RetryPolicy::default().with_max_retries(config.transport.max_retries))
            .timeout(Duration::from_secs(config.transport.timeout_secs));
        if let Some(host) = &config.llm.host {
            builder = builder.host(host.clone());
        }
        if let Some(skills) = &agent.skills {
            builder = builder.skills(skills.clone());
        }
        Ok(builder)
    }

    pub fn provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn role_setup(mut self, role_setup: impl Into<String>) -> Self {
        self.role_setup = Some(role_setup.into());
        self
    }

    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn images(mut self, references: Vec<String>) -> Self {
        self.images = references;
        self
    }

    pub fn image_detail(mut self, detail: impl Into<String>) -> Self {
        self.image_detail = Some(detail.into());
        self
    }

    pub fn stream(mut self, enabled: bool) -> Self {
        self.stream = enabled;
        self
    }

    /// Skills exposed by default. Every name must exist in the manager.
    pub fn skills(mut self, names: Vec<String>) -> Self {
        self.skills = Some(names);
        self
    }

    pub fn manager(mut self, manager: SharedSkillManager) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Uses `adapter` instead of building one for the provider.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Uses `transport` instead of the default HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets an option by name, as found in loosely typed configuration.
    pub fn option(mut self, key: &str, value: Value) -> Result<Self, ConfigurationError> {
        match key {
            "provider" => self.provider = Some(as_str(key, &value)?.parse()?),
            "api_key" => self.api_key = Some(as_str(key, &value)?.to_string()),
            "model" => self.model = Some(as_str(key, &value)?.to_string()),
            "host" => self.host = Some(as_str(key, &value)?.to_string()),
            "role_setup" => self.role_setup = Some(as_str(key, &value)?.to_string()),
            "temperature" => self.tuning.temperature = Some(as_f64(key, &value)?),
            "max_tokens" => self.tuning.max_tokens = Some(as_u32(key, &value)?),
            "presence_penalty" => self.tuning.presence_penalty = Some(as_f64(key, &value)?),
            "frequency_penalty" => self.tuning.frequency_penalty = Some(as_f64(key, &value)?),
            "stop" => self.tuning.stop = Some(as_strings(key, &value)?),
            "seed" => {
                self.tuning.seed = Some(value.as_u64().ok_or_else(|| invalid(key, "expected an unsigned integer"))?)
            }
            "images" => self.images = as_strings(key, &value)?,
            "image_detail" => self.image_detail = Some(as_str(key, &value)?.to_string()),
            "stream" => self.stream = value.as_bool().ok_or_else(|| invalid(key, "expected a boolean"))?,
            "skills" => self.skills = Some(as_strings(key, &value)?),
            _ => return Err(ConfigurationError::UnknownOption(key.to_string())),
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Agent, ConfigurationError> {
        let provider = self
            .provider
            .ok_or(ConfigurationError::MissingOption("provider"))?;
        let model = self
            .model
            .filter(|m| !m.is_empty())
            .ok_or(ConfigurationError::MissingOption("model"))?;
        let api_key = self.api_key.unwrap_or_default();
        if api_key.is_empty() && provider != Provider::Ollama && self.adapter.is_none() {
            return Err(ConfigurationError::MissingOption("api_key"));
        }
        self.tuning.validate()?;

        let manager = self
            .manager
            .unwrap_or_else(|| SkillManager::new().shared());
        if let Some(names) = &self.skills {
            let skills = manager.read().unwrap_or_else(PoisonError::into_inner);
            skills.select(Some(names))?;
        }

        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => {
                let transport: Arc<dyn Transport> = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(
                        HttpTransport::new(
                            self.timeout.unwrap_or(DEFAULT_TIMEOUT),
                            self.retry.unwrap_or_default(),
                        )
                        .map_err(|e| ConfigurationError::Invalid(e.to_string()))?,
                    ),
                };
                create_adapter(provider, &api_key, self.host.as_deref(), transport)
            }
        };

        let config = AgentConfig {
            provider,
            api_key,
            model,
            host: self.host,
            role_setup: self.role_setup.unwrap_or_default(),
            tuning: Tuning {
                max_tokens: self.tuning.max_tokens.or(Some(super::params::DEFAULT_MAX_TOKENS)),
                ..self.tuning
            },
            images: self.images,
            image_detail: self
                .image_detail
                .unwrap_or_else(|| DEFAULT_IMAGE_DETAIL.to_string()),
            stream: self.stream,
            skills: self.skills,
        };

        info!(
            "Agent ready: {} ({}), {} skill(s) available",
            adapter.description(),
            config.model,
            manager.read().unwrap_or_else(PoisonError::into_inner).len()
        );

        Ok(Agent {
            config,
            manager,
            adapter,
        })
    }
}

fn invalid(option: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        option: option.to_string(),
        reason: reason.to_string(),
    }
}

fn as_str<'a>(key: &str, value: &'a Value) -> Result<&'a str, ConfigurationError> {
    value.as_str().ok_or_else(|| invalid(key, "expected a string"))
}

fn as_f64(key: &str, value: &Value) -> Result<f64, ConfigurationError> {
    value.as_f64().ok_or_else(|| invalid(key, "expected a number"))
}

fn as_u32(key: &str, value: &Value) -> Result<u32, ConfigurationError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(key, "expected a positive integer"))
}

/// A string or a list of strings.
fn as_strings(key: &str, value: &Value) -> Result<Vec<String>, ConfigurationError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| as_str(key, item).map(str::to_string))
            .collect(),
        _ => Err(invalid(key, "expected a string or a list of strings")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::agent::{ExecutionMode, StreamChunk};
    use crate::error::{ArgumentValidationError, ProviderError};
    use crate::llm::transport::scripted::ScriptedTransport;
    use crate::llm::{DeltaStream, OpenAiAdapter, StopReason, TransportError, UnifiedResponse};
    use crate::skills::{SkillBuilder, SkillSchema};

    /// Delegates to the OpenAI adapter and counts `build_request` calls.
    struct CountingAdapter {
        inner: OpenAiAdapter,
        builds: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn tool_declaration(&self, schema: &SkillSchema) -> Value {
            self.inner.tool_declaration(schema)
        }

        fn decode_tool_declaration(&self, declaration: &Value) -> Option<SkillSchema> {
            self.inner.decode_tool_declaration(declaration)
        }

        fn build_request(
            &self,
            config: &EffectiveConfig,
            skills: &[SkillSchema],
            messages: &[Message],
        ) -> Result<Value, ProviderError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.inner.build_request(config, skills, messages)
        }

        fn parse_response(&self, payload: Value) -> Result<UnifiedResponse, ProviderError> {
            self.inner.parse_response(payload)
        }

        async fn send(&self, request: &Value) -> Result<Value, ProviderError> {
            self.inner.send(request).await
        }

        async fn stream(&self, request: &Value) -> Result<DeltaStream, ProviderError> {
            self.inner.stream(request).await
        }
    }

    struct Harness {
        agent: Agent,
        transport: Arc<ScriptedTransport>,
        adapter: Arc<CountingAdapter>,
        add_calls: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(ScriptedTransport::default());
        let adapter = Arc::new(CountingAdapter {
            inner: OpenAiAdapter::openai("test-key", None, transport.clone()),
            builds: AtomicUsize::new(0),
        });
        let add_calls = Arc::new(AtomicUsize::new(0));
        let counter = add_calls.clone();

        let mut manager = SkillManager::new();
        let add = SkillBuilder::new("add")
            .description("adds two integers")
            .param("a", "int", "first addend")
            .param("b", "int", "second addend")
            .returns("int")
            .handler(move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(args.int("a")? + args.int("b")?))
            })
            .build()
            .unwrap();
        let explode = SkillBuilder::new("explode")
            .description("always fails")
            .handler(|_| Err(anyhow::anyhow!("kaboom")))
            .build()
            .unwrap();
        manager.register(add, ConflictPolicy::Error).unwrap();
        manager.register(explode, ConflictPolicy::Error).unwrap();

        let agent = Agent::builder()
            .provider(Provider::OpenAi)
            .model("gpt-4o-mini")
            .manager(manager.shared())
            .adapter(adapter.clone())
            .build()
            .unwrap();

        Harness {
            agent,
            transport,
            adapter,
            add_calls,
        }
    }

    fn tool_call_response(name: &str, arguments: &str) -> Value {
        json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": name, "arguments": arguments}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 10}
        })
    }

    fn text_response(text: &str) -> Value {
        json!({
            "choices": [{
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 30, "completion_tokens": 5}
        })
    }

    // ── Builder ─────────────────────────────────────

    #[test]
    fn test_builder_requires_provider_model_and_key() {
        assert_eq!(
            Agent::builder().model("m").build().err(),
            Some(ConfigurationError::MissingOption("provider"))
        );
        assert_eq!(
            Agent::builder().provider(Provider::OpenAi).build().err(),
            Some(ConfigurationError::MissingOption("model"))
        );
        assert_eq!(
            Agent::builder()
                .provider(Provider::Anthropic)
                .model("claude-3-5-haiku-latest")
                .build()
                .err(),
            Some(ConfigurationError::MissingOption("api_key"))
        );
        // Local models need no key
        assert!(Agent::builder()
            .provider(Provider::Ollama)
            .model("llama3.1")
            .transport(Arc::new(ScriptedTransport::default()))
            .build()
            .is_ok());
    }

    #[test]
    fn test_builder_option_by_key() {
        let builder = Agent::builder()
            .option("provider", json!("groq"))
            .unwrap()
            .option("stop", json!("END"))
            .unwrap()
            .option("temperature", json!(0.4))
            .unwrap();
        assert_eq!(builder.provider, Some(Provider::Groq));
        assert_eq!(builder.tuning.stop, Some(vec!["END".to_string()]));

        assert_eq!(
            Agent::builder().option("verbosity", json!(3)).err(),
            Some(ConfigurationError::UnknownOption("verbosity".to_string()))
        );
        assert!(matches!(
            Agent::builder().option("max_tokens", json!("lots")).err(),
            Some(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_builder_rejects_unknown_default_skill_and_bad_tuning() {
        let err = Agent::builder()
            .provider(Provider::Ollama)
            .model("llama3.1")
            .skills(vec!["missing".to_string()])
            .transport(Arc::new(ScriptedTransport::default()))
            .build()
            .err();
        assert_eq!(err, Some(ConfigurationError::UnknownSkill("missing".to_string())));

        let err = Agent::builder()
            .provider(Provider::Ollama)
            .model("llama3.1")
            .tuning(Tuning {
                temperature: Some(3.0),
                ..Tuning::default()
            })
            .transport(Arc::new(ScriptedTransport::default()))
            .build()
            .err();
        assert!(matches!(err, Some(ConfigurationError::OutOfRange { .. })));
    }

    #[test]
    fn test_skill_management() {
        let mut h = harness();
        assert_eq!(h.agent.skill_names(), vec!["add", "explode"]);
        assert!(h.agent.remove_skill("explode").is_some());
        assert_eq!(h.agent.skill_names(), vec!["add"]);

        let echo = SkillBuilder::new("echo")
            .description("echoes its input")
            .param("text", "str", "what to echo")
            .handler(|args| Ok(json!(args.str("text")?)))
            .build()
            .unwrap();
        assert_eq!(
            h.agent.add_skill(echo, ConflictPolicy::Error).unwrap(),
            Registration::Added("echo".to_string())
        );

        h.agent.modify_role("You are terse.");
        assert_eq!(h.agent.config().role_setup, "You are terse.");
    }

    // ── Orchestration ───────────────────────────────

    #[tokio::test]
    async fn test_text_only_response() {
        let h = harness();
        h.transport.respond(text_response("Hello!"));
        let output = h.agent.run(RunRequest::new("Hi")).await.unwrap();
        assert_eq!(output.text(), Some("Hello!"));
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_response_round_trip() {
        let h = harness();
        h.transport.respond(tool_call_response("add", "{\"a\": 2, \"b\": 3}"));
        h.transport.respond(text_response("2 + 3 = 5"));

        let output = h.agent.run(RunRequest::new("What is 2 + 3?")).await.unwrap();
        assert_eq!(output.text(), Some("2 + 3 = 5"));
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 1);

        // The follow-up carries the tool call and its result
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        let messages = requests[1].body["messages"].as_array().unwrap();
        let tool_message = messages.last().unwrap();
        assert_eq!(tool_message["role"], "tool");
        assert_eq!(tool_message["tool_call_id"], "call_1");
        assert_eq!(tool_message["content"], "5");
        assert_eq!(h.adapter.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_response_async_execution_joins() {
        let h = harness();
        h.transport.respond(tool_call_response("add", "{\"a\": 40, \"b\": 2}"));
        h.transport.respond(text_response("42"));
        let output = h
            .agent
            .run(RunRequest::new("40 + 2?").async_execution(true))
            .await
            .unwrap();
        assert_eq!(output.text(), Some("42"));
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_response_skill_failure_aborts_follow_up() {
        let h = harness();
        h.transport.respond(tool_call_response("explode", "{}"));
        let err = h.agent.run(RunRequest::new("Blow up")).await.unwrap_err();
        match err {
            AgentError::SkillExecution(e) => {
                assert_eq!(e.skill, "explode");
                assert_eq!(e.message, "kaboom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_skill_subset_fails_before_build() {
        let h = harness();
        let err = h
            .agent
            .run(RunRequest::new("Hi").skills(["nonexistent"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::Configuration(ConfigurationError::UnknownSkill("nonexistent".to_string()))
        );
        assert_eq!(h.adapter.builds.load(Ordering::SeqCst), 0);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_get_args_never_invokes() {
        let h = harness();
        h.transport.respond(tool_call_response("add", "{\"a\": \"2\", \"b\": 3}"));
        let output = h
            .agent
            .run(RunRequest::new("2 + 3?").mode(ExecutionMode::GetArgs))
            .await
            .unwrap();
        let RunOutput::Arguments(calls) = output else {
            panic!("expected arguments");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
        assert_eq!(calls[0].arguments.int("a").unwrap(), 2);
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_get_args_type_mismatch() {
        let h = harness();
        h.transport.respond(tool_call_response("add", "{\"a\": \"two\", \"b\": 3}"));
        let err = h
            .agent
            .run(RunRequest::new("two + 3?").mode(ExecutionMode::GetArgs))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::ArgumentValidation(ArgumentValidationError::TypeMismatch { .. })
        ));
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execution_only_reports_through_receipt() {
        let h = harness();
        h.transport.respond(tool_call_response("explode", "{}"));
        let output = h
            .agent
            .run(
                RunRequest::new("Blow up")
                    .mode(ExecutionMode::ExecutionOnly)
                    .async_execution(true),
            )
            .await
            .unwrap();
        let RunOutput::Dispatched(receipt) = output else {
            panic!("expected a receipt");
        };
        assert_eq!(receipt.dispatched[0].name, "explode");

        let outcomes = receipt.wait_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());
        // No follow-up request
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_for_unexposed_skill() {
        let h = harness();
        h.transport.respond(tool_call_response("explode", "{}"));
        let err = h
            .agent
            .run(RunRequest::new("Add").skills(["add"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::ArgumentValidation(ArgumentValidationError::UnknownSkill("explode".to_string()))
        );
    }

    #[tokio::test]
    async fn test_full_response_skips_dispatch() {
        let h = harness();
        h.transport.respond(tool_call_response("add", "{\"a\": 1, \"b\": 1}"));
        let output = h
            .agent
            .run(RunRequest::new("1 + 1?").full_response())
            .await
            .unwrap();
        let RunOutput::Response(response) = output else {
            panic!("expected a response");
        };
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.raw["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_skill_subset_sends_no_tools() {
        let h = harness();
        h.transport.respond(text_response("ok"));
        h.agent
            .run(RunRequest::new("Hi").skills(Vec::<String>::new()))
            .await
            .unwrap();
        assert!(h.transport.requests()[0].body.get("tools").is_none());
    }

    #[tokio::test]
    async fn test_tool_choice_must_name_exposed_skill() {
        let h = harness();
        let err = h
            .agent
            .run(
                RunRequest::new("Hi")
                    .skills(["add"])
                    .tool_choice(ToolChoice::Skill("explode".to_string())),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::Configuration(ConfigurationError::UnknownSkill("explode".to_string()))
        );
    }

    #[tokio::test]
    async fn test_images_rejected_for_text_only_provider() {
        let transport = Arc::new(ScriptedTransport::default());
        let agent = Agent::builder()
            .provider(Provider::Groq)
            .api_key("key")
            .model("llama-3.3-70b-versatile")
            .transport(transport.clone())
            .build()
            .unwrap();
        let err = agent
            .run(RunRequest::new("What is this?").images(["https://example.com/cat.png"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::Configuration(ConfigurationError::ImagesUnsupported("groq".to_string()))
        );
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let h = harness();
        h.transport.fail(TransportError::Status {
            status: 503,
            body: "overloaded".to_string(),
        });
        let err = h.agent.run(RunRequest::new("Hi")).await.unwrap_err();
        let AgentError::Provider(e) = err else {
            panic!("expected a provider error");
        };
        assert!(e.is_retriable());
        assert_eq!(e.provider(), "openai");
    }

    // ── Streaming ───────────────────────────────────

    #[tokio::test]
    async fn test_stream_text_only() {
        let h = harness();
        h.transport.stream(vec![
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}, "finish_reason": "stop"}]}),
        ]);
        let output = h.agent.run(RunRequest::new("Hi").stream(true)).await.unwrap();
        let RunOutput::Stream(stream) = output else {
            panic!("expected a stream");
        };
        let chunks: Vec<_> = stream.collect().await;
        let text: String = chunks
            .into_iter()
            .map(|chunk| match chunk.unwrap() {
                StreamChunk::Text(text) => text,
                other => panic!("unexpected chunk {other:?}"),
            })
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(h.transport.requests()[0].body["stream"], true);
    }

    #[tokio::test]
    async fn test_stream_tool_call_dispatches_at_end() {
        let h = harness();
        h.transport.stream(vec![
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "add", "arguments": "{\"a\": 2,"}
            }]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": " \"b\": 3}"}
            }]}, "finish_reason": "tool_calls"}]}),
        ]);
        h.transport.respond(text_response("5"));

        let output = h.agent.run(RunRequest::new("2 + 3?").stream(true)).await.unwrap();
        let RunOutput::Stream(stream) = output else {
            panic!("expected a stream");
        };
        let mut chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        match chunks.remove(0).unwrap() {
            StreamChunk::Dispatch(RunOutput::Text(text)) => assert_eq!(text, "5"),
            other => panic!("unexpected chunk {other:?}"),
        }
        assert_eq!(h.add_calls.load(Ordering::SeqCst), 1);
        // The follow-up is a plain request
        assert_eq!(h.transport.requests()[1].body.get("stream"), None);
    }
}
