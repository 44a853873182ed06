//! Run parameters: agent defaults, per-run overrides, and their merge.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;
use crate::llm::{Provider, ToolChoice};

/// Default completion budget when the agent doesn't set one.
pub const DEFAULT_MAX_TOKENS: u32 = 200;

pub const DEFAULT_IMAGE_DETAIL: &str = "auto";

/// What the orchestrator does with a tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the skill, send its result back, return the model's final answer.
    #[default]
    WaitResponse,
    /// Run the skill and return without a follow-up request.
    ExecutionOnly,
    /// Return the validated arguments without running anything.
    GetArgs,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitResponse => "wait_response",
            Self::ExecutionOnly => "execution_only",
            Self::GetArgs => "get_args",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait_response" => Ok(Self::WaitResponse),
            "execution_only" => Ok(Self::ExecutionOnly),
            "get_args" => Ok(Self::GetArgs),
            _ => Err(ConfigurationError::InvalidValue {
                option: "execution_mode".to_string(),
                reason: format!("'{s}' is not one of wait_response, execution_only, get_args"),
            }),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tuning ───────────────────────────────────────────

/// Sampling parameters. `None` means "not set"; adapters omit unset fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuning {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub seed: Option<u64>,
}

impl Tuning {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_range("temperature", self.temperature, 0.0, 2.0, "0.0..=2.0")?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0, "-2.0..=2.0")?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0, "-2.0..=2.0")?;
        if self.max_tokens == Some(0) {
            return Err(ConfigurationError::OutOfRange {
                option: "max_tokens",
                value: "0".to_string(),
                range: "> 0",
            });
        }
        Ok(())
    }

    /// Field-by-field merge: every field set in `overrides` wins.
    pub fn overlay(&self, overrides: &Tuning) -> Tuning {
        Tuning {
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            seed: overrides.seed.or(self.seed),
        }
    }
}

fn check_range(
    option: &'static str,
    value: Option<f64>,
    min: f64,
    max: f64,
    range: &'static str,
) -> Result<(), ConfigurationError> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(ConfigurationError::OutOfRange {
            option,
            value: v.to_string(),
            range,
        }),
        _ => Ok(()),
    }
}

// ── Agent defaults ───────────────────────────────────

/// Instance-level defaults, fixed when the agent is built.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    /// Base URL override for the provider.
    pub host: Option<String>,
    pub role_setup: String,
    pub tuning: Tuning,
    /// Image references (paths, URLs or data URLs) attached to every run.
    pub images: Vec<String>,
    pub image_detail: String,
    pub stream: bool,
    /// Skills exposed by default; `None` exposes the whole manager.
    pub skills: Option<Vec<String>>,
}

impl AgentConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: String::new(),
            model: model.into(),
            host: None,
            role_setup: String::new(),
            tuning: Tuning {
                max_tokens: Some(DEFAULT_MAX_TOKENS),
                ..Tuning::default()
            },
            images: Vec::new(),
            image_detail: DEFAULT_IMAGE_DETAIL.to_string(),
            stream: false,
            skills: None,
        }
    }
}

// ── Per-run request ──────────────────────────────────

/// One `Agent::run()` call. Every `Option` left unset falls back to the
/// agent's default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub prompt: String,
    pub mode: ExecutionMode,
    /// Run skill bodies on a spawned task.
    pub async_execution: bool,
    /// Return the normalized provider response instead of dispatching.
    pub return_full_response: bool,
    pub skills: Option<Vec<String>>,
    pub images: Option<Vec<String>>,
    pub image_detail: Option<String>,
    pub stream: Option<bool>,
    pub tool_choice: Option<ToolChoice>,
    pub model: Option<String>,
    pub role_setup: Option<String>,
    pub tuning: Tuning,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn async_execution(mut self, enabled: bool) -> Self {
        self.async_execution = enabled;
        self
    }

    pub fn full_response(mut self) -> Self {
        self.return_full_response = true;
        self
    }

    pub fn skills<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn images<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = Some(references.into_iter().map(Into::into).collect());
        self
    }

    pub fn image_detail(mut self, detail: impl Into<String>) -> Self {
        self.image_detail = Some(detail.into());
        self
    }

    pub fn stream(mut self, enabled: bool) -> Self {
        self.stream = Some(enabled);
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn role_setup(mut self, role_setup: impl Into<String>) -> Self {
        self.role_setup = Some(role_setup.into());
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.tuning.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.tuning.max_tokens = Some(max_tokens);
        self
    }

    pub fn presence_penalty(mut self, penalty: f64) -> Self {
        self.tuning.presence_penalty = Some(penalty);
        self
    }

    pub fn frequency_penalty(mut self, penalty: f64) -> Self {
        self.tuning.frequency_penalty = Some(penalty);
        self
    }

    pub fn stop<I, S>(mut self, sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tuning.stop = Some(sequences.into_iter().map(Into::into).collect());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.tuning.seed = Some(seed);
        self
    }
}

// ── Effective configuration ──────────────────────────

/// Agent defaults merged with one run's overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub model: String,
    pub role_setup: String,
    pub tuning: Tuning,
    pub images: Vec<String>,
    pub image_detail: String,
    pub stream: bool,
    pub mode: ExecutionMode,
    pub async_execution: bool,
    pub return_full_response: bool,
    pub skills: Option<Vec<String>>,
    pub tool_choice: Option<ToolChoice>,
}

impl EffectiveConfig {
    pub fn resolve(agent: &AgentConfig, request: &RunRequest) -> Result<Self, ConfigurationError> {
        if request.prompt.trim().is_empty() {
            return Err(ConfigurationError::MissingOption("prompt"));
        }
        let model = request.model.clone().unwrap_or_else(|| agent.model.clone());
        if model.is_empty() {
            return Err(ConfigurationError::MissingOption("model"));
        }

        let tuning = agent.tuning.overlay(&request.tuning);
        tuning.validate()?;

        Ok(Self {
            model,
            role_setup: request
                .role_setup
                .clone()
                .unwrap_or_else(|| agent.role_setup.clone()),
            tuning,
            images: request.images.clone().unwrap_or_else(|| agent.images.clone()),
            image_detail: request
                .image_detail
                .clone()
                .unwrap_or_else(|| agent.image_detail.clone()),
            stream: request.stream.unwrap_or(agent.stream),
            mode: request.mode,
            async_execution: request.async_execution,
            return_full_response: request.return_full_response,
            skills: request.skills.clone().or_else(|| agent.skills.clone()),
            tool_choice: request.tool_choice.clone(),
        })
    }
}

/// Minimal effective configuration for adapter tests.
#[cfg(test)]
pub(crate) fn test_config() -> EffectiveConfig {
    EffectiveConfig {
        model: "test-model".to_string(),
        role_setup: String::new(),
        tuning: Tuning {
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            ..Tuning::default()
        },
        images: Vec::new(),
        image_detail: DEFAULT_IMAGE_DETAIL.to_string(),
        stream: false,
        mode: ExecutionMode::WaitResponse,
        async_execution: false,
        return_full_response: false,
        skills: None,
        tool_choice: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_config() -> AgentConfig {
        let mut config = AgentConfig::new(Provider::OpenAi, "gpt-4o-mini");
        config.role_setup = "You are a calculator.".to_string();
        config.tuning.temperature = Some(0.3);
        config.tuning.stop = Some(vec!["END".to_string()]);
        config
    }

    #[test]
    fn test_execution_mode_from_str() {
        assert_eq!("wait_response".parse::<ExecutionMode>().unwrap(), ExecutionMode::WaitResponse);
        assert_eq!("GET_ARGS".parse::<ExecutionMode>().unwrap(), ExecutionMode::GetArgs);
        assert_eq!(ExecutionMode::default(), ExecutionMode::WaitResponse);
        assert!("fire_and_forget".parse::<ExecutionMode>().is_err());
    }

    // ── Resolution ──────────────────────────────────

    #[test]
    fn test_resolve_uses_agent_defaults() {
        let config = EffectiveConfig::resolve(&agent_config(), &RunRequest::new("2+3?")).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.role_setup, "You are a calculator.");
        assert_eq!(config.tuning.temperature, Some(0.3));
        assert_eq!(config.tuning.max_tokens, Some(DEFAULT_MAX_TOKENS));
        assert_eq!(config.image_detail, "auto");
        assert_eq!(config.mode, ExecutionMode::WaitResponse);
        assert!(config.skills.is_none());
    }

    #[test]
    fn test_resolve_overrides_field_by_field() {
        let request = RunRequest::new("2+3?")
            .temperature(1.2)
            .max_tokens(50)
            .skills(["add"])
            .stream(true)
            .mode(ExecutionMode::GetArgs);
        let config = EffectiveConfig::resolve(&agent_config(), &request).unwrap();
        assert_eq!(config.tuning.temperature, Some(1.2));
        assert_eq!(config.tuning.max_tokens, Some(50));
        // Not overridden
        assert_eq!(config.tuning.stop, Some(vec!["END".to_string()]));
        assert_eq!(config.skills, Some(vec!["add".to_string()]));
        assert!(config.stream);
        assert_eq!(config.mode, ExecutionMode::GetArgs);
    }

    #[test]
    fn test_resolve_empty_skill_subset_is_kept() {
        let request = RunRequest::new("hi").skills(Vec::<String>::new());
        let config = EffectiveConfig::resolve(&agent_config(), &request).unwrap();
        assert_eq!(config.skills, Some(vec![]));
    }

    #[test]
    fn test_resolve_rejects_out_of_range() {
        let err = EffectiveConfig::resolve(&agent_config(), &RunRequest::new("hi").temperature(2.5))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { option: "temperature", .. }));

        let err = EffectiveConfig::resolve(
            &agent_config(),
            &RunRequest::new("hi").frequency_penalty(-3.0),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { option: "frequency_penalty", .. }));

        let err = EffectiveConfig::resolve(&agent_config(), &RunRequest::new("hi").max_tokens(0))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { option: "max_tokens", .. }));
    }

    #[test]
    fn test_resolve_requires_prompt() {
        assert_eq!(
            EffectiveConfig::resolve(&agent_config(), &RunRequest::new("  ")).unwrap_err(),
            ConfigurationError::MissingOption("prompt")
        );
    }

    #[test]
    fn test_tuning_overlay() {
        let base = Tuning {
            temperature: Some(0.7),
            seed: Some(1),
            ..Tuning::default()
        };
        let merged = base.overlay(&Tuning {
            seed: Some(42),
            ..Tuning::default()
        });
        assert_eq!(merged.temperature, Some(0.7));
        assert_eq!(merged.seed, Some(42));
        assert!(merged.validate().is_ok());
    }
}
