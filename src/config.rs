use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::agent::{params::DEFAULT_MAX_TOKENS, Tuning};
use crate::error::ConfigurationError;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// openai | anthropic | groq | ollama
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution. Not needed for Ollama.
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's base URL
    #[serde(default)]
    pub host: Option<String>,
}

/// Agent defaults, overridable per run.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AgentSection {
    pub role_setup: String,
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub stop: Option<StopSequences>,
    pub seed: Option<u64>,
    pub images: Vec<String>,
    pub image_detail: String,
    pub stream: bool,
    /// Skills exposed by default; all registered skills when absent
    pub skills: Option<Vec<String>>,
}

/// `stop = "###"` or `stop = ["###", "END"]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SkillsConfig {
    /// Folder scanned for `*.toml` skill manifests
    pub folder: Option<PathBuf>,
    /// Only skills carrying one of these tags are loaded
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TransportConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            role_setup: String::new(),
            temperature: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            presence_penalty: None,
            frequency_penalty: None,
            stop: None,
            seed: None,
            images: Vec::new(),
            image_detail: "auto".to_string(),
            stream: false,
            skills: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

impl AgentSection {
    pub fn tuning(&self) -> Tuning {
        Tuning {
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            stop: self.stop.clone().map(StopSequences::into_vec),
            seed: self.seed,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigurationError> {
        // Expand environment variables like ${OPENAI_API_KEY}
        let expanded = shellexpand::env(content)
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;
        toml::from_str(&expanded).map_err(|e| {
            let message = e.message();
            match unknown_field(message) {
                Some(field) => ConfigurationError::UnknownOption(field.to_string()),
                None => ConfigurationError::Invalid(message.to_string()),
            }
        })
    }
}

/// Extracts `x` from serde's "unknown field `x`, expected ..." message.
fn unknown_field(message: &str) -> Option<&str> {
    message
        .strip_prefix("unknown field `")
        .and_then(|rest| rest.split('`').next())
}
