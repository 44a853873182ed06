//! Error taxonomy.
//!
//! Each failure class has its own type so callers can match on what went
//! wrong: a malformed skill signature, a bad run configuration, arguments the
//! provider made up, a skill body that failed, or the provider itself.
//! [`AgentError`] is the umbrella returned by `Agent::run()`.

use thiserror::Error;

/// A skill signature (or its registration) is malformed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid skill name '{0}': expected 1-64 characters from [A-Za-z0-9_-]")]
    InvalidName(String),

    #[error("skill '{skill}': parameter '{param}' has no type annotation")]
    MissingAnnotation { skill: String, param: String },

    #[error("skill '{skill}': parameter '{param}' uses mapping type '{annotation}', which tool schemas cannot express")]
    MappingType {
        skill: String,
        param: String,
        annotation: String,
    },

    #[error("skill '{skill}': parameter '{param}' has unsupported type '{annotation}'")]
    UnsupportedType {
        skill: String,
        param: String,
        annotation: String,
    },

    #[error("skill '{skill}': default {value} for parameter '{param}' is not a valid {expected}")]
    IncompatibleDefault {
        skill: String,
        param: String,
        expected: String,
        value: String,
    },

    #[error("skill '{skill}': allowed value {value} for parameter '{param}' is not a valid {expected}")]
    IncompatibleEnum {
        skill: String,
        param: String,
        expected: String,
        value: String,
    },

    #[error("skill '{skill}': parameter '{param}' is declared more than once")]
    DuplicateParameter { skill: String, param: String },

    #[error("skill '{0}' has no handler")]
    MissingHandler(String),

    #[error("skill '{0}' is already registered")]
    DuplicateName(String),
}

/// Agent construction or a run override is invalid.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("unsupported provider '{0}' (supported: openai, anthropic, groq, ollama)")]
    UnknownProvider(String),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("missing required option '{0}'")]
    MissingOption(&'static str),

    #[error("option '{option}' = {value} is out of range ({range})")]
    OutOfRange {
        option: &'static str,
        value: String,
        range: &'static str,
    },

    #[error("option '{option}' has an invalid value: {reason}")]
    InvalidValue { option: String, reason: String },

    #[error("skill '{0}' is not registered")]
    UnknownSkill(String),

    #[error("provider '{0}' does not accept image input")]
    ImagesUnsupported(String),

    #[error("invalid image '{source_ref}': {reason}")]
    InvalidImage { source_ref: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Provider-supplied tool-call arguments do not fit the skill's parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgumentValidationError {
    #[error("provider called skill '{0}', which was not exposed to this run")]
    UnknownSkill(String),

    #[error("skill '{skill}': arguments are not a JSON object: {reason}")]
    MalformedPayload { skill: String, reason: String },

    #[error("skill '{skill}': missing required argument '{param}'")]
    MissingArgument { skill: String, param: String },

    #[error("skill '{skill}': unexpected argument '{param}'")]
    UnexpectedArgument { skill: String, param: String },

    #[error("skill '{skill}': argument '{param}' = {value} cannot be read as {expected}")]
    TypeMismatch {
        skill: String,
        param: String,
        expected: String,
        value: String,
    },

    #[error("skill '{skill}': argument '{param}' = {value} is not one of the allowed values")]
    NotAllowed {
        skill: String,
        param: String,
        value: String,
    },
}

/// A skill body failed while the caller was waiting for its result.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("skill '{skill}' failed: {message}")]
pub struct SkillExecutionError {
    pub skill: String,
    pub message: String,
}

impl SkillExecutionError {
    pub fn new(skill: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            skill: skill.into(),
            message: format!("{err:#}"),
        }
    }
}

/// A provider call failed. Always tagged with the originating adapter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Timeouts, rate limiting, server-side hiccups. Safe to retry.
    #[error("{provider}: {message} (retriable)")]
    Recoverable {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Authentication failures, malformed requests, undecodable responses.
    #[error("{provider}: {message}")]
    Fatal {
        provider: String,
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn fatal(provider: &str, message: impl Into<String>) -> Self {
        Self::Fatal {
            provider: provider.to_string(),
            status: None,
            message: message.into(),
        }
    }

    pub fn recoverable(provider: &str, message: impl Into<String>) -> Self {
        Self::Recoverable {
            provider: provider.to_string(),
            status: None,
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Recoverable { provider, .. } | Self::Fatal { provider, .. } => provider,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Recoverable { status, .. } | Self::Fatal { status, .. } => *status,
        }
    }
}

/// Everything `Agent::run()` can fail with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    ArgumentValidation(#[from] ArgumentValidationError),

    #[error(transparent)]
    SkillExecution(#[from] SkillExecutionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skill_execution_error_keeps_context_chain() {
        let err = anyhow::anyhow!("division by zero").context("computing ratio");
        let wrapped = SkillExecutionError::new("ratio", &err);
        assert_eq!(wrapped.skill, "ratio");
        assert_eq!(wrapped.message, "computing ratio: division by zero");
        assert_eq!(
            wrapped.to_string(),
            "skill 'ratio' failed: computing ratio: division by zero"
        );
    }

    #[test]
    fn test_provider_error_retriable() {
        let err = ProviderError::Recoverable {
            provider: "openai".to_string(),
            status: Some(429),
            message: "rate limited".to_string(),
        };
        assert!(err.is_retriable());
        assert_eq!(err.provider(), "openai");
        assert_eq!(err.status(), Some(429));

        let err = ProviderError::fatal("anthropic", "invalid x-api-key");
        assert!(!err.is_retriable());
        assert_eq!(err.to_string(), "anthropic: invalid x-api-key");
    }

    #[test]
    fn test_agent_error_is_transparent() {
        let err: AgentError = ConfigurationError::UnknownSkill("nonexistent".to_string()).into();
        assert_eq!(err.to_string(), "skill 'nonexistent' is not registered");
        assert!(matches!(
            err,
            AgentError::Configuration(ConfigurationError::UnknownSkill(_))
        ));
    }
}
