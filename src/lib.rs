//! Provider-agnostic LLM chat runtime with schema-checked, composable skills.
//!
//! Skills are described once with a [`SkillBuilder`](skills::SkillBuilder),
//! collected in a [`SkillManager`](skills::SkillManager), and exposed to any
//! supported provider (OpenAI, Groq, Anthropic, Ollama) through an
//! [`Agent`](agent::Agent). The agent turns the model's tool calls into
//! validated skill invocations according to an
//! [`ExecutionMode`](agent::ExecutionMode).

pub mod agent;
pub mod backoff;
pub mod config;
pub mod error;
pub mod llm;
pub mod skills;

pub use agent::{Agent, AgentBuilder, ExecutionMode, RunOutput, RunRequest};
pub use error::AgentError;
