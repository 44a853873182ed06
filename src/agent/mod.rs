pub mod dispatch;
pub mod params;
pub mod runtime;
pub mod stream;

pub use dispatch::{ExecutionReceipt, RunOutput, SkillOutcome, ToolInvocation};
pub use params::{AgentConfig, EffectiveConfig, ExecutionMode, RunRequest, Tuning};
pub use runtime::{Agent, AgentBuilder};
pub use stream::{RunStream, StreamChunk};

#[cfg(test)]
pub(crate) use params::test_config;
