pub mod descriptor;
pub mod loader;
pub mod ops;
pub mod params;
pub mod registry;

use std::future::Future;
use std::marker::PhantomData;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{Map, Value};

pub use descriptor::{ParamDecl, ParamSpec, SkillBuilder, SkillDescriptor, SkillSchema};
pub use loader::{CommandHandler, LoadError, LoadFailure, LoadOptions, LoadReport, SkillCatalog};
pub use ops::Comparison;
pub use params::{ParamType, Primitive};
pub use registry::{ConflictPolicy, Registration, SharedSkillManager, SkillManager};

/// The body of a skill.
///
/// The orchestrator calls `call()` with arguments that were already decoded
/// and coerced against the skill's parameter specs, so handlers can read
/// them with the typed getters on [`Arguments`]. The returned value is sent
/// back to the model as the tool result.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    async fn call(&self, args: Arguments) -> anyhow::Result<Value>;
}

/// Validated arguments for one skill invocation, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(Map<String, Value>);

impl Arguments {
    pub fn new(values: Map<String, Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| anyhow!("Missing required parameter: {name}"))
    }

    pub fn int(&self, name: &str) -> anyhow::Result<i64> {
        self.require(name)?
            .as_i64()
            .with_context(|| format!("Parameter '{name}' is not an integer"))
    }

    pub fn float(&self, name: &str) -> anyhow::Result<f64> {
        self.require(name)?
            .as_f64()
            .with_context(|| format!("Parameter '{name}' is not a number"))
    }

    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        self.require(name)?
            .as_str()
            .with_context(|| format!("Parameter '{name}' is not a string"))
    }

    pub fn bool(&self, name: &str) -> anyhow::Result<bool> {
        self.require(name)?
            .as_bool()
            .with_context(|| format!("Parameter '{name}' is not a boolean"))
    }

    /// Sequence and tuple parameters.
    pub fn list(&self, name: &str) -> anyhow::Result<&[Value]> {
        self.require(name)?
            .as_array()
            .map(Vec::as_slice)
            .with_context(|| format!("Parameter '{name}' is not a list"))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Adapts a plain closure into a [`SkillHandler`].
pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait]
impl<F> SkillHandler for FnHandler<F>
where
    F: Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, args: Arguments) -> anyhow::Result<Value> {
        (self.0)(&args)
    }
}

/// Adapts an async closure into a [`SkillHandler`].
pub(crate) struct AsyncFnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnHandler<F, Fut>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> SkillHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Arguments) -> anyhow::Result<Value> {
        (self.f)(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => Arguments::new(map),
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_typed_getters() {
        let a = args(json!({"n": 3, "x": 1.5, "s": "hi", "b": true, "l": [1, 2]}));
        assert_eq!(a.int("n").unwrap(), 3);
        assert_eq!(a.float("x").unwrap(), 1.5);
        assert_eq!(a.str("s").unwrap(), "hi");
        assert!(a.bool("b").unwrap());
        assert_eq!(a.list("l").unwrap().len(), 2);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn test_getter_errors() {
        let a = args(json!({"s": "hi"}));
        assert!(a.int("missing").unwrap_err().to_string().contains("Missing required parameter"));
        assert!(a.int("s").unwrap_err().to_string().contains("not an integer"));
    }

    #[tokio::test]
    async fn test_fn_handlers() {
        let sync = FnHandler(|a: &Arguments| Ok::<_, anyhow::Error>(json!(a.int("n")? * 2)));
        assert_eq!(sync.call(args(json!({"n": 4}))).await.unwrap(), json!(8));

        let async_handler = AsyncFnHandler::new(|a: Arguments| async move {
            Ok::<_, anyhow::Error>(json!(format!("hello {}", a.str("name")?)))
        });
        assert_eq!(
            async_handler.call(args(json!({"name": "ada"}))).await.unwrap(),
            json!("hello ada")
        );
    }
}
