//! Skill descriptors.
//!
//! A [`SkillBuilder`] collects a skill's declared metadata and its handler;
//! `build()` validates everything eagerly and produces an immutable
//! [`SkillDescriptor`]. The provider-neutral [`SkillSchema`] is computed once
//! at that point and cached on the descriptor.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::params::{AnnotationError, ParamType};
use super::{Arguments, AsyncFnHandler, FnHandler, SkillHandler};
use crate::error::{ArgumentValidationError, SkillExecutionError, ValidationError};

const DEFAULT_VERSION: &str = "1.0.0";
const MAX_NAME_LEN: usize = 64;

/// One declared parameter, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    /// Loose type annotation, e.g. `"int"` or `"list[str]"`.
    pub annotation: Option<String>,
    pub description: String,
    pub default: Option<Value>,
    pub required: bool,
    pub allowed: Option<Vec<Value>>,
}

impl ParamDecl {
    /// A required parameter with no annotation yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotation: None,
            description: String::new(),
            default: None,
            required: true,
            allowed: None,
        }
    }

    pub fn typed(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets a default value; the parameter becomes optional.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.required = false;
        self
    }

    /// Optional without a default: omitted from the arguments when absent.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.allowed = Some(values.into_iter().collect());
        self
    }
}

/// A validated parameter specification.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
    pub allowed: Option<Vec<Value>>,
}

/// Provider-neutral description of a skill, consumed by the adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillSchema {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl SkillSchema {
    /// JSON schema object for the parameters:
    /// `{type: object, properties: {...}, required: [...]}`.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = param.ty.json_schema();
            property["description"] = Value::String(param.description.clone());
            if let Some(default) = &param.default {
                property["default"] = default.clone();
            }
            if let Some(allowed) = &param.allowed {
                property["enum"] = Value::Array(allowed.clone());
            }
            properties.insert(param.name.clone(), property);
        }

        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }

    /// Decodes a parameters schema back into a `SkillSchema`.
    ///
    /// Returns `None` if any property has a type outside the supported set.
    /// Parameter order follows the `properties` map.
    pub fn from_parameters_schema(name: &str, description: &str, schema: &Value) -> Option<Self> {
        let properties = schema.get("properties")?.as_object()?;
        let required: BTreeSet<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let params = properties
            .iter()
            .map(|(param, property)| {
                Some(ParamSpec {
                    name: param.clone(),
                    ty: ParamType::from_json_schema(property)?,
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    required: required.contains(param.as_str()),
                    default: property.get("default").cloned(),
                    allowed: property.get("enum").and_then(Value::as_array).cloned(),
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            name: name.to_string(),
            description: description.to_string(),
            params,
        })
    }
}

/// Collects a skill's declaration. See the module docs.
#[derive(Clone)]
pub struct SkillBuilder {
    name: String,
    description: String,
    params: Vec<ParamDecl>,
    tags: Vec<String>,
    version: String,
    category: Option<String>,
    author: Option<String>,
    returns: Option<String>,
    handler: Option<Arc<dyn SkillHandler>>,
}

impl SkillBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params: Vec::new(),
            tags: Vec::new(),
            version: DEFAULT_VERSION.to_string(),
            category: None,
            author: None,
            returns: None,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Shorthand for a required, annotated parameter.
    pub fn param(
        self,
        name: impl Into<String>,
        annotation: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.param_decl(ParamDecl::new(name).typed(annotation).describe(description))
    }

    pub fn param_decl(mut self, decl: ParamDecl) -> Self {
        self.params.push(decl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn declared_tags(&self) -> &[String] {
        &self.tags
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Informational return annotation.
    pub fn returns(mut self, annotation: impl Into<String>) -> Self {
        self.returns = Some(annotation.into());
        self
    }

    /// Synchronous body.
    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(FnHandler(f)));
        self
    }

    /// Asynchronous body.
    pub fn async_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handler = Some(Arc::new(AsyncFnHandler::new(f)));
        self
    }

    pub fn handler_arc(mut self, handler: Arc<dyn SkillHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn handler_ref(&self) -> Option<Arc<dyn SkillHandler>> {
        self.handler.clone()
    }

    /// Validates the declaration and produces the descriptor.
    ///
    /// Parameters are checked in declaration order: annotation present,
    /// annotation supported (mappings never are), then defaults and allowed
    /// values compatible with the declared type.
    pub fn build(&self) -> Result<SkillDescriptor, ValidationError> {
        validate_name(&self.name)?;

        let mut params: Vec<ParamSpec> = Vec::with_capacity(self.params.len());
        for decl in &self.params {
            if params.iter().any(|p| p.name == decl.name) {
                return Err(ValidationError::DuplicateParameter {
                    skill: self.name.clone(),
                    param: decl.name.clone(),
                });
            }
            params.push(self.validate_param(decl)?);
        }

        let handler = self
            .handler
            .clone()
            .ok_or_else(|| ValidationError::MissingHandler(self.name.clone()))?;

        debug!("Built skill '{}' with {} parameters", self.name, params.len());

        Ok(SkillDescriptor {
            schema: SkillSchema {
                name: self.name.clone(),
                description: self.description.clone(),
                params,
            },
            tags: self.tags.iter().cloned().collect(),
            version: self.version.clone(),
            category: self.category.clone(),
            author: self.author.clone(),
            returns: self.returns.clone(),
            handler,
        })
    }

    fn validate_param(&self, decl: &ParamDecl) -> Result<ParamSpec, ValidationError> {
        let annotation = decl
            .annotation
            .as_deref()
            .ok_or_else(|| ValidationError::MissingAnnotation {
                skill: self.name.clone(),
                param: decl.name.clone(),
            })?;

        let ty = ParamType::parse(annotation).map_err(|e| match e {
            AnnotationError::Mapping => ValidationError::MappingType {
                skill: self.name.clone(),
                param: decl.name.clone(),
                annotation: annotation.to_string(),
            },
            AnnotationError::Unsupported => ValidationError::UnsupportedType {
                skill: self.name.clone(),
                param: decl.name.clone(),
                annotation: annotation.to_string(),
            },
        })?;

        // A null default means "optional, nothing to fill in".
        let default = decl.default.clone().filter(|v| !v.is_null());
        if let Some(value) = &default {
            if !ty.accepts(value) {
                return Err(ValidationError::IncompatibleDefault {
                    skill: self.name.clone(),
                    param: decl.name.clone(),
                    expected: ty.to_string(),
                    value: value.to_string(),
                });
            }
        }

        if let Some(allowed) = &decl.allowed {
            if let Some(bad) = allowed.iter().find(|v| !ty.accepts(v)) {
                return Err(ValidationError::IncompatibleEnum {
                    skill: self.name.clone(),
                    param: decl.name.clone(),
                    expected: ty.to_string(),
                    value: bad.to_string(),
                });
            }
        }

        Ok(ParamSpec {
            name: decl.name.clone(),
            ty,
            description: decl.description.clone(),
            required: decl.required && decl.default.is_none(),
            default,
            allowed: decl.allowed.clone(),
        })
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(name.to_string()))
    }
}

/// An immutable, validated skill. Registries share it through `Arc`.
#[derive(Clone)]
pub struct SkillDescriptor {
    schema: SkillSchema,
    tags: BTreeSet<String>,
    version: String,
    category: Option<String>,
    author: Option<String>,
    returns: Option<String>,
    handler: Arc<dyn SkillHandler>,
}

impl SkillDescriptor {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn description(&self) -> &str {
        &self.schema.description
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.schema.params
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn returns(&self) -> Option<&str> {
        self.returns.as_deref()
    }

    /// The cached provider-neutral schema.
    pub fn schema(&self) -> &SkillSchema {
        &self.schema
    }

    /// Same skill under another name; the handler is shared.
    pub(crate) fn renamed(&self, name: &str) -> Self {
        let mut copy = self.clone();
        copy.schema.name = name.to_string();
        copy
    }

    /// Decodes a raw provider argument payload and coerces it against the
    /// parameter specs. Defaults are filled in for absent optional
    /// parameters; unknown argument names are rejected.
    ///
    /// The payload may be a JSON object, a string containing one (OpenAI
    /// sends arguments as text), or null / empty for parameterless calls.
    pub fn coerce_arguments(&self, raw: &Value) -> Result<Arguments, ArgumentValidationError> {
        let malformed = |reason: String| ArgumentValidationError::MalformedPayload {
            skill: self.name().to_string(),
            reason,
        };

        let decoded = match raw {
            Value::Null => Value::Object(Map::new()),
            Value::String(text) if text.trim().is_empty() => Value::Object(Map::new()),
            Value::String(text) => serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?,
            other => other.clone(),
        };
        let Value::Object(mut supplied) = decoded else {
            return Err(malformed(format!("got {decoded}")));
        };

        if let Some(unknown) = supplied
            .keys()
            .find(|key| !self.params().iter().any(|p| &p.name == *key))
        {
            return Err(ArgumentValidationError::UnexpectedArgument {
                skill: self.name().to_string(),
                param: unknown.clone(),
            });
        }

        let mut coerced = Map::new();
        for spec in self.params() {
            match supplied.remove(&spec.name) {
                Some(value) if !value.is_null() => {
                    let converted = spec.ty.coerce(&value).ok_or_else(|| {
                        ArgumentValidationError::TypeMismatch {
                            skill: self.name().to_string(),
                            param: spec.name.clone(),
                            expected: spec.ty.to_string(),
                            value: value.to_string(),
                        }
                    })?;
                    if let Some(allowed) = &spec.allowed {
                        if !allowed.iter().any(|a| spec.ty.coerce(a).as_ref() == Some(&converted)) {
                            return Err(ArgumentValidationError::NotAllowed {
                                skill: self.name().to_string(),
                                param: spec.name.clone(),
                                value: value.to_string(),
                            });
                        }
                    }
                    coerced.insert(spec.name.clone(), converted);
                }
                _ if spec.required => {
                    return Err(ArgumentValidationError::MissingArgument {
                        skill: self.name().to_string(),
                        param: spec.name.clone(),
                    })
                }
                _ => {
                    if let Some(default) = &spec.default {
                        coerced.insert(spec.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(Arguments::new(coerced))
    }

    /// Runs the skill body.
    pub async fn invoke(&self, args: Arguments) -> Result<Value, SkillExecutionError> {
        self.handler
            .call(args)
            .await
            .map_err(|e| SkillExecutionError::new(self.name(), &e))
    }
}

impl fmt::Debug for SkillDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkillDescriptor")
            .field("name", &self.schema.name)
            .field("params", &self.schema.params.len())
            .field("tags", &self.tags)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::params::Primitive;

    fn add_builder() -> SkillBuilder {
        SkillBuilder::new("add")
            .description("adds two integers")
            .param("a", "int", "first addend")
            .param("b", "int", "second addend")
            .tags(["math"])
            .handler(|args| Ok(json!(args.int("a")? + args.int("b")?)))
    }

    #[test]
    fn test_build_valid_skill() {
        let skill = add_builder().build().unwrap();
        assert_eq!(skill.name(), "add");
        assert_eq!(skill.description(), "adds two integers");
        assert_eq!(skill.version(), "1.0.0");
        assert!(skill.tags().contains("math"));
        assert_eq!(skill.params().len(), 2);
        assert_eq!(skill.params()[0].ty, ParamType::Scalar(Primitive::Int));
        assert!(skill.params()[0].required);
    }

    #[test]
    fn test_missing_annotation_rejected() {
        let err = SkillBuilder::new("greet")
            .param_decl(ParamDecl::new("who").describe("person to greet"))
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingAnnotation {
                skill: "greet".to_string(),
                param: "who".to_string()
            }
        );
    }

    #[test]
    fn test_mapping_parameter_rejected_in_any_position() {
        // Otherwise-valid configurations: first, middle, last, optional, defaulted.
        let variants = vec![
            SkillBuilder::new("s").param("opts", "dict", ""),
            SkillBuilder::new("s").param("a", "int", "").param("opts", "Dict[str, int]", ""),
            SkillBuilder::new("s")
                .param("a", "int", "")
                .param("opts", "map", "")
                .param("b", "str", ""),
            SkillBuilder::new("s").param_decl(ParamDecl::new("opts").typed("dict").optional()),
            SkillBuilder::new("s").param_decl(
                ParamDecl::new("opts").typed("dict").default_value(json!({"k": 1})),
            ),
        ];
        for builder in variants {
            let err = builder.handler(|_| Ok(Value::Null)).build().unwrap_err();
            assert!(matches!(err, ValidationError::MappingType { ref param, .. } if param == "opts"), "{err}");
        }
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let err = SkillBuilder::new("s")
            .param("when", "datetime", "")
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedType { .. }));
    }

    #[test]
    fn test_incompatible_default_rejected() {
        let err = SkillBuilder::new("s")
            .param_decl(ParamDecl::new("n").typed("int").default_value(json!("three")))
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::IncompatibleDefault { .. }));

        let err = SkillBuilder::new("s")
            .param_decl(ParamDecl::new("unit").typed("str").one_of([json!("c"), json!(1)]))
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::IncompatibleEnum { .. }));
    }

    #[test]
    fn test_invalid_names_and_duplicates() {
        for name in ["", "has space", "dots.are.bad", &"x".repeat(65)] {
            let err = SkillBuilder::new(name).handler(|_| Ok(Value::Null)).build().unwrap_err();
            assert!(matches!(err, ValidationError::InvalidName(_)));
        }

        let err = SkillBuilder::new("s")
            .param("a", "int", "")
            .param("a", "str", "")
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateParameter { .. }));

        let err = SkillBuilder::new("s").build().unwrap_err();
        assert_eq!(err, ValidationError::MissingHandler("s".to_string()));
    }

    #[test]
    fn test_parameters_schema() {
        let skill = SkillBuilder::new("weather")
            .description("current weather")
            .param("city", "str", "city name")
            .param_decl(
                ParamDecl::new("unit")
                    .typed("str")
                    .describe("temperature unit")
                    .default_value(json!("c"))
                    .one_of([json!("c"), json!("f")]),
            )
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap();

        let schema = skill.schema().parameters_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["city"]["type"], "string");
        assert_eq!(schema["properties"]["city"]["description"], "city name");
        assert_eq!(schema["properties"]["unit"]["default"], "c");
        assert_eq!(schema["properties"]["unit"]["enum"], json!(["c", "f"]));
        assert_eq!(schema["required"], json!(["city"]));

        let decoded =
            SkillSchema::from_parameters_schema("weather", "current weather", &schema).unwrap();
        assert_eq!(decoded.params.len(), 2);
        let unit = decoded.params.iter().find(|p| p.name == "unit").unwrap();
        assert!(!unit.required);
        assert_eq!(unit.ty, ParamType::Scalar(Primitive::Str));
    }

    #[test]
    fn test_coerce_arguments() {
        let skill = add_builder().build().unwrap();

        let args = skill.coerce_arguments(&json!({"a": 2, "b": "3"})).unwrap();
        assert_eq!(args.int("b").unwrap(), 3);

        let args = skill.coerce_arguments(&json!("{\"a\": 1, \"b\": 1}")).unwrap();
        assert_eq!(args.len(), 2);

        assert!(matches!(
            skill.coerce_arguments(&json!({"a": 2})),
            Err(ArgumentValidationError::MissingArgument { .. })
        ));
        assert!(matches!(
            skill.coerce_arguments(&json!({"a": 2, "b": 3, "c": 4})),
            Err(ArgumentValidationError::UnexpectedArgument { .. })
        ));
        assert!(matches!(
            skill.coerce_arguments(&json!({"a": "two", "b": 3})),
            Err(ArgumentValidationError::TypeMismatch { .. })
        ));
        assert!(matches!(
            skill.coerce_arguments(&json!("not json")),
            Err(ArgumentValidationError::MalformedPayload { .. })
        ));
        assert!(matches!(
            skill.coerce_arguments(&json!([1, 2])),
            Err(ArgumentValidationError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_coerce_fills_defaults_and_checks_enum() {
        let skill = SkillBuilder::new("weather")
            .param("city", "str", "")
            .param_decl(
                ParamDecl::new("unit")
                    .typed("str")
                    .default_value(json!("c"))
                    .one_of([json!("c"), json!("f")]),
            )
            .param_decl(ParamDecl::new("days").typed("int").optional())
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap();

        let args = skill.coerce_arguments(&json!({"city": "Lyon"})).unwrap();
        assert_eq!(args.str("unit").unwrap(), "c");
        assert!(args.get("days").is_none());

        assert!(matches!(
            skill.coerce_arguments(&json!({"city": "Lyon", "unit": "k"})),
            Err(ArgumentValidationError::NotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_wraps_errors() {
        let skill = SkillBuilder::new("fail")
            .handler(|_| anyhow::bail!("boom"))
            .build()
            .unwrap();
        let err = skill.invoke(Arguments::default()).await.unwrap_err();
        assert_eq!(err.skill, "fail");
        assert_eq!(err.message, "boom");

        let add = add_builder().build().unwrap();
        let args = add.coerce_arguments(&json!({"a": 2, "b": 3})).unwrap();
        assert_eq!(add.invoke(args).await.unwrap(), json!(5));
    }

    #[test]
    fn test_renamed_shares_metadata() {
        let skill = add_builder().build().unwrap();
        let renamed = skill.renamed("add_2");
        assert_eq!(renamed.name(), "add_2");
        assert_eq!(renamed.params(), skill.params());
        assert_eq!(skill.name(), "add");
    }
}
