//! Bulk skill loading.
//!
//! Skills come from two places: a [`SkillCatalog`] of builders declared in
//! the running process, and TOML manifest files. A manifest skill declares
//! its metadata and binds its body either to a handler registered in the
//! catalog or to an external command:
//!
//! ```toml
//! [[skill]]
//! name = "add"
//! description = "adds two integers"
//! tags = ["math"]
//! handler = "add"
//!
//! [[skill.param]]
//! name = "a"
//! type = "int"
//! description = "first addend"
//!
//! [[skill]]
//! name = "word_count"
//! command = ["./word_count.sh"]
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::descriptor::{ParamDecl, SkillBuilder};
use super::registry::{ConflictPolicy, Registration, SkillManager};
use super::{Arguments, SkillHandler};
use crate::error::ValidationError;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("skill '{skill}': no handler named '{handler}' in the catalog")]
    UnknownHandler { skill: String, handler: String },

    #[error("skill '{skill}': declare either `handler` or `command`, not both")]
    AmbiguousBody { skill: String },

    #[error("skill '{skill}': parameter '{param}' has a default that TOML cannot express as JSON: {reason}")]
    BadDefault {
        skill: String,
        param: String,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// One skill that could not be loaded, with the reason.
#[derive(Debug)]
pub struct LoadFailure {
    pub name: String,
    pub error: LoadError,
}

/// Outcome of a bulk load, partitioned by name.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names the skills are now reachable under.
    pub registered: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<LoadFailure>,
}

impl LoadReport {
    fn record(&mut self, name: &str, outcome: Result<Registration, LoadError>) {
        match outcome {
            Ok(Registration::Skipped(name)) => self.skipped.push(name),
            Ok(registration) => self.registered.push(registration.name().to_string()),
            Err(error) => {
                warn!("Failed to load skill '{name}': {error}");
                self.failed.push(LoadFailure {
                    name: name.to_string(),
                    error,
                });
            }
        }
    }

    fn merge(&mut self, other: LoadReport) {
        self.registered.extend(other.registered);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Only load skills carrying at least one of these tags.
    pub tags: Option<BTreeSet<String>>,
    pub policy: ConflictPolicy,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            tags: None,
            policy: ConflictPolicy::Skip,
        }
    }
}

impl LoadOptions {
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn admits<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> bool {
        match &self.tags {
            None => true,
            Some(wanted) => tags.into_iter().any(|t| wanted.contains(t)),
        }
    }
}

/// Skills and handlers declared in the running process.
///
/// Every declared skill's handler is also reachable by the skill's name, so
/// a manifest can re-declare a catalog skill with `handler = "<name>"`.
#[derive(Clone, Default)]
pub struct SkillCatalog {
    skills: Vec<SkillBuilder>,
    handlers: HashMap<String, Arc<dyn SkillHandler>>,
}

impl SkillCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a complete skill.
    pub fn skill(mut self, builder: SkillBuilder) -> Self {
        if let Some(handler) = builder.handler_ref() {
            self.handlers.insert(builder.name().to_string(), handler);
        }
        self.skills.push(builder);
        self
    }

    /// Names a handler for manifests to bind to.
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn SkillHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn SkillHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

// ── Manifest format ──────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default, rename = "skill")]
    skills: Vec<ManifestSkill>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestSkill {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    version: Option<String>,
    category: Option<String>,
    author: Option<String>,
    returns: Option<String>,
    handler: Option<String>,
    command: Option<Vec<String>>,
    #[serde(default, rename = "param")]
    params: Vec<ManifestParam>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestParam {
    name: String,
    #[serde(rename = "type")]
    annotation: Option<String>,
    #[serde(default)]
    description: String,
    default: Option<toml::Value>,
    #[serde(default)]
    optional: bool,
    #[serde(rename = "enum")]
    allowed: Option<Vec<toml::Value>>,
}

impl ManifestSkill {
    fn into_builder(self, base: &Path, catalog: &SkillCatalog) -> Result<SkillBuilder, LoadError> {
        let handler: Arc<dyn SkillHandler> = match (&self.handler, &self.command) {
            (Some(_), Some(_)) => return Err(LoadError::AmbiguousBody { skill: self.name }),
            (Some(name), None) => catalog.lookup(name).ok_or_else(|| LoadError::UnknownHandler {
                skill: self.name.clone(),
                handler: name.clone(),
            })?,
            (None, Some(argv)) => Arc::new(CommandHandler::new(argv.clone(), base)),
            (None, None) => return Err(ValidationError::MissingHandler(self.name).into()),
        };

        let mut builder = SkillBuilder::new(&self.name)
            .description(self.description)
            .tags(self.tags)
            .handler_arc(handler);
        if let Some(version) = self.version {
            builder = builder.version(version);
        }
        if let Some(category) = self.category {
            builder = builder.category(category);
        }
        if let Some(author) = self.author {
            builder = builder.author(author);
        }
        if let Some(returns) = self.returns {
            builder = builder.returns(returns);
        }

        for param in self.params {
            let to_json = |value: toml::Value| {
                serde_json::to_value(value).map_err(|e| LoadError::BadDefault {
                    skill: self.name.clone(),
                    param: param.name.clone(),
                    reason: e.to_string(),
                })
            };

            let mut decl = ParamDecl::new(&param.name).describe(&param.description);
            if let Some(annotation) = &param.annotation {
                decl = decl.typed(annotation);
            }
            if param.optional {
                decl = decl.optional();
            }
            if let Some(default) = param.default.clone() {
                decl = decl.default_value(to_json(default)?);
            }
            if let Some(allowed) = param.allowed.clone() {
                let values = allowed.into_iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
                decl = decl.one_of(values);
            }
            builder = builder.param_decl(decl);
        }
        Ok(builder)
    }
}

// ── Command-backed skills ────────────────────────────

/// Runs an external program as a skill body.
///
/// Arguments are written to stdin as one JSON object. Stdout is parsed as
/// JSON when possible and returned as a string otherwise. A non-zero exit
/// status fails the call with the program's stderr.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: PathBuf,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandHandler {
    /// `argv[0]` is resolved against `base` when it contains a path separator.
    pub fn new(argv: Vec<String>, base: &Path) -> Self {
        let mut argv = argv.into_iter();
        let program = PathBuf::from(argv.next().unwrap_or_default());
        let program = if program.is_relative() && program.components().count() > 1 {
            base.join(program)
        } else {
            program
        };
        Self {
            program,
            args: argv.collect(),
            workdir: base.to_path_buf(),
        }
    }
}

#[async_trait]
impl SkillHandler for CommandHandler {
    async fn call(&self, args: Arguments) -> anyhow::Result<Value> {
        if self.program.as_os_str().is_empty() {
            bail!("Empty command");
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;

        let payload = serde_json::to_vec(&args.into_value())?;
        let stdin = child.stdin.take();
        // Feed stdin while draining stdout so neither pipe can fill up.
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;
        match written {
            // The program may exit without reading its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("{} did not read its arguments", self.program.display());
            }
            other => other?,
        }
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}

// ── Loaders ──────────────────────────────────────────

impl SkillManager {
    /// Registers every skill declared in `catalog`.
    pub fn load_from_current_context(
        &mut self,
        catalog: &SkillCatalog,
        options: &LoadOptions,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        for builder in &catalog.skills {
            if !options.admits(builder.declared_tags()) {
                continue;
            }
            let outcome = self.build_and_register(builder, options.policy);
            report.record(builder.name(), outcome);
        }
        report
    }

    /// Registers the skills of one manifest file.
    ///
    /// Reading or parsing the file is an error; individual skills that fail
    /// are recorded in the report.
    pub fn load_from_file(
        &mut self,
        path: impl AsRef<Path>,
        catalog: &SkillCatalog,
        options: &LoadOptions,
    ) -> Result<LoadReport, LoadError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest = toml::from_str(&text).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut report = LoadReport::default();
        for skill in manifest.skills {
            if !options.admits(&skill.tags) {
                continue;
            }
            let name = skill.name.clone();
            let outcome = skill
                .into_builder(base, catalog)
                .and_then(|builder| self.build_and_register(&builder, options.policy));
            report.record(&name, outcome);
        }
        debug!(
            "Loaded {}: {} registered, {} skipped, {} failed",
            path.display(),
            report.registered.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Registers the skills of every `*.toml` manifest under `dir`,
    /// recursively, in path order. Never fails as a whole: unreadable or
    /// malformed files are recorded as failures named after the file.
    pub fn load_from_folder(
        &mut self,
        dir: impl AsRef<Path>,
        catalog: &SkillCatalog,
        options: &LoadOptions,
    ) -> LoadReport {
        let dir = dir.as_ref();
        let mut report = LoadReport::default();
        let mut files = Vec::new();
        if let Err(source) = collect_manifests(dir, &mut files) {
            report.record(
                &dir.display().to_string(),
                Err(LoadError::Io {
                    path: dir.to_path_buf(),
                    source,
                }),
            );
            return report;
        }
        files.sort();

        for file in files {
            match self.load_from_file(&file, catalog, options) {
                Ok(file_report) => report.merge(file_report),
                Err(error) => report.record(&file.display().to_string(), Err(error)),
            }
        }
        info!(
            "Loaded skills from {}: {} registered, {} skipped, {} failed",
            dir.display(),
            report.registered.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    fn build_and_register(
        &mut self,
        builder: &SkillBuilder,
        policy: ConflictPolicy,
    ) -> Result<Registration, LoadError> {
        let skill = builder.build()?;
        Ok(self.register(skill, policy)?)
    }
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_manifests(&path, out)?;
        } else if file_type.is_symlink() && path.is_dir() {
            // Linked directories are not followed; they can form cycles.
            debug!("Skipping symlinked directory {}", path.display());
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            out.push(path);
        }
    }
    Ok(())
}
