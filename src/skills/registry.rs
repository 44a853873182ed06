//! Skill registry.
//!
//! A `SkillManager` maps names to shared descriptors and keeps a tag index
//! alongside. Every mutation updates both structures together, so a failed
//! registration is never half-applied.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::descriptor::{SkillDescriptor, SkillSchema};
use crate::error::{ConfigurationError, ValidationError};

const MAX_NAME_LEN: usize = 64;

/// A manager shared between agents and callers.
pub type SharedSkillManager = Arc<RwLock<SkillManager>>;

/// What `register` does when the name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail and leave the registry unchanged.
    #[default]
    Error,
    Overwrite,
    /// Keep the existing skill.
    Skip,
    /// Register under `{name}_{n}`, with the smallest free `n >= 2`.
    Rename,
}

/// Outcome of one successful `register` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added(String),
    Replaced(String),
    Skipped(String),
    Renamed { original: String, name: String },
}

impl Registration {
    /// The name the skill is reachable under afterwards.
    pub fn name(&self) -> &str {
        match self {
            Self::Added(name) | Self::Replaced(name) | Self::Skipped(name) => name,
            Self::Renamed { name, .. } => name,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SkillManager {
    skills: BTreeMap<String, Arc<SkillDescriptor>>,
    tags: BTreeMap<String, BTreeSet<String>>,
    /// Every name ever passed to `register`, with the number of attempts.
    seen: HashMap<String, usize>,
}

impl SkillManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a fresh manager for sharing with agents.
    pub fn shared(self) -> SharedSkillManager {
        Arc::new(RwLock::new(self))
    }

    pub fn register(
        &mut self,
        skill: impl Into<Arc<SkillDescriptor>>,
        policy: ConflictPolicy,
    ) -> Result<Registration, ValidationError> {
        let skill = skill.into();
        let name = skill.name().to_string();
        *self.seen.entry(name.clone()).or_default() += 1;

        if !self.skills.contains_key(&name) {
            self.insert(skill);
            debug!("Registered skill '{name}'");
            return Ok(Registration::Added(name));
        }

        match policy {
            ConflictPolicy::Error => Err(ValidationError::DuplicateName(name)),
            ConflictPolicy::Overwrite => {
                self.insert(skill);
                debug!("Replaced skill '{name}'");
                Ok(Registration::Replaced(name))
            }
            ConflictPolicy::Skip => {
                warn!("Skill '{name}' is already registered, skipping");
                Ok(Registration::Skipped(name))
            }
            ConflictPolicy::Rename => {
                let renamed = self.free_name(&name);
                self.insert(Arc::new(skill.renamed(&renamed)));
                debug!("Registered skill '{name}' as '{renamed}'");
                Ok(Registration::Renamed {
                    original: name,
                    name: renamed,
                })
            }
        }
    }

    /// Inserts (or replaces) without touching the duplicate audit.
    pub(crate) fn insert(&mut self, skill: Arc<SkillDescriptor>) {
        let name = skill.name().to_string();
        self.unindex(&name);
        for tag in skill.tags() {
            self.tags.entry(tag.clone()).or_default().insert(name.clone());
        }
        self.skills.insert(name, skill);
    }

    fn unindex(&mut self, name: &str) {
        let Some(previous) = self.skills.get(name) else {
            return;
        };
        for tag in previous.tags() {
            if let Some(bucket) = self.tags.get_mut(tag) {
                bucket.remove(name);
                if bucket.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn free_name(&self, name: &str) -> String {
        (2usize..)
            .map(|n| {
                let suffix = format!("_{n}");
                let mut base = name.to_string();
                base.truncate(MAX_NAME_LEN.saturating_sub(suffix.len()));
                base + &suffix
            })
            .find(|candidate| !self.skills.contains_key(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<SkillDescriptor>> {
        self.skills.get(name).cloned()
    }

    /// Skills carrying `tag`, ordered by name. Empty if none.
    pub fn get_by_tag(&self, tag: &str) -> Vec<Arc<SkillDescriptor>> {
        self.tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|name| self.skills.get(name).cloned())
            .collect()
    }

    /// Removes a skill from the name map and every tag bucket.
    /// Removing an absent name is a no-op.
    pub fn remove(&mut self, name: &str) -> Option<Arc<SkillDescriptor>> {
        self.unindex(name);
        let removed = self.skills.remove(name);
        if removed.is_some() {
            debug!("Removed skill '{name}'");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.skills.clear();
        self.tags.clear();
    }

    /// Names that `register` was called with more than once, sorted.
    pub fn get_duplicate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn names(&self) -> Vec<String> {
        self.skills.keys().cloned().collect()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SkillDescriptor>> {
        self.skills.values()
    }

    /// Picks the skills exposed to one run: all of them when `names` is
    /// `None`, otherwise exactly the listed ones in the listed order.
    pub fn select(
        &self,
        names: Option<&[String]>,
    ) -> Result<Vec<Arc<SkillDescriptor>>, ConfigurationError> {
        match names {
            None => Ok(self.skills.values().cloned().collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.get_by_name(name)
                        .ok_or_else(|| ConfigurationError::UnknownSkill(name.clone()))
                })
                .collect(),
        }
    }

    /// Schemas of the selected skills.
    pub fn schemas(&self, names: Option<&[String]>) -> Result<Vec<SkillSchema>, ConfigurationError> {
        Ok(self
            .select(names)?
            .iter()
            .map(|skill| skill.schema().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::SkillBuilder;
    use serde_json::{json, Value};

    fn skill(name: &str, tags: &[&str]) -> SkillDescriptor {
        SkillBuilder::new(name)
            .tags(tags.iter().copied())
            .handler(|_| Ok(Value::Null))
            .build()
            .unwrap()
    }

    fn tagged_names(manager: &SkillManager, tag: &str) -> Vec<String> {
        manager
            .get_by_tag(tag)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut manager = SkillManager::new();
        let outcome = manager.register(skill("add", &["math"]), ConflictPolicy::Error).unwrap();
        assert_eq!(outcome, Registration::Added("add".to_string()));
        assert!(manager.contains("add"));
        assert!(manager.get_by_name("sub").is_none());
        assert_eq!(tagged_names(&manager, "math"), vec!["add"]);
        assert!(manager.get_by_tag("io").is_empty());
    }

    #[test]
    fn test_error_policy_is_atomic() {
        let mut manager = SkillManager::new();
        manager.register(skill("add", &["math"]), ConflictPolicy::Error).unwrap();

        let names_before = manager.names();
        let tags_before = manager.tag_names();

        let err = manager
            .register(skill("add", &["other"]), ConflictPolicy::Error)
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateName("add".to_string()));
        assert_eq!(manager.names(), names_before);
        assert_eq!(manager.tag_names(), tags_before);
        assert!(manager.get_by_tag("other").is_empty());
    }

    #[test]
    fn test_overwrite_reindexes_tags() {
        let mut manager = SkillManager::new();
        manager.register(skill("add", &["math"]), ConflictPolicy::Error).unwrap();
        let outcome = manager.register(skill("add", &["arith"]), ConflictPolicy::Overwrite).unwrap();
        assert_eq!(outcome, Registration::Replaced("add".to_string()));
        assert!(manager.get_by_tag("math").is_empty());
        assert_eq!(tagged_names(&manager, "arith"), vec!["add"]);
        assert_eq!(manager.tag_names(), vec!["arith"]);
    }

    #[test]
    fn test_skip_and_rename() {
        let mut manager = SkillManager::new();
        manager.register(skill("add", &["math"]), ConflictPolicy::Error).unwrap();

        let outcome = manager.register(skill("add", &[]), ConflictPolicy::Skip).unwrap();
        assert_eq!(outcome, Registration::Skipped("add".to_string()));
        assert_eq!(manager.get_by_name("add").unwrap().tags().len(), 1);

        let outcome = manager.register(skill("add", &["math"]), ConflictPolicy::Rename).unwrap();
        assert_eq!(
            outcome,
            Registration::Renamed {
                original: "add".to_string(),
                name: "add_2".to_string()
            }
        );
        let outcome = manager.register(skill("add", &[]), ConflictPolicy::Rename).unwrap();
        assert_eq!(outcome.name(), "add_3");
        assert_eq!(tagged_names(&manager, "math"), vec!["add", "add_2"]);
    }

    #[test]
    fn test_rename_respects_name_limit() {
        let long = "s".repeat(64);
        let mut manager = SkillManager::new();
        manager.register(skill(&long, &[]), ConflictPolicy::Error).unwrap();
        let outcome = manager.register(skill(&long, &[]), ConflictPolicy::Rename).unwrap();
        assert_eq!(outcome.name().len(), 64);
        assert!(outcome.name().ends_with("_2"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut manager = SkillManager::new();
        manager.register(skill("add", &["math"]), ConflictPolicy::Error).unwrap();
        manager.register(skill("mul", &["math"]), ConflictPolicy::Error).unwrap();

        assert!(manager.remove("add").is_some());
        assert!(manager.remove("add").is_none());
        assert_eq!(tagged_names(&manager, "math"), vec!["mul"]);

        manager.clear();
        assert!(manager.is_empty());
        assert!(manager.tag_names().is_empty());
    }

    #[test]
    fn test_duplicate_names_audit() {
        let mut manager = SkillManager::new();
        manager.register(skill("add", &[]), ConflictPolicy::Error).unwrap();
        manager.register(skill("mul", &[]), ConflictPolicy::Error).unwrap();
        let _ = manager.register(skill("add", &[]), ConflictPolicy::Error);
        manager.register(skill("mul", &[]), ConflictPolicy::Skip).unwrap();
        assert_eq!(manager.get_duplicate_names(), vec!["add", "mul"]);

        // The audit survives removal.
        manager.remove("add");
        assert_eq!(manager.get_duplicate_names(), vec!["add", "mul"]);
    }

    #[test]
    fn test_select() {
        let mut manager = SkillManager::new();
        manager.register(skill("add", &[]), ConflictPolicy::Error).unwrap();
        manager.register(skill("mul", &[]), ConflictPolicy::Error).unwrap();

        assert_eq!(manager.select(None).unwrap().len(), 2);
        assert!(manager.select(Some(&[])).unwrap().is_empty());

        let picked = manager.select(Some(&["mul".to_string()])).unwrap();
        assert_eq!(picked[0].name(), "mul");

        let err = manager
            .select(Some(&["nonexistent".to_string()]))
            .unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownSkill("nonexistent".to_string()));

        let schemas = manager.schemas(None).unwrap();
        assert_eq!(schemas[0].name, "add");
        assert_eq!(schemas[0].parameters_schema()["required"], json!([]));
    }
}
