//! Set algebra over skill managers.
//!
//! Skills are compared by name only. Inputs are never mutated; every
//! operation that yields a collection returns a fresh `SkillManager` sharing
//! the input descriptors.

use std::collections::BTreeSet;

use super::registry::{ConflictPolicy, SkillManager};
use crate::error::ValidationError;

/// Result of [`compare`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    pub common: BTreeSet<String>,
    pub unique_to_a: BTreeSet<String>,
    pub unique_to_b: BTreeSet<String>,
}

/// Every skill from every input. Later inputs win on name collisions.
pub fn union(managers: &[&SkillManager]) -> SkillManager {
    let mut merged = SkillManager::new();
    for manager in managers {
        for skill in manager.iter() {
            merged.insert(skill.clone());
        }
    }
    merged
}

/// Like [`union`], resolving collisions with `policy`.
pub fn union_with(
    managers: &[&SkillManager],
    policy: ConflictPolicy,
) -> Result<SkillManager, ValidationError> {
    let mut merged = SkillManager::new();
    for manager in managers {
        for skill in manager.iter() {
            merged.register(skill.clone(), policy)?;
        }
    }
    Ok(merged)
}

/// Names present in both; descriptors come from `a`.
pub fn intersection(a: &SkillManager, b: &SkillManager) -> SkillManager {
    filtered(a, |name| b.contains(name))
}

/// Names in `a` that are absent from `b`.
pub fn difference(a: &SkillManager, b: &SkillManager) -> SkillManager {
    filtered(a, |name| !b.contains(name))
}

/// Names present in exactly one of `a` and `b`.
pub fn symmetric_difference(a: &SkillManager, b: &SkillManager) -> SkillManager {
    let mut result = difference(a, b);
    for skill in b.iter().filter(|s| !a.contains(s.name())) {
        result.insert(skill.clone());
    }
    result
}

pub fn compare(a: &SkillManager, b: &SkillManager) -> Comparison {
    let names_a: BTreeSet<String> = a.names().into_iter().collect();
    let names_b: BTreeSet<String> = b.names().into_iter().collect();
    Comparison {
        common: names_a.intersection(&names_b).cloned().collect(),
        unique_to_a: names_a.difference(&names_b).cloned().collect(),
        unique_to_b: names_b.difference(&names_a).cloned().collect(),
    }
}

fn filtered(source: &SkillManager, keep: impl Fn(&str) -> bool) -> SkillManager {
    let mut result = SkillManager::new();
    for skill in source.iter().filter(|s| keep(s.name())) {
        result.insert(skill.clone());
    }
    result
}
