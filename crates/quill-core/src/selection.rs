//! Selection policy.
//!
//! Maps (task, domain, classification) to a backend id with fixed
//! precedence:
//!
//! 1. explicit caller override
//! 2. domain route
//! 3. level route (a capability tag, resolved in table order)
//! 4. global default
//!
//! followed by every other backend carrying the task's required capability,
//! in table order. Those trailing candidates are what the fallback
//! controller walks when earlier ones fail.
//!
//! Selection is a pure function of its inputs and the table snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::backend::BackendTable;
use crate::error::ConfigurationError;
use crate::types::Level;

/// Which precedence rule produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    Override,
    DomainRoute,
    LevelRoute,
    Default,
    CapabilityFallback,
}

/// Inputs to one selection. The task type reaches selection through its
/// profile's domain and required capability.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    pub domain: &'a str,
    pub level: Level,
    pub required_capability: Option<&'a str>,
    pub override_backend: Option<&'a str>,
}

/// A chosen backend and the rule that chose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub backend_id: String,
    pub rule: SelectionRule,
}

/// Routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// Used when nothing more specific applies
    pub default_backend: String,

    /// Domain tag -> backend id
    #[serde(default)]
    pub domain_routes: BTreeMap<String, String>,

    /// Classification level -> capability tag
    #[serde(default)]
    pub level_routes: BTreeMap<Level, String>,
}

impl SelectionPolicy {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            default_backend: default_backend.into(),
            domain_routes: BTreeMap::new(),
            level_routes: BTreeMap::new(),
        }
    }

    pub fn with_domain_route(mut self, domain: impl Into<String>, backend: impl Into<String>) -> Self {
        self.domain_routes.insert(domain.into(), backend.into());
        self
    }

    pub fn with_level_route(mut self, level: Level, capability: impl Into<String>) -> Self {
        self.level_routes.insert(level, capability.into());
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// The policy shipped with the crate.
    pub fn builtin() -> Result<Self, ConfigurationError> {
        Self::from_yaml(include_str!("../profiles/policy.yaml"))
    }

    /// Check every backend the policy names exists in `table`.
    pub fn validate(&self, table: &BackendTable) -> Result<(), ConfigurationError> {
        if !table.contains(&self.default_backend) {
            return Err(ConfigurationError::UnknownBackend(self.default_backend.clone()));
        }
        for backend in self.domain_routes.values() {
            if !table.contains(backend) {
                return Err(ConfigurationError::UnknownBackend(backend.clone()));
            }
        }
        Ok(())
    }

    /// Every candidate in precedence order, without duplicates.
    pub fn candidates(&self, table: &BackendTable, input: &SelectionInput<'_>) -> Vec<Selection> {
        let mut ordered: Vec<Selection> = Vec::new();
        let mut push = |id: &str, rule: SelectionRule| {
            if table.contains(id) && !ordered.iter().any(|s| s.backend_id == id) {
                ordered.push(Selection {
                    backend_id: id.to_string(),
                    rule,
                });
            }
        };

        if let Some(id) = input.override_backend {
            push(id, SelectionRule::Override);
        }

        if let Some(id) = self.domain_routes.get(input.domain) {
            push(id, SelectionRule::DomainRoute);
        }

        if let Some(tag) = self.level_routes.get(&input.level) {
            for backend in table.with_capability(tag) {
                push(&backend.id, SelectionRule::LevelRoute);
            }
        }

        push(&self.default_backend, SelectionRule::Default);

        for backend in table.iter() {
            let capable = match input.required_capability {
                Some(tag) => backend.has_capability(tag),
                None => true,
            };
            if capable {
                push(&backend.id, SelectionRule::CapabilityFallback);
            }
        }

        ordered
    }

    /// Highest-precedence candidate not in `excluded`.
    pub fn select(
        &self,
        table: &BackendTable,
        input: &SelectionInput<'_>,
        excluded: &BTreeSet<String>,
    ) -> Option<Selection> {
        self.candidates(table, input)
            .into_iter()
            .find(|s| !excluded.contains(&s.backend_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(domain: &'a str, level: Level) -> SelectionInput<'a> {
        SelectionInput {
            domain,
            level,
            required_capability: None,
            override_backend: None,
        }
    }

    fn setup() -> (SelectionPolicy, BackendTable) {
        (
            SelectionPolicy::builtin().unwrap(),
            BackendTable::builtin().unwrap(),
        )
    }

    #[test]
    fn test_default_when_nothing_applies() {
        let (policy, table) = setup();
        let selection = policy
            .select(&table, &input("retention", Level::Low), &BTreeSet::new())
            .unwrap();
        assert_eq!(selection.backend_id, "gemini-pro");
        assert_eq!(selection.rule, SelectionRule::Default);
    }

    #[test]
    fn test_override_wins() {
        let (policy, table) = setup();
        let mut i = input("healthcare", Level::Critical);
        i.override_backend = Some("gpt-4o");
        let selection = policy.select(&table, &i, &BTreeSet::new()).unwrap();
        assert_eq!(selection.backend_id, "gpt-4o");
        assert_eq!(selection.rule, SelectionRule::Override);
    }

    #[test]
    fn test_domain_route_beats_level_route() {
        let (policy, table) = setup();
        let selection = policy
            .select(&table, &input("healthcare", Level::Low), &BTreeSet::new())
            .unwrap();
        assert_eq!(selection.backend_id, "claude-sonnet");
        assert_eq!(selection.rule, SelectionRule::DomainRoute);
    }

    #[test]
    fn test_critical_routes_to_highest_reliability() {
        let (policy, table) = setup();
        let selection = policy
            .select(&table, &input("retention", Level::Critical), &BTreeSet::new())
            .unwrap();
        assert_eq!(selection.backend_id, "claude-sonnet");
        assert_eq!(selection.rule, SelectionRule::LevelRoute);
    }

    #[test]
    fn test_exclusions_walk_candidates() {
        let (policy, table) = setup();
        let mut excluded = BTreeSet::new();
        excluded.insert("gemini-pro".to_string());

        let selection = policy
            .select(&table, &input("retention", Level::Low), &excluded)
            .unwrap();
        assert_eq!(selection.backend_id, "claude-sonnet");
        assert_eq!(selection.rule, SelectionRule::CapabilityFallback);
    }

    #[test]
    fn test_required_capability_filters_fallbacks() {
        let (policy, table) = setup();
        let mut i = input("retention", Level::Low);
        i.required_capability = Some("structured-output");

        let ids: Vec<String> = policy
            .candidates(&table, &i)
            .into_iter()
            .map(|s| s.backend_id)
            .collect();
        assert!(!ids.contains(&"gemini-flash".to_string()));
    }

    #[test]
    fn test_task_profile_drives_selection() {
        let (policy, table) = setup();
        let profile_input = |task: &str, level: Level| {
            let profile = crate::profile::DomainProfile::builtin(task).unwrap();
            (profile.domain, profile.required_capability, level)
        };

        let (domain, capability, level) = profile_input("healthcare_appeal", Level::Low);
        let selection = policy
            .select(
                &table,
                &SelectionInput {
                    domain: &domain,
                    level,
                    required_capability: capability.as_deref(),
                    override_backend: None,
                },
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(selection.backend_id, "claude-sonnet");
        assert_eq!(selection.rule, SelectionRule::DomainRoute);

        // Lending has no route; long-form keeps gemini-flash out of the fallbacks.
        let (domain, capability, level) = profile_input("mortgage_denial", Level::Low);
        let i = SelectionInput {
            domain: &domain,
            level,
            required_capability: capability.as_deref(),
            override_backend: None,
        };
        let ids: Vec<String> = policy
            .candidates(&table, &i)
            .into_iter()
            .map(|s| s.backend_id)
            .collect();
        assert_eq!(ids, vec!["gemini-pro", "claude-sonnet", "gpt-4o"]);
    }

    #[test]
    fn test_all_excluded_returns_none() {
        let (policy, table) = setup();
        let excluded: BTreeSet<String> = table.ids().map(String::from).collect();
        assert!(policy
            .select(&table, &input("retention", Level::High), &excluded)
            .is_none());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let table = BackendTable::builtin().unwrap();
        let policy = SelectionPolicy::new("nope");
        assert!(matches!(
            policy.validate(&table),
            Err(ConfigurationError::UnknownBackend(_))
        ));
    }
}
