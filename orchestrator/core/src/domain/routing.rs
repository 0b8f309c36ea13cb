// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pattern-based routing rules.
//!
//! Rules are consulted only after explicit-target and capability routing
//! fail. Lower `priority` values are evaluated first.

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::domain::cluster::ClusterId;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Invalid routing pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Routing rule {0} already exists")]
    DuplicateRule(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingRule {
    pub id: String,
    pub pattern: String,
    #[serde(skip)]
    compiled: Regex,
    pub target_cluster: ClusterId,
    pub priority: i32,
    pub enabled: bool,
}

impl RoutingRule {
    pub fn new(
        id: impl Into<String>,
        pattern: impl Into<String>,
        target_cluster: impl Into<String>,
        priority: i32,
    ) -> Result<Self, RoutingError> {
        let pattern = pattern.into();
        let compiled = Regex::new(&pattern).map_err(|source| RoutingError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        Ok(Self {
            id: id.into(),
            pattern,
            compiled,
            target_cluster: ClusterId::new(target_cluster),
            priority,
            enabled: true,
        })
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches(&self, serialized: &str) -> bool {
        self.enabled && self.compiled.is_match(serialized)
    }
}

/// Keeps rules sorted by priority, ties broken by insertion order.
pub fn insert_sorted(rules: &mut Vec<RoutingRule>, rule: RoutingRule) -> Result<(), RoutingError> {
    if rules.iter().any(|r| r.id == rule.id) {
        return Err(RoutingError::DuplicateRule(rule.id));
    }
    let at = rules.partition_point(|r| r.priority <= rule.priority);
    rules.insert(at, rule);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = RoutingRule::new("r", "([", "core", 1).unwrap_err();
        assert!(matches!(err, RoutingError::InvalidPattern { .. }));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let rule = RoutingRule::new("r", "billing", "core", 1).unwrap().disabled();
        assert!(!rule.matches(r#"{"payload":"billing"}"#));
    }

    #[test]
    fn test_rules_kept_in_priority_order() {
        let mut rules = Vec::new();
        insert_sorted(&mut rules, RoutingRule::new("b", ".", "x", 5).unwrap()).unwrap();
        insert_sorted(&mut rules, RoutingRule::new("a", ".", "x", 1).unwrap()).unwrap();
        insert_sorted(&mut rules, RoutingRule::new("c", ".", "x", 5).unwrap()).unwrap();
        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        assert!(matches!(
            insert_sorted(&mut rules, RoutingRule::new("a", ".", "x", 0).unwrap()),
            Err(RoutingError::DuplicateRule(_))
        ));
    }
}
