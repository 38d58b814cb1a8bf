//! The cached per-feature value table.

use std::collections::HashMap;

use crate::rules::{EvalContext, RuleSet};

/// A feature value transition produced by an evaluation pass.
pub(crate) type Change = (String, Option<String>);

/// Maps feature names to their current value, or `None` when no rule
/// matched. Entries for features absent from the active rule set are
/// removed on recomputation.
#[derive(Debug, Default)]
pub(crate) struct FeatureTable {
    values: HashMap<String, Option<String>>,
}

impl FeatureTable {
    pub fn value_of(&self, feature: &str) -> Option<String> {
        self.values.get(feature).cloned().flatten()
    }

    pub fn snapshot(&self) -> HashMap<String, Option<String>> {
        self.values.clone()
    }

    /// Full evaluation pass: for every feature in the rule set, the first
    /// rule whose conditions hold wins. Returns the set of changed features
    /// (including transitions to and from absence), sorted by name so a
    /// single commit notifies deterministically.
    pub fn recompute(&mut self, rules: Option<&RuleSet>, ctx: &EvalContext<'_>) -> Vec<Change> {
        let mut next: HashMap<String, Option<String>> = HashMap::new();
        if let Some(rules) = rules {
            for (feature, feature_rules) in rules.features() {
                let value = feature_rules
                    .iter()
                    .find(|rule| rule.matches(ctx))
                    .map(|rule| rule.value.clone());
                next.insert(feature.clone(), value);
            }
        }

        let mut changes: Vec<Change> = Vec::new();
        for (feature, value) in &next {
            let previous = self.values.get(feature).cloned().flatten();
            if previous != *value {
                changes.push((feature.clone(), value.clone()));
            }
        }
        // Features that disappeared with the old rule set.
        for (feature, value) in &self.values {
            if !next.contains_key(feature) && value.is_some() {
                changes.push((feature.clone(), None));
            }
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));

        self.values = next;
        changes
    }

    /// Clear one feature's cached value. Returns the transition when the
    /// feature previously held a value.
    pub fn reset(&mut self, feature: &str) -> Option<Change> {
        let previous = self.values.insert(feature.to_owned(), None).flatten();
        previous.map(|_| (feature.to_owned(), None))
    }

    /// Clear every cached value. Returns transitions for features that
    /// previously held values, sorted by name.
    pub fn reset_all(&mut self) -> Vec<Change> {
        let mut changes: Vec<Change> = self
            .values
            .iter_mut()
            .filter_map(|(feature, value)| value.take().map(|_| (feature.clone(), None)))
            .collect();
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
    }
}
