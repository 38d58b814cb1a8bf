//! Wire format of rule documents.
//!
//! Two document shapes are accepted: the canonical shape with a `features`
//! wrapper, and a legacy shape where the feature map is the top-level
//! object. Both parse to the same internal representation.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::comparator::Operator;
use crate::values::DynValue;

/// `Tolerant` allows a subfield to fail parsing without failing the parsing
/// of the whole structure.
///
/// Used for per-feature rule entries: if one entry uses a shape this build
/// does not understand, the rest of the document is still served.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum Tolerant<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed; the raw value is retained for logging.
    Invalid(serde_json::Value),
}

impl<T> Tolerant<T> {
    pub fn as_parsed(&self) -> Option<&T> {
        match self {
            Tolerant::Parsed(v) => Some(v),
            Tolerant::Invalid(_) => None,
        }
    }

    pub fn into_parsed(self) -> Option<T> {
        match self {
            Tolerant::Parsed(v) => Some(v),
            Tolerant::Invalid(_) => None,
        }
    }
}

/// An operator applied to an expected value, e.g. `{">=", 5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueCheck {
    #[serde(default)]
    pub operator: Operator,
    pub value: DynValue,
}

/// A predicate over the event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCondition {
    /// Event name to match (under `operator`, byte-equality by default).
    pub key: String,
    #[serde(default)]
    pub operator: Operator,
    /// Occurrence-count check over the matching events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<ValueCheck>,
    /// Restrict matching to events within the last N days. Clamped to
    /// [0, 365].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within_last_days: Option<u32>,
    /// Per-parameter predicates; an event must satisfy all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<BTreeMap<String, ValueCheck>>,
    /// Invert the result.
    #[serde(default)]
    pub not: bool,
}

impl EventCondition {
    pub fn named(key: impl Into<String>) -> EventCondition {
        EventCondition {
            key: key.into(),
            operator: Operator::Eq,
            count: None,
            within_last_days: None,
            param: None,
            not: false,
        }
    }
}

/// A predicate over a property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCondition {
    pub key: String,
    pub value: ValueCheck,
    #[serde(default)]
    pub not: bool,
}

/// How the event conditions of a rule combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventsMode {
    /// Order-insensitive; conditions combined with AND/OR.
    #[default]
    Simple,
    /// Conditions are steps that must occur in order.
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOp {
    #[default]
    And,
    Or,
}

/// How sequence steps must line up against the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceOrdering {
    /// Steps consume consecutive events.
    #[default]
    Direct,
    /// Steps must match in order, gaps allowed.
    Indirect,
}

/// Events block of a rule's conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub mode: EventsMode,
    #[serde(default)]
    pub operator: LogicalOp,
    #[serde(default)]
    pub ordering: SequenceOrdering,
    #[serde(default)]
    pub events: Vec<EventCondition>,
}

/// Wire shape of the events block: either the full object or a legacy bare
/// array of conditions (treated as simple mode combined with AND).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventsSpec {
    Legacy(Vec<EventCondition>),
    Config(EventsConfig),
}

impl EventsSpec {
    pub fn normalized(&self) -> EventsConfig {
        match self {
            EventsSpec::Config(config) => config.clone(),
            EventsSpec::Legacy(events) => EventsConfig {
                events: events.clone(),
                ..EventsConfig::default()
            },
        }
    }
}

/// The full condition block of a rule. All three groups must hold; an empty
/// group is vacuously true.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsSpec>,
    #[serde(default)]
    pub user_properties: Vec<PropertyCondition>,
    #[serde(default)]
    pub user_properties_operator: LogicalOp,
    #[serde(default)]
    pub device: Vec<PropertyCondition>,
    #[serde(default)]
    pub device_operator: LogicalOp,
}

/// One entry in a feature's rule list: the value served when the conditions
/// hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRule {
    pub value: String,
    #[serde(default)]
    pub conditions: RuleConditions,
}

pub type FeatureMap = HashMap<String, Vec<Tolerant<FeatureRule>>>;

/// A parsed rule document, prior to index building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    pub features: FeatureMap,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentWire {
    Canonical { features: FeatureMap },
    Legacy(FeatureMap),
}

impl RuleDocument {
    /// Parse a rule document body, accepting both the canonical and the
    /// legacy top-level shape.
    pub fn parse(body: &str) -> crate::Result<RuleDocument> {
        let wire: DocumentWire = serde_json::from_str(body)?;
        let features = match wire {
            DocumentWire::Canonical { features } => features,
            DocumentWire::Legacy(features) => features,
        };
        Ok(RuleDocument { features })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_shape() {
        let doc = RuleDocument::parse(
            r#"{
              "features": {
                "popup": [
                  {
                    "value": "on",
                    "conditions": {
                      "events": {
                        "mode": "simple",
                        "operator": "AND",
                        "events": [
                          {"key": "level_complete", "count": {"operator": ">=", "value": 3}}
                        ]
                      }
                    }
                  }
                ]
              }
            }"#,
        )
        .unwrap();
        let rules = &doc.features["popup"];
        assert_eq!(rules.len(), 1);
        let rule = rules[0].as_parsed().unwrap();
        assert_eq!(rule.value, "on");
        let events = rule.conditions.events.as_ref().unwrap().normalized();
        assert_eq!(events.mode, EventsMode::Simple);
        assert_eq!(events.events[0].key, "level_complete");
        assert_eq!(events.events[0].count.as_ref().unwrap().operator, Operator::Gte);
    }

    #[test]
    fn parses_legacy_top_level_map() {
        let doc = RuleDocument::parse(
            r#"{"banner": [{"value": "b", "conditions": {}}]}"#,
        )
        .unwrap();
        assert!(doc.features.contains_key("banner"));
    }

    #[test]
    fn legacy_events_array_normalizes_to_simple_and() {
        let rule: FeatureRule = serde_json::from_str(
            r#"{
              "value": "v",
              "conditions": {"events": [{"key": "launch"}, {"key": "purchase"}]}
            }"#,
        )
        .unwrap();
        let events = rule.conditions.events.unwrap().normalized();
        assert_eq!(events.mode, EventsMode::Simple);
        assert_eq!(events.operator, LogicalOp::And);
        assert_eq!(events.events.len(), 2);
    }

    #[test]
    fn one_bad_entry_does_not_poison_the_document() {
        let doc = RuleDocument::parse(
            r#"{
              "features": {
                "ok": [{"value": "v", "conditions": {}}],
                "broken": [{"value": 42, "conditions": "nope"}]
              }
            }"#,
        )
        .unwrap();
        assert!(doc.features["ok"][0].as_parsed().is_some());
        assert!(doc.features["broken"][0].as_parsed().is_none());
    }

    #[test]
    fn condition_defaults() {
        let cond: EventCondition = serde_json::from_str(r#"{"key": "signup"}"#).unwrap();
        assert_eq!(cond.operator, Operator::Eq);
        assert!(cond.count.is_none());
        assert!(!cond.not);
    }

    #[test]
    fn sequence_config_parses() {
        let config: EventsConfig = serde_json::from_str(
            r#"{
              "mode": "sequence",
              "ordering": "indirect",
              "events": [{"key": "a"}, {"key": "b"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, EventsMode::Sequence);
        assert_eq!(config.ordering, SequenceOrdering::Indirect);
    }

    #[test]
    fn property_condition_parses() {
        let cond: PropertyCondition = serde_json::from_str(
            r#"{"key": "role", "value": {"operator": "in", "value": ["beta", "admin"]}, "not": false}"#,
        )
        .unwrap();
        assert_eq!(cond.key, "role");
        assert_eq!(cond.value.operator, Operator::In);
    }
}
