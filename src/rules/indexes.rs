//! The active rule set: parsed rules plus the indexes built once per
//! installation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sha2::{Digest, Sha256};

use super::models::{FeatureRule, RuleConditions, RuleDocument};

/// SHA-256 digest of a rule document body, hex-encoded on the wire.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(#[serde_as(as = "serde_with::hex::Hex")] [u8; 32]);

impl ContentHash {
    pub fn of(body: &[u8]) -> ContentHash {
        let digest = Sha256::digest(body);
        ContentHash(digest.into())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

type FeatureSet = BTreeSet<String>;
type InvertedIndex = BTreeMap<String, FeatureSet>;

/// Snapshot of the inverted indexes persisted next to the rules body. The
/// checksum guards against reusing indexes built from a different document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEnvelope {
    pub checksum: ContentHash,
    pub event_index: InvertedIndex,
    pub user_property_index: InvertedIndex,
    pub device_property_index: InvertedIndex,
}

/// A parsed, indexed rule set. Replaced whole on installation; never mutated
/// in place.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// Identity of the immutable document this rule set came from.
    version: String,
    /// Locally computed digest of the document body.
    checksum: ContentHash,
    /// Primary lookup: feature name to its ordered rule list.
    features: HashMap<String, Vec<FeatureRule>>,
    event_index: InvertedIndex,
    user_property_index: InvertedIndex,
    device_property_index: InvertedIndex,
}

impl RuleSet {
    /// Parse a rule document body and build the indexes. `version` is the
    /// content-addressed name of the document (the pointer's `version`, or a
    /// locally derived identity for cached and host-supplied documents).
    pub fn parse(body: &str, version: impl Into<String>) -> crate::Result<RuleSet> {
        let document = RuleDocument::parse(body)?;
        Ok(RuleSet::from_document(
            document,
            version.into(),
            ContentHash::of(body.as_bytes()),
        ))
    }

    fn from_document(document: RuleDocument, version: String, checksum: ContentHash) -> RuleSet {
        let mut features: HashMap<String, Vec<FeatureRule>> = HashMap::new();
        for (feature, entries) in document.features {
            let total = entries.len();
            let rules: Vec<FeatureRule> =
                entries.into_iter().filter_map(|e| e.into_parsed()).collect();
            if rules.len() < total {
                log::warn!(
                    target: "flipkit",
                    "skipped {} unparseable rule(s) for feature {feature:?}",
                    total - rules.len(),
                );
            }
            features.insert(feature, rules);
        }

        let mut set = RuleSet {
            version,
            checksum,
            features,
            event_index: InvertedIndex::new(),
            user_property_index: InvertedIndex::new(),
            device_property_index: InvertedIndex::new(),
        };
        set.rebuild_indexes();
        set
    }

    fn rebuild_indexes(&mut self) {
        let mut event_index = InvertedIndex::new();
        let mut user_index = InvertedIndex::new();
        let mut device_index = InvertedIndex::new();

        for (feature, rules) in &self.features {
            for rule in rules {
                index_conditions(&rule.conditions, feature, &mut event_index, &mut user_index, &mut device_index);
            }
        }

        self.event_index = event_index;
        self.user_property_index = user_index;
        self.device_property_index = device_index;
    }

    /// Adopt previously persisted indexes. Rejected (keeping the freshly
    /// built ones) when the stored checksum does not match this document.
    pub fn try_adopt_indexes(&mut self, envelope: IndexEnvelope) -> bool {
        if envelope.checksum != self.checksum {
            log::debug!(target: "flipkit", "stored rule indexes are stale, rebuilding");
            return false;
        }
        self.event_index = envelope.event_index;
        self.user_property_index = envelope.user_property_index;
        self.device_property_index = envelope.device_property_index;
        true
    }

    pub fn index_envelope(&self) -> IndexEnvelope {
        IndexEnvelope {
            checksum: self.checksum,
            event_index: self.event_index.clone(),
            user_property_index: self.user_property_index.clone(),
            device_property_index: self.device_property_index.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn checksum(&self) -> ContentHash {
        self.checksum
    }

    pub fn features(&self) -> impl Iterator<Item = (&String, &Vec<FeatureRule>)> {
        self.features.iter()
    }

    pub fn rules_for(&self, feature: &str) -> Option<&[FeatureRule]> {
        self.features.get(feature).map(Vec::as_slice)
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Features whose rules reference the given event name.
    pub fn features_for_event(&self, event: &str) -> Option<&FeatureSet> {
        self.event_index.get(event)
    }

    pub fn features_for_user_property(&self, key: &str) -> Option<&FeatureSet> {
        self.user_property_index.get(key)
    }

    pub fn features_for_device_property(&self, key: &str) -> Option<&FeatureSet> {
        self.device_property_index.get(key)
    }
}

fn index_conditions(
    conditions: &RuleConditions,
    feature: &str,
    event_index: &mut InvertedIndex,
    user_index: &mut InvertedIndex,
    device_index: &mut InvertedIndex,
) {
    if let Some(spec) = &conditions.events {
        for cond in &spec.normalized().events {
            event_index
                .entry(cond.key.clone())
                .or_default()
                .insert(feature.to_owned());
        }
    }
    for cond in &conditions.user_properties {
        user_index
            .entry(cond.key.clone())
            .or_default()
            .insert(feature.to_owned());
    }
    for cond in &conditions.device {
        device_index
            .entry(cond.key.clone())
            .or_default()
            .insert(feature.to_owned());
    }
}
