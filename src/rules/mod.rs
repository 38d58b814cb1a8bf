//! Rule documents: wire format, evaluation, and the indexed rule set.

mod eval;
mod indexes;
mod models;

pub(crate) use eval::EvalContext;
pub use indexes::{ContentHash, IndexEnvelope, RuleSet};
pub use models::{
    EventCondition, EventsConfig, EventsMode, EventsSpec, FeatureRule, LogicalOp,
    PropertyCondition, RuleConditions, RuleDocument, SequenceOrdering, Tolerant, ValueCheck,
};
