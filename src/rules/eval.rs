//! Evaluation of rule conditions against the event history and property
//! bags.

use std::collections::HashMap;

use crate::event_log::{EventRecord, MILLIS_PER_DAY};
use crate::values::DynValue;

use super::models::{
    EventCondition, EventsConfig, EventsMode, FeatureRule, LogicalOp, PropertyCondition,
    RuleConditions, SequenceOrdering,
};

const MAX_WINDOW_DAYS: u32 = 365;

/// Everything a single evaluation pass reads. Taken as a consistent snapshot
/// by the caller.
pub(crate) struct EvalContext<'a> {
    pub events: &'a [EventRecord],
    pub user: &'a HashMap<String, String>,
    pub device: &'a HashMap<String, String>,
    pub now_ms: i64,
}

impl FeatureRule {
    /// A rule matches when all three condition groups hold.
    pub(crate) fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        self.conditions.eval(ctx)
    }
}

impl RuleConditions {
    fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        let events_ok = match &self.events {
            Some(spec) => spec.normalized().eval(ctx),
            None => true,
        };
        events_ok
            && eval_properties(&self.user_properties, self.user_properties_operator, ctx.user)
            && eval_properties(&self.device, self.device_operator, ctx.device)
    }
}

fn eval_properties(
    conditions: &[PropertyCondition],
    op: LogicalOp,
    bag: &HashMap<String, String>,
) -> bool {
    if conditions.is_empty() {
        return true;
    }
    match op {
        LogicalOp::And => conditions.iter().all(|c| c.eval(bag)),
        LogicalOp::Or => conditions.iter().any(|c| c.eval(bag)),
    }
}

impl PropertyCondition {
    fn eval(&self, bag: &HashMap<String, String>) -> bool {
        // An absent key never matches; `not` applies on top.
        let base = bag
            .get(&self.key)
            .map(|actual| self.value.operator.eval_str(actual, &self.value.value))
            .unwrap_or(false);
        base != self.not
    }
}

impl EventsConfig {
    fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        if self.events.is_empty() {
            return true;
        }
        match self.mode {
            EventsMode::Simple => match self.operator {
                LogicalOp::And => self.events.iter().all(|c| c.eval_simple(ctx)),
                LogicalOp::Or => self.events.iter().any(|c| c.eval_simple(ctx)),
            },
            EventsMode::Sequence => match self.ordering {
                SequenceOrdering::Direct => eval_direct_sequence(&self.events, ctx),
                SequenceOrdering::Indirect => eval_indirect_sequence(&self.events, ctx),
            },
        }
    }
}

impl EventCondition {
    /// Whether a single event satisfies this condition's name, parameter and
    /// time-window checks. Count checks are the caller's concern.
    pub(crate) fn matches_event(&self, event: &EventRecord, now_ms: i64) -> bool {
        if !self.operator.eval_str_pair(&event.name, &self.key) {
            return false;
        }
        if let Some(cutoff) = self.window_start(now_ms) {
            if event.timestamp_ms < cutoff {
                return false;
            }
        }
        match &self.param {
            Some(params) => params.iter().all(|(name, check)| {
                event
                    .params
                    .get(name)
                    .map(|actual| check.operator.eval(actual, &check.value))
                    .unwrap_or(false)
            }),
            None => true,
        }
    }

    fn window_start(&self, now_ms: i64) -> Option<i64> {
        self.within_last_days
            .map(|days| now_ms - i64::from(days.min(MAX_WINDOW_DAYS)) * MILLIS_PER_DAY)
    }

    fn eval_simple(&self, ctx: &EvalContext<'_>) -> bool {
        let cutoff = self.window_start(ctx.now_ms);
        let matched: Vec<&EventRecord> = ctx
            .events
            .iter()
            .filter(|e| self.operator.eval_str_pair(&e.name, &self.key))
            .filter(|e| cutoff.map_or(true, |c| e.timestamp_ms >= c))
            .collect();

        let satisfied = if self.count.is_none() && self.param.is_none() {
            !matched.is_empty()
        } else {
            let count_ok = self.count.as_ref().map_or(true, |check| {
                check
                    .operator
                    .eval(&DynValue::Number(matched.len() as f64), &check.value)
            });
            let param_ok = self.param.as_ref().map_or(true, |params| {
                matched.iter().any(|e| {
                    params.iter().all(|(name, check)| {
                        e.params
                            .get(name)
                            .map(|actual| check.operator.eval(actual, &check.value))
                            .unwrap_or(false)
                    })
                })
            });
            count_ok && param_ok
        };

        satisfied != self.not
    }

    /// Count check for a step's consumed/observed tally.
    fn count_satisfied(&self, observed: usize) -> bool {
        match &self.count {
            Some(check) => check
                .operator
                .eval(&DynValue::Number(observed as f64), &check.value),
            None => observed > 0,
        }
    }

    /// How many events a direct-sequence step may consume before the next
    /// step takes over. `None` means unbounded.
    fn max_consumed(&self) -> Option<usize> {
        use crate::comparator::Operator;
        let check = self.count.as_ref()?;
        let bound = count_bound(&check.value)?;
        match check.operator {
            Operator::Eq | Operator::Lte => Some(bound),
            Operator::Lt => Some(bound.saturating_sub(1)),
            _ => None,
        }
    }

    /// Lower bound on the number of events this step needs.
    fn min_required(&self) -> usize {
        use crate::comparator::Operator;
        let Some(check) = &self.count else {
            return 1;
        };
        let Some(bound) = count_bound(&check.value) else {
            return 1;
        };
        match check.operator {
            Operator::Eq | Operator::Gte => bound,
            Operator::Gt => bound.saturating_add(1),
            Operator::Lt | Operator::Lte => 0,
            _ => 1,
        }
    }
}

fn count_bound(value: &DynValue) -> Option<usize> {
    let n = value.as_f64()?;
    if n.is_finite() && n >= 0.0 {
        Some(n as usize)
    } else {
        None
    }
}

/// Direct sequences assign consecutive events to consecutive steps. The run
/// is anchored at the first log position whose event matches the opening
/// step; later anchors are not retried.
fn eval_direct_sequence(steps: &[EventCondition], ctx: &EvalContext<'_>) -> bool {
    if steps.is_empty() {
        return true;
    }
    let min_required = steps
        .iter()
        .map(|s| s.min_required())
        .fold(0usize, usize::saturating_add);
    if min_required > ctx.events.len() {
        return false;
    }
    let last_start = match ctx.events.len().checked_sub(min_required.max(1)) {
        Some(last) => last,
        None => return false,
    };

    for start in 0..=last_start {
        if steps[0].matches_event(&ctx.events[start], ctx.now_ms) {
            return direct_run_matches(steps, &ctx.events[start..], ctx.now_ms);
        }
    }
    false
}

fn direct_run_matches(steps: &[EventCondition], run: &[EventRecord], now_ms: i64) -> bool {
    let mut pos = 0usize;
    for step in steps {
        let cap = step.max_consumed();
        let mut consumed = 0usize;
        while pos < run.len()
            && cap.map_or(true, |c| consumed < c)
            && step.matches_event(&run[pos], now_ms)
        {
            consumed = consumed.saturating_add(1);
            pos += 1;
        }
        if !step.count_satisfied(consumed) {
            return false;
        }
    }
    true
}

/// Indirect sequences allow unrelated events between successive step
/// matches. A step without a count accepts its first match; a counted step
/// counts every match in the remaining suffix and the cursor moves past the
/// first one.
fn eval_indirect_sequence(steps: &[EventCondition], ctx: &EvalContext<'_>) -> bool {
    let mut pos = 0usize;
    for step in steps {
        let suffix = &ctx.events[pos..];
        if step.count.is_none() {
            match suffix.iter().position(|e| step.matches_event(e, ctx.now_ms)) {
                Some(offset) => pos += offset + 1,
                None => return false,
            }
        } else {
            let mut observed = 0usize;
            let mut first_match = None;
            for (offset, event) in suffix.iter().enumerate() {
                if step.matches_event(event, ctx.now_ms) {
                    observed = observed.saturating_add(1);
                    if first_match.is_none() {
                        first_match = Some(offset);
                    }
                }
            }
            if !step.count_satisfied(observed) {
                return false;
            }
            if let Some(offset) = first_match {
                pos += offset + 1;
            }
        }
    }
    true
}
