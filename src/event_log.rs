//! Append-only, time-ordered event history with size and age retention.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::values::DynValue;

/// A single behavioral event logged by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name, e.g. `level_complete`.
    pub name: String,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Flat event parameters. Nested values are accepted on the wire but
    /// never produced by the engine itself.
    #[serde(default)]
    pub params: BTreeMap<String, DynValue>,
}

impl EventRecord {
    pub fn new(name: impl Into<String>, timestamp_ms: i64) -> EventRecord {
        EventRecord {
            name: name.into(),
            timestamp_ms,
            params: BTreeMap::new(),
        }
    }

    pub fn with_params(
        name: impl Into<String>,
        timestamp_ms: i64,
        params: BTreeMap<String, DynValue>,
    ) -> EventRecord {
        EventRecord {
            name: name.into(),
            timestamp_ms,
            params,
        }
    }
}

const MIN_MAX_EVENTS: usize = 100;
const MAX_MAX_EVENTS: usize = 100_000;
pub(crate) const DEFAULT_MAX_EVENTS: usize = 5_000;

const MIN_MAX_AGE_DAYS: u32 = 1;
const MAX_MAX_AGE_DAYS: u32 = 365;
pub(crate) const DEFAULT_MAX_AGE_DAYS: u32 = 7;

pub(crate) const MILLIS_PER_DAY: i64 = 86_400_000;

/// The event history. Insertion order is preserved; retention drops expired
/// records first and then trims the oldest entries once the size limit is
/// exceeded.
#[derive(Debug)]
pub struct EventLog {
    records: VecDeque<EventRecord>,
    max_events: usize,
    max_age_ms: i64,
}

impl EventLog {
    /// Create an empty log. Out-of-range limits are clamped.
    pub fn new(max_events: usize, max_age_days: u32) -> EventLog {
        EventLog {
            records: VecDeque::new(),
            max_events: max_events.clamp(MIN_MAX_EVENTS, MAX_MAX_EVENTS),
            max_age_ms: i64::from(max_age_days.clamp(MIN_MAX_AGE_DAYS, MAX_MAX_AGE_DAYS))
                * MILLIS_PER_DAY,
        }
    }

    /// Append a record and enforce retention.
    pub fn append(&mut self, record: EventRecord, now_ms: i64) {
        self.records.push_back(record);
        self.trim(now_ms);
    }

    /// Replace the log contents from a persisted snapshot, re-applying
    /// retention against the current clock.
    pub(crate) fn restore(&mut self, records: Vec<EventRecord>, now_ms: i64) {
        self.records = records.into();
        self.trim(now_ms);
    }

    fn trim(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.max_age_ms);
        self.records.retain(|e| e.timestamp_ms >= cutoff);

        if self.records.len() > self.max_events {
            // Over-trim to 80% of the limit so a steady stream of appends
            // doesn't re-trim on every call.
            let keep = self.max_events * 4 / 5;
            while self.records.len() > keep {
                self.records.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Contiguous view over the log for evaluation.
    pub(crate) fn contiguous(&mut self) -> &[EventRecord] {
        self.records.make_contiguous();
        self.records.as_slices().0
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_limits(max_events: usize, max_age_days: u32) -> EventLog {
        EventLog::new(max_events, max_age_days)
    }

    #[test]
    fn preserves_insertion_order() {
        let mut log = log_with_limits(100, 7);
        for i in 0..10 {
            log.append(EventRecord::new(format!("e{i}"), 1_000 + i), 2_000);
        }
        let names: Vec<&str> = log.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names[0], "e0");
        assert_eq!(names[9], "e9");
    }

    #[test]
    fn limits_are_clamped() {
        let log = log_with_limits(1, 0);
        assert_eq!(log.max_events, 100);
        assert_eq!(log.max_age_ms, MILLIS_PER_DAY);

        let log = log_with_limits(1_000_000, 9_999);
        assert_eq!(log.max_events, 100_000);
        assert_eq!(log.max_age_ms, 365 * MILLIS_PER_DAY);
    }

    #[test]
    fn expired_records_are_dropped() {
        let mut log = log_with_limits(100, 1);
        let now = 10 * MILLIS_PER_DAY;
        log.append(EventRecord::new("old", now - MILLIS_PER_DAY - 1), now);
        log.append(EventRecord::new("fresh", now - 1_000), now);
        let names: Vec<&str> = log.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["fresh"]);
    }

    #[test]
    fn size_trim_keeps_eighty_percent() {
        let mut log = log_with_limits(100, 365);
        let now = 100 * MILLIS_PER_DAY;
        for i in 0..101 {
            log.append(EventRecord::new(format!("e{i}"), now - 1_000 + i), now);
        }
        assert_eq!(log.len(), 80);
        // Oldest entries were dropped.
        assert_eq!(log.iter().next().unwrap().name, "e21");
        assert_eq!(log.iter().last().unwrap().name, "e100");
    }

    #[test]
    fn count_never_exceeds_limit_after_append() {
        let mut log = log_with_limits(100, 365);
        let now = 100 * MILLIS_PER_DAY;
        for i in 0..500 {
            log.append(EventRecord::new("e", now + i), now);
            assert!(log.len() <= 100);
        }
    }

    #[test]
    fn restore_reapplies_retention() {
        let mut log = log_with_limits(100, 1);
        let now = 10 * MILLIS_PER_DAY;
        log.restore(
            vec![
                EventRecord::new("stale", now - 2 * MILLIS_PER_DAY),
                EventRecord::new("kept", now - 1_000),
            ],
            now,
        );
        assert_eq!(log.len(), 1);
        assert_eq!(log.iter().next().unwrap().name, "kept");
    }
}
