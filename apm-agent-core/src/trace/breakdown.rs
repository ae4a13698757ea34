//! Self time of a transaction, broken down by span type and subtype.
use crate::trace::abstract_span::lock;
use std::collections::HashMap;
use std::sync::Mutex;

/// Accumulated self time of the spans of one type and subtype.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfTime {
    /// Span type, `app` for the transaction itself.
    pub span_type: String,
    /// Span subtype, empty if unset.
    pub span_subtype: String,
    /// Number of spans.
    pub count: u64,
    /// Sum of self durations in microseconds.
    pub sum: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TimerKey {
    span_type: String,
    span_subtype: String,
}

#[derive(Clone, Copy, Debug, Default)]
struct Timer {
    count: u64,
    sum: i64,
}

/// Timers keyed by type and subtype, updated by every span that ends.
#[derive(Debug, Default)]
pub(crate) struct Breakdown {
    timers: Mutex<HashMap<TimerKey, Timer>>,
}

impl Breakdown {
    pub(crate) fn increment(&self, span_type: &str, span_subtype: &str, self_duration: i64) {
        let key = TimerKey {
            span_type: span_type.to_owned(),
            span_subtype: span_subtype.to_owned(),
        };
        let mut timers = lock(&self.timers);
        let timer = timers.entry(key).or_default();
        timer.count += 1;
        timer.sum += self_duration;
    }

    /// Timers with at least one span, ordered by type and subtype.
    pub(crate) fn snapshot(&self) -> Vec<SelfTime> {
        let mut snapshot: Vec<SelfTime> = lock(&self.timers)
            .iter()
            .filter(|(_, timer)| timer.count > 0)
            .map(|(key, timer)| SelfTime {
                span_type: key.span_type.clone(),
                span_subtype: key.span_subtype.clone(),
                count: timer.count,
                sum: timer.sum,
            })
            .collect();
        snapshot.sort_by(|a, b| (&a.span_type, &a.span_subtype).cmp(&(&b.span_type, &b.span_subtype)));
        snapshot
    }

    pub(crate) fn reset(&self) {
        lock(&self.timers).clear();
    }
}
