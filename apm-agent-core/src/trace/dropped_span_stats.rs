//! Statistics of exit spans that were not reported.
//!
//! Dropped exit spans still tell which services a transaction called. They are aggregated
//! per service target and outcome so that service maps stay complete even when spans are
//! dropped by the span limit, a min duration or compression.
use crate::trace::abstract_span::{lock, Outcome};
use crate::trace::span::ServiceTarget;
use crate::trace::Span;
use std::collections::HashMap;
use std::sync::Mutex;

/// Distinct keys kept per transaction, further keys are ignored.
pub const MAX_DROPPED_SPAN_STATS: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StatsKey {
    service_target: ServiceTarget,
    outcome: Outcome,
}

#[derive(Clone, Copy, Debug, Default)]
struct Stats {
    count: u64,
    sum: i64,
}

/// Dropped spans calling one service with one outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedSpanStat {
    /// Service the dropped spans called.
    pub service_target: ServiceTarget,
    /// Outcome of the dropped spans.
    pub outcome: Outcome,
    /// Number of dropped spans, composites count all their members.
    pub count: u64,
    /// Sum of durations in microseconds.
    pub sum: i64,
}

#[derive(Debug, Default)]
pub(crate) struct DroppedSpanStats {
    stats: Mutex<HashMap<StatsKey, Stats>>,
}

impl DroppedSpanStats {
    /// Adds `span` unless it is no exit span or its target is unknown.
    pub(crate) fn capture(&self, span: &Span) {
        if !span.is_exit() {
            return;
        }
        let service_target = span.service_target();
        if !service_target.has_content() {
            return;
        }
        let composite = span.composite();
        let (count, sum) = if composite.is_composite() {
            (u64::from(composite.count()), composite.sum())
        } else {
            (1, span.duration())
        };
        let key = StatsKey {
            service_target,
            outcome: span.outcome(),
        };

        let mut stats = lock(&self.stats);
        let len = stats.len();
        match stats.get_mut(&key) {
            Some(entry) => {
                entry.count += count;
                entry.sum += sum;
            }
            None if len < MAX_DROPPED_SPAN_STATS => {
                stats.insert(key, Stats { count, sum });
            }
            None => {}
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<DroppedSpanStat> {
        let mut snapshot: Vec<DroppedSpanStat> = lock(&self.stats)
            .iter()
            .map(|(key, stats)| DroppedSpanStat {
                service_target: key.service_target.clone(),
                outcome: key.outcome,
                count: stats.count,
                sum: stats.sum,
            })
            .collect();
        snapshot.sort_by(|a, b| {
            (&a.service_target.target_type, &a.service_target.name, a.outcome.as_str()).cmp(&(
                &b.service_target.target_type,
                &b.service_target.name,
                b.outcome.as_str(),
            ))
        });
        snapshot
    }

    pub(crate) fn reset(&self) {
        lock(&self.stats).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::InMemoryReporter;
    use crate::trace::{ConstantSampler, Tracer};
    use crate::Config;

    #[test]
    fn aggregates_exit_spans_by_target_and_outcome() {
        let tracer = Tracer::builder()
            .with_config(Config::builtin().with_span_compression_enabled(false))
            .with_reporter(InMemoryReporter::default())
            .with_sampler(ConstantSampler::always_on())
            .build();
        let transaction = tracer.start_root_transaction_at(None, 0);
        let stats = DroppedSpanStats::default();

        let spans: Vec<Span> = (0..3)
            .map(|i| {
                let span = transaction.create_span_at(i * 100);
                span.as_exit();
                span.set_type_subtype_action("db", "mysql", "query");
                span
            })
            .collect();
        spans[2].set_outcome(Outcome::Failure);
        let internal = transaction.create_span_at(400);

        for (i, span) in spans.iter().enumerate() {
            span.increment_references();
            span.end_at(i as i64 * 100 + 10);
            stats.capture(span);
        }
        internal.increment_references();
        internal.end_at(450);
        stats.capture(&internal);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].outcome, Outcome::Failure);
        assert_eq!(snapshot[0].count, 1);
        assert_eq!(snapshot[1].service_target.target_type.as_deref(), Some("mysql"));
        assert_eq!(snapshot[1].outcome, Outcome::Success);
        assert_eq!(snapshot[1].count, 2);
        assert_eq!(snapshot[1].sum, 20);

        for span in &spans {
            span.decrement_references();
        }
        internal.decrement_references();
        transaction.end();
    }
}
