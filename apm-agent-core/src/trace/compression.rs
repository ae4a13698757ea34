//! # Span compression
//!
//! Fast, similar exit spans of one parent are merged into a single composite span. Every
//! parent buffers at most one ended exit span. The next exit sibling to end is either
//! merged into the buffered span or takes its place, in which case the previously
//! buffered span is reported. The buffer is flushed when the parent ends.
//!
//! Two spans are of the same kind when type, subtype and service target match. Spans of
//! the same kind are compressed with the [`CompressionStrategy::ExactMatch`] strategy
//! when their names are equal too and both are shorter than the exact match max
//! duration, and with [`CompressionStrategy::SameKind`] when both are shorter than the
//! same kind max duration. Same kind composites are renamed after their service target.
use crate::apm_debug;
use crate::trace::abstract_span::{lock, AbstractSpan, Outcome};
use crate::trace::span::{ServiceTarget, SpanDetails};
use crate::trace::{Span, Tracer, Transaction};
use std::fmt;

/// How the spans of a composite were matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionStrategy {
    /// Same kind and same name.
    ExactMatch,
    /// Same kind, names differ.
    SameKind,
}

impl CompressionStrategy {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionStrategy::ExactMatch => "exact_match",
            CompressionStrategy::SameKind => "same_kind",
        }
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spans merged into a composite span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Composite {
    count: u32,
    sum: i64,
    compression_strategy: Option<CompressionStrategy>,
}

impl Composite {
    /// Number of spans merged, including the composite itself. `0` for regular spans.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Sum of the durations of all merged spans, in microseconds.
    pub fn sum(&self) -> i64 {
        self.sum
    }

    /// Strategy of the most recent merge.
    pub fn compression_strategy(&self) -> Option<CompressionStrategy> {
        self.compression_strategy
    }

    /// Whether at least one sibling was merged.
    pub fn is_composite(&self) -> bool {
        self.count > 0
    }

    fn init(&mut self, duration: i64, strategy: CompressionStrategy) {
        self.count = 1;
        self.sum = duration;
        self.compression_strategy = Some(strategy);
    }

    fn add(&mut self, duration: i64) {
        self.count += 1;
        self.sum += duration;
    }
}

/// What compression needs to know about the span that just ended.
struct Sibling {
    name: String,
    span_type: Option<String>,
    subtype: Option<String>,
    service_target: ServiceTarget,
    timestamp: i64,
    end_timestamp: i64,
}

impl Sibling {
    fn of(span: &Span) -> Self {
        let (subtype, service_target) = {
            let details = lock(span.details());
            (details.subtype.clone(), details.service_target.clone())
        };
        Sibling {
            name: span.raw_name(),
            span_type: span.span_type(),
            subtype,
            service_target,
            timestamp: span.timestamp(),
            end_timestamp: span.end_timestamp(),
        }
    }

    fn duration(&self) -> i64 {
        self.end_timestamp - self.timestamp
    }

    fn is_same_kind(&self, span_type: &Option<String>, details: &SpanDetails) -> bool {
        self.span_type == *span_type && self.subtype == details.subtype && self.service_target == details.service_target
    }
}

/// Max durations of compressible spans, in microseconds.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CompressionLimits {
    pub(crate) exact_match_max: i64,
    pub(crate) same_kind_max: i64,
}

fn is_compression_eligible(span: &Span) -> bool {
    span.is_exit()
        && span.is_discardable()
        && (span.outcome_not_set() || span.outcome() == Outcome::Success)
}

/// Hands an ended span over to its parent's compression buffer, or to the tracer.
///
/// Takes a temporary reference on `span` so that it can't be recycled by a concurrent
/// flush of the buffer while this runs, and releases the reference the span held on its
/// parent.
pub(crate) fn after_span_end(span: &Span, tracer: &Tracer) {
    span.increment_references();
    let parent = span.parent();
    let transaction = span.transaction();
    match (&parent, transaction.as_ref().and_then(Transaction::compression_limits)) {
        (Some(parent), Some(limits)) => buffer_or_compress(span, parent, transaction.as_ref(), limits, tracer),
        _ => tracer.end_span(span),
    }
    if let Some(parent) = parent {
        parent.decrement_references();
    }
    span.decrement_references();
}

fn buffer_or_compress(
    span: &Span,
    parent: &AbstractSpan,
    transaction: Option<&Transaction>,
    limits: CompressionLimits,
    tracer: &Tracer,
) {
    let eligible = is_compression_eligible(span);
    let sibling = Sibling::of(span);

    let mut buffer = lock(&parent.buffered_span);
    if parent.is_finished() || !eligible {
        let flushed = buffer.take();
        drop(buffer);
        if let Some(flushed) = flushed {
            tracer.end_span(&flushed);
        }
        tracer.end_span(span);
        return;
    }

    if buffer.is_none() {
        apm_debug!(name: "Compression.Buffer", span = span.id());
        *buffer = Some(span.clone());
        return;
    }

    let compressed = buffer
        .as_ref()
        .is_some_and(|buffered| try_to_compress(buffered, &sibling, limits));
    if compressed {
        drop(buffer);
        apm_debug!(name: "Compression.Compressed", span = span.id());
        if span.is_sampled() {
            if let Some(transaction) = transaction {
                transaction.span_count().increment_dropped();
            }
        }
        // the reference taken on start, the span is gone
        span.decrement_references();
    } else {
        let evicted = buffer.replace(span.clone());
        drop(buffer);
        if let Some(evicted) = evicted {
            tracer.end_span(&evicted);
        }
    }
}

/// Merges `sibling` into `buffered` if they are compressible.
fn try_to_compress(buffered: &Span, sibling: &Sibling, limits: CompressionLimits) -> bool {
    let buffered_name = buffered.raw_name();
    let buffered_type = buffered.span_type();
    let buffered_duration = buffered.duration();
    let sibling_duration = sibling.duration();

    let mut details = lock(buffered.details());
    if !sibling.is_same_kind(&buffered_type, &details) {
        return false;
    }
    let same_name = buffered_name == sibling.name;
    let compressed = match details.composite.compression_strategy() {
        None if same_name => {
            if buffered_duration <= limits.exact_match_max && sibling_duration <= limits.exact_match_max {
                details.composite.init(buffered_duration, CompressionStrategy::ExactMatch);
                true
            } else {
                false
            }
        }
        None => {
            if buffered_duration <= limits.same_kind_max && sibling_duration <= limits.same_kind_max {
                details.composite.init(buffered_duration, CompressionStrategy::SameKind);
                buffered.replace_name(compressed_name(&details.service_target));
                true
            } else {
                false
            }
        }
        Some(CompressionStrategy::ExactMatch) => {
            if same_name && sibling_duration <= limits.exact_match_max {
                true
            } else if sibling_duration <= limits.same_kind_max {
                // the composite now holds spans of different names
                details.composite.compression_strategy = Some(CompressionStrategy::SameKind);
                buffered.replace_name(compressed_name(&details.service_target));
                true
            } else {
                false
            }
        }
        Some(CompressionStrategy::SameKind) => sibling_duration <= limits.same_kind_max,
    };
    if compressed {
        buffered.extend_timestamps(sibling.timestamp, sibling.end_timestamp);
        details.composite.add(sibling_duration);
    }
    compressed
}

fn compressed_name(service_target: &ServiceTarget) -> String {
    let mut name = String::from("Calls to ");
    match (&service_target.target_type, &service_target.name) {
        (None, None) => name.push_str("unknown"),
        (Some(target_type), None) => name.push_str(target_type),
        (None, Some(target_name)) => name.push_str(target_name),
        (Some(target_type), Some(target_name)) => {
            name.push_str(target_type);
            name.push('/');
            name.push_str(target_name);
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::InMemoryReporter;
    use crate::trace::ConstantSampler;
    use crate::Config;
    use std::time::Duration;

    fn tracer(exact: Duration, same_kind: Duration) -> (Tracer, InMemoryReporter) {
        let reporter = InMemoryReporter::default();
        let tracer = Tracer::builder()
            .with_config(
                Config::builtin()
                    .with_span_compression_exact_match_max_duration(exact)
                    .with_span_compression_same_kind_max_duration(same_kind),
            )
            .with_reporter(reporter.clone())
            .with_sampler(ConstantSampler::always_on())
            .build();
        (tracer, reporter)
    }

    fn exit_span(transaction: &Transaction, name: &str, start: i64, end: i64) {
        let span = transaction.create_span_at(start);
        span.as_exit();
        span.set_name(name, crate::trace::PRIORITY_DEFAULT);
        span.set_type_subtype_action("db", "postgresql", "query");
        span.set_service_target("postgresql", "users");
        span.end_at(end);
    }

    #[rustfmt::skip]
    fn compressed_names() -> Vec<(ServiceTarget, &'static str)> {
        vec![
            (ServiceTarget::default(), "Calls to unknown"),
            (ServiceTarget { target_type: Some("redis".into()), name: None }, "Calls to redis"),
            (ServiceTarget { target_type: None, name: Some("cache".into()) }, "Calls to cache"),
            (ServiceTarget { target_type: Some("mysql".into()), name: Some("db".into()) }, "Calls to mysql/db"),
        ]
    }

    #[test]
    fn composite_names() {
        for (target, expected) in compressed_names() {
            assert_eq!(compressed_name(&target), expected);
        }
    }

    #[test]
    fn exact_match() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::ZERO);
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "SELECT", 100, 200);
        exit_span(&transaction, "SELECT", 300, 350);
        exit_span(&transaction, "SELECT", 400, 500);
        transaction.end_at(1_000);

        let spans = reporter.spans();
        assert_eq!(spans.len(), 1);
        let composite = spans[0].composite.clone().unwrap();
        assert_eq!(composite.count(), 3);
        assert_eq!(composite.sum(), 250);
        assert_eq!(composite.compression_strategy(), Some(CompressionStrategy::ExactMatch));
        assert_eq!(spans[0].name, "SELECT");
        assert_eq!(spans[0].timestamp, 100);
        assert_eq!(spans[0].duration, 400);
        let span_count = reporter.transactions()[0].span_count;
        assert_eq!(span_count.dropped, 2);
        assert_eq!(span_count.reported, 1);
    }

    #[test]
    fn same_kind() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::from_millis(5));
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "SELECT a", 100, 200);
        exit_span(&transaction, "SELECT b", 300, 400);
        transaction.end_at(1_000);

        let spans = reporter.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "Calls to postgresql/users");
        let composite = spans[0].composite.clone().unwrap();
        assert_eq!(composite.count(), 2);
        assert_eq!(composite.compression_strategy(), Some(CompressionStrategy::SameKind));
    }

    #[test]
    fn ending_the_parent_releases_the_buffered_child() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::ZERO);
        let transaction = tracer.start_root_transaction_at(None, 0);
        let span = transaction.create_span_at(100);
        span.as_exit();
        span.set_type_subtype_action("db", "postgresql", "query");
        span.end_at(200);
        assert!(lock(&transaction.buffered_span)
            .as_ref()
            .is_some_and(|buffered| buffered.ptr_eq(&span)));
        assert!(span.parent().is_some());

        transaction.end_at(1_000);
        assert!(lock(&transaction.buffered_span).is_none());
        assert!(span.parent().is_none());
        assert_eq!(reporter.spans().len(), 1);
        assert_eq!(tracer.pool_stats().spans.size, 1);
    }

    #[test]
    fn exact_match_composite_downgrades_to_same_kind() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::from_millis(5));
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "SELECT a", 100, 200);
        exit_span(&transaction, "SELECT a", 300, 400);
        exit_span(&transaction, "SELECT b", 500, 600);
        exit_span(&transaction, "SELECT a", 700, 800);
        transaction.end_at(1_000);

        let spans = reporter.spans();
        assert_eq!(spans.len(), 1);
        let composite = spans[0].composite.clone().unwrap();
        assert_eq!(composite.count(), 4);
        assert_eq!(composite.sum(), 400);
        assert_eq!(composite.compression_strategy(), Some(CompressionStrategy::SameKind));
        assert_eq!(spans[0].name, "Calls to postgresql/users");
    }

    #[test]
    fn different_kinds_evict_the_buffer() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::from_millis(5));
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "SELECT", 100, 200);
        let redis = transaction.create_span_at(300);
        redis.as_exit();
        redis.set_type_subtype_action("db", "redis", "query");
        redis.end_at(310);
        exit_span(&transaction, "SELECT", 400, 500);
        transaction.end_at(1_000);

        let spans = reporter.spans();
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.composite.is_none()));
        assert_eq!(spans[1].subtype.as_deref(), Some("redis"));
    }

    #[test]
    fn slow_spans_are_not_compressed() {
        let (tracer, reporter) = tracer(Duration::from_millis(1), Duration::ZERO);
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "SELECT", 100, 200);
        exit_span(&transaction, "SELECT", 300, 5_000);
        transaction.end_at(10_000);
        assert_eq!(reporter.spans().len(), 2);
    }

    #[test]
    fn failed_and_propagating_spans_are_not_compressed() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::ZERO);
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "GET", 100, 200);

        let failed = transaction.create_span_at(300);
        failed.as_exit();
        failed.set_name("GET", crate::trace::PRIORITY_DEFAULT);
        failed.set_type_subtype_action("db", "postgresql", "query");
        failed.set_service_target("postgresql", "users");
        failed.set_outcome(Outcome::Failure);
        failed.end_at(310);

        let propagating = transaction.create_span_at(400);
        propagating.as_exit();
        propagating.set_name("GET", crate::trace::PRIORITY_DEFAULT);
        propagating.set_type_subtype_action("db", "postgresql", "query");
        propagating.set_service_target("postgresql", "users");
        let mut headers = std::collections::HashMap::<String, String>::new();
        propagating.propagate_trace_context(&mut headers, &crate::propagation::MapHeaders);
        propagating.end_at(410);
        transaction.end_at(1_000);

        assert_eq!(reporter.spans().len(), 3);
    }

    #[test]
    fn spans_ending_after_parent_are_reported_directly() {
        let (tracer, reporter) = tracer(Duration::from_millis(50), Duration::ZERO);
        let transaction = tracer.start_root_transaction_at(None, 0);
        let parent = transaction.create_span_at(10);
        let late = parent.create_span_at(20);
        late.as_exit();
        late.set_type("db");
        parent.end_at(100);
        assert_eq!(reporter.spans().len(), 1);
        late.end_at(150);
        assert_eq!(reporter.spans().len(), 2);
        transaction.end_at(1_000);
    }

    #[test]
    fn disabled_compression_reports_every_span() {
        let reporter = InMemoryReporter::default();
        let tracer = Tracer::builder()
            .with_config(Config::builtin().with_span_compression_enabled(false))
            .with_reporter(reporter.clone())
            .with_sampler(ConstantSampler::always_on())
            .build();
        let transaction = tracer.start_root_transaction_at(None, 0);
        exit_span(&transaction, "SELECT", 100, 200);
        exit_span(&transaction, "SELECT", 300, 400);
        assert_eq!(reporter.spans().len(), 2);
        transaction.end_at(1_000);
    }
}
