//! Transactions: the local root of a trace.
use crate::config::TraceContinuationStrategy;
use crate::pool::Recyclable;
use crate::propagation::{Baggage, HeaderGetter, TextValue, TRACESTATE_HEADER_NAME};
use crate::trace::abstract_span::{lock, AbstractSpan, SpanCore};
use crate::trace::breakdown::{Breakdown, SelfTime};
use crate::trace::compression::CompressionLimits;
use crate::trace::dropped_span_stats::{DroppedSpanStat, DroppedSpanStats};
use crate::trace::tracer::TracerInner;
use crate::trace::{Sampler, Span, SpanId, TraceContext, TraceState};
use crate::{apm_debug, clock};
use std::error::Error;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Counters of the spans of a transaction.
///
/// Once all spans ended, `started == reported + dropped`.
#[derive(Debug, Default)]
pub struct SpanCount {
    total: AtomicU32,
    dropped: AtomicU32,
    reported: AtomicU32,
}

impl SpanCount {
    /// Spans started, including dropped ones.
    pub fn started(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    /// Spans not reported: over the limit, too fast, unsampled or compressed.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Spans handed to the reporter.
    pub fn reported(&self) -> u32 {
        self.reported.load(Ordering::Acquire)
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> SpanCountSnapshot {
        SpanCountSnapshot {
            started: self.started(),
            dropped: self.dropped(),
            reported: self.reported(),
        }
    }

    pub(crate) fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn increment_reported(&self) {
        self.reported.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn is_span_limit_reached(&self, max_spans: usize) -> bool {
        let recorded = self.started().saturating_sub(self.dropped());
        usize::try_from(recorded).map_or(true, |recorded| recorded >= max_spans)
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Release);
        self.reported.store(0, Ordering::Release);
    }
}

/// Values of [`SpanCount`] at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanCountSnapshot {
    /// See [`SpanCount::started`].
    pub started: u32,
    /// See [`SpanCount::dropped`].
    pub dropped: u32,
    /// See [`SpanCount::reported`].
    pub reported: u32,
}

pub(crate) struct TransactionInner {
    core: SpanCore,
    span_count: SpanCount,
    dropped_span_stats: DroppedSpanStats,
    breakdown: Breakdown,
    result: Mutex<Option<String>>,
    noop: AtomicBool,
}

/// Local root of a trace, e.g. an incoming request.
///
/// Cheap to clone, all clones refer to the same pooled transaction.
#[derive(Clone)]
pub struct Transaction(Arc<TransactionInner>);

impl Transaction {
    pub(crate) fn new(tracer: Weak<TracerInner>, trace_context: TraceContext) -> Self {
        Transaction(Arc::new(TransactionInner {
            core: SpanCore::new(tracer, trace_context),
            span_count: SpanCount::default(),
            dropped_span_stats: DroppedSpanStats::default(),
            breakdown: Breakdown::default(),
            result: Mutex::new(None),
            noop: AtomicBool::new(false),
        }))
    }

    pub(crate) fn start_root(&self, sampler: &dyn Sampler, epoch_micros: Option<i64>, baggage: Baggage) {
        self.trace_context().as_root(sampler);
        self.on_start(epoch_micros, baggage);
    }

    /// Continues or restarts the trace found in the text headers of `carrier`.
    pub(crate) fn start_from_headers<T, C>(
        &self,
        carrier: &C,
        getter: &impl HeaderGetter<T, C>,
        sampler: &dyn Sampler,
        epoch_micros: Option<i64>,
        baggage: Baggage,
    ) where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        let restart = self.restart_trace(carrier, getter);
        let valid = if restart {
            self.add_span_link(carrier, getter);
            false
        } else {
            self.trace_context().as_child_of_headers(carrier, getter, true)
        };
        if !valid {
            self.trace_context().as_root(sampler);
        }
        self.on_start(epoch_micros, baggage);
    }

    /// Continues or restarts the trace found in the binary headers of `carrier`.
    pub(crate) fn start_from_binary_headers<C: ?Sized>(
        &self,
        carrier: &C,
        getter: &impl HeaderGetter<[u8], C>,
        sampler: &dyn Sampler,
        epoch_micros: Option<i64>,
        baggage: Baggage,
    ) {
        let restart = self.restart_trace(carrier, getter);
        let valid = if restart {
            self.add_binary_span_link(carrier, getter);
            false
        } else {
            let mut trace_context = self.trace_context();
            let valid = trace_context.as_child_of_binary_headers(carrier, getter);
            if valid {
                let trace_state = trace_context.trace_state_mut();
                getter.for_each_header(TRACESTATE_HEADER_NAME, carrier, &mut |value: &[u8]| {
                    if let Some(text) = value.as_text() {
                        trace_state.add_text_header(text);
                    }
                });
            }
            valid
        };
        if !valid {
            self.trace_context().as_root(sampler);
        }
        self.on_start(epoch_micros, baggage);
    }

    fn restart_trace<T, C>(&self, carrier: &C, getter: &impl HeaderGetter<T, C>) -> bool
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        match self.config().trace_continuation_strategy {
            TraceContinuationStrategy::Continue => false,
            TraceContinuationStrategy::Restart => true,
            TraceContinuationStrategy::RestartExternal => {
                let mut includes_vendor = false;
                getter.for_each_header(TRACESTATE_HEADER_NAME, carrier, &mut |value: &T| {
                    includes_vendor |= value.as_text().is_some_and(TraceState::includes_vendor);
                });
                !includes_vendor
            }
        }
    }

    /// Turns this transaction into one that is never reported.
    pub(crate) fn start_noop(&self) {
        self.set_name("noop", crate::trace::PRIORITY_DEFAULT);
        self.0.noop.store(true, Ordering::Release);
        self.on_after_start();
        self.increment_references();
    }

    fn on_start(&self, epoch_micros: Option<i64>, baggage: Baggage) {
        self.set_baggage(baggage);
        let timestamp = match epoch_micros {
            Some(epoch_micros) => epoch_micros,
            None => self.epoch_micros(),
        };
        self.set_timestamp(timestamp);
        apm_debug!(
            name: "Transaction.Start",
            transaction = self.id(),
            trace_id = self.trace_id(),
            sampled = self.is_sampled(),
        );
        self.on_after_start();
        self.increment_references();
    }

    /// Whether both handles refer to the same transaction.
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Span counters.
    pub fn span_count(&self) -> &SpanCount {
        &self.0.span_count
    }

    /// Max number of recorded spans.
    pub fn max_spans(&self) -> usize {
        self.config().transaction_max_spans
    }

    pub(crate) fn is_span_limit_reached(&self) -> bool {
        self.0.span_count.is_span_limit_reached(self.max_spans())
    }

    /// Checks the span limit before a child span is created.
    ///
    /// Returns `true` if the limit is reached, in which case the span is counted as
    /// started and dropped and the caller should not create it.
    pub fn check_skip_child_span_creation(&self) -> bool {
        let skip = self.is_span_limit_reached();
        if skip {
            self.0.span_count.increment_total();
            self.0.span_count.increment_dropped();
        }
        skip
    }

    pub(crate) fn compression_limits(&self) -> Option<CompressionLimits> {
        let config = self.config();
        config.span_compression_enabled.then(|| CompressionLimits {
            exact_match_max: clock::duration_micros(config.span_compression_exact_match_max_duration),
            same_kind_max: clock::duration_micros(config.span_compression_same_kind_max_duration),
        })
    }

    /// Counts a span that ends without being reported.
    pub(crate) fn capture_dropped_span(&self, span: &Span) {
        if span.is_sampled() {
            self.0.span_count.increment_dropped();
        }
        if self.is_sampled() {
            self.0.dropped_span_stats.capture(span);
        }
    }

    /// Statistics of dropped exit spans.
    pub fn dropped_span_stats(&self) -> Vec<DroppedSpanStat> {
        self.0.dropped_span_stats.snapshot()
    }

    pub(crate) fn increment_timer(&self, span_type: Option<&str>, subtype: Option<&str>, self_duration: i64) {
        let Some(span_type) = span_type else {
            return;
        };
        if !self.collects_breakdown_metrics() || self.is_finished() {
            return;
        }
        self.0.breakdown.increment(span_type, subtype.unwrap_or(""), self_duration);
    }

    /// Self time per span type and subtype.
    pub fn breakdown(&self) -> Vec<SelfTime> {
        self.0.breakdown.snapshot()
    }

    /// Result, e.g. an HTTP status class like `HTTP 2xx`.
    pub fn result(&self) -> Option<String> {
        lock(&self.0.result).clone()
    }

    /// Sets the result.
    pub fn set_result(&self, result: impl Into<String>) {
        *lock(&self.0.result) = Some(result.into());
    }

    /// Sets the result unless one is set already.
    pub fn set_result_if_unset(&self, result: impl Into<String>) {
        let mut current = lock(&self.0.result);
        if current.is_none() {
            *current = Some(result.into());
        }
    }

    /// Whether this transaction is never reported.
    pub fn is_noop(&self) -> bool {
        self.0.noop.load(Ordering::Acquire)
    }

    /// Prevents this transaction from being reported.
    pub fn ignore(&self) {
        self.0.noop.store(true, Ordering::Release);
    }

    /// Starts a child span now.
    pub fn create_span(&self) -> Span {
        AbstractSpan::from(self).create_span()
    }

    /// Starts a child span at `epoch_micros`.
    pub fn create_span_at(&self, epoch_micros: i64) -> Span {
        AbstractSpan::from(self).create_span_at(epoch_micros)
    }

    /// Starts a child exit span.
    pub fn create_exit_span(&self) -> Option<Span> {
        AbstractSpan::from(self).create_exit_span()
    }

    /// Reports an error that happened within this transaction.
    pub fn capture_exception(&self, error: &(dyn Error + 'static)) -> Option<SpanId> {
        AbstractSpan::from(self).capture_exception(error)
    }

    /// Ends the transaction now.
    pub fn end(&self) {
        let now = self.epoch_micros();
        self.end_at(now);
    }

    /// Ends the transaction at `epoch_micros` and reports it.
    ///
    /// Spans still running keep the transaction alive until they end.
    pub fn end_at(&self, epoch_micros: i64) {
        if self.begin_end(epoch_micros).is_none() {
            return;
        }
        self.before_end();
        self.finish();
        match self.tracer() {
            Some(tracer) => tracer.end_transaction(self),
            None => self.decrement_references(),
        }
    }

    fn before_end(&self) {
        self.infer_outcome();
        self.increment_timer(Some("app"), None, self.self_duration());
    }

    /// Takes a reference.
    pub fn increment_references(&self) {
        self.retain();
    }

    /// Releases a reference, recycling the transaction when it was the last one.
    pub fn decrement_references(&self) {
        if self.release() {
            if let Some(tracer) = self.tracer() {
                tracer.recycle_transaction(self.clone());
            }
        }
    }
}

impl Deref for Transaction {
    type Target = SpanCore;

    fn deref(&self) -> &SpanCore {
        &self.0.core
    }
}

impl Recyclable for Transaction {
    fn reference_count(&self) -> i64 {
        self.0.core.reference_count()
    }

    fn reset(&self) {
        self.0.core.reset();
        self.0.span_count.reset();
        self.0.dropped_span_stats.reset();
        self.0.breakdown.reset();
        *lock(&self.0.result) = None;
        self.0.noop.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("trace_id", &self.trace_id())
            .field("sampled", &self.is_sampled())
            .field("references", &self.reference_count())
            .finish()
    }
}
