//! Spans: timed operations within a transaction.
use crate::pool::Recyclable;
use crate::propagation::Baggage;
use crate::trace::abstract_span::{lock, non_empty, AbstractSpan, SpanCore};
use crate::trace::compression::{self, Composite};
use crate::trace::tracer::TracerInner;
use crate::trace::{SpanId, TraceContext, Transaction};
use crate::{apm_debug, apm_warn};
use std::error::Error;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Interval between two warnings about the span limit, in microseconds.
const MAX_LOG_INTERVAL_MICROS: i64 = 5 * 60 * 1_000_000;

static LAST_SPAN_MAX_WARNING: AtomicI64 = AtomicI64::new(0);

/// Service an exit span calls.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ServiceTarget {
    /// Kind of service, e.g. `postgresql` or `kafka`.
    pub target_type: Option<String>,
    /// Instance of the service, e.g. a database or queue name.
    pub name: Option<String>,
}

impl ServiceTarget {
    /// Whether type or name is known.
    pub fn has_content(&self) -> bool {
        self.target_type.is_some() || self.name.is_some()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SpanDetails {
    pub(crate) subtype: Option<String>,
    pub(crate) action: Option<String>,
    pub(crate) service_target: ServiceTarget,
    pub(crate) composite: Composite,
}

pub(crate) struct SpanInner {
    core: SpanCore,
    transaction: Mutex<Option<Transaction>>,
    pub(crate) details: Mutex<SpanDetails>,
}

/// A timed operation below a [`Transaction`], e.g. a database query.
///
/// Cheap to clone, all clones refer to the same pooled span.
#[derive(Clone)]
pub struct Span(Arc<SpanInner>);

impl Span {
    pub(crate) fn new(tracer: Weak<TracerInner>, trace_context: TraceContext) -> Self {
        Span(Arc::new(SpanInner {
            core: SpanCore::new(tracer, trace_context),
            transaction: Mutex::new(None),
            details: Mutex::new(SpanDetails::default()),
        }))
    }

    /// Non-recording child of `parent`, neither pooled nor counted by its transaction.
    ///
    /// Handed out below unsampled transactions and once the tracer is gone. It still
    /// propagates the trace context and baggage of its parent.
    pub(crate) fn detached(parent: &AbstractSpan, baggage: Baggage, epoch_micros: Option<i64>) -> Self {
        let trace_context = {
            let parent_context = parent.trace_context();
            let mut trace_context = parent_context.empty_like();
            trace_context.as_child_of(&parent_context);
            trace_context.set_recorded(false);
            trace_context
        };
        let span = Span::new(Weak::new(), trace_context);
        span.set_baggage(baggage);
        span.set_timestamp(epoch_micros.unwrap_or_else(|| span.epoch_micros()));
        span.on_after_start();
        span.increment_references();
        span
    }

    pub(crate) fn details(&self) -> &Mutex<SpanDetails> {
        &self.0.details
    }

    pub(crate) fn start(&self, parent: &AbstractSpan, baggage: Baggage, epoch_micros: Option<i64>) {
        {
            let parent_context = parent.trace_context();
            self.trace_context().as_child_of(&parent_context);
        }
        self.set_baggage(baggage);
        let transaction = parent.transaction();
        if let Some(transaction) = &transaction {
            if transaction.is_span_limit_reached() {
                let now = epoch_micros.unwrap_or_else(|| self.epoch_micros());
                let last = LAST_SPAN_MAX_WARNING.load(Ordering::Relaxed);
                if now - last > MAX_LOG_INTERVAL_MICROS
                    && LAST_SPAN_MAX_WARNING
                        .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                {
                    apm_warn!(
                        name: "Span.MaxSpansReached",
                        message = "Max spans for this transaction has been reached, further spans will be dropped",
                        max_spans = transaction.max_spans(),
                        transaction = transaction.id(),
                    );
                }
                apm_debug!(name: "Span.ExceedsMaxSpans", span = self.id());
                self.trace_context().set_recorded(false);
                transaction.span_count().increment_dropped();
            }
            transaction.span_count().increment_total();
        }
        *lock(&self.0.transaction) = transaction;
        self.set_parent(Some(parent.clone()));

        let timestamp = match epoch_micros {
            Some(epoch_micros) => epoch_micros,
            None => self.epoch_micros(),
        };
        self.set_timestamp(timestamp);
        apm_debug!(name: "Span.Start", span = self.id(), parent = parent.id());

        self.on_after_start();
        self.increment_references();
        parent.increment_references();
        parent.on_child_start(timestamp);
    }

    /// Transaction this span belongs to.
    pub fn transaction(&self) -> Option<Transaction> {
        lock(&self.0.transaction).clone()
    }

    /// Whether both handles refer to the same span.
    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Marks this span as a call to an external service.
    pub fn as_exit(&self) -> &Self {
        self.mark_exit();
        self
    }

    /// Subtype, e.g. `postgresql`.
    pub fn subtype(&self) -> Option<String> {
        lock(&self.0.details).subtype.clone()
    }

    /// Sets the subtype, an empty value unsets it.
    pub fn set_subtype(&self, subtype: &str) {
        lock(&self.0.details).subtype = non_empty(subtype);
    }

    /// Action, e.g. `query`.
    pub fn action(&self) -> Option<String> {
        lock(&self.0.details).action.clone()
    }

    /// Sets the action, an empty value unsets it.
    pub fn set_action(&self, action: &str) {
        lock(&self.0.details).action = non_empty(action);
    }

    /// Sets type, subtype and action at once.
    pub fn set_type_subtype_action(&self, span_type: &str, subtype: &str, action: &str) {
        self.set_type(span_type);
        let mut details = lock(&self.0.details);
        details.subtype = non_empty(subtype);
        details.action = non_empty(action);
    }

    /// Service called by this exit span.
    pub fn service_target(&self) -> ServiceTarget {
        lock(&self.0.details).service_target.clone()
    }

    /// Sets the called service. Empty values unset the field.
    pub fn set_service_target(&self, target_type: &str, name: &str) {
        lock(&self.0.details).service_target = ServiceTarget {
            target_type: non_empty(target_type),
            name: non_empty(name),
        };
    }

    /// Compression state, empty unless this span absorbed siblings.
    pub fn composite(&self) -> Composite {
        lock(&self.0.details).composite.clone()
    }

    /// Whether siblings were compressed into this span.
    pub fn is_composite(&self) -> bool {
        lock(&self.0.details).composite.is_composite()
    }

    /// Starts a child span now.
    pub fn create_span(&self) -> Span {
        AbstractSpan::from(self).create_span()
    }

    /// Starts a child span at `epoch_micros`.
    pub fn create_span_at(&self, epoch_micros: i64) -> Span {
        AbstractSpan::from(self).create_span_at(epoch_micros)
    }

    /// Starts a child exit span, `None` if this span already is an exit span.
    pub fn create_exit_span(&self) -> Option<Span> {
        AbstractSpan::from(self).create_exit_span()
    }

    /// Reports an error that happened within this span.
    pub fn capture_exception(&self, error: &(dyn Error + 'static)) -> Option<SpanId> {
        AbstractSpan::from(self).capture_exception(error)
    }

    /// Ends the span now.
    pub fn end(&self) {
        let now = self.epoch_micros();
        self.end_at(now);
    }

    /// Ends the span at `epoch_micros`.
    ///
    /// The span is then either buffered for compression, reported or dropped. It must not
    /// be used afterwards unless a reference was taken.
    pub fn end_at(&self, epoch_micros: i64) {
        let Some(epoch_micros) = self.begin_end(epoch_micros) else {
            return;
        };
        self.before_end(epoch_micros);
        self.finish();
        self.after_end();
    }

    fn before_end(&self, epoch_micros: i64) {
        self.infer_outcome();
        let span_type = self.span_type();
        let subtype = {
            let mut details = lock(&self.0.details);
            if self.is_exit() && !details.service_target.has_content() {
                details.service_target.target_type = details.subtype.clone().or_else(|| span_type.clone());
            }
            details.subtype.clone()
        };
        if let Some(transaction) = self.transaction() {
            transaction.increment_timer(span_type.as_deref(), subtype.as_deref(), self.self_duration());
        }
        if let Some(parent) = self.parent() {
            parent.on_child_end(epoch_micros);
        }
    }

    fn after_end(&self) {
        match self.tracer() {
            Some(tracer) => compression::after_span_end(self, &tracer),
            None => self.decrement_references(),
        }
    }

    /// Takes a reference on this span and its transaction.
    pub fn increment_references(&self) {
        if let Some(transaction) = self.transaction() {
            transaction.increment_references();
        }
        self.retain();
    }

    /// Releases a reference on this span and its transaction.
    pub fn decrement_references(&self) {
        let transaction = self.transaction();
        if self.release() {
            if let Some(tracer) = self.tracer() {
                tracer.recycle_span(self.clone());
            }
        }
        if let Some(transaction) = transaction {
            transaction.decrement_references();
        }
    }
}

impl Deref for Span {
    type Target = SpanCore;

    fn deref(&self) -> &SpanCore {
        &self.0.core
    }
}

impl Recyclable for Span {
    fn reference_count(&self) -> i64 {
        self.0.core.reference_count()
    }

    fn reset(&self) {
        self.0.core.reset();
        *lock(&self.0.transaction) = None;
        *lock(&self.0.details) = SpanDetails::default();
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("trace_id", &self.trace_id())
            .field("references", &self.reference_count())
            .finish()
    }
}
