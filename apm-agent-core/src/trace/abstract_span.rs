//! State and behavior shared by transactions and spans.
//!
//! Both are handles to pooled, reference counted entities. Every holder that needs the
//! entity to stay valid (the pending `end()`, an activation, a child span, the
//! compression buffer, a reporter) increments the reference count and decrements it when
//! done. Once the count drops to zero the entity is reset and returned to its pool, so a
//! handle must not be used after its holder released it.
use crate::config::Config;
use crate::propagation::{Baggage, HeaderGetter, HeaderSetter, TextValue};
use crate::trace::tracer::{Tracer, TracerInner};
use crate::trace::{Span, SpanId, TraceContext, TraceId, Transaction};
use crate::{apm_debug, apm_error, apm_warn, apm_warn_once};
use std::error::Error;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Names set by the tracer itself.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Names derived by low level instrumentation, e.g. a servlet path.
pub const PRIORITY_LOW_LEVEL_FRAMEWORK: i32 = 10;
/// Names derived by high level instrumentation, e.g. a controller route.
pub const PRIORITY_HIGH_LEVEL_FRAMEWORK: i32 = 20;
/// Names derived from a method signature.
pub const PRIORITY_METHOD_SIGNATURE: i32 = 30;
/// Names set through the public API.
pub const PRIORITY_USER_SUPPLIED: i32 = 100;

/// Upper bound of span links per transaction or span.
pub const MAX_SPAN_LINKS: usize = 1000;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of the operation a transaction or span represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
    /// Nothing is known about the result.
    Unknown,
}

impl Outcome {
    /// Lowercase name of the outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link from a transaction or span to a context of another trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpanLink {
    /// Trace of the linked context.
    pub trace_id: TraceId,
    /// Id of the linked span.
    pub span_id: SpanId,
}

/// Time covered by at least one direct child.
#[derive(Debug, Default)]
struct ChildDurationTimer {
    active_children: AtomicI32,
    start: AtomicI64,
    duration: AtomicI64,
}

impl ChildDurationTimer {
    fn on_child_start(&self, epoch_micros: i64) {
        if self.active_children.fetch_add(1, Ordering::AcqRel) == 0 {
            self.start.store(epoch_micros, Ordering::Release);
        }
    }

    fn on_child_end(&self, epoch_micros: i64) {
        if self.active_children.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.increment_duration(epoch_micros);
        }
    }

    fn on_span_end(&self, epoch_micros: i64) {
        if self.active_children.swap(0, Ordering::AcqRel) != 0 {
            self.increment_duration(epoch_micros);
        }
    }

    fn increment_duration(&self, epoch_micros: i64) {
        let start = self.start.load(Ordering::Acquire);
        self.duration.fetch_add(epoch_micros - start, Ordering::AcqRel);
    }

    fn duration(&self) -> i64 {
        self.duration.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.active_children.store(0, Ordering::Release);
        self.start.store(0, Ordering::Release);
        self.duration.store(0, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct SpanInfo {
    name: String,
    name_priority: i32,
    span_type: Option<String>,
    outcome: Option<Outcome>,
    user_outcome: Option<Outcome>,
    span_links: Vec<SpanLink>,
    baggage: Baggage,
}

/// Fields and operations common to [`Transaction`] and [`Span`].
///
/// Reached through `Deref` on both handle types and on [`AbstractSpan`].
pub struct SpanCore {
    tracer: Weak<TracerInner>,
    config: Arc<Config>,
    trace_context: Mutex<TraceContext>,
    info: Mutex<SpanInfo>,
    /// Counted link to the parent, taken on start. `after_span_end` releases the count and
    /// `reset` clears the link when the span returns to its pool.
    parent: Mutex<Option<AbstractSpan>>,
    timestamp: AtomicI64,
    end_timestamp: AtomicI64,
    references: AtomicI64,
    finished: AtomicBool,
    exit: AtomicBool,
    discard_requested: AtomicBool,
    has_captured_exceptions: AtomicBool,
    collect_breakdown_metrics: bool,
    assertions_enabled: bool,
    child_durations: ChildDurationTimer,
    /// Last ended child waiting for a sibling to compress with. Only filled while this
    /// span is unfinished and emptied by `finish`, so together with `parent` it never
    /// outlives the end of this span.
    pub(crate) buffered_span: Mutex<Option<Span>>,
}

impl SpanCore {
    pub(crate) fn new(tracer: Weak<TracerInner>, trace_context: TraceContext) -> Self {
        let config = trace_context.config().clone();
        SpanCore {
            tracer,
            collect_breakdown_metrics: config.breakdown_metrics,
            assertions_enabled: config.assertions_enabled,
            config,
            trace_context: Mutex::new(trace_context),
            info: Mutex::new(SpanInfo::default()),
            parent: Mutex::new(None),
            timestamp: AtomicI64::new(0),
            end_timestamp: AtomicI64::new(0),
            references: AtomicI64::new(0),
            finished: AtomicBool::new(true),
            exit: AtomicBool::new(false),
            discard_requested: AtomicBool::new(false),
            has_captured_exceptions: AtomicBool::new(false),
            child_durations: ChildDurationTimer::default(),
            buffered_span: Mutex::new(None),
        }
    }

    pub(crate) fn tracer(&self) -> Option<Tracer> {
        self.tracer.upgrade().map(Tracer::from_inner)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Locks and returns the trace context.
    ///
    /// The guard must be dropped before calling other methods of this span.
    pub fn trace_context(&self) -> MutexGuard<'_, TraceContext> {
        lock(&self.trace_context)
    }

    /// Id of the trace.
    pub fn trace_id(&self) -> TraceId {
        self.trace_context().trace_id()
    }

    /// Own id.
    pub fn id(&self) -> SpanId {
        self.trace_context().id()
    }

    /// Id of the parent, empty for root transactions.
    pub fn parent_id(&self) -> SpanId {
        self.trace_context().parent_id()
    }

    /// Whether this span is recorded.
    pub fn is_sampled(&self) -> bool {
        self.trace_context().is_sampled()
    }

    /// Current time according to the clock of this trace.
    pub fn epoch_micros(&self) -> i64 {
        self.trace_context().clock().epoch_micros()
    }

    /// Parent of a span, `None` for transactions.
    pub fn parent(&self) -> Option<AbstractSpan> {
        lock(&self.parent).clone()
    }

    pub(crate) fn set_parent(&self, parent: Option<AbstractSpan>) {
        *lock(&self.parent) = parent;
    }

    /// Name, `unnamed` if no name has been set.
    pub fn name(&self) -> String {
        let info = lock(&self.info);
        if info.name.is_empty() {
            String::from("unnamed")
        } else {
            info.name.clone()
        }
    }

    pub(crate) fn raw_name(&self) -> String {
        lock(&self.info).name.clone()
    }

    pub(crate) fn replace_name(&self, name: String) {
        lock(&self.info).name = name;
    }

    /// Priority of the current name.
    pub fn name_priority(&self) -> i32 {
        lock(&self.info).name_priority
    }

    /// Replaces the name unless it was set with a higher priority.
    ///
    /// Empty names are ignored. Returns `true` if the name was replaced.
    pub fn set_name(&self, name: &str, priority: i32) -> bool {
        let mut info = lock(&self.info);
        if priority < info.name_priority || name.is_empty() {
            return false;
        }
        info.name.clear();
        info.name.push_str(name);
        info.name_priority = priority;
        true
    }

    /// Appends to the name unless it was set with a higher priority.
    pub fn append_to_name(&self, text: &str, priority: i32) -> bool {
        let mut info = lock(&self.info);
        if priority < info.name_priority {
            return false;
        }
        info.name.push_str(text);
        info.name_priority = priority;
        true
    }

    /// Type, e.g. `request` or `db`.
    pub fn span_type(&self) -> Option<String> {
        lock(&self.info).span_type.clone()
    }

    /// Sets the type, an empty value unsets it.
    pub fn set_type(&self, span_type: &str) {
        lock(&self.info).span_type = non_empty(span_type);
    }

    /// Outcome set by the user, else by instrumentation, else [`Outcome::Unknown`].
    pub fn outcome(&self) -> Outcome {
        let info = lock(&self.info);
        info.user_outcome.or(info.outcome).unwrap_or(Outcome::Unknown)
    }

    /// Outcome as determined by instrumentation.
    pub fn set_outcome(&self, outcome: Outcome) {
        lock(&self.info).outcome = Some(outcome);
    }

    /// Outcome set through the public API, it wins over [`SpanCore::set_outcome`].
    pub fn set_user_outcome(&self, outcome: Outcome) {
        lock(&self.info).user_outcome = Some(outcome);
    }

    pub(crate) fn outcome_not_set(&self) -> bool {
        let info = lock(&self.info);
        info.user_outcome.is_none() && info.outcome.is_none()
    }

    pub(crate) fn infer_outcome(&self) {
        let mut info = lock(&self.info);
        if info.user_outcome.is_none() && info.outcome.is_none() {
            info.outcome = Some(if self.has_captured_exceptions() {
                Outcome::Failure
            } else {
                Outcome::Success
            });
        }
    }

    /// Baggage propagated with this span.
    pub fn baggage(&self) -> Baggage {
        lock(&self.info).baggage.clone()
    }

    pub(crate) fn set_baggage(&self, baggage: Baggage) {
        lock(&self.info).baggage = baggage;
    }

    /// Start in epoch microseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub(crate) fn set_timestamp(&self, epoch_micros: i64) {
        self.timestamp.store(epoch_micros, Ordering::Release);
    }

    pub(crate) fn extend_timestamps(&self, start: i64, end: i64) {
        self.timestamp.fetch_min(start, Ordering::AcqRel);
        self.end_timestamp.fetch_max(end, Ordering::AcqRel);
    }

    /// End in epoch microseconds, `0` until ended.
    pub fn end_timestamp(&self) -> i64 {
        self.end_timestamp.load(Ordering::Acquire)
    }

    /// Duration in microseconds.
    pub fn duration(&self) -> i64 {
        self.end_timestamp() - self.timestamp()
    }

    /// Duration not covered by direct children, in microseconds.
    pub fn self_duration(&self) -> i64 {
        self.duration() - self.child_durations.duration()
    }

    /// Whether `end()` has been called, also `true` for pooled instances.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether this span calls an external service.
    pub fn is_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Asks for this span not to be reported.
    ///
    /// Only honored while the span is discardable.
    pub fn request_discarding(&self) {
        self.discard_requested.store(true, Ordering::Release);
    }

    /// Whether this span will be dropped instead of reported.
    pub fn is_discarded(&self) -> bool {
        self.discard_requested.load(Ordering::Acquire) && self.is_discardable()
    }

    /// Whether this span may still be dropped without leaving dangling references.
    pub fn is_discardable(&self) -> bool {
        self.trace_context().is_discardable()
    }

    /// Prevents this span and its parents from being discarded.
    ///
    /// Called when something else refers to the span: a downstream service via its
    /// outgoing headers, an error or a reported child.
    pub fn set_non_discardable(&self) {
        let was_discardable = {
            let mut trace_context = self.trace_context();
            let was_discardable = trace_context.is_discardable();
            trace_context.set_non_discardable();
            was_discardable
        };
        if was_discardable {
            if let Some(parent) = self.parent() {
                parent.set_non_discardable();
            }
        }
    }

    /// Whether an error was captured with this span as parent.
    pub fn has_captured_exceptions(&self) -> bool {
        self.has_captured_exceptions.load(Ordering::Acquire)
    }

    pub(crate) fn mark_captured_exception(&self) {
        self.has_captured_exceptions.store(true, Ordering::Release);
    }

    /// Writes the trace context headers of this span to a carrier.
    pub fn propagate_trace_context<T, C>(&self, carrier: &mut C, setter: &impl HeaderSetter<T, C>)
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        self.set_non_discardable();
        self.trace_context().propagate_trace_context(carrier, setter);
    }

    /// Writes the binary trace context header of this span to a carrier.
    pub fn propagate_binary_trace_context<C: ?Sized>(
        &self,
        carrier: &mut C,
        setter: &impl HeaderSetter<[u8], C>,
    ) -> bool {
        self.set_non_discardable();
        self.trace_context().propagate_binary_trace_context(carrier, setter)
    }

    /// Links to the context found in the text headers of a carrier.
    ///
    /// The `tracestate` of the linked context is ignored. Returns `false` if the carrier
    /// holds no valid context or the link limit is reached.
    pub fn add_span_link<T, C>(&self, carrier: &C, getter: &impl HeaderGetter<T, C>) -> bool
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        self.push_span_link(|link| link.as_child_of_headers(carrier, getter, false))
    }

    /// Links to the context found in the binary header of a carrier.
    pub fn add_binary_span_link<C: ?Sized>(&self, carrier: &C, getter: &impl HeaderGetter<[u8], C>) -> bool {
        self.push_span_link(|link| link.as_child_of_binary_headers(carrier, getter))
    }

    /// Links to a local context.
    pub fn add_span_link_to(&self, linked: &TraceContext) -> bool {
        if !linked.has_content() {
            return false;
        }
        let link = SpanLink {
            trace_id: linked.trace_id(),
            span_id: linked.id(),
        };
        self.insert_span_link(link)
    }

    fn push_span_link(&self, parse: impl FnOnce(&mut TraceContext) -> bool) -> bool {
        let mut link = self.trace_context().empty_like();
        if !parse(&mut link) {
            return false;
        }
        self.insert_span_link(SpanLink {
            trace_id: link.trace_id(),
            span_id: link.parent_id(),
        })
    }

    fn insert_span_link(&self, link: SpanLink) -> bool {
        let mut info = lock(&self.info);
        if info.span_links.len() >= MAX_SPAN_LINKS {
            apm_warn_once!(
                name: "Span.MaxSpanLinks",
                message = "Span links reached the allowed maximum, no more spans will be linked",
                max = MAX_SPAN_LINKS,
            );
            return false;
        }
        if info.span_links.contains(&link) {
            return false;
        }
        info.span_links.push(link);
        true
    }

    /// Contexts this span links to.
    pub fn span_links(&self) -> Vec<SpanLink> {
        lock(&self.info).span_links.clone()
    }

    /// Outstanding references.
    pub fn reference_count(&self) -> i64 {
        self.references.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference, returns `true` if it was the last one.
    pub(crate) fn release(&self) -> bool {
        let remaining = self.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            self.references.fetch_add(1, Ordering::AcqRel);
            apm_error!(
                name: "Span.NegativeReferenceCount",
                message = "Released more references than were taken",
                span = self.id(),
            );
            if self.assertions_enabled {
                panic!("reference count of span {} dropped below zero", self.id());
            }
            return false;
        }
        remaining == 0
    }

    pub(crate) fn on_after_start(&self) {
        self.finished.store(false, Ordering::Release);
    }

    pub(crate) fn on_child_start(&self, epoch_micros: i64) {
        if self.collect_breakdown_metrics {
            self.child_durations.on_child_start(epoch_micros);
        }
    }

    pub(crate) fn on_child_end(&self, epoch_micros: i64) {
        if self.collect_breakdown_metrics {
            self.child_durations.on_child_end(epoch_micros);
        }
    }

    pub(crate) fn collects_breakdown_metrics(&self) -> bool {
        self.collect_breakdown_metrics
    }

    /// First half of `end()`: validates the call and records the end timestamp.
    ///
    /// Returns the effective end timestamp, `None` if the span already ended.
    pub(crate) fn begin_end(&self, epoch_micros: i64) -> Option<i64> {
        if self.is_finished() {
            apm_warn_once!(
                name: "Span.DuplicateEnd",
                message = "End has already been called",
                span = self.id(),
            );
            if self.assertions_enabled {
                panic!("end has already been called on span {}", self.id());
            }
            return None;
        }
        let start = self.timestamp();
        let epoch_micros = if epoch_micros < start {
            apm_warn!(
                name: "Span.EndBeforeStart",
                message = "End timestamp is before the start, using the start timestamp",
                span = self.id(),
            );
            start
        } else {
            epoch_micros
        };
        self.end_timestamp.store(epoch_micros, Ordering::Release);
        self.child_durations.on_span_end(epoch_micros);
        let mut info = lock(&self.info);
        if info.span_type.is_none() {
            info.span_type = Some(String::from("custom"));
        }
        Some(epoch_micros)
    }

    /// Marks the span finished and reports the span buffered for compression, if any.
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        let buffered = lock(&self.buffered_span).take();
        if let Some(buffered) = buffered {
            apm_debug!(name: "Span.FlushCompressionBuffer", span = buffered.id());
            match self.tracer() {
                Some(tracer) => tracer.end_span(&buffered),
                None => buffered.decrement_references(),
            }
        }
    }

    pub(crate) fn reset(&self) {
        self.trace_context().reset();
        *lock(&self.info) = SpanInfo::default();
        self.set_parent(None);
        self.timestamp.store(0, Ordering::Release);
        self.end_timestamp.store(0, Ordering::Release);
        self.finished.store(true, Ordering::Release);
        self.exit.store(false, Ordering::Release);
        self.discard_requested.store(false, Ordering::Release);
        self.has_captured_exceptions.store(false, Ordering::Release);
        self.child_durations.reset();
        let buffered = lock(&self.buffered_span).take();
        drop(buffered);
    }
}

impl fmt::Debug for SpanCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanCore")
            .field("name", &lock(&self.info).name)
            .field("trace_context", &*self.trace_context())
            .field("references", &self.reference_count())
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Either a [`Transaction`] or a [`Span`].
#[derive(Clone, Debug)]
pub enum AbstractSpan {
    /// A transaction.
    Transaction(Transaction),
    /// A span.
    Span(Span),
}

impl AbstractSpan {
    /// The transaction this span belongs to, the transaction itself for transactions.
    pub fn transaction(&self) -> Option<Transaction> {
        match self {
            AbstractSpan::Transaction(transaction) => Some(transaction.clone()),
            AbstractSpan::Span(span) => span.transaction(),
        }
    }

    /// Returns the span, `None` for transactions.
    pub fn as_span(&self) -> Option<&Span> {
        match self {
            AbstractSpan::Span(span) => Some(span),
            AbstractSpan::Transaction(_) => None,
        }
    }

    /// Returns the transaction, `None` for spans.
    pub fn as_transaction(&self) -> Option<&Transaction> {
        match self {
            AbstractSpan::Transaction(transaction) => Some(transaction),
            AbstractSpan::Span(_) => None,
        }
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &AbstractSpan) -> bool {
        match (self, other) {
            (AbstractSpan::Transaction(a), AbstractSpan::Transaction(b)) => a.ptr_eq(b),
            (AbstractSpan::Span(a), AbstractSpan::Span(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Takes a reference, see the module documentation.
    pub fn increment_references(&self) {
        match self {
            AbstractSpan::Transaction(transaction) => transaction.increment_references(),
            AbstractSpan::Span(span) => span.increment_references(),
        }
    }

    /// Releases a reference, recycling the instance when it was the last one.
    pub fn decrement_references(&self) {
        match self {
            AbstractSpan::Transaction(transaction) => transaction.decrement_references(),
            AbstractSpan::Span(span) => span.decrement_references(),
        }
    }

    /// Starts a child span now.
    pub fn create_span(&self) -> Span {
        self.create_span_with(None, self.baggage())
    }

    /// Starts a child span at `epoch_micros`.
    pub fn create_span_at(&self, epoch_micros: i64) -> Span {
        self.create_span_with(Some(epoch_micros), self.baggage())
    }

    /// Starts a child span carrying `baggage` instead of the baggage of this span.
    ///
    /// Children of unsampled transactions are non-recording spans that skip the pool and
    /// the span count of the transaction.
    pub fn create_span_with(&self, epoch_micros: Option<i64>, baggage: Baggage) -> Span {
        let sampled = self.transaction().is_some_and(|transaction| transaction.is_sampled());
        match self.tracer() {
            Some(tracer) if sampled => tracer.start_span(self, baggage, epoch_micros),
            _ => Span::detached(self, baggage, epoch_micros),
        }
    }

    /// Starts a child exit span.
    ///
    /// Exit spans don't have exit span children, `None` tells the caller to skip
    /// instrumenting the nested call.
    pub fn create_exit_span(&self) -> Option<Span> {
        if self.is_exit() {
            return None;
        }
        let span = self.create_span();
        span.as_exit();
        Some(span)
    }

    /// Ends the transaction or span now.
    pub fn end(&self) {
        match self {
            AbstractSpan::Transaction(transaction) => transaction.end(),
            AbstractSpan::Span(span) => span.end(),
        }
    }

    /// Ends the transaction or span at `epoch_micros`.
    pub fn end_at(&self, epoch_micros: i64) {
        match self {
            AbstractSpan::Transaction(transaction) => transaction.end_at(epoch_micros),
            AbstractSpan::Span(span) => span.end_at(epoch_micros),
        }
    }

    /// Reports an error that happened within this span and returns the id of the error.
    pub fn capture_exception(&self, error: &(dyn Error + 'static)) -> Option<SpanId> {
        let now = self.epoch_micros();
        self.capture_exception_at(now, error)
    }

    /// Reports an error that happened at `epoch_micros` within this span.
    pub fn capture_exception_at(&self, epoch_micros: i64, error: &(dyn Error + 'static)) -> Option<SpanId> {
        self.mark_captured_exception();
        let tracer = self.tracer()?;
        Some(tracer.capture_exception(self, epoch_micros, error))
    }
}

impl Deref for AbstractSpan {
    type Target = SpanCore;

    fn deref(&self) -> &SpanCore {
        match self {
            AbstractSpan::Transaction(transaction) => &**transaction,
            AbstractSpan::Span(span) => &**span,
        }
    }
}

impl From<Transaction> for AbstractSpan {
    fn from(transaction: Transaction) -> Self {
        AbstractSpan::Transaction(transaction)
    }
}

impl From<Span> for AbstractSpan {
    fn from(span: Span) -> Self {
        AbstractSpan::Span(span)
    }
}

impl From<&Transaction> for AbstractSpan {
    fn from(transaction: &Transaction) -> Self {
        AbstractSpan::Transaction(transaction.clone())
    }
}

impl From<&Span> for AbstractSpan {
    fn from(span: &Span) -> Self {
        AbstractSpan::Span(span.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::InMemoryReporter;
    use crate::trace::{ConstantSampler, Tracer};
    use crate::Config;

    fn tracer(config: Config) -> (Tracer, InMemoryReporter) {
        let reporter = InMemoryReporter::default();
        let tracer = Tracer::builder()
            .with_config(config)
            .with_reporter(reporter.clone())
            .with_sampler(ConstantSampler::always_on())
            .build();
        (tracer, reporter)
    }

    #[test]
    fn child_duration_timer_merges_overlapping_children() {
        let timer = ChildDurationTimer::default();
        timer.on_child_start(10);
        timer.on_child_start(15);
        timer.on_child_end(20);
        timer.on_child_end(30);
        timer.on_child_start(40);
        timer.on_span_end(45);
        assert_eq!(timer.duration(), 25);
    }

    #[test]
    fn name_priorities() {
        let (tracer, _) = tracer(Config::builtin());
        let transaction = tracer.start_root_transaction(None);
        assert_eq!(transaction.name(), "unnamed");
        assert!(transaction.set_name("GET /users", PRIORITY_LOW_LEVEL_FRAMEWORK));
        assert!(!transaction.set_name("servlet", PRIORITY_DEFAULT));
        assert!(transaction.set_name("UserController#list", PRIORITY_HIGH_LEVEL_FRAMEWORK));
        assert!(!transaction.set_name("", PRIORITY_USER_SUPPLIED));
        assert_eq!(transaction.name(), "UserController#list");
        assert!(!transaction.append_to_name("?", PRIORITY_DEFAULT));
        assert!(transaction.append_to_name("!", PRIORITY_USER_SUPPLIED));
        assert_eq!(transaction.name(), "UserController#list!");
        transaction.end();
    }

    #[test]
    fn user_outcome_wins() {
        let (tracer, reporter) = tracer(Config::builtin());
        let transaction = tracer.start_root_transaction(None);
        assert_eq!(transaction.outcome(), Outcome::Unknown);
        transaction.set_user_outcome(Outcome::Success);
        transaction.set_outcome(Outcome::Failure);
        assert_eq!(transaction.outcome(), Outcome::Success);
        transaction.end();
        assert_eq!(reporter.transactions()[0].outcome, Outcome::Success);
    }

    #[test]
    fn outcome_is_inferred_from_captured_exceptions() {
        let (tracer, reporter) = tracer(Config::builtin());
        let transaction = tracer.start_root_transaction(None);
        let failing = transaction.create_span();
        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(failing.capture_exception(&error).is_some());
        failing.end();
        let ok = transaction.create_span();
        ok.end();
        transaction.end();

        let spans = reporter.spans();
        assert_eq!(spans[0].outcome, Outcome::Failure);
        assert_eq!(spans[1].outcome, Outcome::Success);
        assert_eq!(reporter.transactions()[0].outcome, Outcome::Success);
    }

    #[test]
    fn end_before_start_is_clamped() {
        let (tracer, reporter) = tracer(Config::builtin().with_assertions_enabled(false));
        let transaction = tracer.start_root_transaction_at(None, 1_000);
        transaction.end_at(500);
        assert_eq!(reporter.transactions()[0].duration, 0);
    }

    #[test]
    fn duplicate_end_is_ignored_without_assertions() {
        let (tracer, reporter) = tracer(Config::builtin().with_assertions_enabled(false));
        let transaction = tracer.start_root_transaction_at(None, 1_000);
        transaction.increment_references();
        transaction.end_at(2_000);
        transaction.end_at(3_000);
        assert_eq!(reporter.transactions().len(), 1);
        assert_eq!(transaction.end_timestamp(), 2_000);
        transaction.decrement_references();
    }

    #[test]
    #[should_panic(expected = "end has already been called")]
    fn duplicate_end_panics_with_assertions() {
        let (tracer, _) = tracer(Config::builtin().with_assertions_enabled(true));
        let transaction = tracer.start_root_transaction(None);
        transaction.increment_references();
        transaction.end();
        transaction.end();
    }

    #[test]
    fn exit_spans_have_no_exit_children() {
        let (tracer, _) = tracer(Config::builtin());
        let transaction = AbstractSpan::from(tracer.start_root_transaction(None));
        let exit = match transaction.create_exit_span() {
            Some(exit) => exit,
            None => panic!("transaction is no exit span"),
        };
        assert!(exit.is_exit());
        assert!(AbstractSpan::from(&exit).create_exit_span().is_none());
        exit.end();
        transaction.end();
    }

    #[test]
    fn span_links_are_unique_and_bounded() {
        let (tracer, _) = tracer(Config::builtin());
        let transaction = tracer.start_root_transaction(None);
        let mut linked = transaction.trace_context().empty_like();
        linked.as_root(&ConstantSampler::always_on());
        assert!(transaction.add_span_link_to(&linked));
        assert!(!transaction.add_span_link_to(&linked));
        for i in 1..MAX_SPAN_LINKS as u64 {
            let mut headers = std::collections::HashMap::new();
            headers.insert(
                "traceparent".to_string(),
                format!("00-0af7651916cd43dd8448eb211c80319c-{:016x}-01", i),
            );
            assert!(transaction.add_span_link(&headers, &crate::propagation::MapHeaders));
        }
        assert_eq!(transaction.span_links().len(), MAX_SPAN_LINKS);
        let mut headers = std::collections::HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01".to_string(),
        );
        assert!(!transaction.add_span_link(&headers, &crate::propagation::MapHeaders));
        transaction.end();
    }
}
