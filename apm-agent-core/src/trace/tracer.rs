//! # Tracer
//!
//! The [`Tracer`] starts transactions, hands out pooled spans and errors, and decides on
//! `end()` whether a span is reported, dropped or buffered for compression. It is an
//! explicitly constructed handle: clone it into every component that needs to trace.
//!
//! Pooled entities only hold a weak reference to their tracer. Once the last `Tracer`
//! handle is dropped, entities still in flight end without being reported and new child
//! spans are detached, unsampled and never pooled.
use crate::config::Config;
use crate::pool::{ObjectPool, PoolStats, Recyclable};
use crate::propagation::{Baggage, HeaderGetter, TextValue};
use crate::report::{NoopReporter, Reporter};
use crate::trace::abstract_span::AbstractSpan;
use crate::trace::error_capture::ErrorCapture;
use crate::trace::{sampler, IdGenerator, RandomIdGenerator, Sampler, Span, SpanId, TraceContext, Transaction};
use crate::{apm_debug, apm_info, apm_warn, clock};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};

pub(crate) struct TracerInner {
    config: Arc<Config>,
    reporter: Box<dyn Reporter>,
    sampler: Box<dyn Sampler>,
    transactions: ObjectPool<Transaction>,
    spans: ObjectPool<Span>,
    errors: ObjectPool<ErrorCapture>,
}

impl fmt::Debug for TracerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.config)
            .field("reporter", &self.reporter)
            .field("sampler", &self.sampler)
            .finish()
    }
}

/// Pool counters of a tracer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TracerPoolStats {
    /// Transaction pool
    pub transactions: PoolStats,
    /// Span pool
    pub spans: PoolStats,
    /// Error pool
    pub errors: PoolStats,
}

/// Entry point for creating transactions.
///
/// Cheap to clone, all clones share configuration, reporter and pools.
#[derive(Clone, Debug)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer::builder().build()
    }
}

impl Tracer {
    /// Create a new [`Tracer`] builder.
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<TracerInner>) -> Self {
        Tracer { inner }
    }

    /// Configuration of this tracer.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current counters of the object pools.
    pub fn pool_stats(&self) -> TracerPoolStats {
        TracerPoolStats {
            transactions: self.inner.transactions.stats(),
            spans: self.inner.spans.stats(),
            errors: self.inner.errors.stats(),
        }
    }

    fn sampler<'a>(&'a self, sampler: Option<&'a dyn Sampler>) -> &'a dyn Sampler {
        sampler.unwrap_or(self.inner.sampler.as_ref())
    }

    /// Starts a transaction that begins a new trace.
    ///
    /// `sampler` overrides the sampler of the tracer for this transaction.
    pub fn start_root_transaction(&self, sampler: Option<&dyn Sampler>) -> Transaction {
        self.start_root_transaction_with(sampler, None, Baggage::empty())
    }

    /// Starts a transaction that begins a new trace at `epoch_micros`.
    pub fn start_root_transaction_at(&self, sampler: Option<&dyn Sampler>, epoch_micros: i64) -> Transaction {
        self.start_root_transaction_with(sampler, Some(epoch_micros), Baggage::empty())
    }

    /// Starts a transaction that begins a new trace and carries `baggage`.
    pub fn start_root_transaction_with(
        &self,
        sampler: Option<&dyn Sampler>,
        epoch_micros: Option<i64>,
        baggage: Baggage,
    ) -> Transaction {
        let transaction = acquire(&self.inner.transactions);
        transaction.start_root(self.sampler(sampler), epoch_micros, baggage);
        transaction
    }

    /// Starts a transaction continuing the trace found in the text headers of a carrier.
    ///
    /// Falls back to a new trace if the carrier holds no valid `traceparent`. How an
    /// incoming trace is continued depends on the configured
    /// [`TraceContinuationStrategy`](crate::config::TraceContinuationStrategy). Incoming
    /// `baggage` headers are parsed as well.
    pub fn start_child_transaction<T, C>(
        &self,
        carrier: &C,
        getter: &impl HeaderGetter<T, C>,
        sampler: Option<&dyn Sampler>,
    ) -> Transaction
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        self.start_child_transaction_with(carrier, getter, sampler, None)
    }

    /// Same as [`Tracer::start_child_transaction`], starting at `epoch_micros`.
    pub fn start_child_transaction_at<T, C>(
        &self,
        carrier: &C,
        getter: &impl HeaderGetter<T, C>,
        sampler: Option<&dyn Sampler>,
        epoch_micros: i64,
    ) -> Transaction
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        self.start_child_transaction_with(carrier, getter, sampler, Some(epoch_micros))
    }

    fn start_child_transaction_with<T, C>(
        &self,
        carrier: &C,
        getter: &impl HeaderGetter<T, C>,
        sampler: Option<&dyn Sampler>,
        epoch_micros: Option<i64>,
    ) -> Transaction
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        let baggage = Baggage::builder().with_headers(carrier, getter).build();
        let transaction = acquire(&self.inner.transactions);
        transaction.start_from_headers(carrier, getter, self.sampler(sampler), epoch_micros, baggage);
        transaction
    }

    /// Starts a transaction continuing the trace found in the binary headers of a carrier.
    pub fn start_child_transaction_from_binary<C: ?Sized>(
        &self,
        carrier: &C,
        getter: &impl HeaderGetter<[u8], C>,
        sampler: Option<&dyn Sampler>,
    ) -> Transaction {
        let baggage = Baggage::builder().with_headers(carrier, getter).build();
        let transaction = acquire(&self.inner.transactions);
        transaction.start_from_binary_headers(carrier, getter, self.sampler(sampler), None, baggage);
        transaction
    }

    /// A transaction that is never reported.
    ///
    /// Used where a transaction is required but nothing should be recorded.
    pub fn noop_transaction(&self) -> Transaction {
        let transaction = acquire(&self.inner.transactions);
        transaction.start_noop();
        transaction
    }

    pub(crate) fn start_span(&self, parent: &AbstractSpan, baggage: Baggage, epoch_micros: Option<i64>) -> Span {
        let span = acquire(&self.inner.spans);
        span.start(parent, baggage, epoch_micros);
        span
    }

    /// Reports the ended transaction and releases the reference taken on start.
    pub(crate) fn end_transaction(&self, transaction: &Transaction) {
        apm_debug!(
            name: "Tracer.EndTransaction",
            transaction = transaction.id(),
            duration = transaction.duration(),
        );
        if !transaction.is_noop() {
            self.inner.reporter.report_transaction(transaction);
        }
        transaction.decrement_references();
    }

    /// Reports or drops an ended span and releases the reference taken on start.
    pub(crate) fn end_span(&self, span: &Span) {
        let transaction = span.transaction();
        if !span.is_sampled() {
            if let Some(transaction) = &transaction {
                transaction.capture_dropped_span(span);
            }
            span.decrement_references();
            return;
        }

        let duration = span.duration();
        let config = &self.inner.config;
        if span.is_exit() {
            if duration < clock::duration_micros(config.exit_span_min_duration) {
                apm_debug!(name: "Tracer.ExitSpanBelowMinDuration", span = span.id(), duration = duration);
                span.request_discarding();
            }
        } else if !span.is_composite() && duration < clock::duration_micros(config.span_min_duration) {
            apm_debug!(name: "Tracer.SpanBelowMinDuration", span = span.id(), duration = duration);
            span.request_discarding();
        }

        if span.is_discarded() {
            apm_debug!(name: "Tracer.DiscardSpan", span = span.id());
            if let Some(transaction) = &transaction {
                transaction.capture_dropped_span(span);
            }
            span.decrement_references();
            return;
        }

        if span.parent().is_some_and(|parent| parent.is_discarded()) {
            apm_warn!(
                name: "Tracer.ReportChildOfDiscardedSpan",
                message = "Reporting a child of a discarded span, consider increasing span_min_duration",
                span = span.id(),
            );
        }
        if let Some(transaction) = &transaction {
            transaction.span_count().increment_reported();
        }
        span.set_non_discardable();
        self.inner.reporter.report_span(span);
        span.decrement_references();
    }

    pub(crate) fn capture_exception(
        &self,
        parent: &AbstractSpan,
        epoch_micros: i64,
        error: &(dyn Error + 'static),
    ) -> SpanId {
        let capture = acquire(&self.inner.errors);
        capture.start(parent, epoch_micros, error);
        let id = capture.id();
        self.inner.reporter.report_error(&capture);
        capture.decrement_references();
        id
    }

    pub(crate) fn recycle_transaction(&self, transaction: Transaction) {
        self.inner.transactions.recycle(transaction);
    }

    pub(crate) fn recycle_span(&self, span: Span) {
        self.inner.spans.recycle(span);
    }

    pub(crate) fn recycle_error(&self, error: ErrorCapture) {
        self.inner.errors.recycle(error);
    }
}

/// Takes an unreferenced instance from `pool`.
///
/// Instances still referenced through a stale handle are left to that handle.
fn acquire<T: Recyclable + fmt::Debug>(pool: &ObjectPool<T>) -> T {
    loop {
        let instance = pool.acquire();
        if instance.reference_count() == 0 {
            return instance;
        }
        apm_warn!(
            name: "Tracer.PooledInstanceReferenced",
            message = "Skipping a pooled instance that is still referenced",
            instance = format!("{instance:?}"),
        );
    }
}

/// Builder for [`Tracer`].
#[derive(Debug, Default)]
pub struct TracerBuilder {
    config: Option<Config>,
    reporter: Option<Box<dyn Reporter>>,
    sampler: Option<Box<dyn Sampler>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl TracerBuilder {
    /// The configuration snapshot, [`Config::default`] if not set.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// The sink for ended transactions, spans and errors. Nothing is reported by default.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    /// The sampler for root transactions, derived from the configured sample rate if not set.
    pub fn with_sampler<S: Sampler + 'static>(mut self, sampler: S) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// The generator of trace and span ids.
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Some(Arc::new(id_generator));
        self
    }

    /// Create a new tracer from this configuration.
    pub fn build(self) -> Tracer {
        let config = Arc::new(self.config.unwrap_or_default());
        let sampler = self
            .sampler
            .unwrap_or_else(|| sampler::from_rate(config.sample_rate));
        let reporter = self.reporter.unwrap_or_else(|| Box::new(NoopReporter));
        let id_generator: Arc<dyn IdGenerator> = self
            .id_generator
            .unwrap_or_else(|| Arc::new(RandomIdGenerator::default()));
        let capacity = config.object_pool_capacity;

        apm_info!(
            name: "Tracer.Build",
            sample_rate = config.sample_rate,
            max_spans = config.transaction_max_spans,
            span_compression = config.span_compression_enabled,
            trace_continuation_strategy = config.trace_continuation_strategy,
        );

        let inner = Arc::new_cyclic(|tracer: &Weak<TracerInner>| {
            let context = {
                let config = config.clone();
                let id_generator = id_generator.clone();
                move || TraceContext::new(config.clone(), id_generator.clone())
            };
            let transactions = {
                let (tracer, context) = (tracer.clone(), context.clone());
                ObjectPool::new("transactions", capacity, move || Transaction::new(tracer.clone(), context()))
            };
            let spans = {
                let (tracer, context) = (tracer.clone(), context.clone());
                ObjectPool::new("spans", capacity, move || Span::new(tracer.clone(), context()))
            };
            let errors = {
                let tracer = tracer.clone();
                ObjectPool::new("errors", capacity, move || ErrorCapture::new(tracer.clone(), context()))
            };
            TracerInner {
                config,
                reporter,
                sampler,
                transactions,
                spans,
                errors,
            }
        });
        Tracer { inner }
    }
}
