//! Errors captured within a transaction or span.
use crate::pool::Recyclable;
use crate::propagation::Baggage;
use crate::trace::abstract_span::{lock, non_empty, AbstractSpan};
use crate::trace::tracer::{Tracer, TracerInner};
use crate::trace::{SpanId, TraceContext, TraceId};
use crate::{apm_debug, apm_error};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Message of an error and of the errors that caused it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// `Display` output of the error.
    pub message: String,
    /// `Display` output of each [`Error::source`], outermost first.
    pub causes: Vec<String>,
}

impl ExceptionInfo {
    /// Captures `error` and its chain of sources.
    pub fn new(error: &(dyn Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        ExceptionInfo {
            message: error.to_string(),
            causes,
        }
    }
}

/// Transaction an error happened in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Name of the transaction, `None` if unnamed.
    pub name: Option<String>,
    /// Type of the transaction.
    pub transaction_type: Option<String>,
    /// Whether the transaction is sampled.
    pub sampled: bool,
}

#[derive(Debug, Default)]
struct ErrorDetails {
    exception: ExceptionInfo,
    transaction: TransactionInfo,
    baggage: Baggage,
}

pub(crate) struct ErrorInner {
    tracer: Weak<TracerInner>,
    trace_context: Mutex<TraceContext>,
    details: Mutex<ErrorDetails>,
    timestamp: AtomicI64,
    references: AtomicI64,
}

/// A pooled error event, linked to the span it happened in.
#[derive(Clone)]
pub struct ErrorCapture(Arc<ErrorInner>);

impl ErrorCapture {
    pub(crate) fn new(tracer: Weak<TracerInner>, trace_context: TraceContext) -> Self {
        ErrorCapture(Arc::new(ErrorInner {
            tracer,
            trace_context: Mutex::new(trace_context),
            details: Mutex::new(ErrorDetails::default()),
            timestamp: AtomicI64::new(0),
            references: AtomicI64::new(0),
        }))
    }

    /// Makes this error a child of `parent`.
    ///
    /// The parent and its ancestors become non-discardable so that the error never points
    /// to a span that was not reported.
    pub(crate) fn start(&self, parent: &AbstractSpan, epoch_micros: i64, error: &(dyn Error + 'static)) {
        self.0.timestamp.store(epoch_micros, Ordering::Release);
        {
            let parent_context = parent.trace_context();
            self.trace_context().as_child_of(&parent_context);
        }
        parent.set_non_discardable();

        let transaction = parent.transaction().map(|transaction| TransactionInfo {
            name: non_empty(&transaction.raw_name()),
            transaction_type: transaction.span_type(),
            sampled: transaction.is_sampled(),
        });
        {
            let mut details = lock(&self.0.details);
            details.exception = ExceptionInfo::new(error);
            details.transaction = transaction.unwrap_or_default();
            details.baggage = parent.baggage();
        }
        self.increment_references();
        apm_debug!(name: "Error.Capture", error = self.id(), parent = parent.id());
    }

    /// Locks and returns the trace context.
    pub fn trace_context(&self) -> MutexGuard<'_, TraceContext> {
        lock(&self.0.trace_context)
    }

    /// Random id of this error.
    pub fn id(&self) -> SpanId {
        self.trace_context().id()
    }

    /// Trace of the span the error happened in.
    pub fn trace_id(&self) -> TraceId {
        self.trace_context().trace_id()
    }

    /// Id of the span the error happened in.
    pub fn parent_id(&self) -> SpanId {
        self.trace_context().parent_id()
    }

    /// Id of the transaction the error happened in.
    pub fn transaction_id(&self) -> SpanId {
        self.trace_context().transaction_id()
    }

    /// Time of the error in epoch microseconds.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp.load(Ordering::Acquire)
    }

    /// The captured error.
    pub fn exception(&self) -> ExceptionInfo {
        lock(&self.0.details).exception.clone()
    }

    /// The transaction the error happened in.
    pub fn transaction(&self) -> TransactionInfo {
        lock(&self.0.details).transaction.clone()
    }

    /// Baggage of the parent span.
    pub fn baggage(&self) -> Baggage {
        lock(&self.0.details).baggage.clone()
    }

    /// Takes a reference.
    pub fn increment_references(&self) {
        self.0.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a reference, recycling the error when it was the last one.
    pub fn decrement_references(&self) {
        let remaining = self.0.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            self.0.references.fetch_add(1, Ordering::AcqRel);
            apm_error!(name: "Error.NegativeReferenceCount", error = self.id());
        } else if remaining == 0 {
            if let Some(tracer) = self.0.tracer.upgrade().map(Tracer::from_inner) {
                tracer.recycle_error(self.clone());
            }
        }
    }
}

impl Recyclable for ErrorCapture {
    fn reference_count(&self) -> i64 {
        self.0.references.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.trace_context().reset();
        *lock(&self.0.details) = ErrorDetails::default();
        self.0.timestamp.store(0, Ordering::Release);
    }
}

impl fmt::Debug for ErrorCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCapture")
            .field("id", &self.id())
            .field("message", &lock(&self.0.details).exception.message)
            .finish()
    }
}
