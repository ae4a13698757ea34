//! Reporter sink
//!
//! The tracer hands every ended transaction, every kept span and every captured error to a
//! [`Reporter`]. Serialization and transport are the reporter's concern. A reporter that
//! needs an entity after `report_*` returns takes a reference with
//! `increment_references` and releases it when done; otherwise the entity may be recycled
//! as soon as the call returns.
use crate::propagation::Baggage;
use crate::trace::{
    Composite, DroppedSpanStat, ErrorCapture, ExceptionInfo, Outcome, SelfTime, ServiceTarget, Span, SpanCountSnapshot,
    SpanId, SpanLink, TraceId, Transaction, TransactionInfo,
};
use std::fmt::Debug;

mod in_memory;

pub use in_memory::InMemoryReporter;

/// Receives completed trace entities.
///
/// Calls are synchronous and happen on the thread that ended the entity, implementations
/// must not block.
pub trait Reporter: Send + Sync + Debug {
    /// Reports an ended transaction, sampled or not.
    fn report_transaction(&self, transaction: &Transaction);

    /// Reports an ended span.
    fn report_span(&self, span: &Span);

    /// Reports a captured error.
    fn report_error(&self, error: &ErrorCapture);
}

/// Reporter dropping everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report_transaction(&self, _transaction: &Transaction) {}

    fn report_span(&self, _span: &Span) {}

    fn report_error(&self, _error: &ErrorCapture) {}
}

/// Snapshot of an ended transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionData {
    /// Trace id
    pub trace_id: TraceId,
    /// Transaction id
    pub id: SpanId,
    /// Id of the remote parent, empty for root transactions.
    pub parent_id: SpanId,
    /// Name
    pub name: String,
    /// Type, `custom` if none was set.
    pub transaction_type: String,
    /// Result, e.g. `HTTP 2xx`.
    pub result: Option<String>,
    /// Outcome
    pub outcome: Outcome,
    /// Start in epoch microseconds.
    pub timestamp: i64,
    /// Duration in microseconds.
    pub duration: i64,
    /// Whether spans and context were recorded.
    pub sampled: bool,
    /// Sample rate advertised in the `tracestate`.
    pub sample_rate: Option<f64>,
    /// Span counters.
    pub span_count: SpanCountSnapshot,
    /// Dropped exit spans per service target.
    pub dropped_span_stats: Vec<DroppedSpanStat>,
    /// Self time per span type.
    pub breakdown: Vec<SelfTime>,
    /// Links to other traces.
    pub span_links: Vec<SpanLink>,
    /// Baggage
    pub baggage: Baggage,
}

impl From<&Transaction> for TransactionData {
    fn from(transaction: &Transaction) -> Self {
        let (trace_id, id, parent_id, sampled, sample_rate) = {
            let trace_context = transaction.trace_context();
            (
                trace_context.trace_id(),
                trace_context.id(),
                trace_context.parent_id(),
                trace_context.is_sampled(),
                trace_context.sample_rate(),
            )
        };
        TransactionData {
            trace_id,
            id,
            parent_id,
            name: transaction.name(),
            transaction_type: transaction.span_type().unwrap_or_default(),
            result: transaction.result(),
            outcome: transaction.outcome(),
            timestamp: transaction.timestamp(),
            duration: transaction.duration(),
            sampled,
            sample_rate,
            span_count: transaction.span_count().snapshot(),
            dropped_span_stats: transaction.dropped_span_stats(),
            breakdown: transaction.breakdown(),
            span_links: transaction.span_links(),
            baggage: transaction.baggage(),
        }
    }
}

/// Snapshot of a reported span.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Trace id
    pub trace_id: TraceId,
    /// Span id
    pub id: SpanId,
    /// Id of the parent span or transaction.
    pub parent_id: SpanId,
    /// Id of the transaction.
    pub transaction_id: SpanId,
    /// Name, renamed after the service target for same kind composites.
    pub name: String,
    /// Type, `custom` if none was set.
    pub span_type: String,
    /// Subtype
    pub subtype: Option<String>,
    /// Action
    pub action: Option<String>,
    /// Outcome
    pub outcome: Outcome,
    /// Start in epoch microseconds.
    pub timestamp: i64,
    /// Duration in microseconds, covering all members of a composite.
    pub duration: i64,
    /// Whether the span calls an external service.
    pub exit: bool,
    /// Service the span calls.
    pub service_target: ServiceTarget,
    /// Set if siblings were compressed into this span.
    pub composite: Option<Composite>,
    /// Links to other traces.
    pub span_links: Vec<SpanLink>,
}

impl From<&Span> for SpanData {
    fn from(span: &Span) -> Self {
        let (trace_id, id, parent_id, transaction_id) = {
            let trace_context = span.trace_context();
            (
                trace_context.trace_id(),
                trace_context.id(),
                trace_context.parent_id(),
                trace_context.transaction_id(),
            )
        };
        let composite = span.composite();
        SpanData {
            trace_id,
            id,
            parent_id,
            transaction_id,
            name: span.name(),
            span_type: span.span_type().unwrap_or_default(),
            subtype: span.subtype(),
            action: span.action(),
            outcome: span.outcome(),
            timestamp: span.timestamp(),
            duration: span.duration(),
            exit: span.is_exit(),
            service_target: span.service_target(),
            composite: composite.is_composite().then_some(composite),
            span_links: span.span_links(),
        }
    }
}

/// Snapshot of a captured error.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorData {
    /// Error id
    pub id: SpanId,
    /// Trace id
    pub trace_id: TraceId,
    /// Id of the span the error happened in.
    pub parent_id: SpanId,
    /// Id of the transaction the error happened in.
    pub transaction_id: SpanId,
    /// Time of the error in epoch microseconds.
    pub timestamp: i64,
    /// The error and its causes.
    pub exception: ExceptionInfo,
    /// The transaction the error happened in.
    pub transaction: TransactionInfo,
}

impl From<&ErrorCapture> for ErrorData {
    fn from(error: &ErrorCapture) -> Self {
        let (id, trace_id, parent_id, transaction_id) = {
            let trace_context = error.trace_context();
            (
                trace_context.id(),
                trace_context.trace_id(),
                trace_context.parent_id(),
                trace_context.transaction_id(),
            )
        };
        ErrorData {
            id,
            trace_id,
            parent_id,
            transaction_id,
            timestamp: error.timestamp(),
            exception: error.exception(),
            transaction: error.transaction(),
        }
    }
}
