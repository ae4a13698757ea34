use crate::report::{ErrorData, Reporter, SpanData, TransactionData};
use crate::trace::{ErrorCapture, Span, Transaction};
use std::sync::{Arc, Mutex, PoisonError};

/// A reporter that keeps snapshots of everything reported in memory.
///
/// Useful for tests and debugging. Clones share the same storage.
///
/// # Example
/// ```
/// use apm_agent_core::report::InMemoryReporter;
/// use apm_agent_core::trace::{ConstantSampler, Tracer};
///
/// let reporter = InMemoryReporter::default();
/// let tracer = Tracer::builder()
///     .with_reporter(reporter.clone())
///     .with_sampler(ConstantSampler::always_on())
///     .build();
///
/// let transaction = tracer.start_root_transaction(None);
/// transaction.create_span().end();
/// transaction.end();
///
/// assert_eq!(reporter.transactions().len(), 1);
/// assert_eq!(reporter.spans().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporter {
    transactions: Arc<Mutex<Vec<TransactionData>>>,
    spans: Arc<Mutex<Vec<SpanData>>>,
    errors: Arc<Mutex<Vec<ErrorData>>>,
}

impl InMemoryReporter {
    /// Reported transactions, in reporting order.
    pub fn transactions(&self) -> Vec<TransactionData> {
        snapshot(&self.transactions)
    }

    /// Reported spans, in reporting order.
    pub fn spans(&self) -> Vec<SpanData> {
        snapshot(&self.spans)
    }

    /// Reported errors, in reporting order.
    pub fn errors(&self) -> Vec<ErrorData> {
        snapshot(&self.errors)
    }

    /// Clears the internal storage.
    pub fn reset(&self) {
        clear(&self.transactions);
        clear(&self.spans);
        clear(&self.errors);
    }
}

fn snapshot<T: Clone>(storage: &Mutex<Vec<T>>) -> Vec<T> {
    storage.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn clear<T>(storage: &Mutex<Vec<T>>) {
    storage.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

fn push<T>(storage: &Mutex<Vec<T>>, data: T) {
    storage.lock().unwrap_or_else(PoisonError::into_inner).push(data);
}

impl Reporter for InMemoryReporter {
    fn report_transaction(&self, transaction: &Transaction) {
        push(&self.transactions, TransactionData::from(transaction));
    }

    fn report_span(&self, span: &Span) {
        push(&self.spans, SpanData::from(span));
    }

    fn report_error(&self, error: &ErrorCapture) {
        push(&self.errors, ErrorData::from(error));
    }
}
