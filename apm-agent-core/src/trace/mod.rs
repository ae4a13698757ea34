//! # Trace
//!
//! Distributed tracing core: trace context propagation, sampling, the lifecycle of pooled
//! transactions and spans, span compression and the [`Tracer`] coordinating them.
//!
//! A [`Tracer`] starts [`Transaction`]s, either as the root of a new trace or continuing a
//! trace found in incoming headers. Transactions and spans create child spans. Ended
//! entities are handed to the configured [`Reporter`](crate::report::Reporter) and
//! recycled once every holder released its reference.
//!
//! ```
//! use apm_agent_core::report::InMemoryReporter;
//! use apm_agent_core::trace::{ActiveStack, ConstantSampler, Tracer};
//!
//! let reporter = InMemoryReporter::default();
//! let tracer = Tracer::builder()
//!     .with_reporter(reporter.clone())
//!     .with_sampler(ConstantSampler::always_on())
//!     .build();
//!
//! let mut stack = ActiveStack::new(&tracer);
//! let transaction = stack.start_root_transaction(None);
//! if let Some(query) = stack.active().and_then(|active| active.create_exit_span()) {
//!     query.set_type_subtype_action("db", "postgresql", "query");
//!     query.end();
//! }
//! stack.deactivate(&transaction.clone().into());
//! transaction.end();
//!
//! assert_eq!(reporter.spans()[0].service_target.target_type.as_deref(), Some("postgresql"));
//! ```
mod abstract_span;
mod active_stack;
mod breakdown;
mod compression;
mod dropped_span_stats;
mod error_capture;
mod id;
mod id_generator;
mod sampler;
mod span;
mod trace_context;
mod trace_state;
mod tracer;
mod transaction;

pub use abstract_span::{
    AbstractSpan, Outcome, SpanCore, SpanLink, MAX_SPAN_LINKS, PRIORITY_DEFAULT, PRIORITY_HIGH_LEVEL_FRAMEWORK,
    PRIORITY_LOW_LEVEL_FRAMEWORK, PRIORITY_METHOD_SIGNATURE, PRIORITY_USER_SUPPLIED,
};
pub use active_stack::{ActivationScope, ActiveStack};
pub use breakdown::SelfTime;
pub use compression::{Composite, CompressionStrategy};
pub use dropped_span_stats::{DroppedSpanStat, MAX_DROPPED_SPAN_STATS};
pub use error_capture::{ErrorCapture, ExceptionInfo, TransactionInfo};
pub use id::{SpanId, TraceFlags, TraceId};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use sampler::{ConstantSampler, ProbabilitySampler, Sampler};
pub use span::{ServiceTarget, Span};
pub use trace_context::{
    parse_binary_header, parse_text_header, TraceContext, TraceParent, BINARY_HEADER_LENGTH, SERIALIZED_LENGTH,
};
pub use trace_state::{round_sample_rate, TraceState};
pub use tracer::{Tracer, TracerBuilder, TracerPoolStats};
pub use transaction::{SpanCount, SpanCountSnapshot, Transaction};
