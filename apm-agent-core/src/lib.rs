//! # APM agent core
//!
//! The distributed tracing engine of an application performance monitoring agent. It
//! propagates W3C trace context and baggage through arbitrary header carriers, samples
//! traces, manages the lifecycle of pooled transactions and spans, compresses sibling exit
//! spans and hands everything that should be kept to a [`Reporter`].
//!
//! Deciding what to instrument, serializing events and shipping them to a collector are
//! the concern of the code around this crate.
//!
//! ## Getting started
//!
//! ```
//! use apm_agent_core::propagation::{MapHeaders, TRACE_PARENT_HEADER_NAME};
//! use apm_agent_core::report::InMemoryReporter;
//! use apm_agent_core::trace::{Outcome, Tracer};
//! use apm_agent_core::Config;
//! use std::collections::HashMap;
//!
//! let reporter = InMemoryReporter::default();
//! let tracer = Tracer::builder()
//!     .with_config(Config::builtin())
//!     .with_reporter(reporter.clone())
//!     .build();
//!
//! let mut incoming = HashMap::new();
//! incoming.insert(
//!     TRACE_PARENT_HEADER_NAME.to_string(),
//!     "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
//! );
//! let transaction = tracer.start_child_transaction(&incoming, &MapHeaders, None);
//! transaction.set_outcome(Outcome::Success);
//!
//! let mut outgoing: HashMap<String, String> = HashMap::new();
//! let call = transaction.create_span();
//! call.propagate_trace_context(&mut outgoing, &MapHeaders);
//! call.end();
//! transaction.end();
//!
//! assert!(outgoing[TRACE_PARENT_HEADER_NAME].starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
//! assert_eq!(reporter.transactions().len(), 1);
//! ```
//!
//! [`Reporter`]: report::Reporter
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod clock;
pub mod config;
pub mod error;
pub mod pool;
pub mod propagation;
pub mod report;
pub mod trace;

mod internal_logging;

pub use config::Config;

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
