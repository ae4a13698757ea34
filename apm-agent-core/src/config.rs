//! Agent configuration snapshot
//!
//! The tracing core only reads configuration, it never loads it. [`Config::default`]
//! picks up `ELASTIC_APM_*` environment variables so a process can be tuned without code
//! changes; invalid values are reported and replaced by the defaults.
use crate::apm_warn;
use crate::error::ConfigError;
use crate::trace::round_sample_rate;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Extra activation slots on top of `transaction_max_spans`.
const ACTIVATION_STACK_BASE_SIZE: usize = 16;

/// Tells the agent what to do with incoming trace context headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TraceContinuationStrategy {
    /// Use the incoming trace id and sampling decision.
    #[default]
    Continue,
    /// Always start a new trace, linking to the incoming context.
    Restart,
    /// Continue when the upstream is another agent of this vendor, restart otherwise.
    RestartExternal,
}

impl FromStr for TraceContinuationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(TraceContinuationStrategy::Continue),
            "restart" => Ok(TraceContinuationStrategy::Restart),
            "restart_external" => Ok(TraceContinuationStrategy::RestartExternal),
            _ => Err(ConfigError::InvalidValue {
                option: "trace_continuation_strategy",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TraceContinuationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceContinuationStrategy::Continue => "continue",
            TraceContinuationStrategy::Restart => "restart",
            TraceContinuationStrategy::RestartExternal => "restart_external",
        })
    }
}

/// Tracer configuration
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Probability of a root transaction being sampled.
    pub sample_rate: f64,

    /// Spans started beyond this count are dropped.
    pub transaction_max_spans: usize,

    /// Whether sibling exit spans may be merged into composite spans.
    pub span_compression_enabled: bool,

    /// Max duration of spans compressed with the exact match strategy.
    pub span_compression_exact_match_max_duration: Duration,

    /// Max duration of spans compressed with the same kind strategy.
    pub span_compression_same_kind_max_duration: Duration,

    /// Exit spans faster than this are discarded when possible.
    pub exit_span_min_duration: Duration,

    /// Regular spans faster than this are discarded when possible.
    pub span_min_duration: Duration,

    /// How incoming trace contexts are honored.
    pub trace_continuation_strategy: TraceContinuationStrategy,

    /// Upper bound of the outgoing `tracestate` header value.
    pub tracestate_size_limit: usize,

    /// Collect self time per span type and subtype.
    pub breakdown_metrics: bool,

    /// Skip injecting trace context headers into outgoing carriers.
    pub disable_outgoing_trace_context_headers: bool,

    /// Also write the legacy `elastic-apm-traceparent` header.
    pub use_elastic_traceparent_header: bool,

    /// Number of recycled instances kept per object pool.
    pub object_pool_capacity: usize,

    /// Turn lifecycle misuse into panics instead of log messages.
    pub assertions_enabled: bool,
}

impl Default for Config {
    /// Create the default configuration, overridden by environment variables.
    fn default() -> Self {
        let mut config = Config::builtin();

        if let Some(rate) = env_value::<f64>("ELASTIC_APM_TRANSACTION_SAMPLE_RATE") {
            if (0.0..=1.0).contains(&rate) {
                config.sample_rate = round_sample_rate(rate);
            } else {
                apm_warn!(
                    name: "Config.InvalidSampleRate",
                    message = "ELASTIC_APM_TRANSACTION_SAMPLE_RATE must be between 0.0 and 1.0, using 1.0",
                    value = rate,
                );
            }
        }
        if let Some(max_spans) = env_value::<usize>("ELASTIC_APM_TRANSACTION_MAX_SPANS") {
            config.transaction_max_spans = max_spans;
        }
        if let Some(enabled) = env_value::<bool>("ELASTIC_APM_SPAN_COMPRESSION_ENABLED") {
            config.span_compression_enabled = enabled;
        }
        if let Some(d) = env_duration("ELASTIC_APM_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION") {
            config.span_compression_exact_match_max_duration = d;
        }
        if let Some(d) = env_duration("ELASTIC_APM_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION") {
            config.span_compression_same_kind_max_duration = d;
        }
        if let Some(d) = env_duration("ELASTIC_APM_EXIT_SPAN_MIN_DURATION") {
            config.exit_span_min_duration = d;
        }
        if let Some(d) = env_duration("ELASTIC_APM_SPAN_MIN_DURATION") {
            config.span_min_duration = d;
        }
        if let Ok(strategy) = env::var("ELASTIC_APM_TRACE_CONTINUATION_STRATEGY") {
            config.trace_continuation_strategy = strategy.parse().unwrap_or_else(|_| {
                apm_warn!(
                    name: "Config.InvalidTraceContinuationStrategy",
                    message = "Valid values are: continue, restart, restart_external. Falling back to continue",
                    value = strategy,
                );
                TraceContinuationStrategy::Continue
            });
        }
        if let Some(limit) = env_value::<usize>("ELASTIC_APM_TRACESTATE_SIZE_LIMIT") {
            config.tracestate_size_limit = limit;
        }
        if let Some(enabled) = env_value::<bool>("ELASTIC_APM_BREAKDOWN_METRICS") {
            config.breakdown_metrics = enabled;
        }
        if let Some(disabled) = env_value::<bool>("ELASTIC_APM_DISABLE_OUTGOING_TRACECONTEXT_HEADERS") {
            config.disable_outgoing_trace_context_headers = disabled;
        }
        if let Some(enabled) = env_value::<bool>("ELASTIC_APM_USE_ELASTIC_TRACEPARENT_HEADER") {
            config.use_elastic_traceparent_header = enabled;
        }
        if let Some(capacity) = env_value::<usize>("ELASTIC_APM_OBJECT_POOL_CAPACITY") {
            config.object_pool_capacity = capacity;
        }
        if let Some(enabled) = env_value::<bool>("ELASTIC_APM_ASSERTIONS_ENABLED") {
            config.assertions_enabled = enabled;
        }

        config
    }
}

impl Config {
    /// Defaults without looking at the environment.
    pub fn builtin() -> Self {
        Config {
            sample_rate: 1.0,
            transaction_max_spans: 500,
            span_compression_enabled: true,
            span_compression_exact_match_max_duration: Duration::from_millis(50),
            span_compression_same_kind_max_duration: Duration::ZERO,
            exit_span_min_duration: Duration::ZERO,
            span_min_duration: Duration::ZERO,
            trace_continuation_strategy: TraceContinuationStrategy::Continue,
            tracestate_size_limit: 4096,
            breakdown_metrics: true,
            disable_outgoing_trace_context_headers: false,
            use_elastic_traceparent_header: true,
            object_pool_capacity: 512,
            assertions_enabled: cfg!(debug_assertions),
        }
    }

    /// Max number of simultaneously active contexts per activation stack.
    pub fn activation_stack_max_depth(&self) -> usize {
        ACTIVATION_STACK_BASE_SIZE + self.transaction_max_spans
    }

    /// Set the sample rate, rounded to three significant digits.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = round_sample_rate(rate.clamp(0.0, 1.0));
        self
    }

    /// Set the maximum number of spans recorded per transaction.
    pub fn with_transaction_max_spans(mut self, max_spans: usize) -> Self {
        self.transaction_max_spans = max_spans;
        self
    }

    /// Enable or disable span compression.
    pub fn with_span_compression_enabled(mut self, enabled: bool) -> Self {
        self.span_compression_enabled = enabled;
        self
    }

    /// Set the exact match compression window.
    pub fn with_span_compression_exact_match_max_duration(mut self, duration: Duration) -> Self {
        self.span_compression_exact_match_max_duration = duration;
        self
    }

    /// Set the same kind compression window.
    pub fn with_span_compression_same_kind_max_duration(mut self, duration: Duration) -> Self {
        self.span_compression_same_kind_max_duration = duration;
        self
    }

    /// Set the exit span duration floor.
    pub fn with_exit_span_min_duration(mut self, duration: Duration) -> Self {
        self.exit_span_min_duration = duration;
        self
    }

    /// Set the regular span duration floor.
    pub fn with_span_min_duration(mut self, duration: Duration) -> Self {
        self.span_min_duration = duration;
        self
    }

    /// Set the trace continuation strategy.
    pub fn with_trace_continuation_strategy(mut self, strategy: TraceContinuationStrategy) -> Self {
        self.trace_continuation_strategy = strategy;
        self
    }

    /// Set the max length of outgoing `tracestate` headers.
    pub fn with_tracestate_size_limit(mut self, limit: usize) -> Self {
        self.tracestate_size_limit = limit;
        self
    }

    /// Enable or disable breakdown timers.
    pub fn with_breakdown_metrics(mut self, enabled: bool) -> Self {
        self.breakdown_metrics = enabled;
        self
    }

    /// Disable writing trace context headers.
    pub fn with_outgoing_trace_context_headers_disabled(mut self, disabled: bool) -> Self {
        self.disable_outgoing_trace_context_headers = disabled;
        self
    }

    /// Enable or disable the legacy traceparent header.
    pub fn with_elastic_traceparent_header(mut self, enabled: bool) -> Self {
        self.use_elastic_traceparent_header = enabled;
        self
    }

    /// Set the object pool capacity.
    pub fn with_object_pool_capacity(mut self, capacity: usize) -> Self {
        self.object_pool_capacity = capacity;
        self
    }

    /// Enable or disable assertions on lifecycle misuse.
    pub fn with_assertions_enabled(mut self, enabled: bool) -> Self {
        self.assertions_enabled = enabled;
        self
    }
}

fn env_value<T: FromStr>(key: &'static str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            apm_warn!(
                name: "Config.InvalidValue",
                message = "Ignoring unparsable value, using the default",
                key = key,
                value = raw,
            );
            None
        }
    }
}

fn env_duration(key: &'static str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match parse_duration(&raw) {
        Ok(duration) => Some(duration),
        Err(err) => {
            apm_warn!(
                name: "Config.InvalidDuration",
                message = "Durations look like 50ms, 5s or 1m. Using the default",
                key = key,
                error = err,
            );
            None
        }
    }
}

/// Parses `50ms`, `5s`, `1m`; a bare number is taken as milliseconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    let invalid = || ConfigError::InvalidValue {
        option: "duration",
        value: raw.to_string(),
    };
    let (number, millis_per_unit) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000)
    } else {
        (value, 1)
    };
    let number = number.trim().parse::<u64>().map_err(|_| invalid())?;
    number
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}
