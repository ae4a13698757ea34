//! Sampling decisions for root transactions.
//!
//! Transactions continuing a remote trace inherit the sampled flag of their parent. Only new
//! roots ask a [`Sampler`], which derives its decision from the random trace id so that the
//! decision is reproducible for a given id.
use crate::trace::{round_sample_rate, TraceId, TraceState};
use std::fmt;

/// Decides whether a new trace is recorded.
pub trait Sampler: Send + Sync + fmt::Debug {
    /// Returns `true` if the trace with the given id should be recorded.
    fn is_sampled(&self, trace_id: TraceId) -> bool;

    /// Rate this sampler applies, in `[0, 1]`.
    fn sample_rate(&self) -> f64;

    /// Vendor `tracestate` entry advertising [`Sampler::sample_rate`], e.g. `es=s:0.5`.
    fn trace_state_header(&self) -> &str;
}

/// Always takes the same decision.
#[derive(Clone, Debug)]
pub struct ConstantSampler {
    sampled: bool,
    header: String,
}

impl ConstantSampler {
    /// Sampler that records every trace.
    pub fn always_on() -> Self {
        ConstantSampler::new(true)
    }

    /// Sampler that records no trace.
    pub fn always_off() -> Self {
        ConstantSampler::new(false)
    }

    /// Sampler returning `sampled` for every trace.
    pub fn new(sampled: bool) -> Self {
        let rate = if sampled { 1.0 } else { 0.0 };
        ConstantSampler {
            sampled,
            header: format!("es=s:{rate}"),
        }
    }
}

impl Sampler for ConstantSampler {
    fn is_sampled(&self, _trace_id: TraceId) -> bool {
        self.sampled
    }

    fn sample_rate(&self) -> f64 {
        if self.sampled {
            1.0
        } else {
            0.0
        }
    }

    fn trace_state_header(&self) -> &str {
        &self.header
    }
}

/// Samples a share of traces given by a rate.
///
/// The low 63 bits of the trace id are compared against `rate * 2^63`, so a rate of `0`
/// samples nothing and a rate of `1` samples everything.
#[derive(Clone, Debug)]
pub struct ProbabilitySampler {
    rate: f64,
    upper_bound: u64,
    header: String,
}

impl ProbabilitySampler {
    /// Creates a sampler for `rate`, clamped to `[0, 1]` and rounded to three significant digits.
    pub fn new(rate: f64) -> Self {
        let rate = round_sample_rate(if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) });
        let header = match TraceState::header_value(rate) {
            Ok(header) => header,
            Err(_) => String::from("es=s:0"),
        };
        ProbabilitySampler {
            rate,
            upper_bound: (rate * (1u64 << 63) as f64) as u64,
            header,
        }
    }
}

impl Sampler for ProbabilitySampler {
    fn is_sampled(&self, trace_id: TraceId) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        let bytes = trace_id.to_bytes();
        let mut low = [0u8; 8];
        low.copy_from_slice(&bytes[8..]);
        let rnd_from_trace_id = u64::from_be_bytes(low) >> 1;
        rnd_from_trace_id < self.upper_bound
    }

    fn sample_rate(&self) -> f64 {
        self.rate
    }

    fn trace_state_header(&self) -> &str {
        &self.header
    }
}

/// Sampler configured by [`crate::Config::sample_rate`].
pub(crate) fn from_rate(rate: f64) -> Box<dyn Sampler> {
    if rate >= 1.0 {
        Box::new(ConstantSampler::always_on())
    } else if rate <= 0.0 {
        Box::new(ConstantSampler::always_off())
    } else {
        Box::new(ProbabilitySampler::new(rate))
    }
}
