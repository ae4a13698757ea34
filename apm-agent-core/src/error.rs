//! Errors raised inside the tracing core.
//!
//! None of these reach the instrumented application: parse failures are turned into a
//! `false` return by the public `as_child_of_*` operations and configuration errors fall
//! back to defaults. They exist so the reason can be logged and tested.
use thiserror::Error;

/// Reasons a `traceparent` header, text or binary, is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceContextError {
    /// Header shorter than the minimal length of its format.
    #[error("traceparent header has to be at least {expected} long, but was {actual}")]
    TooShort {
        /// minimal length
        expected: usize,
        /// observed length after trimming
        actual: usize,
    },

    /// Version 00 headers must have exactly 55 chars.
    #[error("traceparent header has to be exactly 55 chars long for version 00, but was {0}")]
    InvalidLengthForVersion(usize),

    /// Dashes are missing where the format requires them.
    #[error("traceparent header has an invalid format")]
    InvalidFormat,

    /// Version `ff` is forbidden.
    #[error("version ff is not supported")]
    UnsupportedVersion,

    /// A field contains non hex characters.
    #[error("invalid hex in {field}")]
    InvalidHex {
        /// name of the offending field
        field: &'static str,
    },

    /// Trace id or parent id is all zeros.
    #[error("{0} must not be all zeros")]
    EmptyId(&'static str),

    /// Binary header with an unexpected field identifier or version.
    #[error("binary traceparent header has an unexpected byte {found:#04x} at offset {offset}")]
    InvalidBinaryField {
        /// position in the header
        offset: usize,
        /// byte found there
        found: u8,
    },

    /// Internal serialized form has the wrong length.
    #[error("serialized trace context must be {expected} bytes, but was {actual}")]
    InvalidSerializedLength {
        /// required length
        expected: usize,
        /// observed length
        actual: usize,
    },
}

/// Errors produced while mutating a trace state.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TraceStateError {
    /// The sampling rate can only be set once per context.
    #[error("sample rate already set to {0}")]
    SampleRateAlreadySet(f64),

    /// Rate outside of `[0, 1]`.
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(f64),
}

/// Errors produced while reading configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value could not be parsed for the given option.
    #[error("invalid value '{value}' for {option}")]
    InvalidValue {
        /// option name
        option: &'static str,
        /// raw value
        value: String,
    },
}

/// Result type for trace context parsing.
pub type TraceContextResult<T> = Result<T, TraceContextError>;
