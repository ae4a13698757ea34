//! # Trace context
//!
//! The propagation unit of a trace: which trace a span belongs to, its own id, the id of its
//! parent, the sampled flag and the `tracestate`.
//!
//! Text form, see <https://www.w3.org/TR/trace-context/#traceparent-header>:
//!
//! ```text
//! 00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01
//! (_)-(_______________________________)-(______________)-(_)
//!  v            trace id                   parent id      flags
//! ```
//!
//! Binary form (29 bytes):
//!
//! ```text
//! [version: 1][field 0: 1][trace id: 16][field 1: 1][parent id: 8][field 2: 1][flags: 1]
//! ```
use crate::apm_debug;
use crate::apm_warn;
use crate::clock::EpochTickClock;
use crate::config::Config;
use crate::error::{TraceContextError, TraceContextResult};
use crate::propagation::{
    HeaderGetter, HeaderRemover, HeaderSetter, TextValue, ELASTIC_TRACE_PARENT_HEADER_NAME,
    TRACESTATE_HEADER_NAME, TRACE_PARENT_BINARY_HEADER_NAME, TRACE_PARENT_HEADER_NAME,
};
use crate::trace::{IdGenerator, RandomIdGenerator, Sampler, SpanId, TraceFlags, TraceId, TraceState};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Length of the internal serialized form, see [`TraceContext::serialize`].
pub const SERIALIZED_LENGTH: usize = 51;
/// Length of a binary `traceparent` header.
pub const BINARY_HEADER_LENGTH: usize = 29;

const TEXT_HEADER_EXPECTED_LENGTH: usize = 55;
const TEXT_HEADER_TRACE_ID_OFFSET: usize = 3;
const TEXT_HEADER_PARENT_ID_OFFSET: usize = 36;
const TEXT_HEADER_FLAGS_OFFSET: usize = 53;

const BINARY_FORMAT_CURRENT_VERSION: u8 = 0b0000_0000;
const BINARY_FORMAT_TRACE_ID_OFFSET: usize = 1;
const BINARY_FORMAT_TRACE_ID_FIELD_ID: u8 = 0b0000_0000;
const BINARY_FORMAT_PARENT_ID_OFFSET: usize = 18;
const BINARY_FORMAT_PARENT_ID_FIELD_ID: u8 = 0b0000_0001;
const BINARY_FORMAT_FLAGS_OFFSET: usize = 27;
const BINARY_FORMAT_FLAGS_FIELD_ID: u8 = 0b0000_0010;

/// Trace id, parent id and flags read from an incoming header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceParent {
    /// Id of the trace.
    pub trace_id: TraceId,
    /// Id of the remote span.
    pub parent_id: SpanId,
    /// Flags as sent by the caller.
    pub flags: TraceFlags,
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn hex_byte(bytes: &[u8], field: &'static str) -> TraceContextResult<u8> {
    let mut out = [0u8; 1];
    const_hex::decode_to_slice(bytes, &mut out).map_err(|_| TraceContextError::InvalidHex { field })?;
    Ok(out[0])
}

/// Parses a text `traceparent` header value.
///
/// Surrounding whitespace is ignored. Versions other than `00` may carry additional
/// dash-separated fields, which are ignored; version `ff` is rejected.
pub fn parse_text_header(header: &[u8]) -> TraceContextResult<TraceParent> {
    let header = trim_ascii_whitespace(header);
    let len = header.len();
    if len < TEXT_HEADER_EXPECTED_LENGTH {
        return Err(TraceContextError::TooShort {
            expected: TEXT_HEADER_EXPECTED_LENGTH,
            actual: len,
        });
    }
    let no_dash_at = |index: usize| header[index] != b'-';
    if no_dash_at(TEXT_HEADER_TRACE_ID_OFFSET - 1)
        || no_dash_at(TEXT_HEADER_PARENT_ID_OFFSET - 1)
        || no_dash_at(TEXT_HEADER_FLAGS_OFFSET - 1)
        || (len > TEXT_HEADER_EXPECTED_LENGTH && no_dash_at(TEXT_HEADER_EXPECTED_LENGTH))
    {
        return Err(TraceContextError::InvalidFormat);
    }
    if header[..2].eq_ignore_ascii_case(b"ff") {
        return Err(TraceContextError::UnsupportedVersion);
    }
    let version = hex_byte(&header[..2], "version")?;
    if version == 0 && len > TEXT_HEADER_EXPECTED_LENGTH {
        return Err(TraceContextError::InvalidLengthForVersion(len));
    }
    let trace_id = TraceId::from_hex(&header[TEXT_HEADER_TRACE_ID_OFFSET..TEXT_HEADER_PARENT_ID_OFFSET - 1])
        .map_err(|_| TraceContextError::InvalidHex { field: "trace-id" })?;
    if trace_id.is_empty() {
        return Err(TraceContextError::EmptyId("trace-id"));
    }
    let parent_id = SpanId::from_hex(&header[TEXT_HEADER_PARENT_ID_OFFSET..TEXT_HEADER_FLAGS_OFFSET - 1])
        .map_err(|_| TraceContextError::InvalidHex { field: "parent-id" })?;
    if parent_id.is_empty() {
        return Err(TraceContextError::EmptyId("parent-id"));
    }
    let flags = hex_byte(
        &header[TEXT_HEADER_FLAGS_OFFSET..TEXT_HEADER_EXPECTED_LENGTH],
        "trace-flags",
    )?;
    Ok(TraceParent {
        trace_id,
        parent_id,
        flags: TraceFlags::new(flags),
    })
}

/// Parses a binary `traceparent` header value.
///
/// The version byte is not interpreted and trailing bytes are ignored.
pub fn parse_binary_header(header: &[u8]) -> TraceContextResult<TraceParent> {
    if header.len() < BINARY_HEADER_LENGTH {
        return Err(TraceContextError::TooShort {
            expected: BINARY_HEADER_LENGTH,
            actual: header.len(),
        });
    }
    let expect_field = |offset: usize, field_id: u8| {
        if header[offset] == field_id {
            Ok(())
        } else {
            Err(TraceContextError::InvalidBinaryField {
                offset,
                found: header[offset],
            })
        }
    };
    expect_field(BINARY_FORMAT_TRACE_ID_OFFSET, BINARY_FORMAT_TRACE_ID_FIELD_ID)?;
    let mut trace_id = [0u8; TraceId::LENGTH];
    trace_id.copy_from_slice(&header[BINARY_FORMAT_TRACE_ID_OFFSET + 1..BINARY_FORMAT_PARENT_ID_OFFSET]);
    let trace_id = TraceId::from_bytes(trace_id);
    if trace_id.is_empty() {
        return Err(TraceContextError::EmptyId("trace-id"));
    }
    expect_field(BINARY_FORMAT_PARENT_ID_OFFSET, BINARY_FORMAT_PARENT_ID_FIELD_ID)?;
    let mut parent_id = [0u8; SpanId::LENGTH];
    parent_id.copy_from_slice(&header[BINARY_FORMAT_PARENT_ID_OFFSET + 1..BINARY_FORMAT_FLAGS_OFFSET]);
    let parent_id = SpanId::from_bytes(parent_id);
    if parent_id.is_empty() {
        return Err(TraceContextError::EmptyId("parent-id"));
    }
    expect_field(BINARY_FORMAT_FLAGS_OFFSET, BINARY_FORMAT_FLAGS_FIELD_ID)?;
    Ok(TraceParent {
        trace_id,
        parent_id,
        flags: TraceFlags::new(header[BINARY_FORMAT_FLAGS_OFFSET + 1]),
    })
}

/// Trace identifiers of a transaction, span or error.
///
/// A context is empty until one of the `as_*` methods populated it. Contexts are reused
/// through object pools, see [`TraceContext::reset`].
#[derive(Clone)]
pub struct TraceContext {
    trace_id: TraceId,
    id: SpanId,
    parent_id: SpanId,
    transaction_id: SpanId,
    flags: TraceFlags,
    discardable: bool,
    trace_state: TraceState,
    clock: EpochTickClock,
    service_name: Option<String>,
    service_version: Option<String>,
    outgoing_header: OnceLock<String>,
    config: Arc<Config>,
    id_generator: Arc<dyn IdGenerator>,
}

impl Default for TraceContext {
    fn default() -> Self {
        TraceContext::new(Arc::new(Config::builtin()), Arc::new(RandomIdGenerator::default()))
    }
}

impl TraceContext {
    /// Creates an empty context.
    pub fn new(config: Arc<Config>, id_generator: Arc<dyn IdGenerator>) -> Self {
        TraceContext {
            trace_id: TraceId::INVALID,
            id: SpanId::INVALID,
            parent_id: SpanId::INVALID,
            transaction_id: SpanId::INVALID,
            flags: TraceFlags::NOT_SAMPLED,
            discardable: true,
            trace_state: TraceState::with_size_limit(config.tracestate_size_limit),
            clock: EpochTickClock::default(),
            service_name: None,
            service_version: None,
            outgoing_header: OnceLock::new(),
            config,
            id_generator,
        }
    }

    fn on_mutation(&mut self) {
        self.outgoing_header.take();
    }

    /// Starts a new trace, letting `sampler` decide whether it is recorded.
    pub fn as_root(&mut self, sampler: &dyn Sampler) {
        self.trace_id = self.id_generator.new_trace_id();
        self.id = self.id_generator.new_span_id();
        self.parent_id = SpanId::INVALID;
        self.transaction_id = self.id;
        if sampler.is_sampled(self.trace_id) {
            self.flags = TraceFlags::SAMPLED;
            if let Err(err) = self
                .trace_state
                .set(sampler.sample_rate(), sampler.trace_state_header())
            {
                apm_debug!(name: "TraceContext.AsRoot", error = err);
            }
        } else {
            self.flags = TraceFlags::NOT_SAMPLED;
        }
        self.clock.init();
        self.on_mutation();
    }

    /// Makes this context a child of a local parent.
    pub fn as_child_of(&mut self, parent: &TraceContext) {
        self.trace_id = parent.trace_id;
        self.parent_id = parent.id;
        self.transaction_id = parent.transaction_id;
        self.flags = parent.flags;
        self.id = self.id_generator.new_span_id();
        self.clock.init_from(&parent.clock);
        self.service_name.clone_from(&parent.service_name);
        self.service_version.clone_from(&parent.service_version);
        self.trace_state.copy_from(&parent.trace_state);
        self.on_mutation();
    }

    fn as_child_of_remote(&mut self, parent: TraceParent) {
        self.trace_id = parent.trace_id;
        self.parent_id = parent.parent_id;
        self.id = self.id_generator.new_span_id();
        self.transaction_id = self.id;
        self.flags = parent.flags;
        self.clock.init();
        self.on_mutation();
    }

    /// Makes this context a child of a text `traceparent` header value.
    ///
    /// Returns `false` and leaves the context untouched if the header is invalid.
    pub fn as_child_of_header<T: TextValue + ?Sized>(&mut self, header: &T) -> bool {
        match parse_text_header(header.as_text_bytes()) {
            Ok(parent) => {
                self.as_child_of_remote(parent);
                true
            }
            Err(err) => {
                apm_warn!(
                    name: "TraceContext.InvalidTraceParent",
                    error = err,
                    header = String::from_utf8_lossy(header.as_text_bytes()),
                );
                false
            }
        }
    }

    /// Makes this context a child of a binary `traceparent` header value.
    ///
    /// Returns `false` and leaves the context untouched if the header is invalid.
    pub fn as_child_of_binary_header(&mut self, header: &[u8]) -> bool {
        match parse_binary_header(header) {
            Ok(parent) => {
                self.as_child_of_remote(parent);
                true
            }
            Err(err) => {
                apm_warn!(name: "TraceContext.InvalidBinaryTraceParent", error = err);
                false
            }
        }
    }

    /// Makes this context a child of the trace context headers found on a carrier.
    ///
    /// `traceparent` is preferred, the legacy `elastic-apm-traceparent` header is tried when
    /// it is missing or invalid. All `tracestate` headers are read once the parent is valid
    /// and `parse_trace_state` is set.
    pub fn as_child_of_headers<T, C>(
        &mut self,
        carrier: &C,
        getter: &impl HeaderGetter<T, C>,
        parse_trace_state: bool,
    ) -> bool
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        let mut valid = getter
            .first_header(TRACE_PARENT_HEADER_NAME, carrier)
            .is_some_and(|header| self.as_child_of_header(header));
        if !valid {
            valid = getter
                .first_header(ELASTIC_TRACE_PARENT_HEADER_NAME, carrier)
                .is_some_and(|header| self.as_child_of_header(header));
        }
        if valid && parse_trace_state {
            let trace_state = &mut self.trace_state;
            getter.for_each_header(TRACESTATE_HEADER_NAME, carrier, &mut |value: &T| {
                match value.as_text() {
                    Some(text) => trace_state.add_text_header(text),
                    None => {
                        apm_warn!(name: "TraceContext.InvalidTraceState", reason = "not UTF-8");
                    }
                }
            });
        }
        valid
    }

    /// Makes this context a child of the binary `traceparent` header found on a carrier.
    pub fn as_child_of_binary_headers<C: ?Sized>(
        &mut self,
        carrier: &C,
        getter: &impl HeaderGetter<[u8], C>,
    ) -> bool {
        getter
            .first_header(TRACE_PARENT_BINARY_HEADER_NAME, carrier)
            .is_some_and(|header| self.as_child_of_binary_header(header))
    }

    /// Returns `true` if the carrier has a `traceparent` header.
    pub fn contains_trace_context_text_headers<T, C>(carrier: &C, getter: &impl HeaderGetter<T, C>) -> bool
    where
        T: ?Sized,
        C: ?Sized,
    {
        getter.first_header(TRACE_PARENT_HEADER_NAME, carrier).is_some()
    }

    /// Removes every trace context header from the carrier.
    pub fn remove_trace_context_headers<C: ?Sized>(carrier: &mut C, remover: &impl HeaderRemover<C>) {
        remover.remove_header(TRACE_PARENT_HEADER_NAME, carrier);
        remover.remove_header(ELASTIC_TRACE_PARENT_HEADER_NAME, carrier);
        remover.remove_header(TRACESTATE_HEADER_NAME, carrier);
        remover.remove_header(TRACE_PARENT_BINARY_HEADER_NAME, carrier);
    }

    /// Copies the text trace context headers from one carrier to another.
    ///
    /// Only the first `tracestate` header is copied.
    pub fn copy_trace_context_text_headers<S, D>(
        source: &S,
        getter: &impl HeaderGetter<str, S>,
        destination: &mut D,
        setter: &impl HeaderSetter<str, D>,
    ) where
        S: ?Sized,
        D: ?Sized,
    {
        for name in crate::propagation::TRACE_TEXT_HEADER_NAMES {
            if let Some(value) = getter.first_header(name, source) {
                setter.set_header(name, value, destination);
            }
        }
    }

    /// Value of the `traceparent` header for downstream services.
    ///
    /// Unsampled contexts propagate the id of their transaction, which is reported even when
    /// not sampled, so that downstream transactions have an existing parent.
    pub fn outgoing_header(&self) -> &str {
        self.outgoing_header.get_or_init(|| {
            let id = if self.is_sampled() { self.id } else { self.transaction_id };
            format_trace_parent(self.trace_id, id, self.flags)
        })
    }

    /// Binary `traceparent` header for downstream services.
    pub fn outgoing_binary_header(&self) -> [u8; BINARY_HEADER_LENGTH] {
        let id = if self.is_sampled() { self.id } else { self.transaction_id };
        let mut buffer = [0u8; BINARY_HEADER_LENGTH];
        buffer[0] = BINARY_FORMAT_CURRENT_VERSION;
        buffer[BINARY_FORMAT_TRACE_ID_OFFSET] = BINARY_FORMAT_TRACE_ID_FIELD_ID;
        buffer[BINARY_FORMAT_TRACE_ID_OFFSET + 1..BINARY_FORMAT_PARENT_ID_OFFSET]
            .copy_from_slice(&self.trace_id.to_bytes());
        buffer[BINARY_FORMAT_PARENT_ID_OFFSET] = BINARY_FORMAT_PARENT_ID_FIELD_ID;
        buffer[BINARY_FORMAT_PARENT_ID_OFFSET + 1..BINARY_FORMAT_FLAGS_OFFSET].copy_from_slice(&id.to_bytes());
        buffer[BINARY_FORMAT_FLAGS_OFFSET] = BINARY_FORMAT_FLAGS_FIELD_ID;
        buffer[BINARY_FORMAT_FLAGS_OFFSET + 1] = self.flags.to_u8();
        buffer
    }

    /// The `traceparent` header as it was received, i.e. pointing to the remote parent.
    pub fn incoming_header(&self) -> String {
        format_trace_parent(self.trace_id, self.parent_id, self.flags)
    }

    /// Outgoing `tracestate` header, limited to the configured size.
    pub fn outgoing_trace_state(&self) -> Option<String> {
        self.trace_state.to_text_header()
    }

    /// Writes the trace context headers to a carrier.
    ///
    /// Does nothing when outgoing headers are disabled. The legacy header is only written
    /// when enabled.
    pub fn propagate_trace_context<T, C>(&self, carrier: &mut C, setter: &impl HeaderSetter<T, C>)
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        if self.config.disable_outgoing_trace_context_headers {
            apm_debug!(name: "TraceContext.PropagationDisabled");
            return;
        }
        let header = self.outgoing_header();
        setter.set_header(TRACE_PARENT_HEADER_NAME, T::from_text(header), carrier);
        if self.config.use_elastic_traceparent_header {
            setter.set_header(ELASTIC_TRACE_PARENT_HEADER_NAME, T::from_text(header), carrier);
        }
        if let Some(trace_state) = self.outgoing_trace_state() {
            setter.set_header(TRACESTATE_HEADER_NAME, T::from_text(&trace_state), carrier);
        }
    }

    /// Writes the binary `traceparent` header to a carrier.
    pub fn propagate_binary_trace_context<C: ?Sized>(
        &self,
        carrier: &mut C,
        setter: &impl HeaderSetter<[u8], C>,
    ) -> bool {
        if self.config.disable_outgoing_trace_context_headers {
            return false;
        }
        setter.set_header(TRACE_PARENT_BINARY_HEADER_NAME, &self.outgoing_binary_header(), carrier);
        true
    }

    /// Writes this context into `buffer` for a hand-off to another thread.
    ///
    /// Layout: trace id, id, transaction id, has-parent byte, parent id, flags,
    /// discardable byte, clock offset (big endian).
    pub fn serialize_into(&self, buffer: &mut [u8; SERIALIZED_LENGTH]) {
        buffer[0..16].copy_from_slice(&self.trace_id.to_bytes());
        buffer[16..24].copy_from_slice(&self.id.to_bytes());
        buffer[24..32].copy_from_slice(&self.transaction_id.to_bytes());
        buffer[32] = u8::from(!self.parent_id.is_empty());
        buffer[33..41].copy_from_slice(&self.parent_id.to_bytes());
        buffer[41] = self.flags.to_u8();
        buffer[42] = u8::from(self.discardable);
        buffer[43..51].copy_from_slice(&self.clock.offset().to_be_bytes());
    }

    /// See [`TraceContext::serialize_into`].
    pub fn serialize(&self) -> [u8; SERIALIZED_LENGTH] {
        let mut buffer = [0u8; SERIALIZED_LENGTH];
        self.serialize_into(&mut buffer);
        buffer
    }

    /// Restores a context written by [`TraceContext::serialize`].
    pub fn deserialize(
        &mut self,
        buffer: &[u8],
        service_name: Option<&str>,
        service_version: Option<&str>,
    ) -> TraceContextResult<()> {
        let buffer = serialized(buffer)?;
        self.trace_id = TraceId::from_bytes(read_array(buffer, 0));
        self.id = SpanId::from_bytes(read_array(buffer, 16));
        self.transaction_id = SpanId::from_bytes(read_array(buffer, 24));
        self.parent_id = if buffer[32] != 0 {
            SpanId::from_bytes(read_array(buffer, 33))
        } else {
            SpanId::INVALID
        };
        self.flags = TraceFlags::new(buffer[41]);
        self.discardable = buffer[42] == 1;
        self.clock.init_with_offset(i64::from_be_bytes(read_array(buffer, 43)));
        self.service_name = service_name.map(str::to_owned);
        self.service_version = service_version.map(str::to_owned);
        self.on_mutation();
        Ok(())
    }

    /// Makes this context a child of a context written by [`TraceContext::serialize`].
    pub fn as_child_of_serialized(&mut self, buffer: &[u8], service_name: Option<&str>) -> TraceContextResult<()> {
        let buffer = serialized(buffer)?;
        self.trace_id = TraceId::from_bytes(read_array(buffer, 0));
        self.parent_id = SpanId::from_bytes(read_array(buffer, 16));
        self.transaction_id = SpanId::from_bytes(read_array(buffer, 24));
        self.id = self.id_generator.new_span_id();
        self.flags = TraceFlags::new(buffer[41]);
        self.discardable = buffer[42] == 1;
        self.clock.init_with_offset(i64::from_be_bytes(read_array(buffer, 43)));
        self.service_name = service_name.map(str::to_owned);
        self.on_mutation();
        Ok(())
    }

    /// Returns `true` if both contexts have the same trace id and id as `serialized`.
    pub fn trace_id_and_id_equal(&self, serialized: &[u8]) -> bool {
        serialized.len() >= 24
            && serialized[0..16] == self.trace_id.to_bytes()
            && serialized[16..24] == self.id.to_bytes()
    }

    /// Copies all fields from `other`.
    pub fn copy_from(&mut self, other: &TraceContext) {
        self.trace_id = other.trace_id;
        self.id = other.id;
        self.parent_id = other.parent_id;
        self.transaction_id = other.transaction_id;
        self.flags = other.flags;
        self.discardable = other.discardable;
        self.clock.init_from(&other.clock);
        self.service_name.clone_from(&other.service_name);
        self.service_version.clone_from(&other.service_version);
        self.trace_state.copy_from(&other.trace_state);
        self.on_mutation();
    }

    /// Returns the context to its empty state.
    pub fn reset(&mut self) {
        self.trace_id = TraceId::INVALID;
        self.id = SpanId::INVALID;
        self.parent_id = SpanId::INVALID;
        self.transaction_id = SpanId::INVALID;
        self.flags = TraceFlags::NOT_SAMPLED;
        self.discardable = true;
        self.clock.reset();
        self.service_name = None;
        self.service_version = None;
        self.trace_state.reset(self.config.tracestate_size_limit);
        self.on_mutation();
    }

    /// Id of the trace.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Own id.
    pub fn id(&self) -> SpanId {
        self.id
    }

    /// Id of the parent, empty for roots.
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    /// Id of the transaction this context belongs to.
    pub fn transaction_id(&self) -> SpanId {
        self.transaction_id
    }

    /// Trace flags.
    pub fn flags(&self) -> TraceFlags {
        self.flags
    }

    /// Returns `true` if the trace is recorded.
    pub fn is_sampled(&self) -> bool {
        self.flags.is_sampled()
    }

    pub(crate) fn set_recorded(&mut self, recorded: bool) {
        self.flags = self.flags.with_sampled(recorded);
        self.on_mutation();
    }

    /// Sample rate of the trace, `0` for unsampled contexts and `None` if unknown.
    pub fn sample_rate(&self) -> Option<f64> {
        if self.is_sampled() {
            self.trace_state.sample_rate()
        } else {
            Some(0.0)
        }
    }

    /// Returns `true` for contexts without a parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    /// Returns `true` once populated.
    pub fn has_content(&self) -> bool {
        !self.id.is_empty()
    }

    /// Returns `true` if `other` is the direct parent of this context.
    pub fn is_child_of(&self, other: &TraceContext) -> bool {
        other.trace_id == self.trace_id && other.id == self.parent_id
    }

    /// Returns `true` while the span may still be discarded.
    pub fn is_discardable(&self) -> bool {
        self.discardable
    }

    pub(crate) fn set_non_discardable(&mut self) {
        self.discardable = false;
    }

    /// The trace state.
    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    /// Mutable access to the trace state.
    pub fn trace_state_mut(&mut self) -> &mut TraceState {
        &mut self.trace_state
    }

    /// Clock shared by every span of the trace in this process.
    pub fn clock(&self) -> &EpochTickClock {
        &self.clock
    }

    pub(crate) fn clock_mut(&mut self) -> &mut EpochTickClock {
        &mut self.clock
    }

    /// Service name overriding the agent's default for this trace.
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Service version overriding the agent's default for this trace.
    pub fn service_version(&self) -> Option<&str> {
        self.service_version.as_deref()
    }

    /// Overrides service name and version; ignored when the name is empty.
    pub fn set_service_info(&mut self, name: Option<&str>, version: Option<&str>) {
        match name {
            Some(name) if !name.is_empty() => {
                self.service_name = Some(name.to_owned());
                self.service_version = version.map(str::to_owned);
            }
            _ => {}
        }
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Empty context sharing this context's configuration and id generator.
    pub(crate) fn empty_like(&self) -> TraceContext {
        TraceContext::new(self.config.clone(), self.id_generator.clone())
    }
}

fn serialized(buffer: &[u8]) -> TraceContextResult<&[u8]> {
    if buffer.len() == SERIALIZED_LENGTH {
        Ok(buffer)
    } else {
        Err(TraceContextError::InvalidSerializedLength {
            expected: SERIALIZED_LENGTH,
            actual: buffer.len(),
        })
    }
}

fn read_array<const N: usize>(buffer: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buffer[offset..offset + N]);
    out
}

fn format_trace_parent(trace_id: TraceId, id: SpanId, flags: TraceFlags) -> String {
    format!("00-{trace_id}-{id}-{:02x}", flags)
}

impl PartialEq for TraceContext {
    fn eq(&self, other: &Self) -> bool {
        self.trace_id == other.trace_id && self.id == other.id
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("trace_id", &self.trace_id)
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("transaction_id", &self.transaction_id)
            .field("flags", &self.flags)
            .field("discardable", &self.discardable)
            .field("trace_state", &self.trace_state)
            .finish()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.outgoing_header())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{HeaderList, MapHeaders};
    use crate::trace::{ConstantSampler, IncrementIdGenerator};
    use std::collections::HashMap;

    const VALID_HEADER: &str = "00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01";

    fn context() -> TraceContext {
        TraceContext::default()
    }

    fn context_with(config: Config) -> TraceContext {
        TraceContext::new(Arc::new(config), Arc::new(RandomIdGenerator::default()))
    }

    #[rustfmt::skip]
    fn invalid_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("00-00000000000000000000000000000000-b9c7c989f97918e1-00", "all zero trace id"),
            ("00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01", "all zero parent id"),
            ("00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1", "missing flags"),
            ("00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01-", "version 00 too long"),
            ("00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01-unknown", "version 00 with extra field"),
            ("00_0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01", "wrong separator"),
            ("00-0af7651916cd43dd8448eb211c80319c_b9c7c989f97918e1-01", "wrong separator before parent"),
            ("00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1_01", "wrong separator before flags"),
            ("ff-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01", "version ff"),
            ("00-0af7651916cd43dd8448eb211c80319x-b9c7c989f97918e1-01", "invalid trace id hex"),
            ("00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918eg-01", "invalid parent id hex"),
            ("00-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-0z", "invalid flags hex"),
            ("01-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-01x", "no dash after flags"),
            ("", "empty"),
        ]
    }

    #[test]
    fn rejects_invalid_headers() {
        for (header, reason) in invalid_headers() {
            let mut trace_context = context();
            assert!(!trace_context.as_child_of_header(header), "{reason}");
            assert!(!trace_context.has_content(), "{reason}");
            assert!(trace_context.trace_id().is_empty(), "{reason}");
        }
    }

    #[test]
    fn parses_valid_header() {
        let mut trace_context = context();
        assert!(trace_context.as_child_of_header(VALID_HEADER));
        assert_eq!(trace_context.trace_id().to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(trace_context.parent_id().to_string(), "b9c7c989f97918e1");
        assert_eq!(trace_context.transaction_id(), trace_context.id());
        assert_ne!(trace_context.id(), trace_context.parent_id());
        assert!(trace_context.is_sampled());
        assert!(!trace_context.is_root());
        assert!(trace_context.clock().is_initialized());
        assert_eq!(trace_context.incoming_header(), VALID_HEADER);
    }

    #[test]
    fn tolerates_whitespace_and_future_versions() {
        let mut trace_context = context();
        assert!(trace_context.as_child_of_header(format!("  {VALID_HEADER}\t").as_str()));

        let mut trace_context = context();
        assert!(trace_context.as_child_of_header(
            "01-0af7651916cd43dd8448eb211c80319c-b9c7c989f97918e1-00-future-fields"
        ));
        assert!(!trace_context.is_sampled());
        assert_eq!(trace_context.flags().to_u8(), 0);
    }

    #[test]
    fn accepts_utf8_byte_headers() {
        let mut trace_context = context();
        assert!(trace_context.as_child_of_header(VALID_HEADER.as_bytes()));
        assert_eq!(trace_context.parent_id().to_string(), "b9c7c989f97918e1");
    }

    #[test]
    fn outgoing_header_round_trip() {
        let mut root = context();
        root.as_root(&ConstantSampler::always_on());
        let header = root.outgoing_header().to_string();
        assert!(header.ends_with("-01"));

        let mut child = context();
        assert!(child.as_child_of_header(header.as_str()));
        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(child.parent_id(), root.id());
        assert_eq!(child.flags(), root.flags());
    }

    #[test]
    fn binary_round_trip() {
        let mut root = context();
        root.as_root(&ConstantSampler::always_on());
        let header = root.outgoing_binary_header();
        assert_eq!(header.len(), BINARY_HEADER_LENGTH);

        let mut child = context();
        assert!(child.as_child_of_binary_header(&header));
        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(child.parent_id(), root.id());
        assert!(child.is_sampled());
    }

    #[test]
    fn rejects_invalid_binary_headers() {
        let mut root = context();
        root.as_root(&ConstantSampler::always_on());
        let valid = root.outgoing_binary_header();

        let mut too_short = context();
        assert!(!too_short.as_child_of_binary_header(&valid[..28]));

        for offset in [BINARY_FORMAT_TRACE_ID_OFFSET, BINARY_FORMAT_PARENT_ID_OFFSET, BINARY_FORMAT_FLAGS_OFFSET] {
            let mut header = valid;
            header[offset] = 0xff;
            assert_eq!(
                parse_binary_header(&header),
                Err(TraceContextError::InvalidBinaryField { offset, found: 0xff })
            );
        }

        let mut empty_trace_id = valid;
        empty_trace_id[2..18].fill(0);
        assert_eq!(
            parse_binary_header(&empty_trace_id),
            Err(TraceContextError::EmptyId("trace-id"))
        );

        let mut padded = valid.to_vec();
        padded.extend_from_slice(&[1, 2, 3]);
        assert!(parse_binary_header(&padded).is_ok());
    }

    #[test]
    fn root_contexts() {
        let mut sampled = context();
        sampled.as_root(&ConstantSampler::always_on());
        assert!(sampled.is_root());
        assert!(sampled.is_sampled());
        assert!(!sampled.trace_id().is_empty());
        assert_eq!(sampled.transaction_id(), sampled.id());
        assert_eq!(sampled.sample_rate(), Some(1.0));
        assert_eq!(sampled.outgoing_trace_state().as_deref(), Some("es=s:1"));

        let mut unsampled = context();
        unsampled.as_root(&ConstantSampler::always_off());
        assert!(!unsampled.is_sampled());
        assert_eq!(unsampled.sample_rate(), Some(0.0));
        assert_eq!(unsampled.outgoing_trace_state(), None);
    }

    #[test]
    fn child_of_local_parent() {
        let mut parent = context();
        parent.as_root(&ConstantSampler::always_on());
        parent.set_service_info(Some("service"), Some("1.0"));

        let mut child = context();
        child.as_child_of(&parent);
        assert!(child.is_child_of(&parent));
        assert_eq!(child.transaction_id(), parent.transaction_id());
        assert_eq!(child.clock(), parent.clock());
        assert_eq!(child.service_name(), Some("service"));
        assert_eq!(child.trace_state(), parent.trace_state());
        assert_ne!(child.id(), parent.id());
    }

    #[test]
    fn unsampled_contexts_propagate_transaction_id() {
        let ids: Arc<dyn IdGenerator> = Arc::new(IncrementIdGenerator::new());
        let config = Arc::new(Config::builtin());
        let mut transaction = TraceContext::new(config.clone(), ids.clone());
        transaction.as_root(&ConstantSampler::always_off());
        let mut span = TraceContext::new(config, ids);
        span.as_child_of(&transaction);

        assert!(span.outgoing_header().contains(&transaction.id().to_string()));
        assert!(span.outgoing_header().ends_with("-00"));
    }

    #[test]
    fn outgoing_header_cache_is_invalidated() {
        let mut trace_context = context();
        trace_context.as_root(&ConstantSampler::always_on());
        let first = trace_context.outgoing_header().to_string();

        let mut parent = context();
        parent.as_root(&ConstantSampler::always_on());
        trace_context.as_child_of(&parent);
        assert_ne!(trace_context.outgoing_header(), first);
        assert_eq!(trace_context.to_string(), trace_context.outgoing_header());
    }

    #[test]
    fn headers_from_carrier() {
        let mut carrier = vec![
            ("traceparent".to_string(), VALID_HEADER.to_string()),
            ("tracestate".to_string(), "es=s:0.5".to_string()),
            ("tracestate".to_string(), "other=1".to_string()),
        ];
        let mut trace_context = context();
        assert!(trace_context.as_child_of_headers(&carrier, &HeaderList, true));
        assert_eq!(trace_context.trace_state().sample_rate(), Some(0.5));
        assert_eq!(trace_context.outgoing_trace_state().as_deref(), Some("es=s:0.5,other=1"));

        let mut without_trace_state = context();
        assert!(without_trace_state.as_child_of_headers(&carrier, &HeaderList, false));
        assert!(without_trace_state.trace_state().is_empty());

        carrier[0].1 = "invalid".to_string();
        carrier.push(("elastic-apm-traceparent".to_string(), VALID_HEADER.to_string()));
        let mut legacy = context();
        assert!(legacy.as_child_of_headers(&carrier, &HeaderList, true));
        assert_eq!(legacy.parent_id().to_string(), "b9c7c989f97918e1");

        let empty: Vec<(String, String)> = Vec::new();
        assert!(!context().as_child_of_headers(&empty, &HeaderList, true));
    }

    #[test]
    fn propagation_to_carrier() {
        let mut parent = context();
        parent.as_root(&ConstantSampler::always_on());

        let mut carrier: HashMap<String, String> = HashMap::new();
        parent.propagate_trace_context(&mut carrier, &MapHeaders);
        assert_eq!(carrier.get("traceparent").map(String::as_str), Some(parent.outgoing_header()));
        assert_eq!(carrier.get("elastic-apm-traceparent"), carrier.get("traceparent"));
        assert_eq!(carrier.get("tracestate").map(String::as_str), Some("es=s:1"));
        assert!(TraceContext::contains_trace_context_text_headers(&carrier, &MapHeaders));

        let mut copy: HashMap<String, String> = HashMap::new();
        TraceContext::copy_trace_context_text_headers(&carrier, &MapHeaders, &mut copy, &MapHeaders);
        assert_eq!(copy, carrier);

        TraceContext::remove_trace_context_headers(&mut carrier, &MapHeaders);
        assert!(carrier.is_empty());
    }

    #[test]
    fn propagation_respects_config() {
        let mut without_legacy = context_with(Config::builtin().with_elastic_traceparent_header(false));
        without_legacy.as_root(&ConstantSampler::always_on());
        let mut carrier: HashMap<String, String> = HashMap::new();
        without_legacy.propagate_trace_context(&mut carrier, &MapHeaders);
        assert!(carrier.contains_key("traceparent"));
        assert!(!carrier.contains_key("elastic-apm-traceparent"));

        let mut disabled = context_with(Config::builtin().with_outgoing_trace_context_headers_disabled(true));
        disabled.as_root(&ConstantSampler::always_on());
        let mut carrier: HashMap<String, String> = HashMap::new();
        disabled.propagate_trace_context(&mut carrier, &MapHeaders);
        assert!(carrier.is_empty());
        let mut binary: HashMap<String, Vec<u8>> = HashMap::new();
        assert!(!disabled.propagate_binary_trace_context(&mut binary, &MapHeaders));
    }

    #[test]
    fn binary_propagation_to_carrier() {
        let mut parent = context();
        parent.as_root(&ConstantSampler::always_on());
        let mut carrier: HashMap<String, Vec<u8>> = HashMap::new();
        assert!(parent.propagate_binary_trace_context(&mut carrier, &MapHeaders));

        let mut child = context();
        assert!(child.as_child_of_binary_headers(&carrier, &MapHeaders));
        assert!(child.is_child_of(&parent));
    }

    #[test]
    fn serialization_round_trip() {
        let mut parent = context();
        parent.as_root(&ConstantSampler::always_on());
        let mut original = context();
        original.as_child_of(&parent);
        original.set_non_discardable();

        let serialized = original.serialize();
        assert!(original.trace_id_and_id_equal(&serialized));

        let mut restored = context();
        restored.deserialize(&serialized, Some("service"), None).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.parent_id(), original.parent_id());
        assert_eq!(restored.transaction_id(), original.transaction_id());
        assert_eq!(restored.flags(), original.flags());
        assert!(!restored.is_discardable());
        assert_eq!(restored.clock(), original.clock());
        assert_eq!(restored.service_name(), Some("service"));

        let mut child = context();
        child.as_child_of_serialized(&serialized, None).unwrap();
        assert!(child.is_child_of(&original));
        assert_eq!(child.transaction_id(), original.transaction_id());

        assert_eq!(
            context().deserialize(&serialized[..50], None, None),
            Err(TraceContextError::InvalidSerializedLength { expected: 51, actual: 50 })
        );
    }

    #[test]
    fn serialized_root_has_no_parent() {
        let mut root = context();
        root.as_root(&ConstantSampler::always_off());
        let mut restored = context();
        restored.deserialize(&root.serialize(), None, None).unwrap();
        assert!(restored.is_root());
        assert!(restored.is_discardable());
    }

    #[test]
    fn reset_clears_everything() {
        let mut trace_context = context();
        assert!(trace_context.as_child_of_header(VALID_HEADER));
        trace_context.trace_state_mut().add_text_header("es=s:0.5");
        trace_context.set_non_discardable();
        trace_context.reset();
        assert!(!trace_context.has_content());
        assert!(trace_context.trace_id().is_empty());
        assert!(trace_context.trace_state().is_empty());
        assert!(trace_context.is_discardable());
        assert!(!trace_context.clock().is_initialized());
    }
}
