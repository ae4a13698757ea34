use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Flags carried in the last field of a `traceparent` header.
///
/// Only the `recorded` bit is interpreted; other bits are propagated untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Copy, Hash)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// No flag set, the trace is not recorded.
    pub const NOT_SAMPLED: TraceFlags = TraceFlags(0x00);

    /// The trace is recorded by the caller.
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    /// Construct new trace flags
    pub const fn new(flags: u8) -> Self {
        TraceFlags(flags)
    }

    /// Returns `true` if the `sampled` flag is set
    pub fn is_sampled(&self) -> bool {
        (*self & TraceFlags::SAMPLED) == TraceFlags::SAMPLED
    }

    /// Returns copy of the current flags with the `sampled` flag set.
    pub fn with_sampled(&self, sampled: bool) -> Self {
        if sampled {
            *self | TraceFlags::SAMPLED
        } else {
            *self & !TraceFlags::SAMPLED
        }
    }

    /// Returns the flags as a `u8`
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl BitAnd for TraceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for TraceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Not for TraceFlags {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl fmt::LowerHex for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 16-byte value which identifies a trace.
///
/// All zeros is the empty id; a started context never has an empty trace id.
#[derive(Clone, Default, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    /// Empty trace id
    pub const INVALID: TraceId = TraceId(0);

    /// Length in bytes.
    pub const LENGTH: usize = 16;

    /// Create a trace id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Return the representation of this trace id as a byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Parses exactly 32 hex digits.
    ///
    /// # Examples
    ///
    /// ```
    /// use apm_agent_core::trace::TraceId;
    ///
    /// assert!(TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").is_ok());
    /// assert!(TraceId::from_hex("42").is_err());
    /// assert!(TraceId::from_hex("not_hex_not_hex_not_hex_not_hex_").is_err());
    /// ```
    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, const_hex::FromHexError> {
        let mut bytes = [0u8; 16];
        const_hex::decode_to_slice(hex, &mut bytes)?;
        Ok(TraceId::from_bytes(bytes))
    }

    /// Returns `true` if all bytes are zero.
    pub fn is_empty(&self) -> bool {
        *self == TraceId::INVALID
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value which identifies a span, a transaction or an error.
///
/// All zeros is the empty id, used for the parent id of root contexts.
#[derive(Clone, Default, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    /// Empty span id
    pub const INVALID: SpanId = SpanId(0);

    /// Length in bytes.
    pub const LENGTH: usize = 8;

    /// Create a span id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(u64::from_be_bytes(bytes))
    }

    /// Return the representation of this span id as a byte array.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parses exactly 16 hex digits.
    ///
    /// # Examples
    ///
    /// ```
    /// use apm_agent_core::trace::SpanId;
    ///
    /// assert!(SpanId::from_hex("b9c7c989f97918e1").is_ok());
    /// assert!(SpanId::from_hex("b9c7").is_err());
    /// ```
    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, const_hex::FromHexError> {
        let mut bytes = [0u8; 8];
        const_hex::decode_to_slice(hex, &mut bytes)?;
        Ok(SpanId::from_bytes(bytes))
    }

    /// Returns `true` if all bytes are zero.
    pub fn is_empty(&self) -> bool {
        *self == SpanId::INVALID
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
