//! W3C baggage carried alongside trace contexts.
//!
//! A [`Baggage`] is immutable and shared between a span and its children. Changing it goes
//! through a [`BaggageBuilder`], which hands back the parent instance when nothing changed
//! so that the cached header value keeps being reused.
use crate::apm_warn;
use crate::propagation::{HeaderGetter, HeaderSetter, TextValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Name of the W3C baggage header.
pub const BAGGAGE_HEADER_NAME: &str = "baggage";

const MAX_KEY_VALUE_PAIRS: usize = 64;
const MAX_LEN_OF_ALL_PAIRS: usize = 8192;
const FRAGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b';').add(b',').add(b'=');

// https://datatracker.ietf.org/doc/html/rfc7230#section-3.2.6
const INVALID_ASCII_KEY_CHARS: [u8; 17] = [
    b'(', b')', b',', b'/', b':', b';', b'<', b'=', b'>', b'?', b'@', b'[', b'\\', b']', b'{',
    b'}', b'"',
];

#[derive(Clone, Debug, PartialEq, Eq)]
struct BaggageEntry {
    key: String,
    value: String,
    metadata: Option<String>,
}

impl BaggageEntry {
    fn content_len(&self) -> usize {
        self.key.len() + self.value.len() + self.metadata.as_ref().map_or(0, String::len)
    }
}

#[derive(Default)]
struct BaggageInner {
    entries: Vec<BaggageEntry>,
    serialized: OnceLock<String>,
}

/// Immutable set of key/value pairs, each with optional metadata, in insertion order.
///
/// Limits: at most 64 pairs and 8192 bytes of keys, values and metadata.
#[derive(Clone, Default)]
pub struct Baggage(Arc<BaggageInner>);

impl Baggage {
    /// Baggage without entries.
    pub fn empty() -> Self {
        static EMPTY: OnceLock<Baggage> = OnceLock::new();
        EMPTY.get_or_init(Baggage::default).clone()
    }

    /// Builder starting from empty baggage.
    pub fn builder() -> BaggageBuilder {
        Baggage::empty().to_builder()
    }

    /// Builder pre-populated with the entries of this baggage.
    pub fn to_builder(&self) -> BaggageBuilder {
        BaggageBuilder {
            parent: self.clone(),
            entries: None,
        }
    }

    /// Value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entry(key).map(|e| e.value.as_str())
    }

    /// Raw metadata stored for `key`, without the leading `;`.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.entry(key).and_then(|e| e.metadata.as_deref())
    }

    fn entry(&self, key: &str) -> Option<&BaggageEntry> {
        self.0.entries.iter().find(|e| e.key == key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.entries.iter().map(|e| e.key.as_str())
    }

    /// `(key, value, metadata)` triples in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Option<&str>)> {
        self.0
            .entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_str(), e.metadata.as_deref()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.entries.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.entries.is_empty()
    }

    /// Returns `true` if both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Baggage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// W3C `baggage` header value, computed once per instance.
    pub fn w3c_header(&self) -> &str {
        self.0.serialized.get_or_init(|| {
            self.0
                .entries
                .iter()
                .map(|entry| {
                    let mut pair: String = utf8_percent_encode(entry.key.trim(), FRAGMENT)
                        .chain(std::iter::once("="))
                        .chain(utf8_percent_encode(entry.value.trim(), FRAGMENT))
                        .collect();
                    if let Some(metadata) = entry.metadata.as_deref().map(str::trim) {
                        if !metadata.is_empty() {
                            pair.push(';');
                            pair.push_str(metadata);
                        }
                    }
                    pair
                })
                .collect::<Vec<String>>()
                .join(",")
        })
    }

    /// Writes the `baggage` header unless this baggage is empty.
    pub fn propagate_to_headers<T, C>(&self, carrier: &mut C, setter: &impl HeaderSetter<T, C>)
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        if !self.is_empty() {
            setter.set_header(BAGGAGE_HEADER_NAME, T::from_text(self.w3c_header()), carrier);
        }
    }
}

impl PartialEq for Baggage {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.entries == other.0.entries
    }
}

impl fmt::Debug for Baggage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.entries.iter().map(|e| (&e.key, &e.value)))
            .finish()
    }
}

/// Accumulates changes to a parent [`Baggage`].
#[derive(Debug)]
pub struct BaggageBuilder {
    parent: Baggage,
    entries: Option<Vec<BaggageEntry>>,
}

impl BaggageBuilder {
    /// Sets `key` to `value`, dropping metadata previously stored for it.
    pub fn put(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_entry(key.into(), Some(value.into()), None)
    }

    /// Sets `key` to `value` with raw metadata.
    pub fn put_with_metadata(
        self,
        key: impl Into<String>,
        value: impl Into<String>,
        metadata: impl Into<String>,
    ) -> Self {
        self.put_entry(key.into(), Some(value.into()), Some(metadata.into()))
    }

    /// Removes `key`.
    pub fn remove(self, key: impl Into<String>) -> Self {
        self.put_entry(key.into(), None, None)
    }

    fn current(&self) -> &[BaggageEntry] {
        self.entries
            .as_deref()
            .unwrap_or(self.parent.0.entries.as_slice())
    }

    fn put_entry(mut self, key: String, value: Option<String>, metadata: Option<String>) -> Self {
        let position = self.current().iter().position(|e| e.key == key);
        let Some(value) = value else {
            if let Some(position) = position {
                self.entries_mut().remove(position);
            }
            return self;
        };

        let entry = BaggageEntry {
            key,
            value,
            metadata: metadata.filter(|m| !m.is_empty()),
        };
        if position.is_some_and(|p| self.current()[p] == entry) {
            return self;
        }
        if position.is_none() && !is_key_valid(entry.key.as_bytes()) {
            apm_warn!(name: "Baggage.InvalidKey", key = entry.key);
            return self;
        }
        if position.is_none() && self.current().len() == MAX_KEY_VALUE_PAIRS {
            apm_warn!(name: "Baggage.TooManyEntries", key = entry.key, max = MAX_KEY_VALUE_PAIRS);
            return self;
        }
        let previous_len = position.map_or(0, |p| self.current()[p].content_len());
        let content_len: usize = self.current().iter().map(BaggageEntry::content_len).sum();
        if content_len - previous_len + entry.content_len() > MAX_LEN_OF_ALL_PAIRS {
            apm_warn!(name: "Baggage.TooLarge", key = entry.key, max = MAX_LEN_OF_ALL_PAIRS);
            return self;
        }
        match position {
            Some(position) => self.entries_mut()[position] = entry,
            None => self.entries_mut().push(entry),
        }
        self
    }

    fn entries_mut(&mut self) -> &mut Vec<BaggageEntry> {
        let parent = &self.parent;
        self.entries.get_or_insert_with(|| parent.0.entries.clone())
    }

    /// Adds the entries of a W3C `baggage` header value.
    pub fn with_w3c_header(mut self, header_value: &str) -> Self {
        for member in header_value.split(',') {
            let mut parts = member.splitn(2, ';');
            let name_and_value = parts.next().unwrap_or_default();
            let properties = parts.next();
            let Some((name, value)) = name_and_value.split_once('=') else {
                if !name_and_value.trim().is_empty() {
                    apm_warn!(
                        name: "Baggage.InvalidKeyValueFormat",
                        baggage_header = header_value,
                    );
                }
                continue;
            };
            let decoded_name = percent_decode_str(name).decode_utf8();
            let decoded_value = percent_decode_str(value).decode_utf8();
            let (Ok(name), Ok(value)) = (decoded_name, decoded_value) else {
                apm_warn!(name: "Baggage.InvalidUTF8", baggage_header = header_value);
                continue;
            };
            let metadata = properties
                .map(|props| {
                    props
                        .split(';')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .collect::<Vec<_>>()
                        .join(";")
                })
                .filter(|m| !m.is_empty());
            self = self.put_entry(
                name.trim().to_owned(),
                Some(value.trim().to_owned()),
                metadata,
            );
        }
        self
    }

    /// Adds the entries of all `baggage` headers found on a carrier.
    pub fn with_headers<T, C>(mut self, carrier: &C, getter: &impl HeaderGetter<T, C>) -> Self
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        let mut values = Vec::new();
        getter.for_each_header(BAGGAGE_HEADER_NAME, carrier, &mut |value: &T| {
            match value.as_text() {
                Some(text) => values.push(text.to_owned()),
                None => {
                    apm_warn!(name: "Baggage.InvalidUTF8", header = BAGGAGE_HEADER_NAME);
                }
            }
        });
        for value in values {
            self = self.with_w3c_header(&value);
        }
        self
    }

    /// Returns the parent instance if nothing changed, a new baggage otherwise.
    pub fn build(self) -> Baggage {
        match self.entries {
            Some(entries) if entries != self.parent.0.entries => Baggage(Arc::new(BaggageInner {
                entries,
                serialized: OnceLock::new(),
            })),
            _ => self.parent,
        }
    }
}

fn is_key_valid(key: &[u8]) -> bool {
    !key.is_empty()
        && key
            .iter()
            .all(|b| b.is_ascii_graphic() && !INVALID_ASCII_KEY_CHARS.contains(b))
}
