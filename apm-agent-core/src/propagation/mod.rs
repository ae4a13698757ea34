//! # Header carriers
//!
//! The tracing core never knows what an HTTP request or a message looks like. Integrations
//! hand it a carrier together with an accessor that knows how to read or write header
//! values on that carrier. Values come in three representations:
//!
//! * text headers (`str`), e.g. HTTP headers
//! * UTF-8 encoded text in byte buffers (`[u8]`), e.g. message properties
//! * binary headers (`[u8]` in the binary `traceparent` layout), e.g. Kafka record headers
//!
//! Getters lend values out of the carrier, so reading a header never allocates.
//! Accessors for `HashMap` based carriers are provided by [`MapHeaders`] and for ordered
//! header lists, which may contain a header more than once, by [`HeaderList`].
use std::collections::HashMap;

pub mod baggage;

pub use baggage::{Baggage, BaggageBuilder, BAGGAGE_HEADER_NAME};

/// Name of the W3C trace context header.
pub const TRACE_PARENT_HEADER_NAME: &str = "traceparent";
/// Legacy header written by older agents of this vendor.
pub const ELASTIC_TRACE_PARENT_HEADER_NAME: &str = "elastic-apm-traceparent";
/// Name of the W3C trace state header.
pub const TRACESTATE_HEADER_NAME: &str = "tracestate";
/// Name of the binary trace context header.
pub const TRACE_PARENT_BINARY_HEADER_NAME: &str = "elasticapmtraceparent";

/// Textual trace context headers, in the order they are written.
pub const TRACE_TEXT_HEADER_NAMES: [&str; 3] = [
    TRACE_PARENT_HEADER_NAME,
    ELASTIC_TRACE_PARENT_HEADER_NAME,
    TRACESTATE_HEADER_NAME,
];

/// Reads header values of type `T` from a carrier of type `C`.
pub trait HeaderGetter<T: ?Sized, C: ?Sized> {
    /// Returns the first value of the header `name`, if any.
    fn first_header<'a>(&self, name: &str, carrier: &'a C) -> Option<&'a T>;

    /// Calls `consumer` for every value of the header `name`.
    fn for_each_header<'a>(&self, name: &str, carrier: &'a C, consumer: &mut dyn FnMut(&'a T)) {
        if let Some(value) = self.first_header(name, carrier) {
            consumer(value);
        }
    }
}

/// Writes header values of type `T` to a carrier of type `C`.
pub trait HeaderSetter<T: ?Sized, C: ?Sized> {
    /// Sets the header `name`, replacing previous values.
    fn set_header(&self, name: &str, value: &T, carrier: &mut C);
}

/// Removes headers from a carrier of type `C`.
pub trait HeaderRemover<C: ?Sized> {
    /// Removes all values of the header `name`.
    fn remove_header(&self, name: &str, carrier: &mut C);
}

/// Header value representations able to hold text headers.
///
/// Implemented for `str` and for UTF-8 encoded `[u8]` so that one parser serves both.
pub trait TextValue {
    /// Raw bytes of the value.
    fn as_text_bytes(&self) -> &[u8];

    /// The value as a string, `None` if it isn't valid UTF-8.
    fn as_text(&self) -> Option<&str>;

    /// Converts a string into this representation.
    fn from_text(text: &str) -> &Self;
}

impl TextValue for str {
    fn as_text_bytes(&self) -> &[u8] {
        self.as_bytes()
    }

    fn as_text(&self) -> Option<&str> {
        Some(self)
    }

    fn from_text(text: &str) -> &Self {
        text
    }
}

impl TextValue for [u8] {
    fn as_text_bytes(&self) -> &[u8] {
        self
    }

    fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(self).ok()
    }

    fn from_text(text: &str) -> &Self {
        text.as_bytes()
    }
}

/// Accessor for `HashMap` carriers with lowercase keys.
///
/// Lookups lowercase the requested name, writes store lowercase names.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapHeaders;

impl<V> HeaderGetter<V::Target, HashMap<String, V>> for MapHeaders
where
    V: std::ops::Deref,
{
    fn first_header<'a>(&self, name: &str, carrier: &'a HashMap<String, V>) -> Option<&'a V::Target> {
        carrier.get(&name.to_lowercase()).map(|value| &**value)
    }
}

impl HeaderSetter<str, HashMap<String, String>> for MapHeaders {
    fn set_header(&self, name: &str, value: &str, carrier: &mut HashMap<String, String>) {
        carrier.insert(name.to_lowercase(), value.to_owned());
    }
}

impl HeaderSetter<[u8], HashMap<String, Vec<u8>>> for MapHeaders {
    fn set_header(&self, name: &str, value: &[u8], carrier: &mut HashMap<String, Vec<u8>>) {
        carrier.insert(name.to_lowercase(), value.to_vec());
    }
}

impl<V> HeaderRemover<HashMap<String, V>> for MapHeaders {
    fn remove_header(&self, name: &str, carrier: &mut HashMap<String, V>) {
        carrier.remove(&name.to_lowercase());
    }
}

/// Accessor for ordered header lists that may repeat a header name.
///
/// Names are compared case-insensitively.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderList;

impl<V> HeaderGetter<V::Target, Vec<(String, V)>> for HeaderList
where
    V: std::ops::Deref,
{
    fn first_header<'a>(&self, name: &str, carrier: &'a Vec<(String, V)>) -> Option<&'a V::Target> {
        carrier
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| &**value)
    }

    fn for_each_header<'a>(
        &self,
        name: &str,
        carrier: &'a Vec<(String, V)>,
        consumer: &mut dyn FnMut(&'a V::Target),
    ) {
        carrier
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .for_each(|(_, value)| consumer(value));
    }
}

impl HeaderSetter<str, Vec<(String, String)>> for HeaderList {
    fn set_header(&self, name: &str, value: &str, carrier: &mut Vec<(String, String)>) {
        carrier.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        carrier.push((name.to_owned(), value.to_owned()));
    }
}

impl HeaderSetter<[u8], Vec<(String, Vec<u8>)>> for HeaderList {
    fn set_header(&self, name: &str, value: &[u8], carrier: &mut Vec<(String, Vec<u8>)>) {
        carrier.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        carrier.push((name.to_owned(), value.to_vec()));
    }
}

impl<V> HeaderRemover<Vec<(String, V)>> for HeaderList {
    fn remove_header(&self, name: &str, carrier: &mut Vec<(String, V)>) {
        carrier.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_headers_are_case_insensitive() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        MapHeaders.set_header("TraceParent", "value", &mut carrier);
        assert_eq!(
            HeaderGetter::<str, _>::first_header(&MapHeaders, "TRACEPARENT", &carrier),
            Some("value")
        );
        MapHeaders.remove_header("traceparent", &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn map_headers_over_bytes() {
        let mut carrier: HashMap<String, Vec<u8>> = HashMap::new();
        MapHeaders.set_header("elasticapmtraceparent", &[0u8, 1, 2][..], &mut carrier);
        let value: Option<&[u8]> = MapHeaders.first_header("elasticapmtraceparent", &carrier);
        assert_eq!(value, Some(&[0u8, 1, 2][..]));
    }

    #[test]
    fn header_list_iterates_repeated_headers() {
        let carrier = vec![
            ("tracestate".to_string(), "a=1".to_string()),
            ("other".to_string(), "x".to_string()),
            ("TraceState".to_string(), "b=2".to_string()),
        ];
        let mut values = Vec::new();
        HeaderGetter::<str, _>::for_each_header(&HeaderList, "tracestate", &carrier, &mut |v| {
            values.push(v)
        });
        assert_eq!(values, vec!["a=1", "b=2"]);
        assert_eq!(
            HeaderGetter::<str, _>::first_header(&HeaderList, "TRACESTATE", &carrier),
            Some("a=1")
        );
    }

    #[test]
    fn header_list_setter_replaces() {
        let mut carrier = vec![("traceparent".to_string(), "old".to_string())];
        HeaderList.set_header("Traceparent", "new", &mut carrier);
        assert_eq!(carrier, vec![("Traceparent".to_string(), "new".to_string())]);
        HeaderList.remove_header("TRACEPARENT", &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn text_values() {
        assert_eq!(<[u8] as TextValue>::from_text("abc"), b"abc");
        assert_eq!(TextValue::as_text(&b"abc"[..]), Some("abc"));
        assert_eq!(TextValue::as_text(&[0xffu8][..]), None);
    }
}
