use crate::apm_warn;
use crate::error::TraceStateError;

const DEFAULT_SIZE_LIMIT: usize = 4096;
const VENDOR_SEPARATOR: char = ',';
const ENTRY_SEPARATOR: char = ';';
const VENDOR_PREFIX: &str = "es=";
const SAMPLE_RATE_PREFIX: &str = "s:";

/// Rounds a sample rate to three significant digits.
///
/// Positive rates too small to be represented that way are kept at the smallest
/// representable step so that a sampled trace never advertises a zero rate.
pub fn round_sample_rate(rate: f64) -> f64 {
    if rate <= 0.0 || rate.is_nan() {
        return 0.0;
    }
    if rate >= 1.0 {
        return 1.0;
    }
    let magnitude = rate.log10().floor() as i32;
    let factor = 10f64.powi(2 - magnitude);
    let rounded = (rate * factor).round() / factor;
    if rounded > 0.0 {
        rounded
    } else {
        1.0 / factor
    }
}

/// The `tracestate` carried by a trace context.
///
/// Incoming header values are kept verbatim and in order. The only entry interpreted here
/// is this agent's vendor entry, `es=s:<rate>[;k:v...]`, which records the sample rate used
/// at the root of the trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceState {
    size_limit: usize,
    sample_rate: Option<f64>,
    headers: Vec<String>,
}

impl Default for TraceState {
    fn default() -> Self {
        TraceState {
            size_limit: DEFAULT_SIZE_LIMIT,
            sample_rate: None,
            headers: Vec::with_capacity(1),
        }
    }
}

impl TraceState {
    /// Empty trace state with the given max length of the outgoing header.
    pub fn with_size_limit(size_limit: usize) -> Self {
        TraceState {
            size_limit,
            ..Default::default()
        }
    }

    /// Adds a received `tracestate` header value.
    ///
    /// An invalid vendor entry, or one received after a rate has already been set, is
    /// removed from the value; a valid rate needing rounding is rewritten.
    pub fn add_text_header(&mut self, header_value: &str) {
        let Some(vendor_start) = find_vendor_entry(header_value) else {
            self.push_header(header_value.to_owned());
            return;
        };
        let vendor_end = header_value[vendor_start..]
            .find(VENDOR_SEPARATOR)
            .map_or(header_value.len(), |i| vendor_start + i);
        let vendor_value = &header_value[vendor_start + VENDOR_PREFIX.len()..vendor_end];

        let raw_rate = vendor_value
            .split(ENTRY_SEPARATOR)
            .find_map(|entry| entry.trim().strip_prefix(SAMPLE_RATE_PREFIX));
        let rate = raw_rate.and_then(|raw| raw.trim().parse::<f64>().ok());

        let rewritten = match rate {
            Some(rate) if (0.0..=1.0).contains(&rate) => {
                if let Some(current) = self.sample_rate {
                    apm_warn!(
                        name: "TraceState.SampleRateAlreadySet",
                        message = "sample rate from header ignored",
                        current = current,
                        ignored = rate,
                    );
                    remove_vendor_entry(header_value, vendor_start, vendor_end)
                } else {
                    let rounded = round_sample_rate(rate);
                    self.sample_rate = Some(rounded);
                    if rounded == rate {
                        header_value.to_owned()
                    } else {
                        rewrite_sample_rate(header_value, vendor_start, vendor_end, rounded)
                    }
                }
            }
            _ => {
                apm_warn!(
                    name: "TraceState.InvalidSampleRate",
                    header = header_value,
                );
                remove_vendor_entry(header_value, vendor_start, vendor_end)
            }
        };
        self.push_header(rewritten);
    }

    fn push_header(&mut self, header_value: String) {
        if !header_value.is_empty() {
            self.headers.push(header_value);
        }
    }

    /// Records the sample rate decided locally together with its vendor header value.
    pub fn set(&mut self, rate: f64, header_value: impl Into<String>) -> Result<(), TraceStateError> {
        if let Some(current) = self.sample_rate {
            return Err(TraceStateError::SampleRateAlreadySet(current));
        }
        self.sample_rate = Some(rate);
        self.headers.push(header_value.into());
        Ok(())
    }

    /// Vendor header value for a sample rate, e.g. `es=s:0.5`.
    pub fn header_value(rate: f64) -> Result<String, TraceStateError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(TraceStateError::InvalidSampleRate(rate));
        }
        Ok(format!("{VENDOR_PREFIX}{SAMPLE_RATE_PREFIX}{}", round_sample_rate(rate)))
    }

    /// The sample rate found in the vendor entry, if any.
    pub fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    /// Header values in the order they were added.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Max length of the outgoing header.
    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Changes the max length; ignored once headers have been added.
    pub fn set_size_limit(&mut self, size_limit: usize) {
        if self.headers.is_empty() {
            self.size_limit = size_limit;
        } else {
            apm_warn!(
                name: "TraceState.SizeLimitChangeIgnored",
                message = "can't change size limit once headers have been added",
                size_limit = size_limit,
            );
        }
    }

    /// Returns `true` if no header has been added.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Joins the header values into one outgoing `tracestate` value within the size limit.
    ///
    /// Values that don't fit are dropped entirely unless they contain several vendor
    /// entries, in which case the leading entries that fit are kept.
    pub fn to_text_header(&self) -> Option<String> {
        if let [single] = self.headers.as_slice() {
            if single.len() <= self.size_limit {
                return Some(single.clone());
            }
        }
        let mut buffer = String::new();
        for header_value in &self.headers {
            append_within_limit(header_value, &mut buffer, self.size_limit);
        }
        if buffer.is_empty() {
            None
        } else {
            Some(buffer)
        }
    }

    /// Copies everything from `other`, reusing the allocated storage.
    pub fn copy_from(&mut self, other: &TraceState) {
        self.size_limit = other.size_limit;
        self.sample_rate = other.sample_rate;
        self.headers.clone_from(&other.headers);
    }

    /// Clears the state for reuse with a new size limit.
    pub fn reset(&mut self, size_limit: usize) {
        self.size_limit = size_limit;
        self.sample_rate = None;
        self.headers.clear();
    }

    /// Returns `true` if a raw `tracestate` value carries this agent's vendor entry.
    pub fn includes_vendor(header_value: &str) -> bool {
        find_vendor_entry(header_value).is_some()
    }
}

fn find_vendor_entry(header_value: &str) -> Option<usize> {
    let mut start = 0;
    for entry in header_value.split(VENDOR_SEPARATOR) {
        let leading_ws = entry.len() - entry.trim_start().len();
        if entry[leading_ws..].starts_with(VENDOR_PREFIX) {
            return Some(start + leading_ws);
        }
        start += entry.len() + 1;
    }
    None
}

fn remove_vendor_entry(header_value: &str, vendor_start: usize, vendor_end: usize) -> String {
    let before = header_value[..vendor_start].trim_end_matches(|c: char| c == VENDOR_SEPARATOR || c.is_whitespace());
    let after = header_value[vendor_end..].trim_start_matches(|c: char| c == VENDOR_SEPARATOR || c.is_whitespace());
    match (before.is_empty(), after.is_empty()) {
        (false, false) => format!("{before}{VENDOR_SEPARATOR}{after}"),
        (false, true) => before.to_owned(),
        _ => after.to_owned(),
    }
}

fn rewrite_sample_rate(header_value: &str, vendor_start: usize, vendor_end: usize, rounded: f64) -> String {
    let vendor_value = &header_value[vendor_start + VENDOR_PREFIX.len()..vendor_end];
    let entries = vendor_value
        .split(ENTRY_SEPARATOR)
        .map(|entry| {
            if entry.trim().starts_with(SAMPLE_RATE_PREFIX) {
                format!("{SAMPLE_RATE_PREFIX}{rounded}")
            } else {
                entry.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(";");
    format!(
        "{}{VENDOR_PREFIX}{entries}{}",
        &header_value[..vendor_start],
        &header_value[vendor_end..]
    )
}

fn append_within_limit(header_value: &str, buffer: &mut String, size_limit: usize) {
    let needs_comma = !buffer.is_empty();
    let required = header_value.len() + usize::from(needs_comma);
    if buffer.len() + required <= size_limit {
        if needs_comma {
            buffer.push(VENDOR_SEPARATOR);
        }
        buffer.push_str(header_value);
        return;
    }
    // only complete vendor entries may be kept
    let end = header_value
        .char_indices()
        .rev()
        .find(|&(i, c)| c == VENDOR_SEPARATOR && buffer.len() + i < size_limit)
        .map_or(0, |(i, _)| i);
    if end > 0 {
        if needs_comma {
            buffer.push(VENDOR_SEPARATOR);
        }
        buffer.push_str(&header_value[..end]);
    }
}
