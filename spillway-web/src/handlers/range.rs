//! HTTP `Range` header resolution.
//!
//! Only the single `bytes=<start>-[<end>]` form is supported. Suffix
//! ranges (`bytes=-N`), multipart ranges, and unparseable headers are all
//! treated as absent; a parseable range that cannot be satisfied against
//! the file size maps to `416 Requested Range Not Satisfiable`.

use axum::http::{HeaderMap, header};

/// Outcome of resolving a `Range` header against a known file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No usable range header: serve the whole file with status 200.
    Full,
    /// Valid range, inclusive on both ends: status 206.
    Partial {
        /// First byte offset.
        start: u64,
        /// Last byte offset, clamped to the file size.
        end: u64,
    },
    /// Syntactically valid but unsatisfiable for this size: status 416.
    Unsatisfiable,
}

impl RangeSpec {
    /// Number of body bytes this range will produce.
    pub fn content_length(&self, size: u64) -> u64 {
        match self {
            RangeSpec::Full => size,
            RangeSpec::Partial { start, end } => end - start + 1,
            RangeSpec::Unsatisfiable => 0,
        }
    }
}

/// Resolves the request's `Range` header against the file size.
pub fn resolve_range(headers: &HeaderMap, size: u64) -> RangeSpec {
    let Some(raw) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return RangeSpec::Full;
    };
    let Some(spec) = raw.strip_prefix("bytes=") else {
        return RangeSpec::Full;
    };
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeSpec::Full;
    };
    // An empty start would be a suffix range; unsupported, treated as
    // absent like any other unparseable form.
    let Ok(start) = start_str.parse::<u64>() else {
        return RangeSpec::Full;
    };
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        match end_str.parse::<u64>() {
            Ok(end) => end.min(size.saturating_sub(1)),
            Err(_) => return RangeSpec::Full,
        }
    };
    if start >= size || start > end {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Partial { start, end }
}
