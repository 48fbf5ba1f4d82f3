//! `Range: bytes=<start>-<end>` handling for downloads.

/// Inclusive byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range header; serve the whole resource.
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Resolve a `Range` header against a resource of `size` bytes.
///
/// A missing start means 0 and a missing end means the last byte; an end
/// past the resource is clamped. Headers that do not parse, use another
/// unit, or ask for several ranges are ignored.
pub fn resolve_range(header: Option<&str>, size: u64) -> RangeRequest {
    let Some(raw) = header else {
        return RangeRequest::Full;
    };

    let Some((unit, spec)) = raw.trim().split_once('=') else {
        return RangeRequest::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
        return RangeRequest::Full;
    }

    let Some((start, end)) = spec.split_once('-') else {
        return RangeRequest::Full;
    };
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() && end.is_empty() {
        return RangeRequest::Full;
    }

    let start = if start.is_empty() {
        0
    } else {
        match start.parse::<u64>() {
            Ok(v) => v,
            Err(_) => return RangeRequest::Full,
        }
    };

    let requested_end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => return RangeRequest::Full,
        }
    };

    if size == 0 || start >= size {
        return RangeRequest::Unsatisfiable;
    }

    let end = requested_end.map_or(size - 1, |e| e.min(size - 1));
    if start > end {
        return RangeRequest::Unsatisfiable;
    }

    RangeRequest::Partial(ByteRange { start, end })
}
