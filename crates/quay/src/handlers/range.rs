//! HTTP Range requests (RFC 7233), single range only

/// A single byte range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Outcome of evaluating a `Range` header against a file
#[derive(Debug, PartialEq, Eq)]
pub enum RangeRequest {
    /// Serve the whole file (no header, unsupported unit, multiple ranges)
    Full,
    Partial(ByteRange),
    /// Well-formed but outside the file
    Unsatisfiable,
}

/// `Content-Range` value for a 416 response
pub fn unsatisfiable_range(total: u64) -> String {
    format!("bytes */{}", total)
}

/// Evaluate a `Range` header
///
/// Format: `bytes=0-499`, `bytes=-500` (last 500), `bytes=500-` (500 to end)
pub fn evaluate(header: Option<&str>, file_size: u64) -> RangeRequest {
    let Some(header) = header else {
        return RangeRequest::Full;
    };
    let Some((unit, spec)) = header.split_once('=') else {
        return RangeRequest::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return RangeRequest::Full;
    }

    let specs: Vec<&str> = spec.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    // multipart/byteranges responses are not produced
    if specs.len() != 1 {
        return RangeRequest::Full;
    }

    let Some((start_str, end_str)) = specs[0].split_once('-') else {
        return RangeRequest::Full;
    };
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    let parsed = if start_str.is_empty() {
        // Suffix range
        match end_str.parse::<u64>() {
            Ok(0) => return RangeRequest::Unsatisfiable,
            Ok(suffix) if file_size > 0 => Some((file_size.saturating_sub(suffix), file_size - 1)),
            Ok(_) => return RangeRequest::Unsatisfiable,
            Err(_) => None,
        }
    } else {
        match (start_str.parse::<u64>(), end_str) {
            (Ok(start), "") => Some((start, file_size.saturating_sub(1))),
            (Ok(start), end) => match end.parse::<u64>() {
                Ok(end) if end >= start => Some((start, end.min(file_size.saturating_sub(1)))),
                _ => None,
            },
            _ => None,
        }
    };

    match parsed {
        // Syntactically invalid ranges are ignored
        None => RangeRequest::Full,
        Some((start, _)) if start >= file_size => RangeRequest::Unsatisfiable,
        Some((start, end)) => RangeRequest::Partial(ByteRange { start, end }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(start: u64, end: u64) -> RangeRequest {
        RangeRequest::Partial(ByteRange { start, end })
    }

    #[test]
    fn test_forms() {
        assert_eq!(evaluate(Some("bytes=0-499"), 1000), partial(0, 499));
        assert_eq!(evaluate(Some("bytes=500-"), 1000), partial(500, 999));
        assert_eq!(evaluate(Some("bytes=-200"), 1000), partial(800, 999));
        assert_eq!(evaluate(Some("bytes=-2000"), 1000), partial(0, 999));
        assert_eq!(evaluate(Some("bytes=900-5000"), 1000), partial(900, 999));
    }

    #[test]
    fn test_full_fallbacks() {
        assert_eq!(evaluate(None, 1000), RangeRequest::Full);
        assert_eq!(evaluate(Some("items=0-1"), 1000), RangeRequest::Full);
        assert_eq!(evaluate(Some("bytes=0-1,5-9"), 1000), RangeRequest::Full);
        assert_eq!(evaluate(Some("bytes=9-1"), 1000), RangeRequest::Full);
        assert_eq!(evaluate(Some("bytes=abc"), 1000), RangeRequest::Full);
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(evaluate(Some("bytes=1000-"), 1000), RangeRequest::Unsatisfiable);
        assert_eq!(evaluate(Some("bytes=0-0"), 0), RangeRequest::Unsatisfiable);
        assert_eq!(evaluate(Some("bytes=-0"), 1000), RangeRequest::Unsatisfiable);
        assert_eq!(unsatisfiable_range(1000), "bytes */1000");
    }

    #[test]
    fn test_content_range() {
        let range = ByteRange { start: 0, end: 3 };
        assert_eq!(range.length(), 4);
        assert_eq!(range.content_range(4), "bytes 0-3/4");
    }
}
