//! Responses produced by handlers, middleware and the error renderer
//!
//! Bodies are either buffered ([`Response::body`]) or a [`FileRegion`] that
//! the connection streams from disk in chunks.

use bytes::Bytes;
use smallvec::SmallVec;
use std::path::PathBuf;

pub use http::StatusCode;

/// Reason phrase for a status, `"Unknown"` for unregistered codes
pub fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

/// Part of a file sent without loading it into memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegion {
    pub path: PathBuf,
    /// First byte sent
    pub offset: u64,
    /// Number of bytes sent
    pub len: u64,
}

impl FileRegion {
    /// The whole file
    pub fn whole(path: impl Into<PathBuf>, len: u64) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            len,
        }
    }
}

/// An HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    /// Header pairs in insertion order; names compare case-insensitively
    pub headers: SmallVec<[(String, String); 8]>,
    /// Buffered body, ignored when `file` is set
    pub body: Bytes,
    /// Streamed body
    pub file: Option<FileRegion>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: SmallVec::new(),
            body: Bytes::new(),
            file: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    fn typed(content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut res = Self::ok();
        res.headers.push(("content-type".to_string(), content_type.to_string()));
        res.body = body.into();
        res
    }

    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::typed("application/json", body)
    }

    pub fn text(body: impl Into<Bytes>) -> Self {
        Self::typed("text/plain; charset=utf-8", body)
    }

    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::typed("text/html; charset=utf-8", body)
    }

    /// 308 when `permanent`, 307 otherwise
    pub fn redirect(location: &str, permanent: bool) -> Self {
        let status = if permanent {
            StatusCode::PERMANENT_REDIRECT
        } else {
            StatusCode::TEMPORARY_REDIRECT
        };
        let mut res = Self::new(status);
        res.add_header("location", location);
        res
    }

    /// First value of a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header, keeping existing values with the same name
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Set a header, replacing existing values with the same name
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Buffered body as UTF-8
    pub fn body_string(&self) -> Option<String> {
        String::from_utf8(self.body.to_vec()).ok()
    }

    /// True when the body is streamed from disk
    pub fn is_streamed(&self) -> bool {
        self.file.is_some()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}

/// Chained construction of a [`Response`]
#[derive(Debug)]
pub struct ResponseBuilder(Response);

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self(Response::new(status))
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.0.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.add_header(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.0.body = body.into();
        self.0.file = None;
        self
    }

    /// Stream the body from a file region
    pub fn file(mut self, region: FileRegion) -> Self {
        self.0.body = Bytes::new();
        self.0.file = Some(region);
        self
    }

    pub fn build(self) -> Response {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_phrase() {
        assert_eq!(reason_phrase(StatusCode::NOT_FOUND), "Not Found");
        assert_eq!(reason_phrase(StatusCode::IM_A_TEAPOT), "I'm a teapot");
        assert_eq!(reason_phrase(StatusCode::from_u16(599).unwrap()), "Unknown");
    }

    #[test]
    fn test_response_json() {
        let res = Response::json(r#"{"foo":"bar"}"#);
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.content_type(), Some("application/json"));
        assert!(!res.is_streamed());
    }

    #[test]
    fn test_set_header_replaces() {
        let mut res = Response::text("hello");
        res.add_header("X-Test-Header", "a");
        res.add_header("x-test-header", "b");
        res.set_header("X-Test-Header", "c");

        let values: Vec<_> = res
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("x-test-header"))
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["c"]);
    }

    #[test]
    fn test_file_and_body_are_exclusive() {
        let res = ResponseBuilder::new(StatusCode::OK)
            .body("buffered")
            .file(FileRegion::whole("/tmp/x", 10))
            .build();
        assert!(res.is_streamed());
        assert!(res.body.is_empty());

        let res = ResponseBuilder::new(StatusCode::OK)
            .file(FileRegion::whole("/tmp/x", 10))
            .body("buffered")
            .build();
        assert!(!res.is_streamed());
        assert_eq!(res.body_string().as_deref(), Some("buffered"));
    }
}
