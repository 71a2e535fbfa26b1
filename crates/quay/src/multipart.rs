//! `multipart/form-data` decoding
//!
//! Bodies are decoded as they arrive. Parts larger than
//! [`MultipartConfig::file_size_threshold`] are spilled to a temporary file
//! under [`MultipartConfig::location`]; the file is removed when the part is
//! dropped.

use crate::StatusCode;
use bytes::{Buf, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

static SPILL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Multipart limits for a handler
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Directory spilled parts are written to
    pub location: PathBuf,
    /// Parts larger than this many bytes are written to disk
    pub file_size_threshold: usize,
    /// Largest accepted part
    pub max_file_size: Option<u64>,
    /// Largest accepted request body
    pub max_request_size: Option<u64>,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            location: std::env::temp_dir(),
            file_size_threshold: 0,
            max_file_size: None,
            max_request_size: None,
        }
    }
}

impl MultipartConfig {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    pub fn file_size_threshold(mut self, bytes: usize) -> Self {
        self.file_size_threshold = bytes;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn max_request_size(mut self, bytes: u64) -> Self {
        self.max_request_size = Some(bytes);
        self
    }
}

/// Multipart decoding failures
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("Content type '{0}' is not multipart/form-data")]
    NotMultipart(String),

    #[error("Missing multipart boundary")]
    MissingBoundary,

    #[error("Multipart request contains no parts")]
    Empty,

    #[error("Malformed multipart body: {0}")]
    Malformed(&'static str),

    #[error("Part '{name}' is {size} bytes, limit is {limit}")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("Request is {size} bytes, limit is {limit}")]
    RequestTooLarge { size: u64, limit: u64 },

    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("Failed to store part: {0}")]
    Io(#[from] std::io::Error),
}

impl MultipartError {
    /// HTTP status reported to the client
    pub fn status(&self) -> StatusCode {
        match self {
            MultipartError::FileTooLarge { .. } | MultipartError::RequestTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            MultipartError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Part contents
#[derive(Debug)]
pub enum PartData {
    Memory(Bytes),
    File(SpilledFile),
}

/// A part written to disk, deleted on drop
#[derive(Debug)]
pub struct SpilledFile {
    path: PathBuf,
    size: u64,
}

impl SpilledFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpilledFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove spilled part");
            }
        }
    }
}

/// One decoded part
#[derive(Debug)]
pub struct Part {
    /// Form field name
    pub name: String,
    /// Submitted file name, for file fields
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub data: PartData,
}

impl Part {
    /// Size in bytes
    pub fn size(&self) -> u64 {
        match &self.data {
            PartData::Memory(b) => b.len() as u64,
            PartData::File(f) => f.size,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.data, PartData::Memory(_))
    }

    /// Path of the spilled file, if on disk
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            PartData::Memory(_) => None,
            PartData::File(f) => Some(f.path()),
        }
    }

    /// Read the whole part
    pub async fn bytes(&self) -> std::io::Result<Bytes> {
        match &self.data {
            PartData::Memory(b) => Ok(b.clone()),
            PartData::File(f) => tokio::fs::read(&f.path).await.map(Bytes::from),
        }
    }

    /// Read the whole part as UTF-8 text
    pub async fn text(&self) -> std::io::Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Get a part header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extract the boundary from a `multipart/form-data` content type
pub fn boundary(content_type: Option<&str>) -> Result<String, MultipartError> {
    let content_type = content_type.unwrap_or("");
    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or("").trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(MultipartError::NotMultipart(content_type.to_string()));
    }

    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or(MultipartError::MissingBoundary)
}

/// Decode a buffered request body into parts
pub async fn decode(
    content_type: Option<&str>,
    body: &Bytes,
    config: &MultipartConfig,
) -> Result<Vec<Part>, MultipartError> {
    decode_body(content_type, Full::new(body.clone()), config).await
}

/// Decode a request body into parts as it arrives
///
/// Only the bytes of the part being read are held in memory, and a part is
/// moved to disk as soon as it grows past the spill threshold.
pub async fn decode_body<B>(
    content_type: Option<&str>,
    body: B,
    config: &MultipartConfig,
) -> Result<Vec<Part>, MultipartError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let boundary = boundary(content_type)?;

    if let (Some(limit), Some(size)) = (config.max_request_size, body.size_hint().exact()) {
        if size > limit {
            return Err(MultipartError::RequestTooLarge { size, limit });
        }
    }

    let opening = format!("--{}", boundary);
    let delimiter = format!("\r\n--{}", boundary);
    let mut reader = Reader::new(body, config.max_request_size);

    reader.skip_preamble(opening.as_bytes()).await?;
    let mut parts = Vec::new();
    while reader.next_part().await? {
        let headers = reader.read_headers().await?;
        parts.push(reader.read_part(headers, delimiter.as_bytes(), config).await?);
    }

    if parts.is_empty() {
        return Err(MultipartError::Empty);
    }
    Ok(parts)
}

/// Largest header block accepted for a single part
const MAX_HEADER_BLOCK: usize = 16 * 1024;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Buffered view over a body being received
struct Reader<B> {
    body: Pin<Box<B>>,
    buf: BytesMut,
    received: u64,
    limit: Option<u64>,
    eof: bool,
}

impl<B> Reader<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    fn new(body: B, limit: Option<u64>) -> Self {
        Self {
            body: Box::pin(body),
            buf: BytesMut::new(),
            received: 0,
            limit,
            eof: false,
        }
    }

    /// Append the next data frame to the buffer; false at end of body
    async fn fill(&mut self) -> Result<bool, MultipartError> {
        while !self.eof {
            match self.body.frame().await {
                None => self.eof = true,
                Some(Err(e)) => return Err(MultipartError::Body(e.to_string())),
                Some(Ok(frame)) => {
                    // trailers carry no content
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    self.received += data.len() as u64;
                    if let Some(limit) = self.limit {
                        if self.received > limit {
                            return Err(MultipartError::RequestTooLarge {
                                size: self.received,
                                limit,
                            });
                        }
                    }
                    if !data.is_empty() {
                        self.buf.extend_from_slice(&data);
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Buffer at least `n` bytes; false if the body ends first
    async fn want(&mut self, n: usize) -> Result<bool, MultipartError> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Discard everything up to and including the opening boundary
    async fn skip_preamble(&mut self, opening: &[u8]) -> Result<(), MultipartError> {
        let mut blank = true;
        loop {
            if let Some(at) = find(&self.buf, opening) {
                self.buf.advance(at + opening.len());
                return Ok(());
            }
            // keep a tail that may hold the start of the boundary
            let seen = self.buf.len().saturating_sub(opening.len() - 1);
            blank &= self.buf[..seen].iter().all(u8::is_ascii_whitespace);
            self.buf.advance(seen);

            if !self.fill().await? {
                blank &= self.buf.iter().all(u8::is_ascii_whitespace);
                return Err(if blank {
                    MultipartError::Empty
                } else {
                    MultipartError::Malformed("missing opening boundary")
                });
            }
        }
    }

    /// Consume what follows a boundary; false at the closing `--`
    async fn next_part(&mut self) -> Result<bool, MultipartError> {
        self.want(2).await?;
        if self.buf.starts_with(b"--") {
            return Ok(false);
        }
        // transport padding after the boundary
        loop {
            let padding = self.buf.iter().take_while(|b| **b == b' ' || **b == b'\t').count();
            self.buf.advance(padding);
            if !self.buf.is_empty() || !self.fill().await? {
                break;
            }
        }
        if !self.want(2).await? || !self.buf.starts_with(b"\r\n") {
            return Err(MultipartError::Malformed("boundary not followed by CRLF"));
        }
        self.buf.advance(2);
        Ok(true)
    }

    async fn read_headers(&mut self) -> Result<Vec<(String, String)>, MultipartError> {
        if !self.want(2).await? {
            return Err(MultipartError::Malformed("unterminated part headers"));
        }
        if self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
            return Ok(Vec::new());
        }

        let mut searched = 0;
        loop {
            if let Some(end) = find(&self.buf[searched..], b"\r\n\r\n") {
                let end = searched + end;
                let block = self.buf.split_to(end + 4);
                return parse_headers(&block[..end]);
            }
            if self.buf.len() > MAX_HEADER_BLOCK {
                return Err(MultipartError::Malformed("part headers too large"));
            }
            searched = self.buf.len().saturating_sub(3);
            if !self.fill().await? {
                return Err(MultipartError::Malformed("unterminated part headers"));
            }
        }
    }

    /// Stream part content up to the next delimiter into memory or disk
    async fn read_part(
        &mut self,
        headers: Vec<(String, String)>,
        delimiter: &[u8],
        config: &MultipartConfig,
    ) -> Result<Part, MultipartError> {
        let header = |n: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(n))
                .map(|(_, v)| v.clone())
        };
        let (name, filename) = header("content-disposition")
            .map(|d| disposition(&d))
            .unwrap_or((None, None));
        let name = name.ok_or(MultipartError::Malformed("part has no field name"))?;
        let content_type = header("content-type");

        let mut sink = Sink::new(&name, config);
        loop {
            if let Some(at) = find(&self.buf, delimiter) {
                sink.write(self.buf.split_to(at).freeze()).await?;
                self.buf.advance(delimiter.len());
                break;
            }
            // bytes that cannot be the start of a delimiter
            let settled = self.buf.len().saturating_sub(delimiter.len() - 1);
            if settled > 0 {
                sink.write(self.buf.split_to(settled).freeze()).await?;
            }
            if !self.fill().await? {
                return Err(MultipartError::Malformed("missing closing boundary"));
            }
        }
        let data = sink.finish().await?;

        Ok(Part {
            name,
            filename,
            content_type,
            headers,
            data,
        })
    }
}

enum Store {
    Memory(BytesMut),
    File(tokio::fs::File, SpilledFile),
}

/// Destination of one part's content
struct Sink<'a> {
    name: &'a str,
    config: &'a MultipartConfig,
    size: u64,
    store: Store,
}

impl<'a> Sink<'a> {
    fn new(name: &'a str, config: &'a MultipartConfig) -> Self {
        Self {
            name,
            config,
            size: 0,
            store: Store::Memory(BytesMut::new()),
        }
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), MultipartError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.size += chunk.len() as u64;
        if let Some(limit) = self.config.max_file_size {
            if self.size > limit {
                return Err(MultipartError::FileTooLarge {
                    name: self.name.to_string(),
                    size: self.size,
                    limit,
                });
            }
        }

        if let Store::Memory(buf) = &mut self.store {
            if self.size <= self.config.file_size_threshold as u64 {
                buf.extend_from_slice(&chunk);
                return Ok(());
            }
            let held = std::mem::take(buf);
            let spilled = SpilledFile {
                path: self.config.location.join(format!(
                    "quay-upload-{}-{}.part",
                    std::process::id(),
                    SPILL_COUNTER.fetch_add(1, Ordering::Relaxed)
                )),
                size: 0,
            };
            let mut file = tokio::fs::File::create(&spilled.path).await?;
            file.write_all(&held).await?;
            self.store = Store::File(file, spilled);
        }
        if let Store::File(file, _) = &mut self.store {
            file.write_all(&chunk).await?;
        }
        Ok(())
    }

    async fn finish(self) -> Result<PartData, MultipartError> {
        match self.store {
            Store::Memory(buf) => Ok(PartData::Memory(buf.freeze())),
            Store::File(mut file, mut spilled) => {
                file.flush().await?;
                spilled.size = self.size;
                Ok(PartData::File(spilled))
            }
        }
    }
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>, MultipartError> {
    let text = std::str::from_utf8(block).map_err(|_| MultipartError::Malformed("part headers are not UTF-8"))?;
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or(MultipartError::Malformed("invalid part header"))
        })
        .collect()
}

/// `form-data; name="field"; filename="a.txt"` -> (name, filename)
fn disposition(value: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for param in value.split(';').skip(1) {
        let Some((key, val)) = param.split_once('=') else {
            continue;
        };
        let val = val.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(val),
            "filename" => filename = Some(val),
            _ => {}
        }
    }
    (name, filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::StreamBody;
    use hyper::body::Frame;
    use std::convert::Infallible;

    const CT: &str = "multipart/form-data; boundary=XyZ";

    fn body(parts: &[(&str, Option<&str>, &str)]) -> Bytes {
        let mut out = String::new();
        for (name, filename, content) in parts {
            out.push_str("--XyZ\r\n");
            match filename {
                Some(f) => out.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: text/plain\r\n",
                    name, f
                )),
                None => out.push_str(&format!("Content-Disposition: form-data; name=\"{}\"\r\n", name)),
            }
            out.push_str("\r\n");
            out.push_str(content);
            out.push_str("\r\n");
        }
        out.push_str("--XyZ--\r\n");
        Bytes::from(out)
    }

    #[test]
    fn test_boundary() {
        assert_eq!(boundary(Some(CT)).unwrap(), "XyZ");
        assert_eq!(
            boundary(Some("Multipart/Form-Data; charset=utf-8; boundary=\"a b\"")).unwrap(),
            "a b"
        );
        assert!(matches!(boundary(Some("text/plain")), Err(MultipartError::NotMultipart(_))));
        assert!(matches!(boundary(None), Err(MultipartError::NotMultipart(_))));
        assert!(matches!(
            boundary(Some("multipart/form-data")),
            Err(MultipartError::MissingBoundary)
        ));
    }

    #[tokio::test]
    async fn test_decode_in_memory() {
        let config = MultipartConfig::default().file_size_threshold(1024);
        let parts = decode(
            Some(CT),
            &body(&[("field", None, "value"), ("upload", Some("a.txt"), "line1\r\nline2")]),
            &config,
        )
        .await
        .unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "field");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].text().await.unwrap(), "value");

        assert_eq!(parts[1].filename.as_deref(), Some("a.txt"));
        assert_eq!(parts[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(parts[1].text().await.unwrap(), "line1\r\nline2");
        assert!(parts[1].is_in_memory());
    }

    #[tokio::test]
    async fn test_spill_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let config = MultipartConfig::new(dir.path()).file_size_threshold(4);

        let parts = decode(Some(CT), &body(&[("big", Some("b.bin"), "0123456789"), ("s", None, "ok")]), &config)
            .await
            .unwrap();

        let path = parts[0].path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
        assert_eq!(parts[0].size(), 10);
        assert_eq!(parts[0].text().await.unwrap(), "0123456789");
        assert!(parts[1].is_in_memory());

        drop(parts);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_limits() {
        let content = body(&[("f", Some("f.txt"), "0123456789")]);

        let config = MultipartConfig::default().max_file_size(5);
        let err = decode(Some(CT), &content, &config).await.unwrap_err();
        assert!(matches!(err, MultipartError::FileTooLarge { size: 10, limit: 5, .. }));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let config = MultipartConfig::default().max_request_size(8);
        let err = decode(Some(CT), &content, &config).await.unwrap_err();
        assert!(matches!(err, MultipartError::RequestTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_empty_and_malformed() {
        let config = MultipartConfig::default();

        let err = decode(Some(CT), &Bytes::new(), &config).await.unwrap_err();
        assert!(matches!(err, MultipartError::Empty));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = decode(Some(CT), &Bytes::from_static(b"--XyZ--\r\n"), &config).await.unwrap_err();
        assert!(matches!(err, MultipartError::Empty));

        let err = decode(Some(CT), &Bytes::from_static(b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, MultipartError::Malformed(_)));

        let err = decode(Some("application/json"), &Bytes::from_static(b"{}"), &config).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    /// Body delivered in fixed-size frames with no length hint
    fn chunked(content: &Bytes, size: usize) -> StreamBody<impl futures_util::stream::Stream<Item = Result<Frame<Bytes>, Infallible>>> {
        let frames: Vec<_> = content
            .chunks(size)
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        StreamBody::new(futures_util::stream::iter(frames))
    }

    #[tokio::test]
    async fn test_decode_across_frame_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let config = MultipartConfig::new(dir.path()).file_size_threshold(16);
        let content = "abcdefghij".repeat(10);
        let raw = body(&[("small", None, "tiny"), ("big", Some("big.txt"), &content), ("last", None, "")]);

        // every frame size splits boundaries and headers somewhere different
        for size in [1, 3, 7, 64] {
            let parts = decode_body(Some(CT), chunked(&raw, size), &config).await.unwrap();
            assert_eq!(parts.len(), 3, "frame size {}", size);
            assert_eq!(parts[0].text().await.unwrap(), "tiny");
            assert!(parts[0].is_in_memory());
            assert!(!parts[1].is_in_memory());
            assert_eq!(parts[1].size(), 100);
            assert_eq!(parts[1].text().await.unwrap(), content);
            assert_eq!(parts[2].name, "last");
            assert_eq!(parts[2].size(), 0);
        }
    }

    #[tokio::test]
    async fn test_streamed_request_limit() {
        let content = "x".repeat(4096);
        let raw = body(&[("f", Some("f.txt"), &content)]);
        let config = MultipartConfig::default().file_size_threshold(usize::MAX).max_request_size(1024);

        let err = decode_body(Some(CT), chunked(&raw, 256), &config).await.unwrap_err();
        match err {
            MultipartError::RequestTooLarge { size, limit } => {
                assert_eq!(limit, 1024);
                assert!(size > 1024 && size <= 1024 + 256);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_part_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = MultipartConfig::new(dir.path()).file_size_threshold(4).max_file_size(64);
        let content = "y".repeat(200);
        let raw = body(&[("f", Some("f.txt"), &content)]);

        let err = decode_body(Some(CT), chunked(&raw, 16), &config).await.unwrap_err();
        assert!(matches!(err, MultipartError::FileTooLarge { limit: 64, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_preamble_and_padding() {
        let raw = Bytes::from_static(
            b"ignored preamble\r\n--XyZ  \r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--XyZ--\r\nepilogue",
        );
        let parts = decode_body(Some(CT), chunked(&raw, 5), &MultipartConfig::default().file_size_threshold(8))
            .await
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text().await.unwrap(), "1");
    }
}
