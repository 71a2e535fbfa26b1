//! Static file serving handler
//!
//! Serves files below a root directory with ETags, optional `Cache-Control`,
//! conditional requests, single byte ranges and an in-memory cache.

use super::file_cache::FileCache;
use super::range::{self, RangeRequest};
use crate::config::StaticServingConfig;
use crate::response::{reason_phrase, FileRegion};
use crate::{HandlerError, Method, Request, Response, ResponseBuilder, StatusCode};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Static file handler
pub struct StaticFiles {
    config: StaticServingConfig,
    cache_control: Option<String>,
    cache: FileCache,
}

impl StaticFiles {
    pub fn new(config: StaticServingConfig) -> Self {
        let cache_control = config.cache_control();
        match cache_control {
            Some(_) => tracing::info!(
                "Sending max age header for static files. Max age is {} days",
                config.max_age as f64 / (24.0 * 60.0 * 60.0)
            ),
            None => tracing::info!("Not sending max age header for static files"),
        }
        tracing::info!(
            "Using in-memory cache with size of {} KiB for static files",
            config.max_cache_size as f64 / 1024.0
        );

        let cache = FileCache::new(
            config.max_cache_size,
            config.effective_max_cached_file_size(),
            config.effective_max_cached_files(),
        );
        Self {
            config,
            cache_control,
            cache,
        }
    }

    /// Serve static files from directory
    pub fn serve(root: impl Into<PathBuf>) -> Self {
        Self::new(StaticServingConfig::new(root))
    }

    pub fn config(&self) -> &StaticServingConfig {
        &self.config
    }

    /// Handle request for static file
    pub async fn handle(&self, req: &Request) -> Result<Response, HandlerError> {
        // Only handle GET and HEAD
        if req.method != Method::Get && req.method != Method::Head {
            return Err(HandlerError::method_not_allowed().with_header("Allow", "GET, HEAD"));
        }

        let path = self.sanitize_path(&req.path).ok_or_else(HandlerError::not_found)?;
        let full_path = self.config.root.join(&path);

        let meta = tokio::fs::metadata(&full_path)
            .await
            .map_err(|_| HandlerError::not_found())?;

        if !meta.is_dir() {
            return self.serve_file(&full_path, &meta, req).await;
        }

        // No directory listing; only the index file
        let index = self.config.index.as_ref().ok_or_else(HandlerError::not_found)?;
        let index_path = full_path.join(index);
        match tokio::fs::metadata(&index_path).await {
            Ok(index_meta) if index_meta.is_file() => self.serve_file(&index_path, &index_meta, req).await,
            _ => Err(HandlerError::not_found()),
        }
    }

    /// Sanitize request path to prevent directory traversal
    fn sanitize_path(&self, path: &str) -> Option<PathBuf> {
        let path = path.trim_start_matches('/');

        // Hidden files
        if path.split('/').any(|s| s.starts_with('.')) {
            return None;
        }

        let mut result = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                std::path::Component::Normal(c) => result.push(c),
                std::path::Component::ParentDir => return None,
                _ => {}
            }
        }

        Some(result)
    }

    async fn serve_file(
        &self,
        path: &Path,
        meta: &std::fs::Metadata,
        req: &Request,
    ) -> Result<Response, HandlerError> {
        let etag = generate_etag(meta);

        if let Some(if_none_match) = req.header("if-none-match") {
            if etag_matches(if_none_match, &etag) {
                let mut res = ResponseBuilder::new(StatusCode::NOT_MODIFIED)
                    .header("ETag", etag)
                    .build();
                if let Some(cc) = &self.cache_control {
                    res.add_header("Cache-Control", cc.as_str());
                }
                return Ok(res);
            }
        }

        let total = meta.len();
        let range = match range::evaluate(req.header("range"), total) {
            RangeRequest::Full => None,
            RangeRequest::Partial(r) => Some(r),
            RangeRequest::Unsatisfiable => {
                return Err(HandlerError::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    reason_phrase(StatusCode::RANGE_NOT_SATISFIABLE),
                )
                .with_header("Content-Range", range::unsatisfiable_range(total)));
            }
        };
        let status = match range {
            Some(_) => StatusCode::PARTIAL_CONTENT,
            None => StatusCode::OK,
        };

        // Files too large for the cache are streamed from disk
        let builder = ResponseBuilder::new(status);
        let builder = if total > self.config.effective_max_cached_file_size() as u64 {
            let region = match &range {
                Some(r) => FileRegion {
                    path: path.to_path_buf(),
                    offset: r.start,
                    len: r.length(),
                },
                None => FileRegion::whole(path, total),
            };
            builder.file(region)
        } else {
            let content = self.load(path, meta).await?;
            if content.len() as u64 != total {
                return Err(HandlerError::internal("File changed while being served"));
            }
            match &range {
                Some(r) => builder.body(content.slice(r.start as usize..=r.end as usize)),
                None => builder.body(content),
            }
        };
        let content_range = range.map(|r| r.content_range(total));

        // hyper omits the body of HEAD responses
        let mut res = builder
            .header("Content-Type", mime_type(path))
            .header("ETag", etag)
            .header("Accept-Ranges", "bytes")
            .build();
        if let Some(cr) = content_range {
            res.add_header("Content-Range", cr);
        }
        if let Some(cc) = &self.cache_control {
            res.add_header("Cache-Control", cc.as_str());
        }
        Ok(res)
    }

    async fn load(&self, path: &Path, meta: &std::fs::Metadata) -> Result<Bytes, HandlerError> {
        if let Some(content) = self.cache.get(path, meta) {
            return Ok(content);
        }
        let content = Bytes::from(tokio::fs::read(path).await.map_err(|_| HandlerError::not_found())?);
        self.cache.insert(path, meta, content.clone());
        Ok(content)
    }
}

fn generate_etag(meta: &std::fs::Metadata) -> String {
    use std::time::UNIX_EPOCH;

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    format!("\"{:x}-{:x}\"", mtime, meta.len())
}

/// `If-None-Match` comparison (weak)
fn etag_matches(header: &str, etag: &str) -> bool {
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == etag.trim_start_matches("W/")
    })
}

fn mime_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match ext.to_lowercase().as_str() {
        // Text
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "csv" => "text/csv",

        // Images
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",

        // Audio/Video
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",

        // Fonts
        "woff" => "font/woff",
        "woff2" => "font/woff2",

        "pdf" => "application/pdf",
        "wasm" => "application/wasm",

        _ => "application/octet-stream",
    }
}
