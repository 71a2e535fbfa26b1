//! Error page rendering
//!
//! Every error the dispatcher produces (unmapped paths, handler failures,
//! caught panics, oversized bodies) is turned into a response by an
//! [`ErrorRenderer`].

use crate::response::reason_phrase;
use crate::{Method, Response, ResponseBuilder, StatusCode};

/// What went wrong, as seen by an error renderer
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub status: StatusCode,
    /// Message supplied by the handler, if any
    pub message: Option<&'a str>,
    pub method: Option<Method>,
    /// Full request path, context root included
    pub uri: &'a str,
    /// The request's `Accept` header
    pub accept: Option<&'a str>,
}

/// Builds error responses
///
/// Implemented for closures `Fn(&ErrorContext) -> Response`.
pub trait ErrorRenderer: Send + Sync + 'static {
    fn render(&self, ctx: &ErrorContext<'_>) -> Response;
}

impl<F> ErrorRenderer for F
where
    F: Fn(&ErrorContext<'_>) -> Response + Send + Sync + 'static,
{
    fn render(&self, ctx: &ErrorContext<'_>) -> Response {
        self(ctx)
    }
}

/// Default renderer: HTML page, or JSON/plain text when the client asks
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorRenderer;

#[derive(Debug, PartialEq)]
enum Format {
    Html,
    Json,
    Text,
}

fn negotiate(accept: Option<&str>) -> Format {
    let Some(accept) = accept else {
        return Format::Html;
    };
    let accept = accept.to_ascii_lowercase();
    if accept.contains("text/html") || accept.contains("*/*") || accept.trim().is_empty() {
        Format::Html
    } else if accept.contains("application/json") {
        Format::Json
    } else if accept.contains("text/plain") {
        Format::Text
    } else {
        Format::Html
    }
}

impl ErrorRenderer for DefaultErrorRenderer {
    fn render(&self, ctx: &ErrorContext<'_>) -> Response {
        let code = ctx.status.as_u16();
        let reason = reason_phrase(ctx.status);
        let message = ctx.message.unwrap_or(reason);

        let (content_type, body) = match negotiate(ctx.accept) {
            Format::Html => (
                "text/html; charset=utf-8",
                format!(
                    "<html>\n<head>\n<meta http-equiv=\"Content-Type\" content=\"text/html;charset=utf-8\"/>\n\
                     <title>Error {code} {reason}</title>\n</head>\n<body>\n\
                     <h2>HTTP ERROR {code} {reason}</h2>\n<table>\n\
                     <tr><th>URI:</th><td>{uri}</td></tr>\n\
                     <tr><th>STATUS:</th><td>{code}</td></tr>\n\
                     <tr><th>MESSAGE:</th><td>{message}</td></tr>\n\
                     </table>\n</body>\n</html>\n",
                    uri = escape_html(ctx.uri),
                    message = escape_html(message),
                ),
            ),
            Format::Json => (
                "application/json",
                serde_json::json!({
                    "url": ctx.uri,
                    "status": code.to_string(),
                    "message": message,
                })
                .to_string(),
            ),
            Format::Text => (
                "text/plain; charset=utf-8",
                format!("HTTP ERROR {code} {reason}\nURI: {}\nSTATUS: {code}\nMESSAGE: {message}\n", ctx.uri),
            ),
        };

        ResponseBuilder::new(ctx.status)
            .header("content-type", content_type)
            .header("cache-control", "must-revalidate,no-cache,no-store")
            .body(body)
            .build()
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(status: StatusCode, uri: &'a str, accept: Option<&'a str>) -> ErrorContext<'a> {
        ErrorContext {
            status,
            message: None,
            method: Some(Method::Get),
            uri,
            accept,
        }
    }

    #[test]
    fn test_default_html() {
        let res = DefaultErrorRenderer.render(&ctx(StatusCode::NOT_FOUND, "/test0", Some("*/*")));
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(res.content_type(), Some("text/html; charset=utf-8"));

        let body = res.body_string().unwrap();
        assert!(body.contains("<h2>HTTP ERROR 404 Not Found</h2>"));
        assert!(body.contains("<td>/test0</td>"));
    }

    #[test]
    fn test_html_is_escaped() {
        let res = DefaultErrorRenderer.render(&ctx(StatusCode::NOT_FOUND, "/<script>", None));
        let body = res.body_string().unwrap();
        assert!(body.contains("/&lt;script&gt;"));
        assert!(!body.contains("<script>"));
    }

    #[test]
    fn test_negotiated_formats() {
        let res = DefaultErrorRenderer.render(&ctx(
            StatusCode::INTERNAL_SERVER_ERROR,
            "/boom",
            Some("application/json"),
        ));
        let value: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
        assert_eq!(value["status"], "500");
        assert_eq!(value["url"], "/boom");

        let res = DefaultErrorRenderer.render(&ctx(StatusCode::BAD_REQUEST, "/x", Some("text/plain")));
        assert!(res.body_string().unwrap().starts_with("HTTP ERROR 400 Bad Request"));
    }

    #[test]
    fn test_closure_renderer() {
        let renderer = |ctx: &ErrorContext<'_>| {
            Response::html(format!("<h3>Custom Error: {}</h3>", ctx.status.as_u16()))
        };
        let res = renderer.render(&ctx(StatusCode::NOT_FOUND, "/", None));
        assert_eq!(res.body_string().unwrap(), "<h3>Custom Error: 404</h3>");
        // the dispatcher restores the error status afterwards
        assert_eq!(res.status, StatusCode::OK);
    }
}
