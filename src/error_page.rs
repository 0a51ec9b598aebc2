//! Terminal error responses
//!
//! The Forbidden and Unavailable pages are embedded at build time and a
//! gzipped copy of each is precomputed at startup, so the error path never
//! compresses under load. The sentinel decides status and body; strict mode
//! forces a terse plain-text reply regardless of what the client accepts.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{HeaderMap, HeaderValue, Response, StatusCode};

use crate::context::Sentinel;

pub static FORBIDDEN_PAGE: &[u8] = include_bytes!("../static/forbidden.html");
pub static UNAVAILABLE_PAGE: &[u8] = include_bytes!("../static/unavailable.html");

/// Terse body for strict mode and non-HTML clients.
const TERSE_BODY: &str = "service error";

pub struct ErrorPages {
    strict_mode: bool,
    forbidden_gz: Bytes,
    unavailable_gz: Bytes,
}

impl ErrorPages {
    pub fn new(strict_mode: bool) -> Self {
        Self {
            strict_mode,
            forbidden_gz: compress(FORBIDDEN_PAGE),
            unavailable_gz: compress(UNAVAILABLE_PAGE),
        }
    }

    /// Render the terminal response for a sentinel.
    pub fn render(&self, sentinel: Sentinel, request_headers: &HeaderMap) -> Response<Bytes> {
        match sentinel {
            Sentinel::BucketLimit => empty_response(StatusCode::GATEWAY_TIMEOUT),
            Sentinel::ReqLimit => {
                self.page_response(StatusCode::TOO_MANY_REQUESTS, request_headers, Page::Forbidden)
            }
            Sentinel::DomainNotAllow => {
                self.page_response(StatusCode::FORBIDDEN, request_headers, Page::Forbidden)
            }
            Sentinel::BackendError => {
                self.page_response(StatusCode::BAD_GATEWAY, request_headers, Page::Unavailable)
            }
        }
    }

    fn page_response(
        &self,
        status: StatusCode,
        request_headers: &HeaderMap,
        page: Page,
    ) -> Response<Bytes> {
        if self.strict_mode {
            return terse_response(status);
        }
        if !accepts_html(request_headers) {
            return json_response(status);
        }

        let (plain, gz) = match page {
            Page::Forbidden => (FORBIDDEN_PAGE, &self.forbidden_gz),
            Page::Unavailable => (UNAVAILABLE_PAGE, &self.unavailable_gz),
        };

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "text/html; charset=utf-8");
        let body = if accepts_gzip(request_headers) {
            builder = builder.header("content-encoding", "gzip");
            gz.clone()
        } else {
            Bytes::from_static(plain)
        };
        builder
            .header("content-length", body.len().to_string())
            .body(body)
            .unwrap_or_else(|_| empty_response(status))
    }
}

#[derive(Clone, Copy)]
enum Page {
    Forbidden,
    Unavailable,
}

fn compress(data: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Embedded pages compress at startup; failure would be a build defect.
    let _ = encoder.write_all(data);
    Bytes::from(encoder.finish().unwrap_or_else(|_| data.to_vec()))
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get("accept-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

fn empty_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

fn terse_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(TERSE_BODY.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode) -> Response<Bytes> {
    let body = format!(
        r#"{{"code":{},"error":"{}"}}"#,
        status.as_u16(),
        status.canonical_reason().unwrap_or("error")
    );
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/html,application/xhtml+xml".parse().unwrap());
        headers
    }

    #[test]
    fn test_sentinel_status_table() {
        let pages = ErrorPages::new(false);
        let headers = html_headers();
        assert_eq!(
            pages.render(Sentinel::BucketLimit, &headers).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            pages.render(Sentinel::ReqLimit, &headers).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            pages.render(Sentinel::DomainNotAllow, &headers).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            pages.render(Sentinel::BackendError, &headers).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_bucket_limit_has_empty_body() {
        let pages = ErrorPages::new(false);
        let response = pages.render(Sentinel::BucketLimit, &html_headers());
        assert!(response.body().is_empty());
    }

    #[test]
    fn test_html_client_gets_embedded_page() {
        let pages = ErrorPages::new(false);
        let response = pages.render(Sentinel::DomainNotAllow, &html_headers());
        assert_eq!(response.body().as_ref(), FORBIDDEN_PAGE);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_gzip_client_gets_precompressed_page() {
        let pages = ErrorPages::new(false);
        let mut headers = html_headers();
        headers.insert("accept-encoding", "gzip".parse().unwrap());
        let response = pages.render(Sentinel::BackendError, &headers);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(response.body().as_ref())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, UNAVAILABLE_PAGE);
    }

    #[test]
    fn test_non_html_client_gets_json() {
        let pages = ErrorPages::new(false);
        let headers = HeaderMap::new();
        let response = pages.render(Sentinel::ReqLimit, &headers);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert!(response.body().starts_with(b"{\"code\":429"));
    }

    #[test]
    fn test_strict_mode_forces_terse_body() {
        let pages = ErrorPages::new(true);
        let response = pages.render(Sentinel::DomainNotAllow, &html_headers());
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_ref(), TERSE_BODY.as_bytes());
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let pages = ErrorPages::new(false);
        let a = pages.render(Sentinel::DomainNotAllow, &html_headers());
        let b = pages.render(Sentinel::DomainNotAllow, &html_headers());
        assert_eq!(a.status(), b.status());
        assert_eq!(a.body(), b.body());
    }
}
