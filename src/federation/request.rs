//! Inbound request and response sink
//!
//! The engine is transport-agnostic: the HTTP adapter hands it an
//! `InboxRequest` and receives whatever was written to the `ResponseSink`.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use url::Url;

/// A POST or GET against an actor's inbox
#[derive(Debug, Clone)]
pub struct InboxRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// IRI of the inbox the request targets
    pub inbox: Url,
}

impl InboxRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes, inbox: Url) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            inbox,
        }
    }

    /// Path and query as they appear in `(request-target)`
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// A response that has been written to the sink
#[derive(Debug, Clone)]
pub struct WrittenResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for WrittenResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Write-once response slot shared by the gates and the gateway
///
/// The first write wins. Later writes are ignored and logged, so a stage
/// can never overwrite the answer an earlier stage already gave.
#[derive(Debug, Default)]
pub struct ResponseSink {
    written: Option<WrittenResponse>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a status with a plain-text body
    ///
    /// # Returns
    /// `false` if a response had already been written
    pub fn write(&mut self, status: StatusCode, body: impl Into<Bytes>) -> bool {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.write_with_headers(status, headers, body)
    }

    /// Write a status, headers and body
    pub fn write_with_headers(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> bool {
        if let Some(existing) = &self.written {
            tracing::warn!(
                existing = %existing.status,
                attempted = %status,
                "Response already written; ignoring second write"
            );
            return false;
        }

        self.written = Some(WrittenResponse {
            status,
            headers,
            body: body.into(),
        });
        true
    }

    pub fn is_written(&self) -> bool {
        self.written.is_some()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.written.as_ref().map(|w| w.status)
    }

    pub fn into_written(self) -> Option<WrittenResponse> {
        self.written
    }
}
