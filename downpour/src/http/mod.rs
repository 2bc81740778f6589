//! Abstract HTTP collaborator.
//!
//! The engine depends only on the [`HttpClient`] capability set: build a
//! range/conditional GET with headers, cookies, auth and proxy; send it;
//! read status, headers and body. [`ReqwestClient`] is the production
//! implementation over `reqwest`'s blocking client; tests substitute
//! scripted implementations.

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Basic-auth credentials attached to piece requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

/// Per-request context: different pieces of one logical download may carry
/// different effective headers (separate audio/video manifests, for one).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Option<String>,
    pub auth: Option<BasicAuth>,
}

impl RequestContext {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Inclusive byte range for a ranged GET. An open `end` lets the worker
/// keep reading past the piece boundary when coalescing is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// What a probe or a connected GET revealed about the resource.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status: u16,
    /// Content length of the response body (for a 206, the remaining
    /// range, not the full resource).
    pub length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub accept_ranges: bool,
    /// URL after redirects.
    pub final_url: String,
    /// Position within the piece the server actually honored; zero when
    /// the transfer (re)starts from the beginning.
    pub resume_offset: u64,
}

/// An open response with its body still streaming.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub final_url: String,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Snapshot of the response's metadata for progress/validation
    /// reporting.
    pub fn probe(&self, resume_offset: u64) -> ProbeResult {
        ProbeResult {
            status: self.status,
            length: self.content_length,
            last_modified: self.last_modified,
            content_type: self.content_type.clone(),
            accept_ranges: false,
            final_url: self.final_url.clone(),
            resume_offset,
        }
    }
}

/// The transport capability the engine is written against.
pub trait HttpClient: Send + Sync {
    /// Issue a GET, optionally ranged. Non-success statuses are returned as
    /// responses, not errors; callers classify them.
    fn get(&self, ctx: &RequestContext, range: Option<ByteRange>) -> EngineResult<HttpResponse>;

    /// Issue a HEAD to learn length, range support and freshness metadata.
    fn probe(&self, ctx: &RequestContext) -> EngineResult<ProbeResult>;
}

/// Fetch a small text resource (a manifest), enforcing a success status.
pub fn fetch_text(client: &dyn HttpClient, ctx: &RequestContext) -> EngineResult<String> {
    let mut response = client.get(ctx, None)?;
    if !response.is_success() {
        return Err(EngineError::HttpStatus(response.status));
    }
    let mut text = String::new();
    response
        .body
        .read_to_string(&mut text)
        .map_err(|e| EngineError::Network(format!("reading manifest body: {e}")))?;
    Ok(text)
}

/// Parse an RFC 2822 `Last-Modified` header value.
pub fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Production client over `reqwest::blocking`.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Build a client from the engine configuration. `proxy` applies to
    /// every request made through this client.
    pub fn new(config: &EngineConfig, proxy: Option<&str>) -> EngineResult<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone());
        builder = match config.read_timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder.timeout(None::<Duration>),
        };
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| EngineError::Network(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Network(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn apply_context(
        &self,
        mut request: reqwest::blocking::RequestBuilder,
        ctx: &RequestContext,
    ) -> reqwest::blocking::RequestBuilder {
        for (name, value) in &ctx.headers {
            request = request.header(name, value);
        }
        if let Some(cookies) = &ctx.cookies {
            request = request.header(reqwest::header::COOKIE, cookies);
        }
        if let Some(auth) = &ctx.auth {
            request = request.basic_auth(&auth.username, auth.password.as_deref());
        }
        request
    }
}

fn classify_send_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Network(format!("request timed out: {e}"))
    } else {
        EngineError::Network(e.to_string())
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, ctx: &RequestContext, range: Option<ByteRange>) -> EngineResult<HttpResponse> {
        let mut request = self.apply_context(self.client.get(ctx.url.as_str()), ctx);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let response = request.send().map_err(classify_send_error)?;

        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_last_modified);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let final_url = response.url().to_string();

        Ok(HttpResponse {
            status,
            content_length,
            last_modified,
            content_type,
            final_url,
            body: Box::new(response),
        })
    }

    fn probe(&self, ctx: &RequestContext) -> EngineResult<ProbeResult> {
        let request = self.apply_context(self.client.head(ctx.url.as_str()), ctx);
        let response = request.send().map_err(classify_send_error)?;

        let accept_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(ProbeResult {
            status: response.status().as_u16(),
            length: response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok()),
            last_modified: response
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_last_modified),
            content_type: response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
            accept_ranges,
            final_url: response.url().to_string(),
            resume_offset: 0,
        })
    }
}
