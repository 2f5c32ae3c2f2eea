use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;

use crate::{auth::CSRF_COOKIE_NAME, request_meta::RequestMeta};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const CSRF_HEADER_NAME: &str = "x-csrf-token";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, axum::Json(ErrorBody { message: message.into() })).into_response()
}

fn incoming_request_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    let ok = !raw.is_empty()
        && raw.len() <= MAX_REQUEST_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    ok.then(|| raw.to_string())
}

// Middleware: tags every request with an id (caller-supplied if sane) and
// echoes it back in the response headers.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id =
        incoming_request_id(req.headers()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestMeta {
        request_id: request_id.clone(),
    });

    let mut resp = next.run(req).await;
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_allowed_origins() -> Vec<String> {
    // Production should set `BOTDOCK_ALLOWED_ORIGINS` explicitly, e.g.
    // BOTDOCK_ALLOWED_ORIGINS=https://bots.example.com,https://admin.example.com
    let raw = std::env::var("BOTDOCK_ALLOWED_ORIGINS").unwrap_or_else(|_| {
        "http://localhost:5173,http://127.0.0.1:5173".to_string()
    });
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn origin_is_allowed(headers: &HeaderMap) -> bool {
    // Missing Origin means a non-browser client.
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };

    parse_allowed_origins().iter().any(|a| a == origin)
}

fn request_has_cookie_header(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn csrf_is_valid(headers: &HeaderMap) -> bool {
    let jar = CookieJar::from_headers(headers);
    let cookie = match jar.get(CSRF_COOKIE_NAME) {
        Some(c) => c,
        None => return false,
    };

    let header = match headers.get(CSRF_HEADER_NAME).and_then(|v| v.to_str().ok()) {
        Some(v) => v,
        None => return false,
    };

    cookie.value() == header
}

// Middleware: double-submit CSRF + Origin allowlist for state-changing
// requests. Bearer-only clients send no cookies and skip the CSRF check.
pub async fn csrf_and_origin(req: Request<Body>, next: Next) -> Response {
    if !is_unsafe_method(req.method()) {
        return next.run(req).await;
    }

    let headers = req.headers();
    if !origin_is_allowed(headers) {
        return json_error(StatusCode::FORBIDDEN, "origin not allowed");
    }

    if request_has_cookie_header(headers) && !csrf_is_valid(headers) {
        return json_error(StatusCode::FORBIDDEN, "csrf invalid");
    }

    next.run(req).await
}

/// Sliding-window limiter keyed by caller.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_hits: usize,
    hits: std::sync::Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_hits: usize, window: Duration) -> Self {
        Self {
            window,
            max_hits: max_hits.max(1),
            hits: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        let max_hits = std::env::var("BOTDOCK_RATE_LIMIT_MAX_HITS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(5)
            .clamp(1, 10_000);
        let window_ms = std::env::var("BOTDOCK_RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000)
            .clamp(1000, 600_000);
        Self::new(max_hits, Duration::from_millis(window_ms))
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut map = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let q = map.entry(key.to_string()).or_default();
        while q
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            q.pop_front();
        }
        if q.len() >= self.max_hits {
            return false;
        }
        q.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_blocks_after_max_hits_per_key() {
        let rl = RateLimiter::new(2, Duration::from_secs(10));
        let now = Instant::now();
        assert!(rl.allow_at("user:a", now));
        assert!(rl.allow_at("user:a", now));
        assert!(!rl.allow_at("user:a", now));
        assert!(rl.allow_at("user:b", now));
    }

    #[test]
    fn limiter_window_slides() {
        let rl = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();
        assert!(rl.allow_at("k", now));
        assert!(!rl.allow_at("k", now + Duration::from_secs(5)));
        assert!(rl.allow_at("k", now + Duration::from_secs(11)));
    }

    #[test]
    fn request_id_header_is_sanitised() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(incoming_request_id(&headers).as_deref(), Some("abc-123"));

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("a b;c"));
        assert_eq!(incoming_request_id(&headers), None);
    }

    #[test]
    fn csrf_requires_matching_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("csrf=tok"),
        );
        assert!(!csrf_is_valid(&headers));
        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("tok"));
        assert!(csrf_is_valid(&headers));
    }
}
