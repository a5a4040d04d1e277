//! HTTP request normalization.
//!
//! # Responsibilities
//! - Split a request into query, body, cookie and header param sources
//! - Decode JSON and form bodies
//!
//! # Design Decisions
//! - Header names are lowercase (as hyper stores them)
//! - Within one source the first occurrence of a key wins
//! - Unknown body types contribute no params

use axum::http::header::{CONTENT_TYPE, COOKIE};
use axum::http::request::Parts;
use bytes::Bytes;
use serde_json::Value;
use url::form_urlencoded;

use crate::dispatch::{HttpSources, Params};

/// Collect the param sources of one request.
pub fn extract_sources(parts: &Parts, body: &Bytes) -> HttpSources {
    HttpSources {
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(|q| parse_form(q.as_bytes())).unwrap_or_default(),
        body: parse_body(parts, body),
        cookies: parse_cookies(parts),
        headers: parse_headers(parts),
    }
}

fn insert_first(params: &mut Params, key: String, value: Value) {
    params.entry(key).or_insert(value);
}

fn parse_form(input: &[u8]) -> Params {
    let mut params = Params::new();
    for (key, value) in form_urlencoded::parse(input) {
        insert_first(&mut params, key.into_owned(), Value::String(value.into_owned()));
    }
    params
}

fn parse_body(parts: &Parts, body: &Bytes) -> Params {
    if body.is_empty() {
        return Params::new();
    }
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return parse_form(body);
    }
    if content_type.starts_with("application/json") {
        return match serde_json::from_slice(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Params::new(),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring undecodable JSON body");
                Params::new()
            }
        };
    }
    Params::new()
}

fn parse_cookies(parts: &Parts) -> Params {
    let mut params = Params::new();
    for header in parts.headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else {
            continue;
        };
        for pair in header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                insert_first(&mut params, name.to_string(), Value::String(value.to_string()));
            }
        }
    }
    params
}

fn parse_headers(parts: &Parts) -> Params {
    let mut params = Params::new();
    for (name, value) in &parts.headers {
        if *name == COOKIE {
            continue;
        }
        if let Ok(value) = value.to_str() {
            insert_first(&mut params, name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    params
}
