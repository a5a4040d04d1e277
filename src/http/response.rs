//! HTTP response construction.
//!
//! # Design Decisions
//! - Envelopes are always `200 OK` JSON; the envelope code carries errors
//! - A request that will never be answered (stale, or its handle dropped)
//!   gets 499 with an empty body

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::net::control::{HttpSentinel, PONG};

/// Non-standard "client closed request" status.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

pub fn envelope(body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn sentinel(kind: HttpSentinel) -> Response {
    match kind {
        HttpSentinel::Ping => Bytes::from_static(PONG).into_response(),
        HttpSentinel::Favicon => StatusCode::OK.into_response(),
    }
}

pub fn unanswered() -> Response {
    StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
        .unwrap_or(StatusCode::REQUEST_TIMEOUT)
        .into_response()
}
