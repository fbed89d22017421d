// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tiermaster.
//
// tiermaster is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tiermaster is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tiermaster.  If not,
// see <http://www.gnu.org/licenses/>.

//! # http
//!
//! HTTP plumbing shared by the leaderboard service & the gateway.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    extract::MatchedPath,
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tap::Pipe;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::error;

use crate::metrics::{self, request_metric_name};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// A serializable struct for use in HTTP error responses
///
/// Every error response tiermaster produces carries a body of the form `{"error": "..."}`; the
/// [IntoResponse] implementations for our handler error types all funnel through this.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl ErrorResponseBody {
    pub fn new(error: impl Into<String>) -> ErrorResponseBody {
        ErrorResponseBody {
            error: error.into(),
        }
    }
}

impl IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Generate request IDs from a monotonically increasing counter
///
/// They're short, readable, and a rough gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
pub struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .pipe(HeaderValue::from)
            .pipe(RequestId::new)
            .pipe(Some)
    }
}

/// Count requests per method & route
///
/// We name the counter after the matched route (`/rank/{user_id}`), not the literal path, so that
/// the number of instruments stays bounded.
pub async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "/unmatched".to_owned());
    let name = request_metric_name(request.method().as_str(), &path);
    opentelemetry::global::meter(metrics::METER)
        .u64_counter(name)
        .build()
        .add(1, &[]);
    next.run(request).await
}

/// Wrap `router` in our standard middleware stack
///
/// Incoming requests hit the outermost layer first, and that's the one applied last:
///
/// ```text
///                 requests
///                    |
///                    v
/// +---------  SetRequestIdLayer      ---------+
/// | +-------      OTEL layer         -------+ |
/// | | +-----      TraceLayer         -----+ | |
/// | | | +--- PropagateRequestIdLayer ---+ | | |
/// | | | |                               | | | |
/// | | | |          handler              | | | |
/// | | | |                               | | | |
/// | | | +--- PropagateRequestIdLayer ---+ | | |
/// | | +-----      TraceLayer         -----+ | |
/// | +-------      OTEL Layer         -------+ |
/// +---------   SetRequestIdLayer     ---------+
///                    |
///                    v
///                responses
/// ```
pub fn instrument(router: Router) -> Router {
    router
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            X_REQUEST_ID,
            RequestIdGenerator::default(),
        ))
}

/// Produce a `/metrics` response from `registry`
pub fn metrics_response(registry: &prometheus::Registry) -> axum::response::Response {
    match metrics::render(registry) {
        Ok(text) => (
            [(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            error!("{err:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponseBody::new("Failed to render metrics"),
            )
                .into_response()
        }
    }
}
