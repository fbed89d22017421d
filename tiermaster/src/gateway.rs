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

//! # gateway
//!
//! A small reverse proxy that fronts the tiermaster services.
//!
//! Requests to `/api/v1/{service}/{rest}` are looked-up in a [ServiceRegistry] by `service` &
//! forwarded to `{base}/{rest}`, query string, method, headers & body intact (save for `Host`, which
//! reqwest sets for the upstream). The upstream's status, headers & body are relayed back as-is,
//! minus hop-by-hop headers. The gateway knows nothing about what it's proxying; adding a service is
//! a matter of adding a registry entry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{CONTENT_LENGTH, HOST},
        HeaderMap, HeaderName, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use url::Url;

use crate::{
    define_metric,
    http::{instrument, metrics_response, ErrorResponseBody},
};

/// The name under which the leaderboard service is registered by default
pub const LEADERBOARD: &str = "leaderboard";

/// Where the leaderboard service lives, absent configuration to the contrary
pub const DEFAULT_LEADERBOARD_URL: &str = "http://leaderboard-service:3001";

/// Default upper bound on a single upstream exchange
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// The largest request body we'll buffer for forwarding
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection & must not be forwarded by a proxy (RFC 9110 §7.6.1)
const HOP_BY_HOP: [HeaderName; 8] = [
    HeaderName::from_static("connection"),
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailer"),
    HeaderName::from_static("transfer-encoding"),
    HeaderName::from_static("upgrade"),
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build the upstream HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the request body: {source}"))]
    RequestBody {
        source: axum::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No service named {service} is registered"))]
    UnknownService {
        service: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The request to {service} failed: {source}"))]
    Upstream {
        service: String,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the response from {service}: {source}"))]
    UpstreamBody {
        service: String,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::Client { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Proxy error".to_owned()),
            Error::RequestBody { .. } => (
                StatusCode::BAD_REQUEST,
                "Failed to read the request body".to_owned(),
            ),
            Error::UnknownService { .. } => {
                (StatusCode::NOT_FOUND, "Service not available".to_owned())
            }
            Error::Upstream { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_owned(),
            ),
            Error::UpstreamBody { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read response from service".to_owned(),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (code, msg) = self.as_status_and_msg();
        error!("{:#?}", self);
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

define_metric! { "gateway.forwards", gateway_forwards, Sort::IntegralCounter }
define_metric! { "gateway.failures", gateway_failures, Sort::IntegralCounter }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        ServiceRegistry                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logical service name → base URL
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ServiceRegistry {
    services: HashMap<String, Url>,
}

impl ServiceRegistry {
    pub fn new(services: HashMap<String, Url>) -> ServiceRegistry {
        ServiceRegistry { services }
    }
    pub fn get(&self, service: &str) -> Option<&Url> {
        self.services.get(service)
    }
    pub fn insert(&mut self, service: &str, base: Url) -> Option<Url> {
        self.services.insert(service.to_owned(), base)
    }
    pub fn len(&self) -> usize {
        self.services.len()
    }
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
    /// Compute the upstream URL for `rest` (a path relative to the service root) & `query`
    pub fn target(&self, service: &str, rest: &str, query: Option<&str>) -> Option<Url> {
        self.get(service).map(|base| {
            let mut target = base.clone();
            let path = format!(
                "{}/{}",
                base.path().trim_end_matches('/'),
                rest.trim_start_matches('/')
            );
            target.set_path(&path);
            target.set_query(query);
            target
        })
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        ServiceRegistry {
            services: HashMap::from([(
                LEADERBOARD.to_owned(),
                Url::parse(DEFAULT_LEADERBOARD_URL).unwrap(/* known good */),
            )]),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Gateway                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Application state for the gateway
pub struct Gateway {
    services: ServiceRegistry,
    client: reqwest::Client,
    registry: prometheus::Registry,
}

impl Gateway {
    pub fn new(
        services: ServiceRegistry,
        upstream_timeout: Duration,
        registry: prometheus::Registry,
    ) -> Result<Gateway> {
        Ok(Gateway {
            services,
            client: reqwest::Client::builder()
                .timeout(upstream_timeout)
                .build()
                .context(ClientSnafu)?,
            registry,
        })
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Forward `request` to `rest` on `service` & relay the reply
async fn forward1(
    state: &Gateway,
    service: &str,
    rest: &str,
    request: axum::extract::Request,
) -> Result<Response> {
    info!("Forwarding {} {} to {service}", request.method(), request.uri());
    let target = state
        .services
        .target(service, rest, request.uri().query())
        .context(UnknownServiceSnafu { service })?;
    debug!("Target URL: {target}");

    let (parts, body) = request.into_parts();
    let headers: HeaderMap = parts
        .headers
        .iter()
        .filter(|(name, _)| **name != HOST && **name != CONTENT_LENGTH && !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .context(RequestBodySnafu)?;

    let upstream = state
        .client
        .request(parts.method, target)
        .headers(headers)
        .body(body)
        .send()
        .await
        .context(UpstreamSnafu { service })?;

    let status = upstream.status();
    let headers: HeaderMap = upstream
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let bytes = upstream
        .bytes()
        .await
        .context(UpstreamBodySnafu { service })?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

async fn forward_with(
    state: Arc<Gateway>,
    service: String,
    rest: String,
    request: axum::extract::Request,
) -> Response {
    let attrs = [KeyValue::new("service", service.clone())];
    match forward1(&state, &service, &rest, request).await {
        Ok(response) => {
            gateway_forwards.add(1, &attrs);
            response
        }
        Err(err) => {
            gateway_failures.add(1, &attrs);
            err.into_response()
        }
    }
}

async fn forward(
    State(state): State<Arc<Gateway>>,
    Path((service, rest)): Path<(String, String)>,
    request: axum::extract::Request,
) -> Response {
    forward_with(state, service, rest, request).await
}

/// Forward a request for a service's root
async fn forward_root(
    State(state): State<Arc<Gateway>>,
    Path(service): Path<String>,
    request: axum::extract::Request,
) -> Response {
    forward_with(state, service, String::new(), request).await
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthRsp {
    pub status: String,
    pub service: String,
}

async fn health() -> Json<HealthRsp> {
    Json(HealthRsp {
        status: "ok".to_owned(),
        service: "gateway".to_owned(),
    })
}

async fn metrics(State(state): State<Arc<Gateway>>) -> Response {
    metrics_response(&state.registry)
}

/// Make the gateway [Router], wrapped in our standard middleware
pub fn make_router(state: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/{service}", any(forward_root))
        .route("/api/v1/{service}/{*rest}", any(forward))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .pipe(instrument)
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::{
        matchers::{body_json, header, method, path, query_param},
        Match, Mock, MockServer, Request, ResponseTemplate,
    };

    /// Matches requests that arrive without hop-by-hop headers
    struct NoHopByHop;

    impl Match for NoHopByHop {
        fn matches(&self, request: &Request) -> bool {
            !request.headers.contains_key("connection") && !request.headers.contains_key("te")
        }
    }

    fn gateway(base: &str) -> Router {
        let mut services = ServiceRegistry::default();
        services.insert(LEADERBOARD, Url::parse(base).unwrap());
        make_router(Arc::new(
            Gateway::new(
                services,
                Duration::from_secs(5),
                prometheus::Registry::new(),
            )
            .unwrap(),
        ))
    }

    async fn send(app: &Router, request: axum::http::Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_of(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn targets() {
        let mut services = ServiceRegistry::default();
        assert_eq!(
            services.target(LEADERBOARD, "scores", Some("limit=3")).unwrap().as_str(),
            "http://leaderboard-service:3001/scores?limit=3"
        );
        services.insert("nested", Url::parse("http://host:1234/svc/").unwrap());
        assert_eq!(
            services.target("nested", "rank/u1", None).unwrap().as_str(),
            "http://host:1234/svc/rank/u1"
        );
        assert_eq!(
            services.target("nested", "", None).unwrap().as_str(),
            "http://host:1234/svc/"
        );
        assert!(services.target("nope", "x", None).is_none());
        assert_eq!(services.len(), 2);
    }

    #[tokio::test]
    async fn relays_reads() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scores"))
            .and(query_param("limit", "3"))
            .and(NoHopByHop)
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-upstream", "leaderboard")
                    .set_body_json(json!({"message": "Top 3 users", "leaderboard": []})),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let app = gateway(&upstream.uri());
        let rsp = send(
            &app,
            axum::http::Request::get("/api/v1/leaderboard/scores?limit=3")
                .header("connection", "keep-alive")
                .header("te", "trailers")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.headers()["x-upstream"], "leaderboard");
        assert_eq!(
            json_of(rsp).await,
            json!({"message": "Top 3 users", "leaderboard": []})
        );
    }

    #[tokio::test]
    async fn relays_writes_and_failures() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/score/u1"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"username": "alice", "score": 50})))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "below threshold"})),
            )
            .mount(&upstream)
            .await;

        let app = gateway(&upstream.uri());
        let rsp = send(
            &app,
            axum::http::Request::post("/api/v1/leaderboard/score/u1")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"username": "alice", "score": 50}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        // Upstream statuses are relayed, errors included
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(rsp).await, json!({"error": "below threshold"}));
    }

    #[tokio::test]
    async fn unknown_and_unreachable_services() {
        // Nothing listens on port 1
        let app = gateway("http://127.0.0.1:1");

        let rsp = send(
            &app,
            axum::http::Request::get("/api/v1/nonesuch/scores")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(rsp).await, json!({"error": "Service not available"}));

        let rsp = send(
            &app,
            axum::http::Request::get("/api/v1/leaderboard/highest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(rsp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_of(rsp).await, json!({"error": "Service unavailable"}));
    }

    #[tokio::test]
    async fn gateway_health() {
        let rsp = send(
            &gateway("http://127.0.0.1:1"),
            axum::http::Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(
            json_of(rsp).await,
            json!({"status": "ok", "service": "gateway"})
        );
    }

    #[test]
    fn registry_from_toml() {
        let services: ServiceRegistry =
            toml::from_str("leaderboard = \"http://localhost:3001\"\nchat = \"http://chat:4000\"")
                .unwrap();
        assert_eq!(
            services.get("chat").unwrap().as_str(),
            "http://chat:4000/"
        );
        assert_eq!(services.len(), 2);
    }
}
