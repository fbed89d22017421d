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

//! # leaderboard
//!
//! The leaderboard HTTP API.
//!
//! | Method | Path                | Notes                                              |
//! |--------|---------------------|----------------------------------------------------|
//! | POST   | `/score/{user_id}`  | body: `{"userId"?, "username", "score"}`           |
//! | GET    | `/scores?limit=N`   | `1 <= N <= 100`                                    |
//! | GET    | `/highest`          | 404 on an empty board                              |
//! | GET    | `/rank/{user_id}`   | `"rank": null` if the user isn't on the board      |
//! | GET    | `/health`           |                                                    |
//! | GET    | `/metrics`          | Prometheus text format                             |
//!
//! The user ID in the path is authoritative. The body may repeat it (older clients do), but if it
//! names someone *else* the request is refused.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace, IntoError};
use tap::Pipe;
use tracing::{debug, error, info};

use crate::{
    define_metric,
    entities::{Rank, RankedEntry, Score, UserId, Username},
    http::{instrument, metrics_response, ErrorResponseBody},
    repository,
    service::{self, Submission},
    storage,
    tiermaster::Tiermaster,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse the request body: {message}"))]
    BadBody { message: String, backtrace: Backtrace },
    #[snafu(display("Invalid 'limit' query parameter {text:?}; it must be an integer"))]
    BadLimit {
        text: Option<String>,
        backtrace: Backtrace,
    },
    #[snafu(display("The request path names {path}, but the body names {body}"))]
    MismatchedIdentity {
        path: String,
        body: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Service { source: service::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::BadBody { .. } | Error::BadLimit { .. } | Error::MismatchedIdentity { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Error::Service { source } if source.is_validation() => {
                (StatusCode::BAD_REQUEST, source.to_string())
            }
            Error::Service {
                source:
                    service::Error::Storage {
                        source: repository::Error::InvalidLimit { .. },
                    },
            } => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Service { source } if source.is_not_found() => {
                (StatusCode::NOT_FOUND, source.to_string())
            }
            ////////////////////////////////////////////////////////////////////////////////////////
            // The backing store is down or slow-- the caller may try again later
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Service { source }
                if source
                    .storage()
                    .map(storage::Error::is_unavailable)
                    .unwrap_or(false) =>
            {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Storage unavailable; please retry later".to_string(),
                )
            }
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it:
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Service { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Something went wrong: {source}"),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        if code.is_server_error() {
            error!("{:#?}", self);
        } else {
            debug!("{}", self);
        }
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

define_metric! { "leaderboard.submissions.accepted", submissions_accepted, Sort::IntegralCounter }
define_metric! { "leaderboard.submissions.rejected", submissions_rejected, Sort::IntegralCounter }
define_metric! { "leaderboard.submissions.failed",   submissions_failed,   Sort::IntegralCounter }
define_metric! { "leaderboard.top.queries",          top_queries,          Sort::IntegralCounter }
define_metric! { "leaderboard.highest.queries",      highest_queries,      Sort::IntegralCounter }
define_metric! { "leaderboard.rank.lookups",         rank_lookups,         Sort::IntegralCounter }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        request/response                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Request body for `POST /score/{user_id}`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitReq {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Username,
    pub score: Score,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitRsp {
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopParams {
    pub limit: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopRsp {
    pub message: String,
    pub leaderboard: Vec<RankedEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HighestRsp {
    #[serde(rename = "highestScore")]
    pub highest_score: Score,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RankRsp {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub rank: Option<Rank>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthRsp {
    pub status: String,
    pub service: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Submit a score for `user_id`
async fn submit(
    State(state): State<Arc<Tiermaster>>,
    Path(user_id): Path<String>,
    body: std::result::Result<Json<SubmitReq>, JsonRejection>,
) -> Result<Json<SubmitRsp>> {
    let Json(req) = body.map_err(|err| {
        submissions_rejected.add(1, &[]);
        BadBodySnafu {
            message: err.body_text(),
        }
        .build()
    })?;
    if let Some(named) = req.user_id.filter(|named| !named.is_empty() && *named != user_id) {
        submissions_rejected.add(1, &[]);
        return MismatchedIdentitySnafu {
            path: user_id,
            body: named,
        }
        .fail();
    }

    let entry = state
        .service
        .submit_score(Submission {
            user_id,
            username: req.username,
            score: req.score,
        })
        .await
        .map_err(|err| {
            if err.is_validation() {
                submissions_rejected.add(1, &[]);
            } else {
                submissions_failed.add(1, &[]);
            }
            ServiceSnafu.into_error(err)
        })?;

    info!("{} submitted a score of {}", entry.user_id, entry.score);
    submissions_accepted.add(1, &[]);
    Ok(Json(SubmitRsp {
        message: "Successfully submitted score".to_owned(),
    }))
}

/// Retrieve the top `limit` players
async fn top(
    State(state): State<Arc<Tiermaster>>,
    params: std::result::Result<Query<TopParams>, QueryRejection>,
) -> Result<Json<TopRsp>> {
    top_queries.add(1, &[]);
    let text = params.ok().and_then(|Query(params)| params.limit);
    let limit = text
        .as_deref()
        .and_then(|text| text.trim().parse::<i64>().ok())
        .context(BadLimitSnafu { text: text.clone() })?;
    let leaderboard = state
        .service
        .get_top_players(limit)
        .await
        .context(ServiceSnafu)?;
    Ok(Json(TopRsp {
        message: format!("Top {limit} users"),
        leaderboard,
    }))
}

/// Retrieve the best score on the board
async fn highest(State(state): State<Arc<Tiermaster>>) -> Result<Json<HighestRsp>> {
    highest_queries.add(1, &[]);
    Ok(Json(HighestRsp {
        highest_score: state
            .service
            .get_highest_score()
            .await
            .context(ServiceSnafu)?,
    }))
}

/// Retrieve `user_id`'s rank
async fn rank(
    State(state): State<Arc<Tiermaster>>,
    Path(user_id): Path<String>,
) -> Result<Json<RankRsp>> {
    rank_lookups.add(1, &[]);
    let user_id = UserId::try_from(user_id).map_err(|_| {
        ServiceSnafu.into_error(service::MissingIdentitySnafu.build())
    })?;
    let rank = state
        .service
        .get_rank(&user_id)
        .await
        .context(ServiceSnafu)?;
    Ok(Json(RankRsp { user_id, rank }))
}

async fn health(State(state): State<Arc<Tiermaster>>) -> Json<HealthRsp> {
    Json(HealthRsp {
        status: "healthy".to_owned(),
        service: state.service_name.clone(),
    })
}

async fn metrics(State(state): State<Arc<Tiermaster>>) -> axum::response::Response {
    metrics_response(&state.registry)
}

/// Make the leaderboard [Router], wrapped in our standard middleware
pub fn make_router(state: Arc<Tiermaster>) -> Router {
    Router::new()
        .route("/score/{user_id}", post(submit))
        .route("/scores", get(top))
        .route("/highest", get(highest))
        .route("/rank/{user_id}", get(rank))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .pipe(instrument)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use serde_json::{json, Value};
    use snafu::IntoError;
    use tower::ServiceExt;

    use crate::{
        memory::InMemory,
        repository::{Repository, DEFAULT_TIMEOUT},
        service::{Service, DEFAULT_MIN_SCORE},
        storage::{Backend as StorageBackend, ConsistencySnafu, UnavailableSnafu},
    };

    fn app_with(storage: Arc<dyn StorageBackend + Send + Sync>) -> Router {
        make_router(Arc::new(Tiermaster {
            service_name: "leaderboard".to_owned(),
            service: Service::new(
                Repository::new(storage, DEFAULT_TIMEOUT),
                Score::from(DEFAULT_MIN_SCORE),
            ),
            registry: prometheus::Registry::new(),
        }))
    }

    fn app() -> Router {
        app_with(Arc::new(InMemory::new()))
    }

    async fn send(app: &Router, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let rsp = app.clone().oneshot(request).await.unwrap();
        let status = rsp.status();
        let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post_score(user_id: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::post(format!("/score/{user_id}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn submit_and_read_back() {
        let app = app();
        for (user_id, score) in [("u1", 50), ("u2", 80), ("u3", 50)] {
            let (status, body) = send(
                &app,
                post_score(user_id, json!({"username": format!("{user_id}!"), "score": score})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "Successfully submitted score");
        }

        let (status, body) = send(&app, get_("/scores?limit=3")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Top 3 users");
        let board = body["leaderboard"].as_array().unwrap();
        assert_eq!(board.len(), 3);
        assert_eq!(board[0]["userId"], "u2");
        assert_eq!(board[0]["username"], "u2!");
        assert_eq!(board[0]["rank"], 1);
        assert_eq!(board[0]["score"], 80.0);
        assert!(board[0]["lastUpdatedAt"].is_string());
        assert_eq!(board[1]["rank"], 2);
        assert_eq!(board[2]["rank"], 3);

        let (status, body) = send(&app, get_("/highest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["highestScore"], 80.0);

        let (status, body) = send(&app, get_("/rank/u1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"userId": "u1", "rank": 3}));

        let (status, body) = send(&app, get_("/rank/nobody")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"userId": "nobody", "rank": null}));
    }

    #[tokio::test]
    async fn bad_submissions() {
        let app = app();
        let (status, body) = send(&app, post_score("u1", json!({"score": -1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("negative"));

        let (status, _) = send(&app, post_score("u1", json!({"score": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            send(&app, post_score("u1", json!({"userId": "u2", "score": 10}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, post_score("u1", json!({"username": "no score"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let rsp = app
            .clone()
            .oneshot(
                axum::http::Request::post("/score/u1")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        // None of that should have landed
        let (_, body) = send(&app, get_("/rank/u1")).await;
        assert_eq!(body["rank"], Value::Null);

        // Repeating the path's user ID in the body is fine, as is an empty one
        let (status, _) =
            send(&app, post_score("u1", json!({"userId": "u1", "score": 10}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, post_score("u1", json!({"userId": "", "score": 11}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn limits() {
        let app = app();
        for uri in [
            "/scores",
            "/scores?limit=",
            "/scores?limit=ten",
            "/scores?limit=0",
            "/scores?limit=101",
            "/scores?limit=-3",
        ] {
            let (status, body) = send(&app, get_(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string(), "{uri}");
        }
        for uri in ["/scores?limit=1", "/scores?limit=100"] {
            let (status, body) = send(&app, get_(uri)).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body["leaderboard"], json!([]));
        }
    }

    #[tokio::test]
    async fn empty_board() {
        let (status, body) = send(&app(), get_("/highest")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn health_and_metrics() {
        let app = app();
        let (status, body) = send(&app, get_("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "healthy", "service": "leaderboard"}));

        let rsp = app.clone().oneshot(get_("/metrics")).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    /// A backing store that fails every call with a canned error
    struct Broken(fn() -> storage::Error);

    #[async_trait]
    impl StorageBackend for Broken {
        async fn submit(&self, _: &UserId, _: Score, _: &str) -> storage::Result<()> {
            Err((self.0)())
        }
        async fn top(&self, _: usize) -> storage::Result<Vec<(UserId, Score)>> {
            Err((self.0)())
        }
        async fn payloads(&self, _: &[UserId]) -> storage::Result<Vec<Option<String>>> {
            Err((self.0)())
        }
        async fn position(&self, _: &UserId) -> storage::Result<Option<u64>> {
            Err((self.0)())
        }
    }

    fn unavailable() -> storage::Error {
        UnavailableSnafu.into_error(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }

    fn half_written() -> storage::Error {
        ConsistencySnafu {
            userid: UserId::new("u1").unwrap(),
            message: "payload write failed".to_owned(),
        }
        .build()
    }

    #[tokio::test]
    async fn storage_failures() {
        let down = app_with(Arc::new(Broken(unavailable)));
        let (status, body) = send(&down, post_score("u1", json!({"score": 10}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
        let (status, _) = send(&down, get_("/scores?limit=5")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&down, get_("/highest")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&down, get_("/rank/u1")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        // Validation still comes first
        let (status, _) = send(&down, post_score("u1", json!({"score": -10}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let inconsistent = app_with(Arc::new(Broken(half_written)));
        let (status, _) = send(&inconsistent, post_score("u1", json!({"score": 10}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn statuses() {
        let (status, _) = ServiceSnafu
            .into_error(
                service::StorageSnafu.into_error(repository::StorageSnafu.into_error(
                    storage::TimeoutSnafu {
                        timeout: Duration::from_secs(5),
                    }
                    .build(),
                )),
            )
            .as_status_and_msg();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // A rolled-back write is our failure, not an outage
        let (status, msg) = ServiceSnafu
            .into_error(
                service::StorageSnafu.into_error(repository::StorageSnafu.into_error(
                    storage::AbortedSnafu {
                        userid: UserId::new("u1").unwrap(),
                        message: "ABORTED ERR out of memory",
                    }
                    .build(),
                )),
            )
            .as_status_and_msg();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(msg.contains("rolled back"));
    }
}
