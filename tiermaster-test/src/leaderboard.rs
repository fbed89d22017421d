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

//! Integration tests for the leaderboard API.
//!
//! Each test takes a base URL at which the leaderboard API is rooted, so the same logic can be run
//! against the service directly or through the gateway.

use libtest_mimic::Failed;
use reqwest::{
    blocking::{Client, Response},
    StatusCode, Url,
};
use serde_json::json;

use tiermaster::{
    entities::{Rank, Score},
    http::ErrorResponseBody,
    leaderboard::{HighestRsp, RankRsp, SubmitRsp, TopRsp},
};

pub fn submit(client: &Client, base: &Url, user_id: &str, score: f64) -> Result<Response, Failed> {
    Ok(client
        .post(base.join(&format!("score/{user_id}"))?)
        .json(&json!({"username": format!("player-{user_id}"), "score": score}))
        .send()?)
}

fn submit_ok(client: &Client, base: &Url, user_id: &str, score: f64) -> Result<(), Failed> {
    let rsp = submit(client, base, user_id, score)?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(
        "Successfully submitted score",
        rsp.json::<SubmitRsp>()?.message
    );
    Ok(())
}

pub fn top(client: &Client, base: &Url, limit: &str) -> Result<Response, Failed> {
    Ok(client
        .get(base.join(&format!("scores?limit={limit}"))?)
        .send()?)
}

pub fn rank(client: &Client, base: &Url, user_id: &str) -> Result<Option<Rank>, Failed> {
    let rsp = client.get(base.join(&format!("rank/{user_id}"))?).send()?;
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<RankRsp>()?;
    assert_eq!(user_id, body.user_id.as_ref());
    Ok(body.rank)
}

/// Three players, one tie: the ranking is strictly increasing & the leader is unambiguous
pub fn test_ranking(client: &Client, base: &Url) -> Result<(), Failed> {
    submit_ok(client, base, "u1", 50.0)?;
    submit_ok(client, base, "u2", 80.0)?;
    submit_ok(client, base, "u3", 50.0)?;

    let rsp = top(client, base, "3")?;
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<TopRsp>()?;
    assert_eq!("Top 3 users", body.message);
    assert_eq!(3, body.leaderboard.len());
    assert_eq!("u2", body.leaderboard[0].entry.user_id.as_ref());
    assert_eq!(Score::from(80), body.leaderboard[0].entry.score);
    let mut tied = body
        .leaderboard
        .iter()
        .skip(1)
        .map(|ranked| ranked.entry.user_id.to_string())
        .collect::<Vec<String>>();
    tied.sort();
    assert_eq!(vec!["u1".to_owned(), "u3".to_owned()], tied);
    assert!(body
        .leaderboard
        .windows(2)
        .all(|pair| pair[0].rank < pair[1].rank));
    assert_eq!(
        vec![1, 2, 3],
        body.leaderboard
            .iter()
            .map(|ranked| ranked.rank.get())
            .collect::<Vec<u64>>()
    );

    assert_eq!(Some(Rank::from_index(0)), rank(client, base, "u2")?);

    let rsp = client.get(base.join("highest")?).send()?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(Score::from(80), rsp.json::<HighestRsp>()?.highest_score);

    // A later submission replaces the earlier one, even if it's lower:
    submit_ok(client, base, "u2", 10.0)?;
    assert_eq!(Some(Rank::from_index(2)), rank(client, base, "u2")?);
    let body = top(client, base, "1")?.json::<TopRsp>()?;
    assert_eq!(1, body.leaderboard.len());
    assert_eq!(Score::from(50), body.leaderboard[0].entry.score);

    Ok(())
}

/// Submissions that must be refused, and leave no trace
pub fn test_rejections(client: &Client, base: &Url) -> Result<(), Failed> {
    let rsp = submit(client, base, "u1", 1.0)?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert!(!rsp.json::<ErrorResponseBody>()?.error.is_empty());
    assert_eq!(None, rank(client, base, "u1")?);

    let rsp = submit(client, base, "u1", -5.0)?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(None, rank(client, base, "u1")?);

    let rsp = client
        .post(base.join("score/u1")?)
        .json(&json!({"userId": "u9", "username": "nine", "score": 40}))
        .send()?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(None, rank(client, base, "u1")?);
    assert_eq!(None, rank(client, base, "u9")?);

    let rsp = client
        .post(base.join("score/u1")?)
        .header("content-type", "application/json")
        .body("{\"score\": \"lots\"}")
        .send()?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());

    // Nothing was written, so there's no leader:
    let rsp = client.get(base.join("highest")?).send()?;
    assert_eq!(StatusCode::NOT_FOUND, rsp.status());

    // The threshold itself is fine
    submit_ok(client, base, "u1", 2.0)?;
    assert_eq!(Some(Rank::from_index(0)), rank(client, base, "u1")?);

    Ok(())
}

/// `limit` must be present & in [1, 100]
pub fn test_limits(client: &Client, base: &Url) -> Result<(), Failed> {
    submit_ok(client, base, "u1", 10.0)?;
    for bad in ["0", "-1", "101", "ten", ""] {
        assert_eq!(StatusCode::BAD_REQUEST, top(client, base, bad)?.status());
    }
    assert_eq!(
        StatusCode::BAD_REQUEST,
        client.get(base.join("scores")?).send()?.status()
    );

    let rsp = top(client, base, "100")?;
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<TopRsp>()?;
    assert_eq!("Top 100 users", body.message);
    assert_eq!(1, body.leaderboard.len());
    Ok(())
}
