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

//! Integration tests for the gateway.

use libtest_mimic::Failed;
use reqwest::StatusCode;

use tiermaster::{
    entities::Rank, gateway::HealthRsp, http::ErrorResponseBody, leaderboard::TopRsp,
};

use crate::{
    leaderboard::{rank, submit, top},
    Fixture,
};

pub fn test_gateway_health(fixture: &Fixture) -> Result<(), Failed> {
    let rsp = fixture
        .client
        .get(fixture.gateway.join("/health")?)
        .send()?;
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<HealthRsp>()?;
    assert_eq!("ok", body.status);
    assert_eq!("gateway", body.service);
    Ok(())
}

/// Writes made through the gateway are visible directly, and vice versa
pub fn test_forwarding(fixture: &Fixture) -> Result<(), Failed> {
    let proxied = fixture.proxied()?;
    let rsp = submit(&fixture.client, &proxied, "u1", 40.0)?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(
        Some(Rank::from_index(0)),
        rank(&fixture.client, &fixture.leaderboard, "u1")?
    );

    let rsp = submit(&fixture.client, &fixture.leaderboard, "u2", 60.0)?;
    assert_eq!(StatusCode::OK, rsp.status());
    let body = top(&fixture.client, &proxied, "2")?.json::<TopRsp>()?;
    assert_eq!(
        vec!["u2", "u1"],
        body.leaderboard
            .iter()
            .map(|ranked| ranked.entry.user_id.as_ref())
            .collect::<Vec<&str>>()
    );

    // Upstream errors are relayed as-is
    let rsp = submit(&fixture.client, &proxied, "u3", -1.0)?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert!(!rsp.json::<ErrorResponseBody>()?.error.is_empty());
    assert_eq!(
        StatusCode::BAD_REQUEST,
        top(&fixture.client, &proxied, "0")?.status()
    );

    Ok(())
}

pub fn test_unknown_service(fixture: &Fixture) -> Result<(), Failed> {
    let rsp = fixture
        .client
        .get(fixture.gateway.join("/api/v1/profiles/u1")?)
        .send()?;
    assert_eq!(StatusCode::NOT_FOUND, rsp.status());
    assert_eq!(
        "Service not available",
        rsp.json::<ErrorResponseBody>()?.error
    );
    Ok(())
}
