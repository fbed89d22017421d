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

//! Integration tests specific to the Redis store.
//!
//! These reach around tiermaster to damage the leaderboard keys directly, then check that the
//! service refuses to write through the damage.

use std::time::Duration;

use libtest_mimic::Failed;
use reqwest::StatusCode;
use secrecy::SecretString;

use tiermaster::{
    entities::{Score, UserId},
    redis::{Client, ENTRIES, RANKINGS},
    storage::{self, Backend},
};

use crate::{clear_redis, leaderboard::submit, redis_connection, Fixture};

/// A submission against a wrongly-typed key is refused as corruption & writes nothing
pub fn test_corrupt_keys(fixture: &Fixture, url: &SecretString) -> Result<(), Failed> {
    let userid = UserId::new("u1")?;

    // The payload table isn't a hash:
    fixture.block_on(async {
        let mut conn = redis_connection(url).await?;
        let _: () = redis::cmd("SET")
            .arg(ENTRIES)
            .arg("not a hash")
            .query_async(&mut conn)
            .await?;

        let client = Client::new(url, 1, Duration::from_millis(100)).await?;
        let err = client
            .submit(&userid, Score::from(50), "{}")
            .await
            .expect_err("a submission over a corrupt payload table succeeded");
        assert!(matches!(err, storage::Error::Corrupt { .. }), "{err}");
        assert!(!err.is_retryable());

        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(RANKINGS)
            .arg(userid.as_ref())
            .query_async(&mut conn)
            .await?;
        assert_eq!(None, score);
        Ok::<_, Failed>(())
    })?;

    // The same, by way of the HTTP API
    let rsp = submit(&fixture.client, &fixture.leaderboard, "u2", 60.0)?;
    assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, rsp.status());

    // The ranking index isn't a sorted set:
    fixture.block_on(async {
        clear_redis(url).await?;
        let mut conn = redis_connection(url).await?;
        let _: () = redis::cmd("SET")
            .arg(RANKINGS)
            .arg("not a sorted set")
            .query_async(&mut conn)
            .await?;

        let client = Client::new(url, 1, Duration::from_millis(100)).await?;
        let err = client
            .submit(&userid, Score::from(50), "{}")
            .await
            .expect_err("a submission over a corrupt ranking index succeeded");
        assert!(matches!(err, storage::Error::Corrupt { .. }), "{err}");

        let exists: i64 = redis::cmd("EXISTS")
            .arg(ENTRIES)
            .query_async(&mut conn)
            .await?;
        assert_eq!(0, exists);

        clear_redis(url).await?;
        Ok::<_, Failed>(())
    })
}
