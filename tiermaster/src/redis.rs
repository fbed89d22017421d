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

//! # redis
//!
//! [Storage] implementation for Redis.
//!
//! [Storage]: crate::storage
//!
//! The ranking index is a sorted set & the payload table a hash. Keeping the two in step is the
//! whole game here. Pipelining `ZADD` & `HSET` back-to-back would save a round trip but guarantees
//! nothing: either command can fail independently of the other. Instead, a submission is a single
//! Lua script, which Redis runs atomically (no other command interleaves with it). The script:
//!
//! 1. checks the types of both keys *before* writing anything, so that the common failure (some
//!    other client clobbered one of our keys) can't leave a half-applied write;
//! 2. writes the ranking, then the payload;
//! 3. if the payload write fails anyway, restores the ranking to its prior state & reports
//!    `ABORTED` (nothing was applied), which we surface as [Aborted];
//! 4. if even *that* fails, reports `PARTIAL`, which we surface as [Consistency] so the caller can
//!    retry the (idempotent) submission.
//!
//! [Aborted]: crate::storage::Error::Aborted
//! [Consistency]: crate::storage::Error::Consistency
//!
//! Because the script is atomic on the server, dropping the future mid-flight (on a timeout, say)
//! leaves the store either fully updated or untouched.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisError, Script};
use secrecy::{ExposeSecret, SecretString};
use snafu::{prelude::*, Backtrace, IntoError};
use tracing::{debug, warn};

use crate::{
    entities::{Score, UserId},
    storage::{self, AbortedSnafu, Backend, ConsistencySnafu, CorruptSnafu},
};

/// The sorted set holding (identity, score) pairs
pub const RANKINGS: &str = "leaderboard:rankings";
/// The hash holding (identity, JSON payload) pairs
pub const ENTRIES: &str = "leaderboard:entries";

const SUBMIT_SCRIPT: &str = r#"
local rankings, entries = KEYS[1], KEYS[2]
local userid, score, payload = ARGV[1], ARGV[2], ARGV[3]

local function check(key, expected)
  local found = redis.call('TYPE', key).ok
  if found ~= 'none' and found ~= expected then
    return redis.error_reply('WRONGTYPE ' .. key .. ' holds a ' .. found)
  end
  return nil
end

local bad = check(rankings, 'zset') or check(entries, 'hash')
if bad then
  return bad
end

local prior = redis.call('ZSCORE', rankings, userid)
redis.call('ZADD', rankings, score, userid)
local written = redis.pcall('HSET', entries, userid, payload)
if type(written) == 'table' and written.err then
  local undone
  if prior then
    undone = redis.pcall('ZADD', rankings, prior, userid)
  else
    undone = redis.pcall('ZREM', rankings, userid)
  end
  if type(undone) == 'table' and undone.err then
    return redis.error_reply('PARTIAL ' .. written.err)
  end
  return redis.error_reply('ABORTED ' .. written.err)
end
return 1
"#;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to Redis after {attempts} attempt(s): {source}"))]
    Connect {
        attempts: usize,
        source: RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad Redis connection URL: {source}"))]
    Open {
        source: RedisError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Map a failed Redis call onto the storage error taxonomy
fn classify(userid: Option<&UserId>, err: RedisError) -> storage::Error {
    let code = err.code().map(str::to_owned);
    classify_reply(userid, code.as_deref(), err)
}

/// Map an error reply, identified by its leading `code`, onto the storage error taxonomy
///
/// `PARTIAL` & `ABORTED` come from our submit script, & are only meaningful with an identity.
fn classify_reply<E>(userid: Option<&UserId>, code: Option<&str>, err: E) -> storage::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    match (code, userid) {
        (Some("PARTIAL"), Some(userid)) => ConsistencySnafu {
            userid: userid.clone(),
            message: err.to_string(),
        }
        .build(),
        (Some("ABORTED"), Some(userid)) => AbortedSnafu {
            userid: userid.clone(),
            message: err.to_string(),
        }
        .build(),
        (Some("WRONGTYPE"), _) => CorruptSnafu {
            message: err.to_string(),
        }
        .build(),
        _ => storage::Error::unavailable(err),
    }
}

/// A tiermaster Redis client
///
/// [ConnectionManager] is a multiplexed connection that reconnects on its own; cloning it is cheap
/// & every clone shares the one underlying connection, so a single [Client] serves all requests.
pub struct Client {
    conn: ConnectionManager,
    submit: Script,
}

impl Client {
    /// Connect to the Redis instance at `url`, making up to `attempts` attempts `delay` apart
    pub async fn new(url: &SecretString, attempts: usize, delay: Duration) -> Result<Client> {
        let client = redis::Client::open(url.expose_secret()).context(OpenSnafu)?;
        let attempts = attempts.max(1);
        let mut attempt = 1;
        let conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(err) if attempt < attempts => {
                    warn!(
                        "Attempt {attempt} to connect to Redis failed ({err}); retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(ConnectSnafu { attempts }.into_error(err)),
            }
        };
        debug!("Connected to Redis after {attempt} attempt(s)");
        Ok(Client {
            conn,
            submit: Script::new(SUBMIT_SCRIPT),
        })
    }
}

#[async_trait]
impl Backend for Client {
    async fn submit(&self, userid: &UserId, score: Score, payload: &str) -> storage::Result<()> {
        let mut conn = self.conn.clone();
        let result: std::result::Result<i64, RedisError> = self
            .submit
            .key(RANKINGS)
            .key(ENTRIES)
            .arg(userid.as_ref())
            .arg(score.value())
            .arg(payload)
            .invoke_async(&mut conn)
            .await;
        result.map(|_| ()).map_err(|err| classify(Some(userid), err))
    }
    async fn top(&self, limit: usize) -> storage::Result<Vec<(UserId, Score)>> {
        // A stop index of -1 would mean "everything"
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(RANKINGS)
            .arg(0)
            .arg(limit - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|err| classify(None, err))?;
        raw.into_iter()
            .map(|(member, score)| {
                let userid = UserId::try_from(member).map_err(|err| {
                    CorruptSnafu {
                        message: format!("bad member in {RANKINGS}: {err}"),
                    }
                    .build()
                })?;
                let score = Score::new(score).map_err(|err| {
                    CorruptSnafu {
                        message: format!("bad score for {userid} in {RANKINGS}: {err}"),
                    }
                    .build()
                })?;
                Ok((userid, score))
            })
            .collect()
    }
    async fn payloads(&self, userids: &[UserId]) -> storage::Result<Vec<Option<String>>> {
        // HMGET requires at least one field
        if userids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(ENTRIES)
            .arg(userids.iter().map(|u| u.as_ref()).collect::<Vec<&str>>())
            .query_async(&mut conn)
            .await
            .map_err(|err| classify(None, err))?;
        Ok(payloads)
    }
    async fn position(&self, userid: &UserId) -> storage::Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let position: Option<u64> = redis::cmd("ZREVRANK")
            .arg(RANKINGS)
            .arg(userid.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(|err| classify(Some(userid), err))?;
        Ok(position)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reply(text: &str) -> std::io::Error {
        std::io::Error::other(text.to_owned())
    }

    #[test]
    fn script_replies() {
        let userid = UserId::new("u1").unwrap();

        let err = classify_reply(
            Some(&userid),
            Some("PARTIAL"),
            reply("PARTIAL ERR out of memory"),
        );
        match &err {
            storage::Error::Consistency { userid: named, .. } => assert_eq!(*named, userid),
            other => panic!("expected a consistency failure, got {other:?}"),
        }
        assert!(err.is_retryable());
        assert!(!err.is_unavailable());

        let err = classify_reply(
            Some(&userid),
            Some("ABORTED"),
            reply("ABORTED ERR out of memory"),
        );
        assert!(matches!(err, storage::Error::Aborted { .. }));
        assert!(err.is_retryable());
        assert!(!err.is_unavailable());

        let err = classify_reply(
            Some(&userid),
            Some("WRONGTYPE"),
            reply("WRONGTYPE leaderboard:entries holds a string"),
        );
        assert!(matches!(err, storage::Error::Corrupt { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn everything_else_is_unavailability() {
        let userid = UserId::new("u1").unwrap();
        // Script codes mean nothing on the read path
        assert!(classify_reply(None, Some("PARTIAL"), reply("PARTIAL ?")).is_unavailable());
        assert!(classify_reply(Some(&userid), Some("ERR"), reply("ERR whatever")).is_unavailable());
        assert!(classify_reply(Some(&userid), None, reply("connection reset")).is_unavailable());
    }
}
