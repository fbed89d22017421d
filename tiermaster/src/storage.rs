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

//! # storage
//!
//! Abstractions for the tiermaster storage layer.
//!
//! A leaderboard lives in two structures: a *ranking index* (identity → score, ordered by score)
//! and a *payload table* (identity → serialized [LeaderboardEntry]). They're two projections of the
//! same logical entity, so this trait offers exactly one way to write them: [submit],
//! which must apply both writes or neither. There is no way to update one projection on its own.
//!
//! [LeaderboardEntry]: crate::entities::LeaderboardEntry
//! [submit]: Backend::submit

use std::time::Duration;

use async_trait::async_trait;
use snafu::{Backtrace, IntoError, Snafu};

use crate::entities::{Score, UserId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("The submission for {userid} was refused & rolled back: {message}"))]
    Aborted {
        userid: UserId,
        message: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The submission for {userid} was only partially applied: {message}"))]
    Consistency {
        userid: UserId,
        message: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The backing store returned unexpected data: {message}"))]
    Corrupt { message: String, backtrace: Backtrace },
    #[snafu(display("The backing store didn't answer within {timeout:?}"))]
    Timeout {
        timeout: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("The backing store is unavailable: {source}"))]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Wrap an arbitrary backend failure as [Error::Unavailable]
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        UnavailableSnafu.into_error(Box::new(err))
    }
    /// True if the failure is one the caller may reasonably retry
    ///
    /// A [Consistency] failure is retryable because submissions are idempotent: re-applying the
    /// whole submission restores the invariant. An [Aborted] submission left nothing behind, so it
    /// too may be retried. Timeouts & unavailability should be retried with backoff.
    ///
    /// [Consistency]: Error::Consistency
    /// [Aborted]: Error::Aborted
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Corrupt { .. })
    }
    /// True if this represents the store being unreachable (as opposed to misbehaving)
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Unavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The capability set tiermaster needs from a backing store
///
/// This trait is object-safe: the repository holds an `Arc<dyn Backend + Send + Sync>` so that the
/// store can be chosen at startup (or replaced by an in-memory fake in tests).
#[async_trait]
pub trait Backend {
    /// Write `userid` into the ranking index with `score`, and `payload` into the payload table,
    /// as a single unit of failure. Any prior score & payload for `userid` are replaced.
    async fn submit(&self, userid: &UserId, score: Score, payload: &str) -> Result<()>;
    /// Retrieve the (at most) `limit` highest-scoring identities, with their scores, in descending
    /// order
    async fn top(&self, limit: usize) -> Result<Vec<(UserId, Score)>>;
    /// Retrieve the raw payloads for `userids`; the result is positionally aligned with the input,
    /// with `None` wherever the payload table has no entry
    async fn payloads(&self, userids: &[UserId]) -> Result<Vec<Option<String>>>;
    /// Retrieve the zero-based, descending position of `userid` in the ranking index; `None` if
    /// it's not there
    async fn position(&self, userid: &UserId) -> Result<Option<u64>>;
}
