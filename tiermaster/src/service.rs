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

//! # service
//!
//! The leaderboard service: the contract boundary for callers.
//!
//! Everything that decides whether a submission is *acceptable* lives here; the [Repository] below
//! us only knows how to store & retrieve. Rules are applied in a fixed order:
//!
//! 1. the score must not be negative
//! 2. the submission must name a user
//! 3. the entry is stamped with the current time
//! 4. the score must meet the configured minimum
//!
//! A submission rejected at any step never reaches the [Repository], so a rejected submission
//! can't disturb a user's existing standing (their `lastUpdatedAt` included).

use chrono::Utc;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};

use crate::{
    entities::{LeaderboardEntry, Rank, RankedEntry, Score, UserId, Username},
    repository::{self, Repository, MAX_LIMIT},
    storage,
};

/// The lowest score the service will accept, absent configuration to the contrary
pub const DEFAULT_MIN_SCORE: u32 = 2;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Scores may not be negative; got {score}"))]
    NegativeScore { score: Score, backtrace: Backtrace },
    #[snafu(display("Submissions must name a user"))]
    MissingIdentity { backtrace: Backtrace },
    #[snafu(display("A score of {score} is below the minimum of {minimum}"))]
    BelowThreshold {
        score: Score,
        minimum: Score,
        backtrace: Backtrace,
    },
    #[snafu(display("{limit} is not a valid limit; it must be between 1 & {MAX_LIMIT}"))]
    LimitOutOfRange { limit: i64, backtrace: Backtrace },
    #[snafu(display("The leaderboard is empty"))]
    Empty { backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Storage { source: repository::Error },
}

impl Error {
    /// True if this failure is the caller's fault; retrying won't help
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NegativeScore { .. }
                | Error::MissingIdentity { .. }
                | Error::BelowThreshold { .. }
                | Error::LimitOutOfRange { .. }
        )
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Empty { .. })
    }
    /// If this failure originated in the backing store, return the underlying [storage::Error]
    pub fn storage(&self) -> Option<&storage::Error> {
        match self {
            Error::Storage { source } => source.storage(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A score submission, as received from a caller
///
/// Nothing here has been checked yet; in particular `user_id` may be empty & `score` may be
/// negative.
#[derive(Clone, Debug, PartialEq)]
pub struct Submission {
    pub user_id: String,
    pub username: Username,
    pub score: Score,
}

pub struct Service {
    repository: Repository,
    minimum: Score,
}

impl Service {
    pub fn new(repository: Repository, minimum: Score) -> Service {
        Service {
            repository,
            minimum,
        }
    }
    pub fn minimum(&self) -> Score {
        self.minimum
    }
    /// Validate & record `submission`; return the entry as stored
    pub async fn submit_score(&self, submission: Submission) -> Result<LeaderboardEntry> {
        let Submission {
            user_id,
            username,
            score,
        } = submission;
        ensure!(!score.is_negative(), NegativeScoreSnafu { score });
        let user_id = UserId::try_from(user_id).map_err(|_| MissingIdentitySnafu.build())?;
        let entry = LeaderboardEntry {
            user_id,
            username,
            score,
            last_updated_at: Utc::now(),
        };
        if entry.score < self.minimum {
            warn!(
                "Rejecting a score of {} for {}; the minimum is {}",
                entry.score, entry.user_id, self.minimum
            );
            return BelowThresholdSnafu {
                score: entry.score,
                minimum: self.minimum,
            }
            .fail();
        }
        self.repository.submit(&entry).await.context(StorageSnafu)?;
        debug!("Recorded a score of {} for {}", entry.score, entry.user_id);
        Ok(entry)
    }
    /// Retrieve the `limit` best players, best first
    pub async fn get_top_players(&self, limit: i64) -> Result<Vec<RankedEntry>> {
        let checked = usize::try_from(limit)
            .ok()
            .filter(|n| (1..=MAX_LIMIT).contains(n))
            .context(LimitOutOfRangeSnafu { limit })?;
        self.repository
            .get_top(checked)
            .await
            .context(StorageSnafu)
    }
    /// Retrieve the best score on the board; [Error::Empty] if nobody's on it
    pub async fn get_highest_score(&self) -> Result<Score> {
        self.repository
            .get_highest()
            .await
            .context(StorageSnafu)?
            .context(EmptySnafu)
    }
    /// Retrieve the rank of `user_id`; `None` means they're not on the board
    pub async fn get_rank(&self, user_id: &UserId) -> Result<Option<Rank>> {
        self.repository
            .get_rank(user_id)
            .await
            .context(StorageSnafu)
    }
}
