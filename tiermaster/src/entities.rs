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

//! # tiermaster models
//!
//! ## Introduction
//!
//! The handful of types everything else in tiermaster is written in terms of: the identity of a
//! player, their display name, their score, and the two shapes a player's standing takes (as
//! stored, and as ranked).

use std::{cmp::Ordering, fmt::Display, ops::Deref};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("User IDs may not be empty"))]
    EmptyUserId { backtrace: Backtrace },
    #[snafu(display("{value} is not a finite score"))]
    NonFiniteScore { value: f64, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_serde_de_err<'de, D: Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             UserId                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tiermaster user identity
///
/// This is the primary key in both the ranking index & the payload table. tiermaster doesn't mint
/// these; they're handed to us by callers, so the only thing we insist upon is that they not be
/// empty.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: &str) -> Result<UserId> {
        UserId::try_from(id.to_owned())
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(value: String) -> StdResult<Self, Self::Error> {
        ensure!(!value.is_empty(), EmptyUserIdSnafu);
        Ok(UserId(value))
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for UserId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand so that an empty identity can't sneak in through a payload
impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        UserId::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A display label; unlike [UserId], there's no uniqueness constraint & no validation
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: &str) -> Username {
        Username(name.to_owned())
    }
}

impl From<String> for Username {
    fn from(value: String) -> Self {
        Username(value)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Score                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A player's score
///
/// Scores are 64-bit floating point values, because that's what sorted-set stores order on. NaN &
/// the infinities are refused at construction time, which lets us give [Score] a total order.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(transparent)]
pub struct Score(f64);

impl Score {
    pub fn new(value: f64) -> Result<Score> {
        ensure!(value.is_finite(), NonFiniteScoreSnafu { value });
        Ok(Score(value))
    }
    pub fn value(&self) -> f64 {
        self.0
    }
    pub fn is_negative(&self) -> bool {
        self.0 < 0.0
    }
}

impl TryFrom<f64> for Score {
    type Error = Error;

    fn try_from(value: f64) -> StdResult<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<u32> for Score {
    fn from(value: u32) -> Self {
        Score(value as f64)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl<'de> Deserialize<'de> for Score {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let f = <f64 as serde::Deserialize>::deserialize(deserializer)?;
        Score::new(f).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Rank                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A 1-based position on the leaderboard, descending by score
///
/// Ranks are never stored; they're computed from the ranking index on every read.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Rank(u64);

impl Rank {
    /// Produce the [Rank] corresponding to a zero-based position in the ranking index
    pub fn from_index(index: u64) -> Rank {
        Rank(index + 1)
    }
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        LeaderboardEntry                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One user's current standing
///
/// This is also the payload format: it's serialized to JSON & stored in the payload table under
/// the user's [UserId]. The field names are part of that format & must not change.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub username: Username,
    pub score: Score,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: DateTime<Utc>,
}

/// A [LeaderboardEntry] annotated with its position
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RankedEntry {
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
    pub rank: Rank,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_ids() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("u1").is_ok());
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
    }

    #[test]
    fn scores() {
        assert!(Score::new(f64::NAN).is_err());
        assert!(Score::new(f64::INFINITY).is_err());
        assert!(Score::new(-1.0).unwrap().is_negative());
        assert!(Score::from(80) > Score::from(50));
        assert_eq!(Score::from(50), Score::new(50.0).unwrap());
    }

    #[test]
    fn ranks() {
        assert_eq!(Rank::from_index(0).get(), 1);
        assert!(Rank::from_index(0) < Rank::from_index(1));
    }

    #[test]
    fn payload_format() {
        let entry = LeaderboardEntry {
            user_id: UserId::new("u1").unwrap(),
            username: Username::new("alice"),
            score: Score::from(50),
            last_updated_at: DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["score"], 50.0);
        assert!(json["lastUpdatedAt"].as_str().unwrap().starts_with("2025-06-01T12:00:00"));

        let ranked = RankedEntry {
            entry: entry.clone(),
            rank: Rank::from_index(2),
        };
        let json = serde_json::to_value(&ranked).unwrap();
        assert_eq!(json["rank"], 3);
        assert_eq!(json["userId"], "u1");
        assert_eq!(
            serde_json::from_value::<RankedEntry>(json).unwrap().entry,
            entry
        );
    }
}
