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

//! # repository
//!
//! The leaderboard repository: the one & only reader & writer of the backing store.
//!
//! The ranking index is the authoritative source for ordering & for scores; the payload table is,
//! in effect, a cache of display fields. On the read path that means we take identities & scores
//! from the ranking, look up payloads for them, and overwrite whatever score the payload carries
//! with the ranking's. A ranked identity whose payload is missing or can't be parsed is dropped
//! from the result (with a warning); a damaged payload table degrades the leaderboard but must not
//! take it down.

use std::{future::Future, sync::Arc, time::Duration};

use snafu::{prelude::*, Backtrace, IntoError};
use tracing::{debug, warn};

use crate::{
    define_metric,
    entities::{LeaderboardEntry, Rank, RankedEntry, Score, UserId},
    storage::{self, Backend as StorageBackend, TimeoutSnafu},
};

/// The largest number of entries that may be requested at once
pub const MAX_LIMIT: usize = 100;

/// Default upper bound on any single call to the backing store
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{limit} is not a valid limit; it must be between 1 & {MAX_LIMIT}"))]
    InvalidLimit { limit: usize, backtrace: Backtrace },
    #[snafu(display("Failed to serialize the entry for {userid}: {source}"))]
    Serialize {
        userid: UserId,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Storage { source: storage::Error },
}

impl Error {
    /// If this failure originated in the backing store, return the underlying [storage::Error]
    pub fn storage(&self) -> Option<&storage::Error> {
        match self {
            Error::Storage { source } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "leaderboard.entries.skipped", entries_skipped, Sort::IntegralCounter }

pub struct Repository {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    timeout: Duration,
}

impl Repository {
    pub fn new(storage: Arc<dyn StorageBackend + Send + Sync>, timeout: Duration) -> Repository {
        Repository { storage, timeout }
    }
    /// Drive `fut` to completion, giving up after our configured timeout
    ///
    /// Giving up drops `fut`, which cancels the in-flight call.
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = storage::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.context(StorageSnafu),
            Err(_) => Err(StorageSnafu.into_error(
                TimeoutSnafu {
                    timeout: self.timeout,
                }
                .build(),
            )),
        }
    }
    /// Record `entry` as the current standing of `entry.user_id`
    ///
    /// Both projections are written as one unit; on a [storage::Error::Consistency] failure the
    /// caller should simply retry the entire submission.
    pub async fn submit(&self, entry: &LeaderboardEntry) -> Result<()> {
        let payload = serde_json::to_string(entry).context(SerializeSnafu {
            userid: entry.user_id.clone(),
        })?;
        self.bounded(self.storage.submit(&entry.user_id, entry.score, &payload))
            .await?;
        debug!("Stored {} with score {}", entry.user_id, entry.score);
        Ok(())
    }
    /// Retrieve the `limit` highest-ranked entries, best first
    ///
    /// Each entry's rank is its position in the ranking index. If an entry is dropped for want of a
    /// usable payload, the entries below it keep their ranks.
    pub async fn get_top(&self, limit: usize) -> Result<Vec<RankedEntry>> {
        ensure!((1..=MAX_LIMIT).contains(&limit), InvalidLimitSnafu { limit });

        let ranking = self.bounded(self.storage.top(limit)).await?;
        let userids: Vec<UserId> = ranking.iter().map(|(userid, _)| userid.clone()).collect();
        let payloads = self.bounded(self.storage.payloads(&userids)).await?;

        Ok(ranking
            .into_iter()
            .zip(payloads)
            .enumerate()
            .filter_map(|(index, ((userid, score), payload))| {
                let Some(payload) = payload else {
                    warn!("{userid} is ranked, but has no payload; skipping");
                    entries_skipped.add(1, &[]);
                    return None;
                };
                match serde_json::from_str::<LeaderboardEntry>(&payload) {
                    Ok(mut entry) => {
                        if entry.user_id != userid {
                            warn!(
                                "The payload stored under {userid} names {}; skipping",
                                entry.user_id
                            );
                            entries_skipped.add(1, &[]);
                            return None;
                        }
                        entry.score = score;
                        Some(RankedEntry {
                            entry,
                            rank: Rank::from_index(index as u64),
                        })
                    }
                    Err(err) => {
                        warn!("Failed to parse the payload for {userid} ({err}); skipping");
                        entries_skipped.add(1, &[]);
                        None
                    }
                }
            })
            .collect())
    }
    /// Retrieve the best score in the ranking index; `None` means the leaderboard is empty
    ///
    /// This consults the ranking alone, so a damaged payload for the leader doesn't hide their
    /// score.
    pub async fn get_highest(&self) -> Result<Option<Score>> {
        Ok(self
            .bounded(self.storage.top(1))
            .await?
            .first()
            .map(|(_, score)| *score))
    }
    /// Retrieve the rank of `userid`; `None` means they're not on the leaderboard
    pub async fn get_rank(&self, userid: &UserId) -> Result<Option<Rank>> {
        Ok(self
            .bounded(self.storage.position(userid))
            .await?
            .map(Rank::from_index))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use crate::{
        entities::Username,
        memory::InMemory,
        storage::ConsistencySnafu,
    };

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn entry(userid: &str, score: u32) -> LeaderboardEntry {
        LeaderboardEntry {
            user_id: uid(userid),
            username: Username::new(&format!("{userid}-name")),
            score: Score::from(score),
            last_updated_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn repo(store: Arc<InMemory>) -> Repository {
        Repository::new(store, DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn limits() {
        let repo = repo(Arc::new(InMemory::new()));
        assert!(matches!(
            repo.get_top(0).await,
            Err(Error::InvalidLimit { .. })
        ));
        assert!(matches!(
            repo.get_top(101).await,
            Err(Error::InvalidLimit { .. })
        ));
        assert!(repo.get_top(1).await.unwrap().is_empty());
        assert!(repo.get_top(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ranking_is_authoritative() {
        let store = Arc::new(InMemory::new());
        let repo = repo(store.clone());
        repo.submit(&entry("u1", 50)).await.unwrap();
        repo.submit(&entry("u2", 80)).await.unwrap();

        // Leave the ranking alone but let the payload's copy of the score drift:
        let mut stale = entry("u1", 10);
        stale.username = Username::new("renamed");
        store.clobber_payload(&uid("u1"), Some(&serde_json::to_string(&stale).unwrap()));

        let top = repo.get_top(10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].entry.user_id, uid("u2"));
        assert_eq!(top[0].rank.get(), 1);
        assert_eq!(top[1].entry.user_id, uid("u1"));
        assert_eq!(top[1].entry.score, Score::from(50));
        assert_eq!(top[1].entry.username, Username::new("renamed"));
        assert_eq!(top[1].rank.get(), 2);
    }

    #[tokio::test]
    async fn damaged_payloads_are_skipped() {
        let store = Arc::new(InMemory::new());
        let repo = repo(store.clone());
        for (userid, score) in [("u1", 10), ("u2", 20), ("u3", 30), ("u4", 40)] {
            repo.submit(&entry(userid, score)).await.unwrap();
        }
        store.clobber_payload(&uid("u4"), None);
        store.clobber_payload(&uid("u3"), Some("this is not JSON"));
        store.clobber_payload(
            &uid("u2"),
            Some(&serde_json::to_string(&entry("u9", 20)).unwrap()),
        );

        let top = repo.get_top(4).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].entry.user_id, uid("u1"));
        // u1 is still fourth in the ranking index
        assert_eq!(top[0].rank.get(), 4);
        assert_eq!(repo.get_rank(&uid("u1")).await.unwrap().unwrap().get(), 4);
    }

    #[tokio::test]
    async fn ranks() {
        let repo = repo(Arc::new(InMemory::new()));
        repo.submit(&entry("u1", 50)).await.unwrap();
        repo.submit(&entry("u2", 80)).await.unwrap();
        assert_eq!(repo.get_rank(&uid("u2")).await.unwrap(), Some(Rank::from_index(0)));
        assert_eq!(repo.get_rank(&uid("u1")).await.unwrap(), Some(Rank::from_index(1)));
        assert_eq!(repo.get_rank(&uid("u3")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn highest_comes_from_the_ranking() {
        let store = Arc::new(InMemory::new());
        let repo = repo(store.clone());
        assert_eq!(repo.get_highest().await.unwrap(), None);

        repo.submit(&entry("u1", 50)).await.unwrap();
        repo.submit(&entry("u2", 80)).await.unwrap();
        assert_eq!(repo.get_highest().await.unwrap(), Some(Score::from(80)));

        store.clobber_payload(&uid("u2"), None);
        assert_eq!(repo.get_highest().await.unwrap(), Some(Score::from(80)));
        store.clobber_payload(&uid("u2"), Some("{"));
        assert_eq!(repo.get_highest().await.unwrap(), Some(Score::from(80)));
    }

    /// A backing store that never answers
    struct Stalled;

    #[async_trait]
    impl StorageBackend for Stalled {
        async fn submit(&self, _: &UserId, _: Score, _: &str) -> storage::Result<()> {
            std::future::pending().await
        }
        async fn top(&self, _: usize) -> storage::Result<Vec<(UserId, Score)>> {
            std::future::pending().await
        }
        async fn payloads(&self, _: &[UserId]) -> storage::Result<Vec<Option<String>>> {
            std::future::pending().await
        }
        async fn position(&self, _: &UserId) -> storage::Result<Option<u64>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts() {
        let repo = Repository::new(Arc::new(Stalled), Duration::from_millis(250));
        let err = repo.submit(&entry("u1", 50)).await.unwrap_err();
        assert!(err.storage().unwrap().is_unavailable());
        let err = repo.get_top(10).await.unwrap_err();
        assert!(matches!(
            err.storage(),
            Some(storage::Error::Timeout { .. })
        ));
        assert!(repo.get_rank(&uid("u1")).await.is_err());
    }

    /// A backing store whose writes only ever half-succeed
    struct HalfWritten;

    #[async_trait]
    impl StorageBackend for HalfWritten {
        async fn submit(&self, userid: &UserId, _: Score, _: &str) -> storage::Result<()> {
            ConsistencySnafu {
                userid: userid.clone(),
                message: "payload write failed".to_owned(),
            }
            .fail()
        }
        async fn top(&self, _: usize) -> storage::Result<Vec<(UserId, Score)>> {
            Ok(Vec::new())
        }
        async fn payloads(&self, _: &[UserId]) -> storage::Result<Vec<Option<String>>> {
            Ok(Vec::new())
        }
        async fn position(&self, _: &UserId) -> storage::Result<Option<u64>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn consistency_failures_surface() {
        let repo = Repository::new(Arc::new(HalfWritten), DEFAULT_TIMEOUT);
        let err = repo.submit(&entry("u1", 50)).await.unwrap_err();
        let source = err.storage().unwrap();
        assert!(matches!(source, storage::Error::Consistency { .. }));
        assert!(source.is_retryable());
        assert!(!source.is_unavailable());
    }
}
