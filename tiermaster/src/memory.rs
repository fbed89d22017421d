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

//! # memory
//!
//! An in-process [Storage] implementation.
//!
//! [Storage]: crate::storage
//!
//! Handy for tests & for running tiermaster locally without a Redis instance. It mimics Redis'
//! ordering exactly: descending by score, with ties broken in reverse lexicographic order of
//! identity (which is what `ZREVRANGE` does). Both projections live behind one lock, so a
//! submission is trivially all-or-nothing.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use crate::{
    entities::{Score, UserId},
    storage::{Backend, Result},
};

/// Sort key for the ranking index
#[derive(Clone, Debug, Eq, PartialEq)]
struct RankKey {
    score: Score,
    userid: UserId,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| other.userid.cmp(&self.userid))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct State {
    ranking: BTreeSet<RankKey>,
    scores: HashMap<UserId, Score>,
    payloads: HashMap<UserId, String>,
}

#[derive(Debug, Default)]
pub struct InMemory {
    state: Mutex<State>,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
    // A panic while holding the lock can't leave `State` half-updated (every mutation below is a
    // sequence of infallible std collection calls), so just carry on.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Overwrite (or remove) a payload without touching the ranking index
    #[cfg(test)]
    pub(crate) fn clobber_payload(&self, userid: &UserId, payload: Option<&str>) {
        let mut state = self.lock();
        match payload {
            Some(text) => state.payloads.insert(userid.clone(), text.to_owned()),
            None => state.payloads.remove(userid),
        };
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn submit(&self, userid: &UserId, score: Score, payload: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(prior) = state.scores.insert(userid.clone(), score) {
            state.ranking.remove(&RankKey {
                score: prior,
                userid: userid.clone(),
            });
        }
        state.ranking.insert(RankKey {
            score,
            userid: userid.clone(),
        });
        state.payloads.insert(userid.clone(), payload.to_owned());
        Ok(())
    }
    async fn top(&self, limit: usize) -> Result<Vec<(UserId, Score)>> {
        Ok(self
            .lock()
            .ranking
            .iter()
            .take(limit)
            .map(|key| (key.userid.clone(), key.score))
            .collect())
    }
    async fn payloads(&self, userids: &[UserId]) -> Result<Vec<Option<String>>> {
        let state = self.lock();
        Ok(userids
            .iter()
            .map(|userid| state.payloads.get(userid).cloned())
            .collect())
    }
    async fn position(&self, userid: &UserId) -> Result<Option<u64>> {
        let state = self.lock();
        Ok(state.scores.get(userid).map(|score| {
            state
                .ranking
                .range(..RankKey {
                    score: *score,
                    userid: userid.clone(),
                })
                .count() as u64
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[tokio::test]
    async fn ordering_matches_redis() {
        let store = InMemory::new();
        store.submit(&uid("u1"), Score::from(50), "{}").await.unwrap();
        store.submit(&uid("u2"), Score::from(80), "{}").await.unwrap();
        store.submit(&uid("u3"), Score::from(50), "{}").await.unwrap();

        let top = store.top(10).await.unwrap();
        assert_eq!(
            top,
            vec![
                (uid("u2"), Score::from(80)),
                (uid("u3"), Score::from(50)),
                (uid("u1"), Score::from(50)),
            ]
        );
        assert_eq!(store.position(&uid("u2")).await.unwrap(), Some(0));
        assert_eq!(store.position(&uid("u3")).await.unwrap(), Some(1));
        assert_eq!(store.position(&uid("u1")).await.unwrap(), Some(2));
        assert_eq!(store.position(&uid("nobody")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn resubmission_replaces() {
        let store = InMemory::new();
        store.submit(&uid("u1"), Score::from(50), "a").await.unwrap();
        store.submit(&uid("u2"), Score::from(60), "b").await.unwrap();
        store.submit(&uid("u1"), Score::from(70), "c").await.unwrap();

        assert_eq!(store.top(100).await.unwrap().len(), 2);
        assert_eq!(
            store.top(1).await.unwrap(),
            vec![(uid("u1"), Score::from(70))]
        );
        assert_eq!(
            store.payloads(&[uid("u1"), uid("u3")]).await.unwrap(),
            vec![Some("c".to_owned()), None]
        );
    }
}
