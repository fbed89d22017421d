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

//! # The tiermaster Integration Tests
//!
//! # Introduction
//!
//! The Rust unit & integration testing framework is really oriented toward testing *libraries*, not
//! programs. There's no notion of test fixtures, nor even of simple setup & teardown operations
//! that apply to multiple tests. So, as in other projects of mine, the integration tests here
//! swap-out the default test harness for one built on [libtest-mimic]:
//!
//! ```toml
//! [[test]]
//!     name = "leaderboard"
//!     harness = false
//! ```
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! `cargo test` will compile `tests/leaderboard.rs` and run its `main()`, which hands the trials
//! registered there to [libtest-mimic].
//!
//! # Project Structure
//!
//! Test logic lives in this crate, in modules named after the API they exercise ([leaderboard] &
//! [gateway]). Each test is a plain function taking a [Fixture]. The [Fixture] is a leaderboard
//! service, with an in-memory store, fronted by a gateway, all running in-process on ephemeral
//! ports. Each trial gets its own, so tests never see one another's scores.
//!
//! [Fixture::with_redis] backs the service with a real Redis instance instead. Those fixtures all
//! share the one pair of leaderboard keys (each fixture deletes them on the way up), so trials run
//! against them must run one at a time; see `tests/leaderboard-redis.rs`.
//!
//! Code relating to the test framework itself (e.g. the `Test` struct) belongs in `tests/common`.
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use libtest_mimic::Failed;
use redis::aio::MultiplexedConnection;
use reqwest::{blocking::Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use snafu::{prelude::*, Backtrace};
use tokio::{net::TcpListener, runtime::Runtime};

use tiermaster::{
    entities::Score,
    gateway::{Gateway, ServiceRegistry, DEFAULT_UPSTREAM_TIMEOUT, LEADERBOARD},
    leaderboard::HealthRsp,
    memory::InMemory,
    redis::{ENTRIES, RANKINGS},
    repository::{Repository, DEFAULT_TIMEOUT},
    service::{Service, DEFAULT_MIN_SCORE},
    storage::Backend as StorageBackend,
    tiermaster::Tiermaster,
};

pub mod gateway;
pub mod leaderboard;
pub mod redis_store;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind a test listener: {source}"))]
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build the gateway: {source}"))]
    Gateway {
        source: tiermaster::gateway::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Redis request failed: {source}"))]
    Redis {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build the Redis storage client: {source}"))]
    RedisClient {
        source: tiermaster::redis::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build a Tokio runtime: {source}"))]
    Runtime {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad listener URL: {source}"))]
    Url {
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type SharedBackend = Arc<dyn StorageBackend + Send + Sync>;

const REDIS_CONNECT_DELAY: Duration = Duration::from_millis(250);

/// A leaderboard service & a gateway in front of it
///
/// The servers run on a runtime owned by the fixture; dropping the fixture shuts them down.
pub struct Fixture {
    runtime: Runtime,
    /// Base URL of the leaderboard service itself
    pub leaderboard: Url,
    /// Base URL of the gateway
    pub gateway: Url,
    pub client: Client,
}

async fn listen() -> Result<(TcpListener, Url)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context(BindSnafu)?;
    let url = Url::parse(&format!(
        "http://{}",
        listener.local_addr().context(BindSnafu)?
    ))
    .context(UrlSnafu)?;
    Ok((listener, url))
}

impl Fixture {
    /// Stand-up a fresh fixture with the default minimum score
    pub fn new() -> Result<Fixture> {
        Fixture::with_minimum(Score::from(DEFAULT_MIN_SCORE))
    }
    pub fn with_minimum(minimum: Score) -> Result<Fixture> {
        Fixture::build(minimum, || async {
            Ok(Arc::new(InMemory::new()) as SharedBackend)
        })
    }
    /// Stand-up a fixture whose leaderboard is kept in the Redis instance at `url`
    ///
    /// Both leaderboard keys are deleted first, so the board starts out empty.
    pub fn with_redis(url: &SecretString) -> Result<Fixture> {
        let url = url.clone();
        Fixture::build(Score::from(DEFAULT_MIN_SCORE), move || async move {
            clear_redis(&url).await?;
            let client = tiermaster::redis::Client::new(&url, 3, REDIS_CONNECT_DELAY)
                .await
                .context(RedisClientSnafu)?;
            Ok(Arc::new(client) as SharedBackend)
        })
    }
    // The store is built on the fixture's runtime; a Redis connection is tied to the runtime that
    // made it.
    fn build<F, Fut>(minimum: Score, storage: F) -> Result<Fixture>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedBackend>>,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context(RuntimeSnafu)?;

        let (leaderboard, gateway) = runtime.block_on(async move {
            let storage = storage().await?;
            let (listener, leaderboard) = listen().await?;
            let state = Arc::new(Tiermaster {
                service_name: LEADERBOARD.to_owned(),
                service: Service::new(Repository::new(storage, DEFAULT_TIMEOUT), minimum),
                registry: prometheus::Registry::new(),
            });
            tokio::spawn(async move {
                axum::serve(listener, tiermaster::leaderboard::make_router(state)).await
            });

            let (listener, gateway) = listen().await?;
            let state = Arc::new(
                Gateway::new(
                    ServiceRegistry::new(HashMap::from([(
                        LEADERBOARD.to_owned(),
                        leaderboard.clone(),
                    )])),
                    DEFAULT_UPSTREAM_TIMEOUT,
                    prometheus::Registry::new(),
                )
                .context(GatewaySnafu)?,
            );
            tokio::spawn(async move {
                axum::serve(listener, tiermaster::gateway::make_router(state)).await
            });

            Ok::<_, Error>((leaderboard, gateway))
        })?;

        Ok(Fixture {
            runtime,
            leaderboard,
            gateway,
            client: Client::new(),
        })
    }
    /// Run `fut` to completion on the fixture's runtime
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
    /// The leaderboard API, as reached through the gateway
    pub fn proxied(&self) -> std::result::Result<Url, url::ParseError> {
        self.gateway.join(&format!("/api/v1/{LEADERBOARD}/"))
    }
}

/// Open a connection to the Redis instance at `url`, independent of any tiermaster client
pub async fn redis_connection(url: &SecretString) -> Result<MultiplexedConnection> {
    redis::Client::open(url.expose_secret())
        .context(RedisSnafu)?
        .get_multiplexed_async_connection()
        .await
        .context(RedisSnafu)
}

/// Delete both leaderboard keys
pub async fn clear_redis(url: &SecretString) -> Result<()> {
    let mut conn = redis_connection(url).await?;
    let _: () = redis::cmd("DEL")
        .arg(RANKINGS)
        .arg(ENTRIES)
        .query_async(&mut conn)
        .await
        .context(RedisSnafu)?;
    Ok(())
}

/// Hit the leaderboard healthcheck endpoint; fail on anything other than success.
pub fn test_healthcheck(fixture: &Fixture) -> std::result::Result<(), Failed> {
    let rsp = fixture
        .client
        .get(fixture.leaderboard.join("/health")?)
        .send()?;
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<HealthRsp>()?;
    assert_eq!("healthy", body.status);
    assert_eq!(LEADERBOARD, body.service);
    Ok(())
}
