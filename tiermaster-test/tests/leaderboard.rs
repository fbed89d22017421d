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

//! # The leaderboard Integration Tests
//!
//! Every trial runs against its own [Fixture]: a leaderboard service with an in-memory store & a
//! gateway in front of it, both listening on ephemeral ports on the loopback interface. That makes
//! the trials independent of one another, so libtest-mimic is free to run them in parallel.
//!
//! Set `TIERMASTER_TEST_LOG` to a filter directive (e.g. `debug`) to see the servers' logs.

use std::{env, io};

use libtest_mimic::{Arguments, Failed, Trial};
use reqwest::StatusCode;
use snafu::{prelude::*, Backtrace};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Registry};

use tiermaster::entities::Score;
use tiermaster_test::{
    gateway::{test_forwarding, test_gateway_health, test_unknown_service},
    leaderboard::{submit, test_limits, test_ranking, test_rejections},
    test_healthcheck, Fixture,
};

use common::Test;

mod common;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Bad TIERMASTER_TEST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

inventory::submit!(Test {
    name: "000test_healthcheck",
    test_fn: test_healthcheck,
});

inventory::submit!(Test {
    name: "010leaderboard_ranking",
    test_fn: |fixture| test_ranking(&fixture.client, &fixture.leaderboard),
});

inventory::submit!(Test {
    name: "011leaderboard_rejections",
    test_fn: |fixture| test_rejections(&fixture.client, &fixture.leaderboard),
});

inventory::submit!(Test {
    name: "012leaderboard_limits",
    test_fn: |fixture| test_limits(&fixture.client, &fixture.leaderboard),
});

inventory::submit!(Test {
    name: "020gateway_health",
    test_fn: test_gateway_health,
});

inventory::submit!(Test {
    name: "021gateway_forwarding",
    test_fn: test_forwarding,
});

inventory::submit!(Test {
    name: "022gateway_unknown_service",
    test_fn: test_unknown_service,
});

inventory::submit!(Test {
    name: "023gateway_ranking",
    test_fn: |fixture| test_ranking(&fixture.client, &fixture.proxied()?),
});

/// A stricter board: 25 is the floor
fn test_configured_minimum(_fixture: &Fixture) -> StdResult<(), Failed> {
    let fixture = Fixture::with_minimum(Score::from(25))?;
    let rsp = submit(&fixture.client, &fixture.leaderboard, "u1", 24.0)?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    let rsp = submit(&fixture.client, &fixture.leaderboard, "u1", 25.0)?;
    assert_eq!(StatusCode::OK, rsp.status());
    Ok(())
}

inventory::submit!(Test {
    name: "030configured_minimum",
    test_fn: test_configured_minimum,
});

fn main() -> Result<()> {
    if let Ok(directive) = env::var("TIERMASTER_TEST_LOG") {
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(EnvFilter::try_new(directive).context(FilterSnafu)?),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    let args = Arguments::from_args();

    let mut tests = inventory::iter::<Test>.into_iter().collect::<Vec<&Test>>();
    tests.sort_by_key(|test| test.name);

    let conclusion = libtest_mimic::run(
        &args,
        tests
            .into_iter()
            .map(|test| {
                Trial::test(test.name, move || {
                    let fixture = Fixture::new()?;
                    (test.test_fn)(&fixture)
                })
            })
            .collect(),
    );

    conclusion.exit();
}
