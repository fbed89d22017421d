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

//! # tiermaster-gateway
//!
//! The public entry point to a tiermaster deployment.
//!
//! Requests for `/api/v1/{service}/...` are relayed to the base URL configured for `{service}`;
//! everything else is answered locally (`/health` & `/metrics`) or refused.

use std::{
    fmt::Display, future::IntoFuture, io, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc,
    time::Duration,
};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use tiermaster::{
    gateway::{make_router, Gateway, ServiceRegistry, DEFAULT_UPSTREAM_TIMEOUT},
    metrics::init_telemetry,
};

/// The gateway's application error type
///
/// As with tiermasterd, [Debug] is implemented in terms of [Display] so that an error returned from
/// `main()` reads well.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to build the gateway: {source}"))]
    Gateway { source: tiermaster::gateway::Error },
    #[snafu(display("Failed to initialize telemetry: {source}"))]
    Metrics { source: tiermaster::metrics::Error },
    #[snafu(display("The HTTP server failed: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// Gateway configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// Local address at which to listen; specify as "address:port"
    address: SocketAddr,
    /// Logical service name → base URL
    services: ServiceRegistry,
    /// Upper bound on any one upstream exchange
    #[serde(rename = "upstream-timeout")]
    upstream_timeout: Duration,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            address: "0.0.0.0:80".parse::<SocketAddr>().unwrap(/* known good */),
            services: ServiceRegistry::default(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")]
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

fn parse_config_text(text: &str) -> StdResult<ConfigV1, toml::de::Error> {
    toml::from_str::<Configuration>(text).map(|cfg| match cfg {
        Configuration::V1(cfg) => cfg,
    })
}

/// Parse the gateway configuration; `/etc/tiermaster-gateway.toml` is optional, a named file isn't
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || {
            (
                PathBuf::from_str("/etc/tiermaster-gateway.toml").unwrap(/* known good */),
                true,
            )
        },
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => {
            parse_config_text(&text).map_err(|err| ConfigParseSnafu { pth }.into_error(err))
        }
        Err(err) if defaulted && err.kind() == io::ErrorKind::NotFound => Ok(ConfigV1::default()),
        Err(err) => Err(ConfigNotFoundSnafu { pth }.into_error(err)),
    }
}

fn make_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context(EnvFilterSnafu)
}

fn make_formatter(plain: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    if plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    }
}

#[tracing::instrument(skip(cfg_path, address, cfg))]
async fn serve(
    cfg_path: Option<PathBuf>,
    address: Option<SocketAddr>,
    mut cfg: ConfigV1,
) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    let registry = init_telemetry("gateway").context(MetricsSnafu)?;

    loop {
        let state = Arc::new(
            Gateway::new(cfg.services.clone(), cfg.upstream_timeout, registry.clone())
                .context(GatewaySnafu)?,
        );
        let address = address.unwrap_or(cfg.address);
        let nfy = Arc::new(Notify::new());
        let mut server = axum::serve(
            TcpListener::bind(address)
                .await
                .context(BindSnafu { address })?,
            make_router(state),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()))
        .into_future();

        info!(
            "Gateway listening on {address}, fronting {} service(s)",
            cfg.services.len()
        );

        let done = tokio::select! {
            res = &mut server => {
                error!("The HTTP server exited unexpectedly: {res:?}");
                return res.context(ServeSnafu);
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                true
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT; terminating.");
                true
            }
        };

        nfy.notify_one();
        if let Err(err) = server.await {
            error!("{err:?}");
        }
        if done {
            break;
        }
        cfg = match parse_config(&cfg_path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!("{err:?}; keeping the prior configuration");
                cfg
            }
        };
    }

    Ok(())
}

fn main() -> Result<()> {
    let matches = Command::new("tiermaster-gateway")
        .version(crate_version!())
        .author(crate_authors!())
        .about("API gateway for tiermaster")
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .num_args(1)
                .value_parser(value_parser!(SocketAddr))
                .env("TIERMASTER_GATEWAY_ADDRESS")
                .help("address at which to listen (overrides the configuration file)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("TIERMASTER_GATEWAY_CONFIG")
                .help("path to a configuration file"),
        )
        .arg(
            Arg::new("plain")
                .short('p')
                .long("plain")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("TIERMASTER_GATEWAY_PLAIN")
                .help("log in human-readable format, not JSON/structured logging"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("TIERMASTER_GATEWAY_VERBOSE")
                .help("produce prolix output"),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let cfg_path = matches.get_one::<PathBuf>("config").cloned();
    let address = matches.get_one::<SocketAddr>("address").cloned();

    let bootstrap_logging_guard = tracing::subscriber::set_default(
        Registry::default()
            .with(fmt::Layer::default().with_writer(io::stderr))
            .with(make_filter(level)?),
    );
    debug!("Temporarily logging to stderr while initializing.");

    let cfg = match parse_config(&cfg_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("While configuring tiermaster-gateway: {err:?}");
            return Err(err);
        }
    };

    tracing::subscriber::set_global_default(
        Registry::default()
            .with(make_formatter(matches.get_flag("plain")))
            .with(make_filter(level)?),
    )
    .context(SubscriberSnafu)?;
    drop(bootstrap_logging_guard);
    info!("tiermaster-gateway version {} starting.", crate_version!());

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(cfg_path, address, cfg))
}

#[cfg(test)]
mod test {
    use super::*;

    use tiermaster::gateway::{DEFAULT_LEADERBOARD_URL, LEADERBOARD};

    #[test]
    fn config_parsing() {
        let cfg = parse_config_text("version = \"1\"\n").unwrap();
        assert_eq!(cfg.address, "0.0.0.0:80".parse::<SocketAddr>().unwrap());
        assert_eq!(
            cfg.services.get(LEADERBOARD).unwrap().as_str(),
            format!("{DEFAULT_LEADERBOARD_URL}/")
        );
        assert_eq!(cfg.upstream_timeout, DEFAULT_UPSTREAM_TIMEOUT);

        let cfg = parse_config_text(
            r#"
version = "1"
address = "127.0.0.1:8080"

[services]
leaderboard = "http://127.0.0.1:3001"
profiles = "http://profiles:4000/v2/"
"#,
        )
        .unwrap();
        assert_eq!(cfg.services.len(), 2);
        assert_eq!(
            cfg.services.get("profiles").unwrap().as_str(),
            "http://profiles:4000/v2/"
        );

        assert!(parse_config_text("version = \"1\"\n[services]\nbad = \"not a url\"\n").is_err());
    }
}
