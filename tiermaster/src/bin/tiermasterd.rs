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

//! # tiermasterd
//!
//! The tiermaster leaderboard service.
//!
//! # Introduction
//!
//! tiermasterd accepts score submissions over HTTP & serves the resulting rankings. It's meant to
//! run in the foreground, under a supervisor or in a container; logs go to stdout.

use std::{
    fmt::Display,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use tiermaster::{
    entities::Score,
    leaderboard::make_router,
    memory::InMemory,
    metrics::init_telemetry,
    repository::{Repository, DEFAULT_TIMEOUT},
    service::{Service, DEFAULT_MIN_SCORE},
    storage::Backend as StorageBackend,
    tiermaster::Tiermaster,
};

/// The tiermasterd application error type
///
/// Note that I do not derive [Debug] for this error. `main()` returns `Result<(), Error>`, and
/// should it return the `Err` variant the Rust runtime will print it using its `Debug`
/// implementation. The derived implementation is neither readable nor brief, so I implement it "by
/// hand" in terms of [Display].
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
    #[snafu(display("Failed to initialize telemetry: {source}"))]
    Metrics { source: tiermaster::metrics::Error },
    #[snafu(display("Failed to connect to Redis: {source}"))]
    Redis { source: tiermaster::redis::Error },
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

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
    /// Overrides the configured listening address
    pub address: Option<SocketAddr>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
            address: matches.get_one::<SocketAddr>("address").cloned(),
        }
    }
}

fn default_connect_attempts() -> usize {
    5
}

fn default_connect_delay() -> Duration {
    Duration::from_secs(2)
}

/// tiermaster datastore configuration
///
/// Application code is written against [StorageBackend]; which implementation backs it is chosen
/// here, at startup.
// Nb. that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    /// Use Redis
    Redis {
        /// Connection URL, e.g. `redis://:password@redis-1:6379/0`; may embed credentials
        url: SecretString,
        /// How many times to try connecting at startup before giving up
        #[serde(rename = "connect-attempts", default = "default_connect_attempts")]
        connect_attempts: usize,
        /// How long to wait between connection attempts
        #[serde(rename = "connect-delay", default = "default_connect_delay")]
        connect_delay: Duration,
    },
    /// Keep everything in process memory; nothing survives a restart
    InMemory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Redis {
            url: SecretString::from("redis://redis-1:6379/0"),
            connect_attempts: default_connect_attempts(),
            connect_delay: default_connect_delay(),
        }
    }
}

/// tiermasterd configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// Local address at which to listen; specify as "address:port"
    address: SocketAddr,
    /// The name this instance reports from `/health`, and tags its metrics with
    #[serde(rename = "service-name")]
    service_name: String,
    /// Submissions scoring below this are refused
    #[serde(rename = "minimum-score")]
    minimum_score: Score,
    /// Upper bound on any single call to the backing store
    #[serde(rename = "storage-timeout")]
    storage_timeout: Duration,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            address: "0.0.0.0:3001".parse::<SocketAddr>().unwrap(/* known good */),
            service_name: "leaderboard".to_owned(),
            minimum_score: Score::from(DEFAULT_MIN_SCORE),
            storage_timeout: DEFAULT_TIMEOUT,
            storage_config: StorageConfig::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the tiermasterd configuration file
///
/// If no file was named, try `/etc/tiermaster.toml`, falling back to defaults if that's not there.
/// A file that was named explicitly must exist.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/tiermaster.toml").unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => {
            parse_config_text(&text).map_err(|err| ConfigParseSnafu { pth }.into_error(err))
        }
        Err(err) => {
            if defaulted && err.kind() == io::ErrorKind::NotFound {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

fn parse_config_text(text: &str) -> StdResult<ConfigV1, toml::de::Error> {
    toml::from_str::<Configuration>(text).map(|cfg| match cfg {
        Configuration::V1(cfg) => cfg,
    })
}

/// Configure logging for the process
///
/// Return a formatting layer & a filter. The filter's default directive comes from the command
/// line; `RUST_LOG` overrides it.
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers *of different types*. It is for this reason that
    // `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Build the storage backend named by `config`
///
/// `memory` is handed back for [StorageConfig::InMemory] so that its contents survive a `SIGHUP`.
async fn select_storage(
    config: &StorageConfig,
    memory: &Arc<InMemory>,
) -> Result<Arc<dyn StorageBackend + Send + Sync>> {
    match config {
        StorageConfig::Redis {
            url,
            connect_attempts,
            connect_delay,
        } => Ok(Arc::new(
            tiermaster::redis::Client::new(url, *connect_attempts, *connect_delay)
                .await
                .context(RedisSnafu)?,
        )),
        StorageConfig::InMemory => {
            warn!("Using in-memory storage; scores will not survive a restart");
            Ok(memory.clone())
        }
    }
}

/// Serve leaderboard API requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    let registry = init_telemetry(&cfg.service_name).context(MetricsSnafu)?;
    let memory = Arc::new(InMemory::new());

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our store connection each pass, in case configuration values have changed:
        let storage = select_storage(&cfg.storage_config, &memory).await?;
        let state = Arc::new(Tiermaster {
            service_name: cfg.service_name.clone(),
            service: Service::new(
                Repository::new(storage, cfg.storage_timeout),
                cfg.minimum_score,
            ),
            registry: registry.clone(),
        });

        let address = opts.address.unwrap_or(cfg.address);
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
            "Serving on {address}; minimum score {}, storage timeout {:?}",
            cfg.minimum_score, cfg.storage_timeout
        );

        tokio::select! {
            res = &mut server => {
                // The server *should* never shutdown on its own.
                error!("The HTTP server exited unexpectedly: {res:?}");
                return res.context(ServeSnafu);
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{err:?}; keeping the prior configuration");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                break;
            }
        }
    }

    Ok(())
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Take care to configure logging *before* we call `serve()` since it's instrumented. Failure to
    // parse at this point is fatal; below, in `serve()`, we fall back to the last "known-good"
    // configuration & keep going.
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(ConfigV1, Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter) = configure_logging(&opts.log_opts)?;
        Ok((cfg, formatter, filter))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter)) => {
            // Nb. this can only be invoked once (will panic on a second invocation)!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);
            info!("tiermasterd version {} starting.", crate_version!());
            serve(opts, cfg).await
        }
        Err(err) => {
            error!("While configuring tiermasterd: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most of tiermasterd's configuration is read from file; the few command-line options it
    // accepts govern where to find that file & how to log. They all have corresponding environment
    // variables for the sake of convenience when running in a container.
    let opts = CliOpts::new(
        Command::new("tiermasterd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A ranked leaderboard service")
            .long_about(
                "`tiermasterd` accepts score submissions over HTTP & serves the resulting rankings.",
            )
            .arg(
                Arg::new("address")
                    .short('a')
                    .long("address")
                    .num_args(1)
                    .value_parser(value_parser!(SocketAddr))
                    .env("TIERMASTER_ADDRESS")
                    .help("address at which to listen (overrides the configuration file)"),
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("TIERMASTER_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("TIERMASTER_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("TIERMASTER_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("TIERMASTER_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("TIERMASTER_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    // Things can go wrong before we've parsed our configuration file & configured logging, so
    // setup a *temporary* logger to stderr via `set_default()`.
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
