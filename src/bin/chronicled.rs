// Copyright (C) 2025 the chronicle authors
//
// This file is part of chronicle.
//
// chronicle is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// chronicle is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with chronicle.  If not,
// see <http://www.gnu.org/licenses/>.

//! # chronicled
//!
//! The chronicle daemon: the administrative REST surface, the dispatch worker, and the wiring
//! between them. Most configuration is read from file; the command line governs where to find
//! that file & how to log. Runs in the foreground (the expected deployment is a container);
//! `SIGHUP` re-reads configuration & rebuilds database connections, `SIGTERM` shuts down
//! gracefully.

use std::{env, future::IntoFuture, io, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use secrecy::SecretString;
use serde::Deserialize;
use snafu::prelude::*;
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::{error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use chronicle::{
    correlator::{Correlator, Signals},
    dispatcher,
    feed::Feed,
    http::Chronicle,
    memory::Memory,
    metrics::{check_metric_registrations, Instruments},
    notifier::{self, Notifier},
    rest::make_router,
    storage::Backend as StorageBackend,
};

/// The chronicled application error type
///
/// Per-module errors in this codebase are small; at the application level the errors are richer in
/// the hopes of helping operators. [Debug] is implemented by hand (rather than derived) because
/// `main()` returns `Result<(), Error>` & the Rust runtime prints the `Debug` rendition of the
/// error variant on stderr; the derived implementation is not very readable.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to connect to ScyllaDB: {source}"))]
    Scylla {
        #[snafu(source(from(chronicle::scylla::Error, Box::new)))]
        source: Box<chronicle::scylla::Error>,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// General-purpose credentials-- presumably username, password
// Not sure that the username should be secret, but why not?
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials(pub (SecretString, SecretString));

/// chronicle datastore configuration
///
/// Application code writes to the generic [Backend](chronicle::storage::Backend) API; at startup a
/// particular *implementation* is chosen, according to this configuration.
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    /// Use ScyllaDB/Cassandra over the CQL interface
    Scylla {
        /// ScyllaDB credentials, if authentication is to be used
        credentials: Option<Credentials>,
        /// ScyllaDB hosts; specify as "host:port" (or anything that can be parsed as a [SocketAddr])
        hosts: Vec<SocketAddr>,
    },
    /// In-process storage; useful for development & demos, contents vanish on exit
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Scylla {
            credentials: None,
            hosts: vec!["localhost:9042".parse::<SocketAddr>().unwrap(/* known good */)],
        }
    }
}

/// chronicle configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address at which to listen for API requests; specify as "address:port"
    #[serde(rename = "listen-address")]
    listen_address: SocketAddr,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    notifier: notifier::Config,
    correlator: chronicle::correlator::Config,
    dispatcher: dispatcher::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            listen_address: "0.0.0.0:20879".parse::<SocketAddr>().unwrap(/* known good */),
            storage_config: StorageConfig::default(),
            notifier: notifier::Config::default(),
            correlator: chronicle::correlator::Config::default(),
            dispatcher: dispatcher::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the chronicle configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    use snafu::IntoError;
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/chronicle.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             logging                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

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
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().ok();
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| match &here {
                    Some(h) => h.join(p),
                    None => p,
                }),
        })
    }
}

/// Configure chronicle logging: structured (JSON) or compact output to stdout, filtered per the
/// command line & `RUST_LOG`. Can only be invoked once (it calls tracing's
/// [set_global_default](tracing::subscriber::set_global_default)).
fn configure_logging(logopts: &LogOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers *of different types*; it is for this reason that
    // `Box<dyn Layer<S> + Send + Sync>` implements `Layer`.
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

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn select_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend + Send + Sync>> {
    match config {
        StorageConfig::Scylla { credentials, hosts } => chronicle::scylla::Session::new(
            hosts.iter().map(SocketAddr::to_string),
            &credentials.clone().map(|c| c.0),
        )
        .await
        .context(ScyllaSnafu)?
        .pipe(|s| Ok(Arc::new(s) as Arc<dyn StorageBackend + Send + Sync>)),
        StorageConfig::Memory => Ok(Arc::new(Memory::new())),
    }
}

/// Serve `chronicle` API requests
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

    let mut sighup = signal(SignalKind::hangup()).unwrap(/* known good */);
    let mut sigterm = signal(SignalKind::terminate()).unwrap(/* known good */);

    check_metric_registrations();
    let instruments = Arc::new(Instruments::new("chronicle"));

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our database connections each pass, in case configuration values have changed:
        let storage = select_storage(&cfg.storage_config).await?;
        let signals = Arc::new(Signals::new());

        let state = Arc::new(Chronicle {
            storage: storage.clone(),
            notifier: Notifier::new(
                storage.clone(),
                signals.clone(),
                cfg.notifier.clone(),
                instruments.clone(),
            ),
            correlator: Correlator::new(
                storage.clone(),
                signals.clone(),
                cfg.correlator.clone(),
                instruments.clone(),
            ),
            feed: Feed::new(storage.clone()),
        });

        let (mut worker_join_handle, worker_shutdown) = dispatcher::new(
            storage,
            signals,
            Some(cfg.dispatcher.clone()),
            instruments.clone(),
        )
        .into_parts();
        let shutdown_timeout = cfg.dispatcher.shutdown_timeout;

        let server_nfy = Arc::new(Notify::new());
        let mut server = axum::serve(
            TcpListener::bind(cfg.listen_address).await.context(BindSnafu {
                address: cfg.listen_address,
            })?,
            make_router(state),
        )
        .with_graceful_shutdown(shutdown_signal(server_nfy.clone()))
        .into_future();

        info!("chronicled listening on {}", cfg.listen_address);

        tokio::select! {
            // The server *should* never shut down on its own; if I don't move it into a Future,
            // though, it never gets polled.
            _ = &mut server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                server_nfy.notify_one();
                log_on_err(server.await);
                worker_shutdown.notify_one();
                match tokio::time::timeout(shutdown_timeout, worker_join_handle).await {
                    Ok(Err(err)) => error!("Failed to shut-down the dispatcher: {:?}", err),
                    Err(err) => error!("Failed waiting to shut-down the dispatcher: {:?}", err),
                    _ => ()
                };
                // Failure to re-parse here falls back to the last known-good configuration.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(_) => cfg
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                server_nfy.notify_one();
                log_on_err(server.await);
                worker_shutdown.notify_one();
                match tokio::time::timeout(shutdown_timeout, worker_join_handle).await {
                    Ok(Err(err)) => error!("Failed to shut-down the dispatcher: {:?}", err),
                    Err(err) => error!("Failed waiting to shut-down the dispatcher: {:?}", err),
                    _ => ()
                };
                break;
            }
            res = &mut worker_join_handle => {
                // This shouldn't happen!
                dispatcher::log_exit(res);
                server_nfy.notify_one();
                log_on_err(server.await);
                break;
            }
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn go_async(opts: CliOpts) -> Result<()> {
    let cfg = parse_config(&opts.cfg)?;
    configure_logging(&opts.log_opts)?;
    info!("chronicle version {} starting.", crate_version!());
    serve(opts, cfg).await
}

fn main() -> Result<()> {
    // Most of chronicled's configuration options are read from file; the few command-line options
    // that it accepts govern where to find the configuration file & how to log. They all have
    // corresponding environment variables for the sake of convenience when running chronicle in a
    // container.
    let opts = CliOpts::new(
        Command::new("chronicled")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Request/notification core for a data archive")
            .long_about(
                "`chronicled` serves the administrative API of a data archive: mutations are \
                 issued as requests on an append-only notification log, applied by a background \
                 dispatcher, and correlated back to their outcomes.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("CHRONICLE_CONFIG")
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
                    .env("CHRONICLE_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CHRONICLE_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CHRONICLE_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CHRONICLE_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts))
}
