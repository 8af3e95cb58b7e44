// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of acsedge.
//
// acsedge is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// acsedge is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with acsedge.  If not,
// see <http://www.gnu.org/licenses/>.

//! # acsedged
//!
//! The acsedge daemon: a TR-069/CWMP session edge.
//!
//! Two listeners: the public address takes CPE traffic (`POST /cwmp/{org}`); the private address
//! takes operational traffic-- organization change events, connection requests, & RPC enqueues.

use std::{
    env,
    ffi::CString,
    fmt::Display,
    fs::OpenOptions,
    future::IntoFuture,
    io,
    net::SocketAddr,
    os::fd::{AsFd, AsRawFd, RawFd},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use errno::Errno;
use http::{HeaderName, HeaderValue, StatusCode};
use libc::c_int;
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::{mpsc, Notify},
    time::Instant,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    Layer, Registry,
};
use uuid::Uuid;

use acsedge::{
    connreq::{self, ConnectionRequest},
    dispatch::{self, InMemoryQueue, Poller},
    entities::CpeKey,
    ingress::{self, Edge},
    org_cache::{self, spawn_refresh, spawn_subscriber, CredentialCache},
    session::{self, OutboundRpc, WorkerPool},
    storage::FileStore,
};

/// The acsedged application error type
///
/// Fairly rich at the application level in the hopes of helping operators; individual modules
/// keep their own, smaller error types.
// `main()` returns `Result<(), Error>`, so the Rust runtime will render any error with its
// `Debug` implementation; the derived one is unreadable, so implement it in terms of `Display`.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to change directory: {source}"))]
    Changedir { source: std::io::Error },
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
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to fork the acsedged process: errno={errno}"))]
    Fork { errno: Errno },
    #[snafu(display("Failed to lock the acsedged lock file: errno={errno}"))]
    LockFile { errno: Errno },
    #[snafu(display("Failed to open the acsedged log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("Failed to HUP the logfile: {source}"))]
    LogHup {
        source: tokio::sync::mpsc::error::SendError<PathBuf>,
    },
    #[snafu(display("Failed to load the organization seed: {source}"))]
    OrgLoad { source: acsedge::org_cache::Error },
    #[snafu(display("Failed to fork the acsedged process a second time: errno={errno}"))]
    SecondFork { errno: Errno },
    #[snafu(display("While resetting signal {signum}, {errno}"))]
    Sigaction { signum: c_int, errno: Errno },
    #[snafu(display("While resetting the process signal mask, {errno}"))]
    Sigprocmask { errno: Errno },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
    #[snafu(display("Failed to write the acsedged PID file: errno={errno}"))]
    WritePid { errno: Errno },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

static DEFAULT_LOCALSTATEDIR: &str = ".";

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub daemon: bool,
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            daemon: !matches.get_flag("no-daemon"),
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
    pub instance_id: Uuid,
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
    pub local_statedir: PathBuf,
    pub no_chdir: bool,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            instance_id: matches
                .get_one::<Uuid>("instance-id")
                .cloned()
                .unwrap_or(Uuid::new_v4()),
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
            local_statedir: matches
                .get_one::<PathBuf>("local-state")
                .unwrap_or(&PathBuf::from_str(DEFAULT_LOCALSTATEDIR).unwrap())
                .clone(),
            no_chdir: matches.get_flag("no-chdir"),
        })
    }
}

/// acsedged configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// The acsedged log file
    #[serde(rename = "log-file")]
    log_file: PathBuf,
    /// Local address at which to listen for CPE traffic; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Address at which to listen for operational requests; specify as "address:port"
    #[serde(rename = "private-address")]
    private_address: SocketAddr,
    /// The name under which this node mints sticky tokens; needn't resolve, just distinguish
    /// nodes from one another in a fleet
    host: String,
    /// JSON file seeding the organization cache (an array of organization records)
    #[serde(rename = "orgs-file")]
    orgs_file: PathBuf,
    cache: org_cache::Config,
    sessions: session::Config,
    ingress: ingress::Config,
    #[serde(rename = "connection-requests")]
    connection_requests: connreq::Config,
    dispatch: dispatch::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            log_file: PathBuf::from_str("/tmp/acsedge.log").unwrap(/* known good */),
            public_address: "0.0.0.0:7547".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:7548".parse::<SocketAddr>().unwrap(/* known good */),
            host: "acs-edge".to_string(),
            orgs_file: PathBuf::from_str("/etc/acsedge/orgs.json").unwrap(/* known good */),
            cache: org_cache::Config::default(),
            sessions: session::Config::default(),
            ingress: ingress::Config::default(),
            connection_requests: connreq::Config::default(),
            dispatch: dispatch::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the acsedged configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/acsedge.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(cfg) => match cfg {
                Configuration::V1(cfg) => Ok(cfg),
            },
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

/// A tracing-compatible, "reopenable" log file
///
/// [MakeWriter] wants a thing that yields an [std::io::Write] for some lifetime 'a, and
/// `Arc<Mutex<W>>` doesn't implement it even when `W: Write`. So: hand the file off wholesale &
/// use a side channel to tell it to re-open itself on `SIGHUP`.
struct LogFile {
    fd: Arc<Mutex<std::fs::File>>,
}

impl LogFile {
    /// Open a file at `pth`; return a [LogFile] instance along with the send side of a channel
    /// the caller can use to close & re-open the file.
    pub fn open(pth: &Path) -> StdResult<(LogFile, mpsc::Sender<PathBuf>), std::io::Error> {
        let (tx, rx) = mpsc::channel::<PathBuf>(1);
        let fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(pth)
            .map(|fd| Arc::new(Mutex::new(fd)))?;
        tokio::spawn(LogFile::rehup(fd.clone(), rx));
        Ok((LogFile { fd }, tx))
    }
    /// Close & re-open the file
    async fn rehup(fd: Arc<Mutex<std::fs::File>>, mut rx: mpsc::Receiver<PathBuf>) {
        while let Some(ref pbuf) = rx.recv().await {
            match OpenOptions::new().create(true).append(true).open(pbuf) {
                Ok(f) => *fd.lock().unwrap() = f,
                Err(err) => error!("Failed to open {:?} ({}).", pbuf, err),
            }
        }
    }
}

pub struct MyMutexGuardWriter<'a>(MutexGuard<'a, std::fs::File>);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = MyMutexGuardWriter<'a>;
    fn make_writer(&'a self) -> Self::Writer {
        MyMutexGuardWriter(self.fd.lock().expect("lock poisoned"))
    }
}

impl io::Write for MyMutexGuardWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }

    #[inline]
    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.0.write_vectored(bufs)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }

    #[inline]
    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.0.write_fmt(fmt)
    }
}

/// Configure acsedged logging
///
/// Foreground (the usual case, inside a container): log to stdout. Daemon: log to file, &
/// return the sender side of a channel that can be used to signal the file to close & re-open
/// itself (in response to a `SIGHUP`, presumably).
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
    logfile: &Path,
) -> Result<(
    Box<dyn Layer<Registry> + Send + Sync>,
    EnvFilter,
    Option<mpsc::Sender<PathBuf>>,
)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `with_writer()` produce `SubscriberBuilder` instances *of different types*; it
    // is for this reason that `Box<dyn Layer<S> + Send + Sync>` implements `Layer`.
    let mut tx = None;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.daemon {
        let (log_file, tx_inner) = LogFile::open(logfile).context(LogFileSnafu)?;
        tx = Some(tx_inner);
        if logopts.plain {
            Box::new(
                fmt::Layer::default()
                    .compact()
                    .with_ansi(false)
                    .with_writer(log_file),
            )
        } else {
            Box::new(
                fmt::Layer::default()
                    .json()
                    .with_current_span(true)
                    .with_writer(log_file),
            )
        }
    } else if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter, tx))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the ops surface                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Shared state for the private (operational) listener.
struct Ops {
    feed: mpsc::Sender<serde_json::Value>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<connreq::Dispatcher>,
    queue: Arc<InMemoryQueue<ConnectionRequest>>,
}

async fn ops_healthcheck() -> &'static str {
    "GOOD"
}

/// One organization change-feed event, exactly as the system of record publishes them.
async fn ops_org_event(
    State(state): State<Arc<Ops>>,
    Json(event): Json<serde_json::Value>,
) -> StatusCode {
    match state.feed.send(event).await {
        Ok(_) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Deserialize)]
struct ConnReqBody {
    #[serde(rename = "cpe-key")]
    cpe_key: CpeKey,
    url: String,
    username: String,
    password: SecretString,
    /// Seconds from receipt after which the task is stale; omit for no deadline
    #[serde(rename = "deadline-secs", default)]
    deadline_secs: Option<u64>,
    /// true: drop it on the shared work queue for the poller; false: attempt it now
    #[serde(default)]
    queued: bool,
}

async fn ops_connection_request(
    State(state): State<Arc<Ops>>,
    Json(body): Json<ConnReqBody>,
) -> (StatusCode, String) {
    let request = ConnectionRequest {
        cpe_key: body.cpe_key,
        url: body.url,
        username: body.username,
        password: body.password,
        deadline: body
            .deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs)),
    };
    if body.queued {
        state.queue.push(request);
        return (StatusCode::ACCEPTED, "queued".to_string());
    }
    match state.dispatcher.submit(request).await {
        Ok(outcome) => (StatusCode::OK, format!("{:?}", outcome)),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "dropped".to_string()),
    }
}

#[derive(Deserialize)]
struct RpcBody {
    #[serde(rename = "cpe-key")]
    cpe_key: CpeKey,
    name: String,
    envelope: String,
}

async fn ops_enqueue_rpc(State(state): State<Arc<Ops>>, Json(body): Json<RpcBody>) -> StatusCode {
    state
        .pool
        .enqueue(
            &body.cpe_key,
            &OutboundRpc {
                name: body.name,
                envelope: body.envelope,
            },
        )
        .await;
    StatusCode::ACCEPTED
}

/// Make the [Router] that will only be locally accessible
fn make_ops_router(state: Arc<Ops>) -> Router {
    Router::new()
        .route("/ops/healthcheck", get(ops_healthcheck))
        .route("/ops/orgs/events", post(ops_org_event))
        .route("/ops/connection-requests", post(ops_connection_request))
        .route("/ops/rpcs", post(ops_enqueue_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 carries less entropy than a UUID but reads better
/// in logs, & doubles as a rough gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
///
/// We want incoming requests to hit the `SetRequestIdLayer` *first*, so it must be the
/// last/outer layer applied.
fn make_world_router(edge: Arc<Edge>) -> Router {
    ingress::make_router(edge)
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

/// Serve CWMP sessions
#[tracing::instrument(
    skip(opts, cfg, log_file_hup),
    fields(instance_id = %opts.instance_id)
)]
async fn serve(
    opts: CliOpts,
    mut cfg: ConfigV1,
    log_file_hup: Option<mpsc::Sender<PathBuf>>,
) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build everything each pass, in case configuration values have changed. Sessions do
        // not survive this; CPEs re-Inform on their retry timers.
        let store = Arc::new(FileStore::new(&cfg.orgs_file));
        let cache = Arc::new(CredentialCache::new(cfg.cache.clone()));
        cache.reload(store.as_ref()).await.context(OrgLoadSnafu)?;

        let (feed_tx, feed_rx) = mpsc::channel::<serde_json::Value>(256);
        let subscriber = spawn_subscriber(cache.clone(), feed_rx);
        let refresh_nfy = Arc::new(Notify::new());
        let refresh = spawn_refresh(cache.clone(), store.clone(), refresh_nfy.clone());

        let pool = Arc::new(WorkerPool::spawn(&cfg.sessions, &cfg.host));
        let edge = Arc::new(Edge::new(cache.clone(), pool.clone(), &cfg.ingress));

        let dispatcher = Arc::new(connreq::Dispatcher::new(&cfg.connection_requests));
        let queue = Arc::new(InMemoryQueue::<ConnectionRequest>::new());
        let poller = Poller::spawn(
            queue.clone(),
            Arc::new(connreq::QueuedDelivery::new(dispatcher.clone())),
            cfg.dispatch.clone(),
        );

        let ops = Arc::new(Ops {
            feed: feed_tx,
            pool: pool.clone(),
            dispatcher,
            queue,
        });

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(edge),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        let local_server = axum::serve(
            TcpListener::bind(cfg.private_address)
                .await
                .context(BindSnafu {
                    addr: cfg.private_address,
                })?,
            make_ops_router(ops.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()));

        let mut world_server = world_server.into_future();
        let mut local_server = local_server.into_future();

        fn log_on_err<T, E>(x: StdResult<T, E>)
        where
            E: std::error::Error + std::fmt::Debug,
        {
            if let Err(err) = x {
                error!("{:?}", err);
            }
        }

        // Tear down this pass's components; every exit from the select! below funnels through.
        async fn quiesce(
            refresh_nfy: Arc<Notify>,
            refresh: tokio::task::JoinHandle<()>,
            subscriber: tokio::task::JoinHandle<()>,
            ops: Arc<Ops>,
            poller: Poller,
        ) {
            refresh_nfy.notify_one();
            let _ = refresh.await;
            drop(ops); // Dropping the feed sender lets the subscriber drain & exit.
            let _ = subscriber.await;
            poller.shutdown().await;
        }

        tokio::select! {
            // The servers *should* never shut down on their own; that said, if they're not
            // moved into Futures, they never get polled.
            _ = &mut world_server => unimplemented!(),
            _ = &mut local_server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; closing the log file & re-reading configuration.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                quiesce(refresh_nfy, refresh, subscriber, ops, poller).await;
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(_) => cfg
                };
                if let Some(ref lfh) = log_file_hup {
                    // `logrotate` & friends rename the log file underneath us, then SIGHUP us
                    // to close & re-open it (under the same name), which lands us on the *new*
                    // file.
                    lfh.send(cfg.log_file.clone()).await.context(LogHupSnafu)?;
                    info!("Started new log file.");
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                quiesce(refresh_nfy, refresh, subscriber, ops, poller).await;
                match Arc::try_unwrap(pool) {
                    Ok(pool) => pool.shutdown().await,
                    Err(_) => error!("A worker channel is still held; abandoning the pool."),
                }
                break;
            }
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Make this process into a System V-style daemon
///
/// There's an issue with the interaction between forking & the tokio runtime-- tokio will
/// spin-up a thread pool, and threads do not mix well with `fork()`. The trick is to fork this
/// process *before* starting-up the Tokio runtime.
///
/// This function will close all open file descriptors (other than stdin/stdout/stderr & the
/// bootstrap log), reset all signal handlers & the signal mask, double-fork with a `setsid()`
/// in between (so we can never re-acquire a controlling terminal), redirect the standard
/// streams to `/dev/null`, reset the umask, change to `/`, & write a locked PID file. See
/// [daemon(7)].
///
/// [daemon(7)]: https://man7.org/linux/man-pages/man7/daemon.7.html
fn daemonize(local_statedir: &Path, no_chdir: bool, log_fd: RawFd) -> Result<()> {
    use errno::errno;
    use libc::{
        close, dup, exit, fdopen, fflush, fork, getdtablesize, getpid, lockf, open, setsid,
        sigaction, sigemptyset, sigprocmask, sigset_t, umask, write, F_TLOCK, SIGKILL, SIGSTOP,
        SIG_DFL, SIG_SETMASK,
    };
    use std::os::unix::ffi::OsStringExt;

    unsafe {
        // Start by closing all open file descriptors (other than stdin, stdout, stderr, and the
        // log fd):
        let mut i = getdtablesize() - 1;
        while i > 2 {
            if i != log_fd {
                close(i);
            }
            i -= 1;
        }

        // Next, reset all signal handlers:
        let mut mask: sigset_t = std::mem::zeroed();
        sigemptyset(&mut mask);

        let sa = sigaction {
            sa_sigaction: SIG_DFL,
            sa_mask: mask,
            sa_flags: 0,
            sa_restorer: None,
        };

        for signum in 1..=libc::SIGSYS {
            if signum != SIGKILL
                && signum != SIGSTOP
                && sigaction(signum, &sa, std::ptr::null_mut()) != 0
            {
                return SigactionSnafu {
                    signum,
                    errno: errno(),
                }
                .fail();
            }
        }

        let n = sigprocmask(SIG_SETMASK, &mask, std::ptr::null_mut());
        if 0 != n {
            return SigprocmaskSnafu { errno: errno() }.fail();
        }

        // Removing ourselves from this process' controlling terminal's job control (if any).
        // Begin by forking; this does a few things:
        //
        // 1. returns control to the shell invoking us, if any
        // 2. guarantees that the child is not a process group leader
        let pid = fork();
        if pid < 0 {
            return ForkSnafu { errno: errno() }.fail();
        } else if pid != 0 {
            // We are the parent process-- exit.
            exit(0);
        }

        // Create a new session, with us as session (and process) group leader; this detaches us
        // from our controlling tty.
        setsid();

        // Fork again & let our parent (the session group leader) exit; this means that this
        // process can never regain a controlling tty.
        let pid = fork();
        if pid < 0 {
            return SecondForkSnafu { errno: errno() }.fail();
        } else if pid != 0 {
            // We are the parent process-- exit.
            exit(0);
        }

        // We next change the present working directory to avoid keeping the present one in use.
        if !no_chdir {
            std::env::set_current_dir("/").context(ChangedirSnafu)?;
        }

        umask(0);

        // Re-open stdin, stdout & stderr all redirected to /dev/null. `i' will be zero, since
        // "The file descriptor returned by a successful call will be the lowest-numbered file
        // descriptor not currently open for the process"...
        i = open(b"/dev/null\0" as *const [u8; 10] as _, libc::O_RDWR);
        // and these two will be 1 & 2 for the same reason.
        dup(i);
        dup(i);

        // Write our "PID file":
        let pth: PathBuf = local_statedir.join("acsedged.pid");
        let pth_c = CString::new(pth.into_os_string().into_vec()).unwrap();
        let fd = open(
            pth_c.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        );
        if lockf(fd, F_TLOCK, 0) < 0 {
            return LockFileSnafu { errno: errno() }.fail();
        }

        let pid = getpid();
        let pid_buf = format!("{}", pid).into_bytes();
        let pid_length = pid_buf.len();
        let pid_c = CString::new(pid_buf).unwrap();
        let n = write(fd, pid_c.as_ptr() as *const libc::c_void, pid_length);
        if n < pid_length as isize {
            return WritePidSnafu { errno: errno() }.fail();
        }
        let f = fdopen(fd, CString::new("w").unwrap().as_ptr());
        if !f.is_null() {
            fflush(f);
        }
        close(fd);
    }

    info!("acsedged successfully daemonized.");

    Ok(())
}

/// Transition to async
///
/// The start-up sequence is a bit touchy:
///
/// 1. if we're to run as a daemon, we need to fork, before starting the async runtime
/// 2. we only configure logging _after_ starting the async runtime, because, again in the case
///    where we're running as a daemon, the logging facility depends on it
/// 3. we only want to enter `serve()` _after_ spinning-up logging, because it carries-out some
///    interesting logging, and we'd like that instrumented with the instance ID
///
/// This function is step 2 in that list-- it's intended to be invoked via `block_on()` & will
/// configure our logging and then call `serve()`.
#[allow(clippy::type_complexity)]
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Read & parse config, create our logging formatter & filter (which depend on config).
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(
        ConfigV1,
        Box<dyn Layer<Registry> + Send + Sync>,
        EnvFilter,
        Option<mpsc::Sender<PathBuf>>,
    )> {
        // Take care to configure logging *before* we call `serve()` since it's instrumented (if
        // we don't, the span that's created on entry to `serve()` is ignored). Failure to parse
        // at this point is fatal; in `serve()`, we fall back to the last known-good
        // configuration & keep going.
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter, log_file_hup) = configure_logging(&opts.log_opts, &cfg.log_file)?;
        Ok((cfg, formatter, filter, log_file_hup))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter, log_file_hup)) => {
            // Setup the global logger. Nb. this can only be invoked once (will panic on a second
            // invocation)!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            // Drop the guard, cleaning-up the bootstrap logger
            drop(bootstrap_logging_guard);

            // At this point we have logging-- huzzah!
            info!(
                "acsedge version {}, instance {} starting.",
                crate_version!(),
                opts.instance_id
            );

            serve(opts, cfg, log_file_hup).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

const BOOTSTRAP_LOG: &str = "acsedged.daemonization.log";

fn main() -> Result<()> {
    // Most of acsedged's configuration options are read from file; the few command-line options
    // that it accepts govern 1) where to find the configuration file, 2) process startup that
    // takes place before the configuration file is parsed. They all have corresponding
    // environment variables for the sake of convenience when running acsedge in a container.
    let opts = CliOpts::new(
        Command::new("acsedged")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A TR-069/CWMP session edge")
            .long_about(
                "`acsedged` terminates CPE CWMP sessions: sticky ingress, per-organization \
                 authentication, session workers & connection requests.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("ACSEDGE_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("local-state")
                    .short('L')
                    .long("local-state")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("ACSEDGE_LOCALSTATEDIR")
                    .help(
                        "path (absolute or relative to the process' current directory) to the \
                           directory in which local state shall be stored (\"/var/run/acsedged\", e.g.)",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ACSEDGE_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                // Not sure this belongs in config. For now, just CLI and env.
                Arg::new("instance-id")
                    .short('I')
                    .long("instance-id")
                    .num_args(1)
                    .value_parser(value_parser!(Uuid))
                    .env("ACSEDGE_INSTANCE_ID")
                    .help("Instance ID (only salient when running in a fleet)")
                    .long_help("Instance ID
A UUID identifying this acsedge instance in a fleet. If not given, a random UUID will be used.")
            )
            .arg(
                Arg::new("no-chdir")
                    .short('C')
                    .long("no-chdir")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ACSEDGE_NO_CHDIR")
                    .help("Do not change directory before daemonizing; ignored if running in foreground")
            )
            .arg(
                Arg::new("no-daemon")
                    .short('F')
                    .long("no-daemon")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ACSEDGE_NO_DAEMON")
                    .help("do not daemonize; remain in foreground"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ACSEDGE_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ACSEDGE_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("ACSEDGE_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Whether we're running as a daemon or not, there are a number of things that can go wrong
    // before we've parsed our configuration file and configured logging for the process. So:
    // setup a *temporary* logger via `set_default()`.
    let bootstrap_logging_guard: tracing::dispatcher::DefaultGuard = if !opts.log_opts.daemon {
        // This case is fairly simple; we'll just log to stderr, at whatever level our command
        // line arguments dictate.
        let bootstrap_subscriber = tracing_subscriber::registry::Registry::default()
            .with(tracing_subscriber::fmt::Layer::default().with_writer(std::io::stderr))
            .with(
                EnvFilter::builder()
                    .with_default_directive(opts.log_opts.level.into())
                    .from_env()
                    .context(EnvFilterSnafu)?,
            );
        let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
        debug!("Temporarily logging to stderr while initializing.");
        bootstrap_logging_guard
    } else {
        // There are a number of things that can go wrong in the process of daemonization
        // *after* we've forked this process & lost the terminal to which we could write error
        // messages; if that happens, the child process will simply exit leaving no trace of
        // what went wrong, which is extremely frustrating for the operator. We don't yet know
        // where the log file is configured to be, so bootstrap with one in the local state
        // directory.
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(opts.local_statedir.join(BOOTSTRAP_LOG))
            .context(LogFileSnafu)?;
        let fd = log_file.as_fd().as_raw_fd();

        let bootstrap_subscriber = tracing_subscriber::registry::Registry::default()
            .with(
                tracing_subscriber::fmt::Layer::default()
                    .with_ansi(false)
                    .with_writer(log_file),
            )
            .with(
                EnvFilter::builder()
                    .with_default_directive(opts.log_opts.level.into())
                    .from_env()
                    .context(EnvFilterSnafu)?,
            );
        let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
        debug!("Temporarily logging to {BOOTSTRAP_LOG} while daemonizing.");
        if let Err(err) = daemonize(&opts.local_statedir, opts.no_chdir, fd) {
            error!("{err}");
            return Err(err);
        }
        bootstrap_logging_guard
    };

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard)) // and start our server!
}
