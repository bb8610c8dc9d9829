use std::io;
use std::mem;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::ptr;
use std::thread;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};

use pollhttpd::config::{ServerConfig, DEFAULT_PORT};
use pollhttpd::logging::{self, LogConfig, DEFAULT_LOG_FILE};
use pollhttpd::pool::DEFAULT_WORKERS;
use pollhttpd::router::{DEFAULT_DOCUMENT_ROOT, DEFAULT_INDEX_DOCUMENT};
use pollhttpd::{Server, ServerHandle};

#[derive(Parser)]
#[command(about = "Edge-triggered HTTP server with a fixed worker pool")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of worker threads
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Directory GET requests are served from
    #[arg(long, default_value = DEFAULT_DOCUMENT_ROOT)]
    root: PathBuf,

    /// File served for `/` and directory targets
    #[arg(long, default_value = DEFAULT_INDEX_DOCUMENT)]
    index: String,

    /// Lowest level written
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// File log lines are appended to
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Log to stdout only
    #[arg(long)]
    no_log_file: bool,

    /// Write log lines on the calling thread instead of a background writer
    #[arg(long)]
    sync_log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Before any thread exists, so every thread inherits the mask and only the waiter sees them.
    let signals = shutdown_signals();
    if let Err(err) = block_signals(&signals) {
        eprintln!("pollhttpd: cannot block shutdown signals: {err}");
        return ExitCode::FAILURE;
    }

    let log_config = LogConfig {
        level: args.log_level.into(),
        async_mode: !args.sync_log,
        file: (!args.no_log_file).then(|| args.log_file.clone()),
    };
    let guard = match logging::init(&log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("pollhttpd: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let status = match serve(args, signals) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    };
    drop(guard);
    status
}

fn serve(args: Args, signals: libc::sigset_t) -> anyhow::Result<()> {
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        workers: args.workers,
        document_root: args.root,
        index_document: args.index,
        ..ServerConfig::default()
    };

    let mut server = Server::bind(config)?;
    spawn_signal_waiter(signals, server.handle()).context("cannot start signal thread")?;
    server.run()
}

fn shutdown_signals() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        set
    }
}

fn block_signals(set: &libc::sigset_t) -> io::Result<()> {
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, set, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

fn spawn_signal_waiter(set: libc::sigset_t, handle: ServerHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("signal-waiter".into())
        .spawn(move || {
            let mut signal: libc::c_int = 0;
            let rc = unsafe { libc::sigwait(&set, &mut signal) };
            if rc != 0 {
                error!("sigwait failed: {}", io::Error::from_raw_os_error(rc));
                return;
            }
            info!(signal, "shutdown signal received");
            if let Err(err) = handle.shutdown() {
                error!("cannot wake event loop: {err}");
            }
        })
        .map(|_| ())
}
