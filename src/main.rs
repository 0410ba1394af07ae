use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use collabd::{
    config::{CollabConfig, ConfigWatcher},
    identity::{IdentityResolver, InsecureIdentityResolver, JwtIdentityResolver},
    presence::LogPresenceSink,
    session::registry::SessionRegistry,
    storage::SqliteDiagramStore,
    ws, AppContext,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "collabd",
    about = "Collaborative threat-model diagram daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port
    #[arg(long, env = "COLLABD_PORT")]
    port: Option<u16>,

    /// Data directory for config, the SQLite database, and session traces
    #[arg(long, env = "COLLABD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COLLABD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "COLLABD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Shared secret for HS256 session token verification
    #[arg(long, env = "COLLABD_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Accept plain `user:name:role` bearer tokens instead of JWTs.
    ///
    /// Development only — anyone who can reach the port can claim any
    /// identity and role.
    #[arg(long)]
    insecure_identity: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    ///
    /// Runs collabd in the foreground.
    ///
    /// Examples:
    ///   collabd serve
    ///   collabd
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        None | Some(Command::Serve) => {
            run_server(
                args.port,
                args.data_dir,
                args.log,
                args.jwt_secret,
                args.insecure_identity,
            )
            .await
        }
    }
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    jwt_secret: Option<String>,
    insecure_identity: bool,
) -> Result<()> {
    let config = Arc::new(CollabConfig::new(
        port,
        data_dir,
        log,
        jwt_secret,
        insecure_identity,
    ));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        data_dir = %config.data_dir.display(),
        "collabd starting"
    );

    let identity: Arc<dyn IdentityResolver> = if config.insecure_identity {
        warn!("--insecure-identity is set: bearer tokens are trusted verbatim. Do not expose this server.");
        Arc::new(InsecureIdentityResolver)
    } else {
        let secret = config
            .jwt_secret
            .as_deref()
            .context("a JWT secret is required (set COLLABD_JWT_SECRET, jwt_secret in config.toml, or pass --insecure-identity for development)")?;
        Arc::new(JwtIdentityResolver::new(secret.as_bytes().to_vec()))
    };

    let store = Arc::new(
        SqliteDiagramStore::new(&config.data_dir)
            .await
            .context("failed to open diagram database")?,
    );

    // The watcher owns the live debug-recorder toggle; without it the flag
    // is fixed at the startup value.
    let watcher = ConfigWatcher::start(&config.data_dir, config.debug_recorder);
    let debug_recorder = watcher
        .as_ref()
        .map(|w| w.debug_recorder.clone())
        .unwrap_or_else(|| {
            Arc::new(std::sync::atomic::AtomicBool::new(config.debug_recorder))
        });

    let presence = Arc::new(LogPresenceSink);
    let registry = SessionRegistry::new(
        config.clone(),
        store.clone(),
        presence.clone(),
        debug_recorder,
    );

    let ctx = Arc::new(AppContext {
        config,
        store,
        identity,
        presence,
        registry,
        started_at: std::time::Instant::now(),
    });

    ws::run(ctx).await
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("collabd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
