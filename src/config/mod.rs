use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 4310;
const DEFAULT_READ_IDLE_SECONDS: u64 = 60;
const DEFAULT_WRITE_DEADLINE_SECONDS: u64 = 10;
const DEFAULT_PING_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SESSION_GRACE_SECONDS: u64 = 5;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const DEFAULT_HISTORY_DEPTH: usize = 50;
const DEFAULT_DEBUG_RECORDER_CAPACITY: usize = 1024;
const DEFAULT_SAVE_DEADLINE_SECONDS: u64 = 5;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4310).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,collabd=trace" (default: "info").
    log: Option<String>,
    /// Shared secret for HS256 session token verification.
    jwt_secret: Option<String>,
    /// Max idle seconds before a connection is closed (default: 60).
    read_idle_seconds: Option<u64>,
    /// Per-send write timeout in seconds (default: 10).
    write_deadline_seconds: Option<u64>,
    /// Heartbeat ping cadence in seconds (default: 30).
    ping_interval_seconds: Option<u64>,
    /// Per-participant outbound buffer in messages (default: 256).
    outbound_queue_capacity: Option<usize>,
    /// Drain delay after the last participant leaves (default: 5).
    session_grace_seconds: Option<u64>,
    /// Max ingress frame size in bytes (default: 1 MiB).
    max_frame_bytes: Option<usize>,
    /// Undo/redo stack depth per session (default: 50; 0 disables).
    history_depth: Option<usize>,
    /// Per-session trace ring capacity (default: 1024).
    debug_recorder_capacity: Option<usize>,
    /// Whether the per-session trace is on (default: false). Hot-reloadable.
    debug_recorder: Option<bool>,
    /// Deadline for one DiagramStore save in seconds (default: 5).
    save_deadline_seconds: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── CollabConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Shared secret for HS256 session tokens. `None` only together with
    /// `insecure_identity`.
    pub jwt_secret: Option<String>,
    /// Accept `user:name:role` bearer tokens instead of JWTs. Development
    /// and tests only.
    pub insecure_identity: bool,
    pub read_idle_seconds: u64,
    pub write_deadline_seconds: u64,
    pub ping_interval_seconds: u64,
    pub outbound_queue_capacity: usize,
    pub session_grace_seconds: u64,
    pub max_frame_bytes: usize,
    pub history_depth: usize,
    pub debug_recorder_capacity: usize,
    /// Initial state of the trace toggle; the live value is the shared
    /// atomic owned by [`ConfigWatcher`].
    pub debug_recorder: bool,
    pub save_deadline_seconds: u64,
}

impl CollabConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        jwt_secret: Option<String>,
        insecure_identity: bool,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            jwt_secret: jwt_secret.or(toml.jwt_secret),
            insecure_identity,
            read_idle_seconds: toml.read_idle_seconds.unwrap_or(DEFAULT_READ_IDLE_SECONDS),
            write_deadline_seconds: toml
                .write_deadline_seconds
                .unwrap_or(DEFAULT_WRITE_DEADLINE_SECONDS),
            ping_interval_seconds: toml
                .ping_interval_seconds
                .unwrap_or(DEFAULT_PING_INTERVAL_SECONDS),
            outbound_queue_capacity: toml
                .outbound_queue_capacity
                .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY),
            session_grace_seconds: toml
                .session_grace_seconds
                .unwrap_or(DEFAULT_SESSION_GRACE_SECONDS),
            max_frame_bytes: toml.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            history_depth: toml.history_depth.unwrap_or(DEFAULT_HISTORY_DEPTH),
            debug_recorder_capacity: toml
                .debug_recorder_capacity
                .unwrap_or(DEFAULT_DEBUG_RECORDER_CAPACITY),
            debug_recorder: toml.debug_recorder.unwrap_or(false),
            save_deadline_seconds: toml
                .save_deadline_seconds
                .unwrap_or(DEFAULT_SAVE_DEADLINE_SECONDS),
            data_dir,
        }
    }

    /// Sensible fixed config for tests: tiny timeouts are the test's job to
    /// override field by field.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self::new(Some(0), Some(data_dir), Some("warn".into()), None, true)
    }

    pub fn read_idle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.read_idle_seconds)
    }

    pub fn write_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.write_deadline_seconds)
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn session_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_grace_seconds)
    }

    pub fn save_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.save_deadline_seconds)
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Watches `config.toml` for changes and reloads the non-critical subset.
///
/// The watcher uses the `notify` crate (kqueue on macOS, inotify on Linux)
/// to detect file modifications. Only the `debug_recorder` toggle is applied
/// live — it is the privileged control input for per-session tracing. Port,
/// capacities, and deadlines require a restart; a changed `log` value is
/// reported so an operator knows a restart is needed.
pub struct ConfigWatcher {
    /// Live trace toggle, shared with every session's recorder.
    pub debug_recorder: Arc<AtomicBool>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal; the
    /// daemon runs fine without hot-reload).
    pub fn start(data_dir: &Path, initial_debug_recorder: bool) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let debug_recorder = Arc::new(AtomicBool::new(initial_debug_recorder));

        let flag = debug_recorder.clone();
        let config_path_clone = config_path.clone();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    // Only act on modify/create events
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let toml = std::fs::read_to_string(&config_path_clone)
                            .ok()
                            .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
                            .unwrap_or_default();
                        let new_value = toml.debug_recorder.unwrap_or(false);
                        let old_value = flag.swap(new_value, Ordering::Relaxed);
                        if old_value != new_value {
                            info!(enabled = new_value, "debug recorder toggled via config.toml");
                        }
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                // Watch the data_dir (parent of config.toml) since watching a
                // non-existent file fails on some platforms.
                if let Err(e) = debouncer.watcher().watch(
                    data_dir,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    debug_recorder,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/collabd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("collabd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/collabd or ~/.local/share/collabd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("collabd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("collabd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\collabd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("collabd");
        }
    }
    // Fallback
    PathBuf::from(".collabd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CollabConfig::new(None, Some(dir.path().to_path_buf()), None, None, false);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.outbound_queue_capacity, 256);
        assert_eq!(cfg.session_grace_seconds, 5);
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
        assert_eq!(cfg.history_depth, 50);
        assert!(!cfg.debug_recorder);
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 9999\nhistory_depth = 5\ndebug_recorder = true\n",
        )
        .unwrap();

        let cfg = CollabConfig::new(None, Some(dir.path().to_path_buf()), None, None, false);
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.history_depth, 5);
        assert!(cfg.debug_recorder);

        let cfg = CollabConfig::new(Some(4000), Some(dir.path().to_path_buf()), None, None, false);
        assert_eq!(cfg.port, 4000);
    }

    #[test]
    fn unparseable_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = {{{{").unwrap();
        let cfg = CollabConfig::new(None, Some(dir.path().to_path_buf()), None, None, false);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
