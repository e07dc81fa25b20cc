pub mod broadcaster;
pub mod controller;
pub mod events;
pub mod parse;
pub mod retry;
pub mod supervisor;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tracing_appender::non_blocking::WorkerGuard;

use crate::daemon::broadcaster::ProgressBroadcaster;
use crate::daemon::controller::JobController;
use crate::daemon::events::JobEvent;
use crate::models::DaemonConfig;
use crate::process::{ProcessSpawner, TokioProcessSpawner};
use crate::server::{self, AppState};
use crate::storage::jobs::JsonJobStore;
use crate::storage::logs::FsLogStore;
use crate::storage::{JobStore, LogStore};

pub const PID_FILE_NAME: &str = "trm.pid";
pub const DAEMON_LOG_NAME: &str = "daemon.log";
const APP_DIR_NAME: &str = "trm";

// ---------------------------------------------------------------------------
// PidFile
// ---------------------------------------------------------------------------

/// Exclusive PID file guarding against a second daemon on the same data dir.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Create the file with our PID. A file left by a dead process is
    /// replaced; one held by a live process is an error.
    pub fn acquire(&self) -> Result<()> {
        if let Some(existing) = self.read_pid() {
            if is_process_alive(existing) {
                return Err(anyhow::anyhow!(
                    "Daemon is already running (PID {}). PID file: {}",
                    existing,
                    self.path.display()
                ));
            }
            tracing::warn!(
                "Removing stale PID file (PID {} is no longer running)",
                existing
            );
            std::fs::remove_file(&self.path).context("Failed to remove stale PID file")?;
        } else if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove unreadable PID file")?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .context("Failed to create PID file (exclusive create)")?;
        let pid = std::process::id();
        write!(file, "{}", pid).context("Failed to write PID file")?;
        file.flush().context("Failed to flush PID file")?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
            tracing::info!("PID file released: {}", self.path.display());
        }
        Ok(())
    }

    /// PID recorded in the file, if it parses.
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    pub fn is_alive(&self) -> bool {
        self.read_pid().is_some_and(is_process_alive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `kill(pid, 0)` probes for existence without delivering a signal.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

// ---------------------------------------------------------------------------
// Config and directories
// ---------------------------------------------------------------------------

fn read_config(path: &Path) -> Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: DaemonConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Resolution order: explicit path, `TRM_CONFIG_DIR`, the platform config
/// dir, then `<data_dir>/config.json`. No file at all means defaults; a
/// file that does not parse is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<DaemonConfig> {
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        return read_config(path);
    }

    let candidates = [
        std::env::var_os("TRM_CONFIG_DIR").map(|dir| PathBuf::from(dir).join("config.json")),
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.json")),
        Some(resolve_data_dir(None).join("config.json")),
    ];
    for path in candidates.into_iter().flatten() {
        if path.exists() {
            return read_config(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(DaemonConfig::default())
}

pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os("TRM_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir.join("logs"))
        .await
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    Ok(())
}

/// Stderr plus `<data_dir>/daemon.log`. The returned guard flushes the file
/// writer when dropped and must outlive the daemon.
pub fn init_tracing(data_dir: &Path, default_level: &str) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Each daemon session starts with a fresh file.
    let log_path = data_dir.join(DAEMON_LOG_NAME);
    if let Err(e) = std::fs::File::create(&log_path) {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init();
        tracing::warn!(
            "Could not open {}: {}. Logging to stderr only.",
            log_path.display(),
            e
        );
        return None;
    }

    let appender = tracing_appender::rolling::never(data_dir, DAEMON_LOG_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging to stderr and {}", log_path.display());
    }
    Some(guard)
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct StartOptions {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Run the daemon until Ctrl+C, SIGTERM or `POST /api/shutdown`.
pub async fn start_daemon(options: StartOptions) -> Result<()> {
    let mut config = load_config(options.config_path.as_deref())?;
    if let Some(host) = options.host {
        config.host = host;
    }
    if let Some(port) = options.port {
        config.port = port;
    }
    let data_dir = match (options.data_dir, config.data_dir.take()) {
        (Some(dir), _) | (None, Some(dir)) => dir,
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir.clone());
    let config = Arc::new(config);

    create_data_dirs(&data_dir).await?;
    let _log_guard = init_tracing(&data_dir, &config.log_level);
    tracing::info!("Data directory: {}", data_dir.display());

    let pid_file = PidFile::new(data_dir.join(PID_FILE_NAME));
    pid_file.acquire()?;

    let result = run(Arc::clone(&config), data_dir).await;
    if let Err(e) = pid_file.release() {
        tracing::error!("Failed to release PID file: {}", e);
    }
    result
}

async fn run(config: Arc<DaemonConfig>, data_dir: PathBuf) -> Result<()> {
    let store = JsonJobStore::new(data_dir.clone()).await?;
    if let Some(e) = store.load_error() {
        tracing::error!("Job table could not be loaded, starting empty: {}", e);
    }
    let store: Arc<dyn JobStore> = Arc::new(store);
    let logs: Arc<dyn LogStore> =
        Arc::new(FsLogStore::new(data_dir.clone(), config.max_log_file_size).await?);
    let spawner: Arc<dyn ProcessSpawner> = Arc::new(TokioProcessSpawner);
    let broadcaster = Arc::new(ProgressBroadcaster::new(config.progress_interval()));
    let (event_tx, _) = broadcast::channel::<JobEvent>(config.broadcast_capacity);

    let controller = Arc::new(JobController::new(
        store,
        logs,
        spawner,
        Arc::clone(&broadcaster),
        event_tx.clone(),
        &config,
    ));

    match controller.remove_orphaned_logs().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Removed {} orphaned job log(s)", n),
        Err(e) => tracing::warn!("Failed to clean up orphaned logs: {}", e),
    }
    let recovered = controller.recover_interrupted().await?;
    if !recovered.is_empty() {
        tracing::warn!(
            "{} job(s) were active when the daemon last stopped and are now failed",
            recovered.len()
        );
    }
    broadcaster.seed(&controller.list().await?).await;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    let ticker = tokio::spawn(Arc::clone(&broadcaster).run(shutdown_tx.subscribe()));

    let state = Arc::new(AppState {
        controller: Arc::clone(&controller),
        event_tx,
        config: Arc::clone(&config),
        start_time: Instant::now(),
        shutdown_tx: Some(shutdown_tx.clone()),
    });
    let router = server::create_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    tracing::info!("Daemon started. Listening on http://{}", bind_addr);

    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await;
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    wait_for_shutdown(shutdown_tx.subscribe()).await?;
    let _ = shutdown_tx.send(());

    controller.shutdown().await;
    let _ = ticker.await;
    let _ = server_handle.await;
    tracing::info!("Daemon exited cleanly.");
    Ok(())
}

async fn wait_for_shutdown(mut api_shutdown_rx: watch::Receiver<()>) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
            _ = api_shutdown_rx.changed() => tracing::info!("Received API shutdown signal"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
            _ = api_shutdown_rx.changed() => tracing::info!("Received API shutdown signal"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pidfile_acquire_and_release() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(PID_FILE_NAME);
        let pid_file = PidFile::new(path.clone());

        pid_file.acquire().expect("acquire");
        assert_eq!(pid_file.read_pid(), Some(std::process::id()));
        assert!(pid_file.is_alive());

        pid_file.release().expect("release");
        assert!(!path.exists());
        assert!(!pid_file.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_pidfile_rejects_live_owner() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, std::process::id().to_string()).expect("write");

        let err = PidFile::new(path).acquire().unwrap_err();
        assert!(err.to_string().contains("already running"), "{}", err);
    }

    #[test]
    fn test_pidfile_replaces_stale_or_garbage() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(PID_FILE_NAME);

        // Above the default pid_max on Linux and macOS.
        std::fs::write(&path, "4000000").expect("write");
        PidFile::new(path.clone()).acquire().expect("stale");
        std::fs::remove_file(&path).expect("remove");

        std::fs::write(&path, "not a pid").expect("write");
        let pid_file = PidFile::new(path);
        pid_file.acquire().expect("garbage");
        assert_eq!(pid_file.read_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_load_config_explicit_path() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "backoff_cap_secs": 30}"#).expect("write");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.port, 9000);
        assert_eq!(config.backoff_cap_secs, 30);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_load_config_errors() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("missing.json");
        assert!(load_config(Some(&missing)).is_err());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").expect("write");
        let err = load_config(Some(&bad)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_data_dir_override() {
        let dir = PathBuf::from("/tmp/trm-test");
        assert_eq!(resolve_data_dir(Some(&dir)), dir);
    }

    #[tokio::test]
    async fn test_create_data_dirs() {
        let dir = TempDir::new().expect("temp dir");
        let data_dir = dir.path().join("nested").join("trm");
        create_data_dirs(&data_dir).await.expect("create");
        assert!(data_dir.join("logs").is_dir());
    }
}
