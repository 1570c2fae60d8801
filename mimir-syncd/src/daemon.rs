use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::config::{ConfigStore, MirrorConfig};
use crate::http_api;
use crate::logging::LogFile;
use crate::scheduler::RepeatingTask;
use crate::sync::local_watcher::{DirectorySnapshot, run_watcher, start_notify_watcher};
use crate::sync::pipeline::default_settle;
use crate::sync::{PassReport, PassResult, TransferPipeline};
use crate::tunnel::{TunnelCommand, TunnelState, TunnelSupervisor};

pub struct DaemonRuntime {
    state: Arc<AppState>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: MirrorConfig, config_path: PathBuf) -> anyhow::Result<Self> {
        ensure_download_dir(&config.download_directory).await?;
        let tunnel = TunnelSupervisor::new(TunnelCommand::cloudflared(config.port))
            .context("failed to prepare tunnel supervisor")?;
        let logs = LogFile::new(config.log_file.clone());
        let state = AppState::new(ConfigStore::new(config, config_path), tunnel, logs)
            .context("failed to build remote clients")?;
        Ok(Self {
            state: Arc::new(state),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Runs exactly one reconciliation pass.
    pub async fn run_once(&self) -> anyhow::Result<PassReport> {
        match self.state.services().reconciler.run_pass().await? {
            PassResult::Completed(report) => Ok(report),
            PassResult::Coalesced => anyhow::bail!("another pass was already running"),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.state.config.current();
        info!(
            folder_id = %config.folder_id,
            dir = %config.download_directory.display(),
            port = config.port,
            sync_every_ms = config.sync_interval_ms,
            "mimir-syncd started"
        );

        if let Err(err) = self.run_once().await {
            error!(error = %err, "initial pass failed");
        }

        let loops = Loops {
            heartbeat: start_heartbeat(&self.state, config.heartbeat_interval()),
            sync: start_sync_timer(&self.state, config.sync_interval()),
            watcher: start_watcher(Arc::clone(&self.state.services().pipeline))
                .await
                .map_err(|err| warn!(error = %err, "local watcher unavailable"))
                .ok(),
        };

        let shutdown = CancellationToken::new();
        let config_task = tokio::spawn(follow_config(
            Arc::clone(&self.state),
            loops,
            shutdown.clone(),
        ));
        let tunnel_task = tokio::spawn(register_on_tunnel_url(
            Arc::clone(&self.state),
            shutdown.clone(),
        ));

        if !config.public_url.trim().is_empty() {
            let state = Arc::clone(&self.state);
            let public_url = config.public_url.clone();
            tokio::spawn(async move { state.register_webhook(&public_url).await });
        } else if config.tunnel_autostart {
            if let Err(err) = self.state.tunnel.start() {
                warn!(error = %err, "tunnel autostart failed");
            }
        }

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind port {}", config.port))?;
        info!(port = config.port, "control surface listening");
        let served = axum::serve(listener, http_api::router(Arc::clone(&self.state)))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("http server failed");

        shutdown.cancel();
        let _ = config_task.await;
        let _ = tunnel_task.await;
        self.state.tunnel.stop();
        info!("mimir-syncd stopped");
        served
    }
}

/// Creates the download directory and checks it can be listed.
pub async fn ensure_download_dir(dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create download directory {}", dir.display()))?;
    tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("download directory {} is not readable", dir.display()))?;
    Ok(())
}

struct WatcherHandle {
    _watcher: notify::RecommendedWatcher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn start_watcher(pipeline: Arc<TransferPipeline>) -> anyhow::Result<WatcherHandle> {
    let dir = pipeline.download_dir().to_path_buf();
    let (watcher, names_rx) = start_notify_watcher(&dir)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    let snapshot = DirectorySnapshot::scan(&dir)
        .await
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_watcher(
        pipeline,
        snapshot,
        names_rx,
        default_settle(),
        cancel.clone(),
    ));
    Ok(WatcherHandle {
        _watcher: watcher,
        cancel,
        task,
    })
}

struct Loops {
    heartbeat: RepeatingTask,
    sync: RepeatingTask,
    watcher: Option<WatcherHandle>,
}

impl Loops {
    async fn stop(self) {
        self.heartbeat.stop().await;
        self.sync.stop().await;
        if let Some(watcher) = self.watcher {
            watcher.stop().await;
        }
    }
}

fn start_heartbeat(state: &Arc<AppState>, period: Duration) -> RepeatingTask {
    let state = Arc::clone(state);
    RepeatingTask::start("heartbeat", period, move || {
        let state = Arc::clone(&state);
        async move {
            let sync = state.sync_state.snapshot();
            info!(
                uptime_secs = state.uptime().as_secs(),
                synced = sync.synced,
                last_update = sync.last_update.as_deref().unwrap_or("never"),
                tunnel = state.tunnel.state().url().unwrap_or("none"),
                "heartbeat"
            );
        }
    })
}

fn start_sync_timer(state: &Arc<AppState>, period: Duration) -> RepeatingTask {
    let state = Arc::clone(state);
    RepeatingTask::start("sync", period, move || {
        let state = Arc::clone(&state);
        async move {
            info!("scheduled pass");
            if let Err(err) = state.services().reconciler.run_pass().await {
                warn!(error = %err, "scheduled pass failed");
            }
        }
    })
}

/// What a configuration replacement requires of the running daemon.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigDelta {
    pub rebind: bool,
    pub heartbeat: Option<Duration>,
    pub sync: Option<Duration>,
    pub public_url: Option<String>,
    pub needs_restart: Vec<&'static str>,
}

pub(crate) fn diff_config(old: &MirrorConfig, new: &MirrorConfig) -> ConfigDelta {
    let mut needs_restart = Vec::new();
    if old.port != new.port {
        needs_restart.push("port");
    }
    if old.log_file != new.log_file {
        needs_restart.push("logFile");
    }
    ConfigDelta {
        rebind: !old.same_binding(new) || old.config_api_url != new.config_api_url,
        heartbeat: (old.heartbeat_interval_ms != new.heartbeat_interval_ms)
            .then(|| new.heartbeat_interval()),
        sync: (old.sync_interval_ms != new.sync_interval_ms).then(|| new.sync_interval()),
        public_url: (old.public_url != new.public_url && !new.public_url.trim().is_empty())
            .then(|| new.public_url.clone()),
        needs_restart,
    }
}

async fn follow_config(state: Arc<AppState>, mut loops: Loops, shutdown: CancellationToken) {
    let mut rx = state.config.subscribe();
    let mut current = state.config.current();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        let next = Arc::clone(&rx.borrow_and_update());
        loops = apply_config(&state, &current, &next, loops).await;
        current = next;
    }
    loops.stop().await;
}

async fn apply_config(
    state: &Arc<AppState>,
    old: &MirrorConfig,
    new: &MirrorConfig,
    mut loops: Loops,
) -> Loops {
    let delta = diff_config(old, new);
    for field in &delta.needs_restart {
        warn!(field = *field, "change takes effect after restart");
    }

    if delta.rebind {
        let rebuilt = match ensure_download_dir(&new.download_directory).await {
            Ok(()) => state
                .rebuild_services(new)
                .map_err(|err| anyhow::anyhow!(err)),
            Err(err) => Err(err),
        };
        match rebuilt {
            Ok(services) => {
                if let Some(watcher) = loops.watcher.take() {
                    watcher.stop().await;
                }
                loops.watcher = start_watcher(Arc::clone(&services.pipeline))
                    .await
                    .map_err(|err| warn!(error = %err, "local watcher unavailable"))
                    .ok();
                tokio::spawn(async move {
                    if let Err(err) = services.reconciler.run_pass().await {
                        warn!(error = %err, "pass after reconfiguration failed");
                    }
                });
            }
            Err(err) => error!(error = %err, "keeping previous services"),
        }
    }
    if let Some(period) = delta.heartbeat {
        loops.heartbeat = loops.heartbeat.restart(period).await;
        info!(period_ms = period.as_millis() as u64, "heartbeat rescheduled");
    }
    if let Some(period) = delta.sync {
        loops.sync = loops.sync.restart(period).await;
        info!(period_ms = period.as_millis() as u64, "sync timer rescheduled");
    }
    if let Some(url) = delta.public_url {
        state.register_webhook(&url).await;
    }
    loops
}

async fn register_on_tunnel_url(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut rx = state.tunnel.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        let tunnel = rx.borrow_and_update().clone();
        if let TunnelState::Running { url } = tunnel {
            state.register_webhook(&url).await;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
