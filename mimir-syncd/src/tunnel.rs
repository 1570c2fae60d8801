use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

const QUICK_TUNNEL_PATTERN: &str = r"https://[a-z0-9-]+\.trycloudflare\.com";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid url pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running { url: String },
    Failed { reason: String },
}

impl TunnelState {
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Running { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            TunnelState::Running { url } => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TunnelCommand {
    pub fn cloudflared(port: u16) -> Self {
        Self {
            program: "cloudflared".to_string(),
            args: vec![
                "tunnel".to_string(),
                "--url".to_string(),
                format!("http://localhost:{port}"),
            ],
        }
    }
}

/// Owns the single outbound tunnel process and tracks its lifecycle.
pub struct TunnelSupervisor {
    command: TunnelCommand,
    url_pattern: Regex,
    generation: Arc<AtomicU64>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    state_tx: watch::Sender<TunnelState>,
}

impl TunnelSupervisor {
    pub fn new(command: TunnelCommand) -> Result<Self, TunnelError> {
        let (state_tx, _) = watch::channel(TunnelState::Stopped);
        Ok(Self {
            command,
            url_pattern: Regex::new(QUICK_TUNNEL_PATTERN)?,
            generation: Arc::new(AtomicU64::new(0)),
            stop_tx: Mutex::new(None),
            state_tx,
        })
    }

    pub fn state(&self) -> TunnelState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    /// Starts the process; a no-op while it is already starting or running.
    pub fn start(&self) -> Result<TunnelState, TunnelError> {
        let mut stop_slot = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.state();
        if current.is_active() {
            debug!(state = ?current, "tunnel already active");
            return Ok(current);
        }

        let spawned = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let reason = source.to_string();
                warn!(program = %self.command.program, error = %reason, "tunnel failed to start");
                self.state_tx.send_replace(TunnelState::Failed { reason });
                return Err(TunnelError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        *stop_slot = Some(stop_tx);
        self.state_tx.send_replace(TunnelState::Starting);
        info!(program = %self.command.program, "tunnel starting");

        tokio::spawn(supervise(
            child,
            stop_rx,
            Monitor {
                generation,
                current: Arc::clone(&self.generation),
                state_tx: self.state_tx.clone(),
                url_pattern: self.url_pattern.clone(),
            },
        ));
        Ok(TunnelState::Starting)
    }

    /// Stops the process; returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if !self.state().is_active() {
            return false;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        self.state_tx.send_replace(TunnelState::Stopped);
        info!("tunnel stopped");
        true
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Monitor {
    generation: u64,
    current: Arc<AtomicU64>,
    state_tx: watch::Sender<TunnelState>,
    url_pattern: Regex,
}

impl Monitor {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn on_line(&self, line: &str) {
        debug!(line, "tunnel output");
        if !self.is_current() {
            return;
        }
        let Some(found) = self.url_pattern.find(line) else {
            return;
        };
        let url = found.as_str().to_string();
        self.state_tx.send_if_modified(|state| {
            if *state == TunnelState::Starting {
                info!(url = %url, "tunnel url discovered");
                *state = TunnelState::Running { url: url.clone() };
                true
            } else {
                false
            }
        });
    }
}

async fn supervise(mut child: Child, mut stop_rx: oneshot::Receiver<()>, monitor: Monitor) {
    let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
    let mut stderr = child.stderr.take().map(|err| BufReader::new(err).lines());

    let exit = loop {
        tokio::select! {
            _ = &mut stop_rx => break None,
            line = async { stdout.as_mut()?.next_line().await.ok().flatten() }, if stdout.is_some() => {
                match line {
                    Some(line) => monitor.on_line(&line),
                    None => stdout = None,
                }
            }
            line = async { stderr.as_mut()?.next_line().await.ok().flatten() }, if stderr.is_some() => {
                match line {
                    Some(line) => monitor.on_line(&line),
                    None => stderr = None,
                }
            }
            status = child.wait() => break Some(status),
        }
    };

    match exit {
        None => {
            let _ = child.kill().await;
            debug!("tunnel process killed");
        }
        Some(status) => {
            if monitor.is_current() {
                warn!(status = ?status, "tunnel process exited");
                monitor.state_tx.send_replace(TunnelState::Stopped);
            }
        }
    }
}
