//! Port-forward manager: an ordered set of local/remote TCP bindings tied to
//! one pod, started and stopped as a unit. Forwarders are independent; a
//! broken stream posts its error on the shared channel and exits without
//! being restarted; the session decides what happens next.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::kubectl::KubectlClient;
use crate::session::scope::{cancelled, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardBinding {
    pub local: u16,
    pub remote: u16,
    pub state: ForwardState,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("port forwards cannot be added after the manager has started")]
    AlreadyStarted,
    #[error("forward {local} -> {remote} broke: {reason}")]
    Broken {
        local: u16,
        remote: u16,
        reason: String,
    },
}

/// Runs a single binding until the stream breaks or `cancel` observes
/// shutdown. Production impl spawns one `kubectl port-forward` per binding;
/// tests substitute their own.
#[async_trait]
pub trait PortForwarder: Send + Sync + 'static {
    async fn forward(
        &self,
        namespace: &str,
        pod: &str,
        local: u16,
        remote: u16,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), ForwardError>;
}

pub struct KubectlForwarder {
    client: KubectlClient,
}

impl KubectlForwarder {
    pub fn new(client: KubectlClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PortForwarder for KubectlForwarder {
    async fn forward(
        &self,
        namespace: &str,
        pod: &str,
        local: u16,
        remote: u16,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ForwardError> {
        let mut cmd = self.client.command();
        cmd.arg("port-forward")
            .arg(format!("pod/{pod}"))
            .arg(format!("{local}:{remote}"))
            .arg("-n")
            .arg(namespace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| ForwardError::Broken {
            local,
            remote,
            reason: format!("could not spawn kubectl port-forward: {err}"),
        })?;
        let mut stderr = child.stderr.take();
        debug!(local, remote, pod, "port forward started");

        tokio::select! {
            status = child.wait() => {
                let mut reason = match status {
                    Ok(status) => format!("kubectl port-forward exited with {status}"),
                    Err(err) => err.to_string(),
                };
                if let Some(pipe) = stderr.as_mut() {
                    let mut buf = String::new();
                    if pipe.read_to_string(&mut buf).await.is_ok() {
                        if let Some(line) = buf.lines().find(|line| !line.trim().is_empty()) {
                            reason = line.trim().to_string();
                        }
                    }
                }
                Err(ForwardError::Broken { local, remote, reason })
            }
            _ = cancelled(&mut cancel) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!(local, remote, "port forward stopped");
                Ok(())
            }
        }
    }
}

pub struct PortForwardManager {
    forwarder: Arc<dyn PortForwarder>,
    err_tx: mpsc::Sender<anyhow::Error>,
    bindings: Arc<Mutex<Vec<ForwardBinding>>>,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl PortForwardManager {
    pub fn new(forwarder: Arc<dyn PortForwarder>, err_tx: mpsc::Sender<anyhow::Error>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            forwarder,
            err_tx,
            bindings: Arc::new(Mutex::new(Vec::new())),
            stop,
            handles: Vec::new(),
            started: false,
        }
    }

    pub fn add(&mut self, local: u16, remote: u16) -> Result<(), ForwardError> {
        if self.started {
            return Err(ForwardError::AlreadyStarted);
        }
        self.bindings.lock().unwrap().push(ForwardBinding {
            local,
            remote,
            state: ForwardState::Idle,
        });
        Ok(())
    }

    pub fn bindings(&self) -> Vec<ForwardBinding> {
        self.bindings.lock().unwrap().clone()
    }

    /// Spawns one forwarder per binding in parallel. Forwarders stop when the
    /// session scope is cancelled or `stop` is called, whichever comes first.
    pub fn start(&mut self, pod: &str, namespace: &str, scope: &Scope) {
        self.started = true;

        // Scope cancellation feeds the manager's own stop channel so that
        // stop() and the session scope shut forwarders down the same way.
        let stop_tx = self.stop.clone();
        let mut scope_rx = scope.subscribe();
        scope.spawn(async move {
            cancelled(&mut scope_rx).await;
            let _ = stop_tx.send(true);
        });

        let count = self.bindings.lock().unwrap().len();
        for index in 0..count {
            let forwarder = Arc::clone(&self.forwarder);
            let bindings = Arc::clone(&self.bindings);
            let err_tx = self.err_tx.clone();
            let cancel = self.stop.subscribe();
            let pod = pod.to_string();
            let namespace = namespace.to_string();
            let (local, remote) = {
                let b = &bindings.lock().unwrap()[index];
                (b.local, b.remote)
            };

            let handle = tokio::spawn(async move {
                bindings.lock().unwrap()[index].state = ForwardState::Active;
                match forwarder
                    .forward(&namespace, &pod, local, remote, cancel)
                    .await
                {
                    Ok(()) => {
                        bindings.lock().unwrap()[index].state = ForwardState::Idle;
                    }
                    Err(err) => {
                        bindings.lock().unwrap()[index].state = ForwardState::Failed;
                        warn!(local, remote, error = %err, "port forward broke");
                        let _ = err_tx.send(anyhow::Error::new(err)).await;
                    }
                }
            });
            self.handles.push(handle);
        }
    }

    /// Idempotent; returns once every forwarder has shut down.
    pub async fn stop(&mut self) {
        let _ = self.stop.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
