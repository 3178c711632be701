//! The up session supervisor: activates dev mode on the remote workload,
//! brings up the forwarding and synchronization data planes, runs the
//! interactive command, and decides between reconnecting and exiting when the
//! running state ends. A single cancellable scope parents every background
//! task, so one cancel call brings the whole tree down.

pub mod scope;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cluster::workload::Workload;
use crate::cluster::{ClusterClient, ClusterError};
use crate::devmode::{self, TransformError};
use crate::forward::{ForwardError, PortForwardManager, PortForwarder};
use crate::manifest::DevSpec;
use crate::sync::{self, FolderMode, SyncError, Syncthing};
use crate::terminal::status::{self, Spinner};
use crate::terminal::tty::TerminalState;
use scope::Scope;

/// Bound on the whole shutdown sub-procedure; tasks that have not drained by
/// then die with the scope.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const RECONNECT_BANNER: &str =
    "\nConnection lost to your development environment, reconnecting...\n";

/// Best-effort cleanup of processes left behind in the dev container by a
/// previous attach.
const REAP_COMMAND: &str =
    "trap '' TERM && kill -- -1 && sleep 0.1 & kill -s KILL -- -1 >/dev/null 2>&1";

#[derive(Debug, Error)]
pub enum UpError {
    #[error("deployment {name} not found in namespace {namespace}")]
    WorkloadNotFound { name: String, namespace: String },
    #[error("your development environment has been deactivated")]
    Deactivated,
    #[error("connection to your development environment was lost")]
    LostConnection,
    #[error("the command in your development container failed")]
    CommandFailed,
    #[error("failed to activate your development environment: {0}")]
    Cluster(#[from] ClusterError),
    #[error("file synchronization failed: {0}")]
    Sync(#[from] SyncError),
    #[error("port forwarding failed: {0}")]
    Forward(#[from] ForwardError),
    #[error("failed to enable dev mode: {0}")]
    Transform(#[from] TransformError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the shutdown sub-procedure touches, replaced wholesale at the
/// start of every supervisor iteration.
struct IterationState {
    scope: Arc<Scope>,
    dev_forwarder: Option<PortForwardManager>,
    sync_forwarder: Option<PortForwardManager>,
}

/// Output of a successful activation.
struct Activation {
    container: String,
    dev_pod: String,
    sync_pod: String,
    syncthing: Syncthing,
}

pub struct UpSession {
    spec: DevSpec,
    client: Arc<dyn ClusterClient>,
    forwarder: Arc<dyn PortForwarder>,
    state: Arc<Mutex<IterationState>>,
}

/// Runs one up session to completion. Returns `Ok(())` on a clean exit,
/// including a user interrupt.
pub async fn run_up(
    mut spec: DevSpec,
    client: Arc<dyn ClusterClient>,
    forwarder: Arc<dyn PortForwarder>,
) -> Result<(), UpError> {
    // The manifest override wins over the cluster default.
    if spec.namespace.is_empty() {
        spec.namespace = client.current_namespace().await?;
    }

    // Captured once, before the first activation; reconnects do not re-save.
    let term = TerminalState::save()?;

    let session = UpSession {
        spec: spec.clone(),
        client: client.clone(),
        forwarder,
        state: Arc::new(Mutex::new(IterationState {
            scope: Arc::new(Scope::new()),
            dev_forwarder: None,
            sync_forwarder: None,
        })),
    };
    let state = session.state.clone();

    let (exit_tx, mut exit_rx) = mpsc::channel::<Result<(), UpError>>(1);
    let activate = tokio::spawn(session.activate(exit_tx, term));

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("interrupt received, starting shutdown sequence");
            println!();
            Ok(())
        }
        received = exit_rx.recv() => {
            debug!("exit channel received, starting shutdown sequence");
            received.unwrap_or(Ok(()))
        }
    };

    activate.abort();
    shutdown(&state).await;
    term.restore();

    if result.is_ok() {
        restore_workload(&spec, client.as_ref()).await;
    }
    result
}

impl UpSession {
    /// The supervisor loop: one iteration per connection attempt, looping
    /// back with the retry flag after a recoverable disconnection.
    async fn activate(self, exit: mpsc::Sender<Result<(), UpError>>, term: TerminalState) {
        let mut retry = false;
        loop {
            let scope = Arc::new(Scope::new());
            let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);
            let (running_tx, mut running_rx) = mpsc::channel::<Result<(), ClusterError>>(1);
            let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(8);
            {
                let mut st = self.state.lock().await;
                st.scope = scope.clone();
                st.dev_forwarder = None;
                st.sync_forwarder = None;
            }

            let mut activation = match self.dev_mode(retry).await {
                Ok(activation) => activation,
                Err(err) => {
                    let _ = exit.send(Err(err)).await;
                    return;
                }
            };
            retry = true;

            let mut dev_forwarder =
                PortForwardManager::new(self.forwarder.clone(), err_tx.clone());
            for forward in &self.spec.forward {
                if let Err(err) = dev_forwarder.add(forward.local, forward.remote) {
                    let _ = exit.send(Err(err.into())).await;
                    return;
                }
            }
            dev_forwarder.start(&activation.dev_pod, &self.spec.namespace, &scope);
            self.state.lock().await.dev_forwarder = Some(dev_forwarder);
            status::success("Development environment activated");

            let spinner = Spinner::start("Synchronizing your files...");
            let synced = self
                .start_sync(&mut activation, &scope, disconnect_tx.clone(), err_tx.clone())
                .await;
            spinner.stop().await;
            if let Err(err) = synced {
                let _ = exit.send(Err(err)).await;
                return;
            }
            status::success("Files synchronized");
            status::display_context(&self.spec.namespace, &self.spec.name, &self.spec.forward);

            {
                let client = self.client.clone();
                let spec = self.spec.clone();
                let dev_pod = activation.dev_pod.clone();
                let container = activation.container.clone();
                let cancel = scope.subscribe();
                let running_tx = running_tx.clone();
                scope.spawn(async move {
                    let result =
                        run_command(client.as_ref(), &spec, &dev_pod, &container, cancel).await;
                    let _ = running_tx.send(result).await;
                });
            }

            let prev =
                wait_until_exit_or_interrupt(&mut running_rx, &mut err_rx, &mut disconnect_rx)
                    .await;
            term.restore();

            let sync_connected = match &prev {
                Err(UpError::CommandFailed) => activation.syncthing.is_connected().await,
                _ => true,
            };
            if should_reconnect(&prev, sync_connected) {
                status::warning(RECONNECT_BANNER);
                shutdown(&self.state).await;
                continue;
            }

            let _ = exit.send(prev).await;
            return;
        }
    }

    async fn dev_mode(&self, retry: bool) -> Result<Activation, UpError> {
        if !sync::is_installed() {
            println!("Installing dependencies...");
            sync::install().await?;
        }
        let syncthing = Syncthing::new(&self.spec)?;

        let name = &self.spec.name;
        let namespace = &self.spec.namespace;
        let mut created = false;
        let workload = match self.client.get_workload(name, namespace).await {
            Ok(workload) => {
                if retry && !devmode::is_dev_mode_on(&workload) {
                    return Err(UpError::Deactivated);
                }
                workload
            }
            Err(err) if err.is_not_found() && !retry => {
                let create = status::confirm(&format!(
                    "Deployment '{name}' doesn't exist. Do you want to create a new one?"
                ))?;
                if !create {
                    return Err(UpError::WorkloadNotFound {
                        name: name.clone(),
                        namespace: namespace.clone(),
                    });
                }
                created = true;
                devmode::sandbox(&self.spec)
            }
            Err(err) => return Err(err.into()),
        };

        let spinner = Spinner::start("Activating your development environment...");
        let enabled = self.enable_dev_mode(workload, created, &syncthing).await;
        spinner.stop().await;
        let (container, dev_pod, sync_pod) = enabled?;

        Ok(Activation {
            container,
            dev_pod,
            sync_pod,
            syncthing,
        })
    }

    async fn enable_dev_mode(
        &self,
        mut workload: Workload,
        created: bool,
        syncthing: &Syncthing,
    ) -> Result<(String, String, String), UpError> {
        let spec = &self.spec;
        self.client
            .apply_manifest(&devmode::secret_manifest(spec, &syncthing.api_key))
            .await?;
        self.client
            .apply_manifest(&devmode::volume_manifest(
                &devmode::primary_volume_name(spec),
                spec,
            ))
            .await?;
        for index in 0..spec.volumes.len() {
            self.client
                .apply_manifest(&devmode::volume_manifest(
                    &devmode::data_volume_name(spec, index),
                    spec,
                ))
                .await?;
        }

        let container = devmode::apply(&mut workload, spec)?;
        self.client.apply_workload(&workload).await?;

        if created {
            self.client
                .apply_manifest(&devmode::service_manifest(spec))
                .await?;
        }

        let sync_pod = self
            .client
            .wait_for_pod(&spec.namespace, &devmode::sync_pod_selector(spec))
            .await?;
        let dev_pod = self
            .client
            .wait_for_pod(&spec.namespace, &devmode::dev_pod_selector(spec))
            .await?;
        info!(dev_pod, sync_pod, container, "dev mode enabled");

        Ok((container, dev_pod, sync_pod))
    }

    /// Brings the sync engine up to its running state: launch, forward,
    /// ping, first scan, override, second scan, flip to bidirectional,
    /// restart. The order is strict.
    async fn start_sync(
        &self,
        activation: &mut Activation,
        scope: &Arc<Scope>,
        disconnect: mpsc::Sender<()>,
        err_tx: mpsc::Sender<anyhow::Error>,
    ) -> Result<(), UpError> {
        let sync_pod = activation.sync_pod.clone();
        let sy = &mut activation.syncthing;
        sy.run(scope)?;

        let mut sync_forwarder = PortForwardManager::new(self.forwarder.clone(), err_tx);
        sync_forwarder.add(sy.remote_port, sync::CLUSTER_PORT)?;
        sync_forwarder.add(sy.remote_gui_port, sync::GUI_PORT)?;
        sync_forwarder.start(&sync_pod, &self.spec.namespace, scope);
        self.state.lock().await.sync_forwarder = Some(sync_forwarder);

        sy.monitor(scope, disconnect);

        let mut cancel = scope.subscribe();
        sy.wait_for_ping(&mut cancel).await?;
        sy.wait_for_completion(&mut cancel).await?;
        sy.override_changes().await?;
        sy.wait_for_completion(&mut cancel).await?;
        sy.update_config(FolderMode::SendReceive)?;
        sy.restart(&mut cancel).await?;
        Ok(())
    }
}

/// Fans in the three running-state signals. The first of command exit or
/// disconnect wins; transient errors are logged and the wait continues.
async fn wait_until_exit_or_interrupt(
    running: &mut mpsc::Receiver<Result<(), ClusterError>>,
    errors: &mut mpsc::Receiver<anyhow::Error>,
    disconnect: &mut mpsc::Receiver<()>,
) -> Result<(), UpError> {
    loop {
        tokio::select! {
            result = running.recv() => {
                println!();
                return match result {
                    Some(Ok(())) | None => Ok(()),
                    Some(Err(err)) if err.is_cancelled() => Ok(()),
                    Some(Err(err)) => {
                        info!(error = %err, "command execution failed");
                        Err(UpError::CommandFailed)
                    }
                };
            }
            Some(err) = errors.recv() => {
                status::warning(&err.to_string());
            }
            Some(()) = disconnect.recv() => return Err(UpError::LostConnection),
        }
    }
}

/// A lost connection always reconnects; a failed command reconnects only when
/// the sync engine is disconnected too, otherwise the failure is surfaced.
fn should_reconnect(prev: &Result<(), UpError>, sync_connected: bool) -> bool {
    match prev {
        Err(UpError::LostConnection) => true,
        Err(UpError::CommandFailed) => !sync_connected,
        _ => false,
    }
}

async fn run_command(
    client: &dyn ClusterClient,
    spec: &DevSpec,
    pod: &str,
    container: &str,
    cancel: watch::Receiver<bool>,
) -> Result<(), ClusterError> {
    let reap = vec!["sh".to_string(), "-c".to_string(), REAP_COMMAND.to_string()];
    let _ = client
        .exec(
            &spec.namespace,
            pod,
            container,
            spec.attach,
            &reap,
            cancel.clone(),
        )
        .await;
    client
        .exec(
            &spec.namespace,
            pod,
            container,
            spec.attach,
            &spec.command,
            cancel,
        )
        .await
}

/// Cancels the session scope, then in parallel drains the wait group and
/// stops both forward managers, all bounded by the watchdog. Idempotent.
async fn shutdown(state: &Arc<Mutex<IterationState>>) {
    debug!("cancelling session scope");
    let (scope, mut dev_forwarder, mut sync_forwarder) = {
        let mut st = state.lock().await;
        st.scope.cancel();
        (
            st.scope.clone(),
            st.dev_forwarder.take(),
            st.sync_forwarder.take(),
        )
    };

    let drain = async {
        tokio::join!(scope.wait(), async {
            if let Some(forwarder) = dev_forwarder.as_mut() {
                forwarder.stop().await;
            }
            if let Some(forwarder) = sync_forwarder.as_mut() {
                forwarder.stop().await;
            }
        });
    };
    if timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        debug!("background tasks did not drain in time, terminating anyway");
    } else {
        debug!("completed shutdown sequence");
    }
}

/// Puts the workload back into its pre-session form after a clean exit.
/// Best-effort: runs outside the cancelled scope, failures are logged.
async fn restore_workload(spec: &DevSpec, client: &dyn ClusterClient) {
    match client.get_workload(&spec.name, &spec.namespace).await {
        Ok(mut workload) if devmode::is_dev_mode_on(&workload) => {
            if devmode::restore(&mut workload).is_ok() {
                match client.apply_workload(&workload).await {
                    Ok(()) => info!("workload restored"),
                    Err(err) => debug!(error = %err, "could not restore the workload"),
                }
            }
        }
        Ok(_) => {}
        Err(err) => debug!(error = %err, "could not fetch the workload for restore"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Instant};

    fn channels() -> (
        mpsc::Sender<Result<(), ClusterError>>,
        mpsc::Receiver<Result<(), ClusterError>>,
        mpsc::Sender<anyhow::Error>,
        mpsc::Receiver<anyhow::Error>,
        mpsc::Sender<()>,
        mpsc::Receiver<()>,
    ) {
        let (running_tx, running_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(8);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        (
            running_tx,
            running_rx,
            err_tx,
            err_rx,
            disconnect_tx,
            disconnect_rx,
        )
    }

    #[tokio::test]
    async fn clean_command_exit_ends_the_wait() {
        let (running_tx, mut running_rx, _err_tx, mut err_rx, _d_tx, mut d_rx) = channels();
        running_tx.send(Ok(())).await.unwrap();
        let result = wait_until_exit_or_interrupt(&mut running_rx, &mut err_rx, &mut d_rx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failed_command_maps_to_command_failed() {
        let (running_tx, mut running_rx, _err_tx, mut err_rx, _d_tx, mut d_rx) = channels();
        running_tx
            .send(Err(ClusterError::CommandExit(127)))
            .await
            .unwrap();
        let result = wait_until_exit_or_interrupt(&mut running_rx, &mut err_rx, &mut d_rx).await;
        assert!(matches!(result, Err(UpError::CommandFailed)));
    }

    #[tokio::test]
    async fn cancelled_exec_is_not_a_command_failure() {
        let (running_tx, mut running_rx, _err_tx, mut err_rx, _d_tx, mut d_rx) = channels();
        running_tx.send(Err(ClusterError::Cancelled)).await.unwrap();
        let result = wait_until_exit_or_interrupt(&mut running_rx, &mut err_rx, &mut d_rx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn disconnect_maps_to_lost_connection() {
        let (_running_tx, mut running_rx, _err_tx, mut err_rx, d_tx, mut d_rx) = channels();
        d_tx.send(()).await.unwrap();
        let result = wait_until_exit_or_interrupt(&mut running_rx, &mut err_rx, &mut d_rx).await;
        assert!(matches!(result, Err(UpError::LostConnection)));
    }

    #[tokio::test]
    async fn transient_errors_do_not_end_the_wait() {
        let (running_tx, mut running_rx, err_tx, mut err_rx, _d_tx, mut d_rx) = channels();
        err_tx.send(anyhow::anyhow!("forward broke")).await.unwrap();
        let waiter = tokio::spawn(async move {
            wait_until_exit_or_interrupt(&mut running_rx, &mut err_rx, &mut d_rx).await
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "non-fatal error must keep waiting");
        running_tx.send(Ok(())).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn reconnect_decision_truth_table() {
        let lost: Result<(), UpError> = Err(UpError::LostConnection);
        let failed: Result<(), UpError> = Err(UpError::CommandFailed);
        let clean: Result<(), UpError> = Ok(());
        let fatal: Result<(), UpError> = Err(UpError::Deactivated);

        assert!(should_reconnect(&lost, true));
        assert!(should_reconnect(&lost, false));
        assert!(should_reconnect(&failed, false));
        assert!(!should_reconnect(&failed, true));
        assert!(!should_reconnect(&clean, true));
        assert!(!should_reconnect(&fatal, false));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_by_the_watchdog() {
        let scope = Arc::new(Scope::new());
        // A task that ignores cancellation entirely.
        scope.spawn(async {
            sleep(Duration::from_secs(3600)).await;
        });
        let state = Arc::new(Mutex::new(IterationState {
            scope,
            dev_forwarder: None,
            sync_forwarder: None,
        }));

        let started = Instant::now();
        shutdown(&state).await;
        assert!(started.elapsed() <= SHUTDOWN_TIMEOUT + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let state = Arc::new(Mutex::new(IterationState {
            scope: Arc::new(Scope::new()),
            dev_forwarder: None,
            sync_forwarder: None,
        }));
        shutdown(&state).await;
        shutdown(&state).await;
        assert!(state.lock().await.scope.is_cancelled());
    }
}
