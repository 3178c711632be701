//! Driver for the external file-sync engine. The engine runs twice: locally
//! as a child process of the CLI and remotely as a sidecar in the dev pod,
//! the two sides meeting over the sync port-forward. The driver owns the
//! local lifecycle: install, configure, launch, health, direction switch,
//! teardown.

pub mod api;
pub mod config;
pub mod device;

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::manifest::DevSpec;
use crate::session::scope::{cancelled, Scope};
use api::{RestSyncApi, SyncApi};

/// Ports the remote sidecar listens on inside the pod.
pub const CLUSTER_PORT: u16 = 22000;
pub const GUI_PORT: u16 = 8384;

const BINARY_NAME: &str = "syncthing";
const CONFIG_FILE: &str = "config.xml";
const API_KEY_LEN: usize = 32;

const PING_INTERVAL: Duration = Duration::from_millis(500);
const PING_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETION_INTERVAL: Duration = Duration::from_millis(500);
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const MONITOR_MAX_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("the sync engine is not installed")]
    NotInstalled,
    #[error("could not install the sync engine: {0}")]
    Install(String),
    #[error("could not launch the sync engine: {0}")]
    Launch(String),
    #[error("sync api request failed: {0}")]
    Api(String),
    #[error("timed out waiting for the sync engine to {0}")]
    Timeout(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderMode {
    SendOnly,
    SendReceive,
}

impl FolderMode {
    pub fn as_config(self) -> &'static str {
        match self {
            FolderMode::SendOnly => "sendonly",
            FolderMode::SendReceive => "sendreceive",
        }
    }
}

pub fn folder_id(spec: &DevSpec) -> String {
    format!("cove-{}", spec.name)
}

fn install_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cove").join("bin").join(BINARY_NAME))
}

fn installed_binary() -> Option<PathBuf> {
    if let Some(path) = install_path() {
        if path.exists() {
            return Some(path);
        }
    }
    which::which(BINARY_NAME).ok()
}

pub fn is_installed() -> bool {
    installed_binary().is_some()
}

fn download_url() -> String {
    format!(
        "https://downloads.cove.sh/{BINARY_NAME}/{}-{}/{BINARY_NAME}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Downloads the platform binary into the cove home and marks it executable.
pub async fn install() -> Result<PathBuf, SyncError> {
    let path = install_path()
        .ok_or_else(|| SyncError::Install("could not determine the home directory".to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let url = download_url();
    debug!(%url, "downloading sync engine");
    let bytes = reqwest::get(&url)
        .await
        .map_err(|err| SyncError::Install(err.to_string()))?
        .error_for_status()
        .map_err(|err| SyncError::Install(err.to_string()))?
        .bytes()
        .await
        .map_err(|err| SyncError::Install(err.to_string()))?;
    std::fs::write(&path, &bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(path)
}

fn free_port() -> Result<u16, SyncError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

pub struct Syncthing {
    binary: Option<PathBuf>,
    home: PathBuf,
    folder_id: String,
    source: PathBuf,
    mode: FolderMode,
    local_device: String,
    remote_device: String,
    /// Data and api ports of the local agent.
    listen_port: u16,
    gui_port: u16,
    /// Local ends of the forwards to the remote sidecar.
    pub remote_port: u16,
    pub remote_gui_port: u16,
    pub api_key: String,
    api: Arc<dyn SyncApi>,
}

impl Syncthing {
    pub fn new(spec: &DevSpec) -> Result<Self, SyncError> {
        let binary = installed_binary().ok_or(SyncError::NotInstalled)?;
        let home = dirs::home_dir()
            .ok_or_else(|| SyncError::Launch("could not determine the home directory".to_string()))?
            .join(".cove")
            .join(&spec.namespace)
            .join(&spec.name);

        let listen_port = free_port()?;
        let gui_port = free_port()?;
        let remote_port = free_port()?;
        let remote_gui_port = free_port()?;
        let api_key = generate_api_key();
        let api = Arc::new(RestSyncApi::new(gui_port, &api_key)?);

        Ok(Self {
            binary: Some(binary),
            home,
            folder_id: folder_id(spec),
            source: spec.source_dir(),
            mode: FolderMode::SendOnly,
            local_device: device::local_device_id(),
            remote_device: device::remote_device_id(),
            listen_port,
            gui_port,
            remote_port,
            remote_gui_port,
            api_key,
            api,
        })
    }

    #[cfg(test)]
    fn with_api(home: PathBuf, api: Arc<dyn SyncApi>) -> Self {
        Self {
            binary: None,
            home,
            folder_id: "cove-web".to_string(),
            source: PathBuf::from("/work/project"),
            mode: FolderMode::SendOnly,
            local_device: device::local_device_id(),
            remote_device: device::remote_device_id(),
            listen_port: 41001,
            gui_port: 41003,
            remote_port: 41002,
            remote_gui_port: 41004,
            api_key: "secret".to_string(),
            api,
        }
    }

    fn write_config(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.home)?;
        let rendered = config::render(&config::SyncConfig {
            folder_id: &self.folder_id,
            source: &self.source,
            mode: self.mode,
            local_device: &self.local_device,
            remote_device: &self.remote_device,
            listen_port: self.listen_port,
            remote_port: self.remote_port,
            gui_port: self.gui_port,
            api_key: &self.api_key,
        });
        std::fs::write(self.home.join(CONFIG_FILE), rendered)?;
        Ok(())
    }

    /// Writes the initial send-only configuration and launches the local
    /// agent under the session scope; cancelling the scope kills it.
    pub fn run(&mut self, scope: &Scope) -> Result<(), SyncError> {
        self.write_config()?;
        let binary = self.binary.as_ref().ok_or(SyncError::NotInstalled)?;

        let mut cmd = Command::new(binary);
        cmd.arg("-home")
            .arg(&self.home)
            .arg("-no-browser")
            .arg("-gui-address")
            .arg(format!("127.0.0.1:{}", self.gui_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| SyncError::Launch(err.to_string()))?;
        debug!(home = %self.home.display(), gui_port = self.gui_port, "sync agent started");

        let mut cancel = scope.subscribe();
        scope.spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(?status, "sync agent exited");
                }
                _ = cancelled(&mut cancel) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!("sync agent stopped");
                }
            }
        });
        Ok(())
    }

    /// Watches the remote peer and posts on `disconnect` once pings have
    /// failed for longer than the threshold. Posts at most once.
    pub fn monitor(&self, scope: &Scope, disconnect: mpsc::Sender<()>) {
        let api = Arc::clone(&self.api);
        let mut cancel = scope.subscribe();
        scope.spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = sleep(MONITOR_INTERVAL) => {}
                    _ = cancelled(&mut cancel) => return,
                }
                match api.ping().await {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        trace!(failures, error = %err, "sync ping failed");
                        if failures >= MONITOR_MAX_FAILURES {
                            warn!("sync engine lost its remote peer");
                            let _ = disconnect.try_send(());
                            return;
                        }
                    }
                }
            }
        });
    }

    pub async fn wait_for_ping(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let deadline = Instant::now() + PING_TIMEOUT;
        loop {
            if self.api.ping().await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout("respond to pings"));
            }
            tokio::select! {
                _ = sleep(PING_INTERVAL) => {}
                _ = cancelled(cancel) => return Err(SyncError::Cancelled),
            }
        }
    }

    /// Blocks until the remote peer reports 100% completion for the session
    /// folder. Bounded only by scope cancellation, like every step of the
    /// bring-up sequence.
    pub async fn wait_for_completion(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        loop {
            match self
                .api
                .completion(&self.folder_id, &self.remote_device)
                .await
            {
                Ok(completion) if completion >= 100.0 => return Ok(()),
                Ok(completion) => trace!(completion, "synchronizing"),
                Err(err) => debug!(error = %err, "completion poll failed"),
            }
            tokio::select! {
                _ = sleep(COMPLETION_INTERVAL) => {}
                _ = cancelled(cancel) => return Err(SyncError::Cancelled),
            }
        }
    }

    /// Forces the initial state to be the local filesystem. Destructive on
    /// the remote side; required to avoid merge ambiguity on first attach.
    pub async fn override_changes(&self) -> Result<(), SyncError> {
        self.api.override_changes(&self.folder_id).await
    }

    /// Rewrites the configuration with the new folder direction. Takes
    /// effect on the next restart.
    pub fn update_config(&mut self, mode: FolderMode) -> Result<(), SyncError> {
        self.mode = mode;
        self.write_config()
    }

    pub async fn restart(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), SyncError> {
        self.api.restart().await?;
        self.wait_for_ping(cancel).await
    }

    pub async fn is_connected(&self) -> bool {
        self.api.connected().await.unwrap_or(false)
    }
}
