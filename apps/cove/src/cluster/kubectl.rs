//! Cluster client backed by the `kubectl` binary. Every operation shells out
//! with `-o json` and parses the result into the typed descriptors; stderr is
//! classified into the stable error kinds.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use super::workload::{Pod, PodList, Workload};
use super::{ClusterClient, ClusterError};
use crate::session::scope::cancelled;

const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);
const POD_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct KubectlClient {
    program: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl KubectlClient {
    pub fn from_env() -> Result<Self, ClusterError> {
        let program = which::which("kubectl")
            .map_err(|_| ClusterError::Transport("kubectl not found on PATH".to_string()))?;
        let kubeconfig = std::env::var_os("KUBECONFIG").map(PathBuf::from);
        Ok(Self {
            program,
            kubeconfig,
        })
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd
    }

    /// Runs kubectl with captured output; non-zero exit is classified against
    /// `context`.
    async fn run(
        &self,
        context: &str,
        args: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, ClusterError> {
        trace!(?args, "running kubectl");
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| ClusterError::Transport(format!("could not run kubectl: {err}")))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&bytes)
                    .await
                    .map_err(|err| ClusterError::Transport(err.to_string()))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify(context, &stderr))
        }
    }
}

/// Maps kubectl stderr to a stable error kind.
fn classify(context: &str, stderr: &str) -> ClusterError {
    let message = stderr
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();
    let lower = message.to_lowercase();

    if lower.contains("notfound") || lower.contains("not found") {
        ClusterError::NotFound(context.to_string())
    } else if lower.contains("forbidden") || lower.contains("unauthorized") {
        ClusterError::Forbidden(context.to_string())
    } else if lower.contains("conflict") || lower.contains("the object has been modified") {
        ClusterError::Conflict(context.to_string())
    } else if lower.contains("unable to connect")
        || lower.contains("connection refused")
        || lower.contains("no such host")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake")
    {
        ClusterError::Transport(message)
    } else {
        ClusterError::Unknown {
            context: context.to_string(),
            message,
        }
    }
}

/// Among the Ready pods matching the selector, picks the newest. Returns
/// `None` while no matching pod is Ready.
fn newest_ready(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .filter(Pod::is_ready)
        .max_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
        })
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn current_namespace(&self) -> Result<String, ClusterError> {
        let out = self
            .run(
                "cluster context",
                &[
                    "config",
                    "view",
                    "--minify",
                    "--output",
                    "jsonpath={..namespace}",
                ],
                None,
            )
            .await?;
        let namespace = String::from_utf8_lossy(&out).trim().to_string();
        if namespace.is_empty() {
            Ok("default".to_string())
        } else {
            Ok(namespace)
        }
    }

    async fn get_workload(&self, name: &str, namespace: &str) -> Result<Workload, ClusterError> {
        let context = format!("deployment {namespace}/{name}");
        let out = self
            .run(
                &context,
                &["get", "deployment", name, "-n", namespace, "-o", "json"],
                None,
            )
            .await?;
        serde_json::from_slice(&out).map_err(|err| ClusterError::Unknown {
            context,
            message: format!("unparseable descriptor: {err}"),
        })
    }

    async fn apply_workload(&self, workload: &Workload) -> Result<(), ClusterError> {
        let context = format!(
            "deployment {}/{}",
            workload.metadata.namespace, workload.metadata.name
        );
        let manifest = serde_json::to_value(workload).map_err(|err| ClusterError::Unknown {
            context: context.clone(),
            message: err.to_string(),
        })?;
        let bytes = manifest.to_string().into_bytes();
        self.run(&context, &["apply", "-f", "-"], Some(bytes)).await?;
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &serde_json::Value) -> Result<(), ClusterError> {
        let kind = manifest
            .get("kind")
            .and_then(|kind| kind.as_str())
            .unwrap_or("manifest")
            .to_lowercase();
        let bytes = manifest.to_string().into_bytes();
        self.run(&kind, &["apply", "-f", "-"], Some(bytes)).await?;
        Ok(())
    }

    async fn wait_for_pod(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<String, ClusterError> {
        let context = format!("pod matching {selector}");
        let started = Instant::now();
        loop {
            let out = self
                .run(
                    &context,
                    &["get", "pods", "-n", namespace, "-l", selector, "-o", "json"],
                    None,
                )
                .await?;
            let list: PodList =
                serde_json::from_slice(&out).map_err(|err| ClusterError::Unknown {
                    context: context.clone(),
                    message: format!("unparseable pod list: {err}"),
                })?;
            if let Some(pod) = newest_ready(list.items) {
                debug!(pod = %pod.metadata.name, selector, "pod is ready");
                return Ok(pod.metadata.name);
            }
            if started.elapsed() > POD_READY_TIMEOUT {
                return Err(ClusterError::Timeout(context));
            }
            sleep(POD_POLL_INTERVAL).await;
        }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tty: bool,
        argv: &[String],
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ClusterError> {
        let mut cmd = self.command();
        cmd.arg("exec").arg("-n").arg(namespace).arg(pod);
        cmd.arg("-c").arg(container);
        cmd.arg("-i");
        if tty {
            cmd.arg("-t");
        }
        cmd.arg("--").args(argv);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| ClusterError::Transport(format!("could not run kubectl exec: {err}")))?;

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(ClusterError::CommandExit(status.code().unwrap_or(-1))),
                Err(err) => Err(ClusterError::Transport(err.to_string())),
            },
            _ = cancelled(&mut cancel) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ClusterError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification_covers_the_stable_kinds() {
        let cases = [
            (
                "Error from server (NotFound): deployments.apps \"web\" not found",
                "NotFound",
            ),
            (
                "Error from server (Forbidden): deployments.apps is forbidden",
                "Forbidden",
            ),
            (
                "Error from server (Conflict): the object has been modified",
                "Conflict",
            ),
            (
                "Unable to connect to the server: dial tcp: i/o timeout",
                "Transport",
            ),
            ("error: something completely different", "Unknown"),
        ];
        for (stderr, expected) in cases {
            let kind = match classify("deployment dev/web", stderr) {
                ClusterError::NotFound(_) => "NotFound",
                ClusterError::Forbidden(_) => "Forbidden",
                ClusterError::Conflict(_) => "Conflict",
                ClusterError::Transport(_) => "Transport",
                ClusterError::Unknown { .. } => "Unknown",
                other => panic!("unexpected kind: {other:?}"),
            };
            assert_eq!(kind, expected, "stderr: {stderr}");
        }
    }

    #[test]
    fn newest_ready_pod_wins() {
        let pods: PodList = serde_json::from_value(serde_json::json!({
            "items": [
                {
                    "metadata": {"name": "web-old", "creationTimestamp": "2026-07-01T10:00:00Z"},
                    "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
                },
                {
                    "metadata": {"name": "web-new", "creationTimestamp": "2026-07-02T10:00:00Z"},
                    "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
                },
                {
                    "metadata": {"name": "web-newest-but-pending", "creationTimestamp": "2026-07-03T10:00:00Z"},
                    "status": {"phase": "Pending", "conditions": []}
                }
            ]
        }))
        .unwrap();
        let pod = newest_ready(pods.items).expect("a ready pod");
        assert_eq!(pod.metadata.name, "web-new");
    }

    #[test]
    fn no_ready_pod_yields_none() {
        let pods: PodList = serde_json::from_value(serde_json::json!({
            "items": [{
                "metadata": {"name": "web-1"},
                "status": {"phase": "Pending", "conditions": []}
            }]
        }))
        .unwrap();
        assert!(newest_ready(pods.items).is_none());
    }
}
