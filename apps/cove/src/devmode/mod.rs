//! The dev-mode transform: a pure, idempotent mutation of a workload
//! descriptor into its development form, and its inverse. The pre-image of
//! every field the transform touches is stored in an annotation on the
//! workload itself, so restoration never depends on external state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::cluster::workload::{
    Container, ContainerPort, ObjectMeta, PersistentVolumeClaimSource, PodTemplateSpec, SecretSource,
    Volume, VolumeMount, Workload, WorkloadSpec,
};
use crate::manifest::DevSpec;
use crate::sync;

pub const DEV_MODE_LABEL: &str = "cove.sh/dev-mode";
pub const DEV_MODE_ON: &str = "on";
pub const DEV_POD_LABEL: &str = "cove.sh/dev-pod";
pub const SYNC_POD_LABEL: &str = "cove.sh/sync-pod";
pub const ORIGINAL_STATE_ANNOTATION: &str = "cove.sh/original-state";

const SYNC_SIDECAR_NAME: &str = "cove-syncer";
const SYNC_AGENT_IMAGE: &str = "ghcr.io/cove-sh/syncer:0.5.2";
const SANDBOX_IMAGE: &str = "ubuntu:22.04";
const VOLUME_SIZE: &str = "10Gi";

/// Where the sidecar sees the synchronized tree and its secret-mounted
/// configuration.
const SIDECAR_SOURCE_MOUNT: &str = "/var/cove/src";
const SIDECAR_SECRET_MOUNT: &str = "/var/cove/secret";

/// The dev container is parked on a sleep so the interactive exec owns the
/// terminal.
const PARK_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("workload has no containers")]
    NoContainers,
    #[error("workload is not in dev mode")]
    NotInDevMode,
    #[error("stored original state is unreadable: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Pre-image of the fields the transform touches.
#[derive(Debug, Serialize, Deserialize)]
struct OriginalState {
    labels: BTreeMap<String, String>,
    template_labels: BTreeMap<String, String>,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    replicas: Option<i32>,
}

pub fn is_dev_mode_on(workload: &Workload) -> bool {
    workload
        .metadata
        .labels
        .get(DEV_MODE_LABEL)
        .map(|value| value == DEV_MODE_ON)
        .unwrap_or(false)
}

pub fn primary_volume_name(spec: &DevSpec) -> String {
    format!("cove-{}", spec.name)
}

pub fn data_volume_name(spec: &DevSpec, index: usize) -> String {
    format!("cove-{}-data-{}", spec.name, index)
}

pub fn secret_name(spec: &DevSpec) -> String {
    format!("cove-{}", spec.name)
}

pub fn dev_pod_selector(spec: &DevSpec) -> String {
    format!("{DEV_POD_LABEL}={}", spec.name)
}

pub fn sync_pod_selector(spec: &DevSpec) -> String {
    format!("{SYNC_POD_LABEL}={}", spec.name)
}

/// Mutates `workload` into its dev-mode form and returns the name of the
/// development container. Applying to a workload already in dev mode is a
/// no-op yielding the same descriptor.
pub fn apply(workload: &mut Workload, spec: &DevSpec) -> Result<String, TransformError> {
    if workload.spec.template.spec.containers.is_empty() {
        return Err(TransformError::NoContainers);
    }
    if is_dev_mode_on(workload) {
        return Ok(workload.spec.template.spec.containers[0].name.clone());
    }

    let snapshot = OriginalState {
        labels: workload.metadata.labels.clone(),
        template_labels: workload.spec.template.metadata.labels.clone(),
        containers: workload.spec.template.spec.containers.clone(),
        volumes: workload.spec.template.spec.volumes.clone(),
        replicas: workload.spec.replicas,
    };
    let encoded = serde_json::to_string(&snapshot)?;

    let template = &mut workload.spec.template;
    let dev = &mut template.spec.containers[0];
    if let Some(image) = &spec.image {
        dev.image = image.clone();
    }
    dev.command = PARK_COMMAND.iter().map(|s| s.to_string()).collect();
    dev.args = Vec::new();
    dev.working_dir = Some(spec.workdir.clone());
    dev.volume_mounts.push(VolumeMount {
        name: primary_volume_name(spec),
        mount_path: spec.workdir.clone(),
    });
    for (index, path) in spec.volumes.iter().enumerate() {
        dev.volume_mounts.push(VolumeMount {
            name: data_volume_name(spec, index),
            mount_path: path.clone(),
        });
    }
    let dev_container = dev.name.clone();

    template.spec.containers.push(sync_sidecar(spec));

    template.spec.volumes.push(Volume {
        name: primary_volume_name(spec),
        persistent_volume_claim: Some(PersistentVolumeClaimSource {
            claim_name: primary_volume_name(spec),
        }),
        secret: None,
    });
    for index in 0..spec.volumes.len() {
        template.spec.volumes.push(Volume {
            name: data_volume_name(spec, index),
            persistent_volume_claim: Some(PersistentVolumeClaimSource {
                claim_name: data_volume_name(spec, index),
            }),
            secret: None,
        });
    }
    template.spec.volumes.push(Volume {
        name: secret_name(spec),
        persistent_volume_claim: None,
        secret: Some(SecretSource {
            secret_name: secret_name(spec),
        }),
    });

    let labels = &mut template.metadata.labels;
    labels.insert(DEV_MODE_LABEL.to_string(), DEV_MODE_ON.to_string());
    labels.insert(DEV_POD_LABEL.to_string(), spec.name.clone());
    labels.insert(SYNC_POD_LABEL.to_string(), spec.name.clone());

    workload
        .metadata
        .labels
        .insert(DEV_MODE_LABEL.to_string(), DEV_MODE_ON.to_string());
    workload
        .metadata
        .annotations
        .insert(ORIGINAL_STATE_ANNOTATION.to_string(), encoded);
    workload.spec.replicas = Some(1);

    Ok(dev_container)
}

/// Inverse of `apply`, keyed only on the stored annotation.
pub fn restore(workload: &mut Workload) -> Result<(), TransformError> {
    let encoded = workload
        .metadata
        .annotations
        .remove(ORIGINAL_STATE_ANNOTATION)
        .ok_or(TransformError::NotInDevMode)?;
    let snapshot: OriginalState = serde_json::from_str(&encoded)?;

    workload.metadata.labels = snapshot.labels;
    workload.spec.template.metadata.labels = snapshot.template_labels;
    workload.spec.template.spec.containers = snapshot.containers;
    workload.spec.template.spec.volumes = snapshot.volumes;
    workload.spec.replicas = snapshot.replicas;
    Ok(())
}

fn sync_sidecar(spec: &DevSpec) -> Container {
    Container {
        name: SYNC_SIDECAR_NAME.to_string(),
        image: SYNC_AGENT_IMAGE.to_string(),
        command: Vec::new(),
        args: Vec::new(),
        working_dir: None,
        volume_mounts: vec![
            VolumeMount {
                name: primary_volume_name(spec),
                mount_path: SIDECAR_SOURCE_MOUNT.to_string(),
            },
            VolumeMount {
                name: secret_name(spec),
                mount_path: SIDECAR_SECRET_MOUNT.to_string(),
            },
        ],
        ports: vec![
            ContainerPort {
                container_port: i32::from(sync::CLUSTER_PORT),
            },
            ContainerPort {
                container_port: i32::from(sync::GUI_PORT),
            },
        ],
    }
}

/// Deterministic minimal workload synthesized when the named workload does
/// not exist and the user consents to creating one.
pub fn sandbox(spec: &DevSpec) -> Workload {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), spec.name.clone());

    Workload {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: ObjectMeta {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            labels: labels.clone(),
            ..ObjectMeta::default()
        },
        spec: WorkloadSpec {
            replicas: Some(1),
            selector: crate::cluster::workload::LabelSelector {
                match_labels: labels.clone(),
            },
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels,
                    ..ObjectMeta::default()
                },
                spec: crate::cluster::workload::PodSpec {
                    containers: vec![Container {
                        name: spec.name.clone(),
                        image: spec
                            .image
                            .clone()
                            .unwrap_or_else(|| SANDBOX_IMAGE.to_string()),
                        ..Container::default()
                    }],
                    volumes: Vec::new(),
                },
            },
        },
    }
}

/// Secret consumed by the sync sidecar: the REST api key, the folder the
/// remote peer serves, and the identity of the local device it should trust.
pub fn secret_manifest(spec: &DevSpec, api_key: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": secret_name(spec),
            "namespace": spec.namespace,
            "labels": { DEV_MODE_LABEL: DEV_MODE_ON }
        },
        "type": "Opaque",
        "stringData": {
            "apikey": api_key,
            "folder": sync::folder_id(spec),
            "path": SIDECAR_SOURCE_MOUNT,
            "localDevice": sync::device::local_device_id()
        }
    })
}

pub fn volume_manifest(name: &str, spec: &DevSpec) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": { DEV_MODE_LABEL: DEV_MODE_ON }
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": VOLUME_SIZE } }
        }
    })
}

/// Service accompanying a sandbox-created workload, exposing the remote side
/// of every declared forward.
pub fn service_manifest(spec: &DevSpec) -> serde_json::Value {
    let mut ports: Vec<serde_json::Value> = spec
        .forward
        .iter()
        .map(|forward| {
            serde_json::json!({
                "name": format!("p{}", forward.remote),
                "port": forward.remote,
                "targetPort": forward.remote
            })
        })
        .collect();
    if ports.is_empty() {
        ports.push(serde_json::json!({"name": "http", "port": 8080, "targetPort": 8080}));
    }

    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace
        },
        "spec": {
            "selector": { "app": spec.name },
            "ports": ports
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> DevSpec {
        DevSpec {
            name: "web".to_string(),
            namespace: "dev".to_string(),
            image: Some("node:16".to_string()),
            workdir: "/app".to_string(),
            volumes: vec!["/data".to_string()],
            forward: vec![crate::manifest::Forward {
                local: 8080,
                remote: 80,
            }],
            command: vec!["sh".to_string()],
            attach: true,
            manifest_path: PathBuf::from("cove.yml"),
        }
    }

    fn workload() -> Workload {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "dev", "labels": {"team": "payments"}},
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "web", "image": "registry/web:prod"}]}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn apply_swaps_image_and_injects_sidecar() {
        let spec = spec();
        let mut w = workload();
        let container = apply(&mut w, &spec).unwrap();
        assert_eq!(container, "web");
        assert!(is_dev_mode_on(&w));

        let containers = &w.spec.template.spec.containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].image, "node:16");
        assert_eq!(containers[0].command, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(containers[1].name, SYNC_SIDECAR_NAME);
        assert_eq!(w.spec.replicas, Some(1));

        let template_labels = &w.spec.template.metadata.labels;
        assert_eq!(
            template_labels.get(DEV_POD_LABEL).map(String::as_str),
            Some("web")
        );
        assert_eq!(
            template_labels.get(SYNC_POD_LABEL).map(String::as_str),
            Some("web")
        );
    }

    #[test]
    fn apply_is_idempotent() {
        let spec = spec();
        let mut once = workload();
        apply(&mut once, &spec).unwrap();
        let mut twice = once.clone();
        apply(&mut twice, &spec).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn restore_is_the_inverse_of_apply() {
        let spec = spec();
        let original = workload();
        let mut w = original.clone();
        apply(&mut w, &spec).unwrap();
        restore(&mut w).unwrap();
        assert_eq!(w, original);
    }

    #[test]
    fn restore_without_dev_mode_fails() {
        let mut w = workload();
        assert!(matches!(restore(&mut w), Err(TransformError::NotInDevMode)));
    }

    #[test]
    fn sandbox_is_deterministic() {
        let spec = spec();
        assert_eq!(sandbox(&spec), sandbox(&spec));
        assert_eq!(
            sandbox(&spec).spec.template.spec.containers[0].image,
            "node:16"
        );
    }

    #[test]
    fn service_exposes_remote_forward_ports() {
        let manifest = service_manifest(&spec());
        let ports = manifest["spec"]["ports"].as_array().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0]["port"], 80);
    }
}
