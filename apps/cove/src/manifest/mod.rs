use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MANIFEST: &str = "cove.yml";

const DEFAULT_WORKDIR: &str = "/app";
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read manifest at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("'{0}' is not a valid name: use lower-case alphanumerics and '-', 63 characters or fewer")]
    InvalidName(String),
    #[error("local port {0} is forwarded more than once")]
    DuplicateForward(u16),
    #[error("'{0}' must be an absolute path")]
    RelativePath(String),
    #[error("command cannot be empty")]
    EmptyCommand,
}

/// A `local:remote` TCP port pair exposing a remote pod port on the local
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Forward {
    pub local: u16,
    pub remote: u16,
}

impl FromStr for Forward {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || format!("forward '{raw}' must look like 'local:remote'");
        let (local, remote) = raw.split_once(':').ok_or_else(malformed)?;
        let local = local.trim().parse::<u16>().map_err(|_| malformed())?;
        let remote = remote.trim().parse::<u16>().map_err(|_| malformed())?;
        Ok(Forward { local, remote })
    }
}

impl TryFrom<String> for Forward {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Declarative description of one development session. Unknown manifest
/// fields are ignored so newer manifests keep working with older binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct DevSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub forward: Vec<Forward>,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_attach")]
    pub attach: bool,
    #[serde(skip)]
    pub manifest_path: PathBuf,
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

fn default_command() -> Vec<String> {
    vec!["sh".to_string()]
}

fn default_attach() -> bool {
    true
}

impl DevSpec {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut spec: DevSpec = serde_yaml::from_str(&raw)?;
        spec.manifest_path = path.to_path_buf();
        spec.validate()?;
        Ok(spec)
    }

    /// The directory whose contents are synchronized into the remote
    /// container: the directory holding the manifest.
    pub fn source_dir(&self) -> PathBuf {
        self.manifest_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn validate(&mut self) -> Result<(), ManifestError> {
        // Workload names are lower-cased before use; the cluster rejects
        // anything outside the DNS label alphabet.
        self.name = self.name.trim().to_lowercase();
        if !is_valid_name(&self.name) {
            return Err(ManifestError::InvalidName(self.name.clone()));
        }

        if !self.workdir.starts_with('/') {
            return Err(ManifestError::RelativePath(self.workdir.clone()));
        }
        for volume in &self.volumes {
            if !volume.starts_with('/') {
                return Err(ManifestError::RelativePath(volume.clone()));
            }
        }

        let mut seen = HashSet::new();
        for forward in &self.forward {
            if !seen.insert(forward.local) {
                return Err(ManifestError::DuplicateForward(forward.local));
            }
        }

        if self.command.is_empty() {
            return Err(ManifestError::EmptyCommand);
        }

        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let alphabet = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    name.chars().all(alphabet)
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<DevSpec, ManifestError> {
        let mut spec: DevSpec = serde_yaml::from_str(yaml)?;
        spec.manifest_path = PathBuf::from("/work/project/cove.yml");
        spec.validate()?;
        Ok(spec)
    }

    #[test]
    fn minimal_manifest_gets_defaults() {
        let spec = parse("name: web\n").expect("valid manifest");
        assert_eq!(spec.name, "web");
        assert_eq!(spec.workdir, "/app");
        assert_eq!(spec.command, vec!["sh"]);
        assert!(spec.attach);
        assert!(spec.namespace.is_empty());
        assert!(spec.forward.is_empty());
    }

    #[test]
    fn name_is_lower_cased() {
        let spec = parse("name: Web\n").expect("valid manifest");
        assert_eq!(spec.name, "web");
    }

    #[test]
    fn invalid_name_is_rejected() {
        let err = parse("name: 'web app'\n").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidName(_)));
    }

    #[test]
    fn forwards_parse_from_port_pairs() {
        let spec = parse("name: web\nforward:\n  - 8080:80\n  - \"9229:9229\"\n").unwrap();
        assert_eq!(
            spec.forward,
            vec![
                Forward { local: 8080, remote: 80 },
                Forward { local: 9229, remote: 9229 },
            ]
        );
    }

    #[test]
    fn malformed_forward_is_rejected() {
        let err = parse("name: web\nforward:\n  - 8080-80\n").unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn duplicate_local_ports_are_rejected() {
        let err = parse("name: web\nforward:\n  - 8080:80\n  - 8080:81\n").unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateForward(8080)));
    }

    #[test]
    fn relative_volume_paths_are_rejected() {
        let err = parse("name: web\nvolumes:\n  - data\n").unwrap_err();
        assert!(matches!(err, ManifestError::RelativePath(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let spec = parse("name: web\nresources:\n  cpu: 2\n").expect("unknown fields tolerated");
        assert_eq!(spec.name, "web");
    }

    #[test]
    fn source_dir_is_the_manifest_directory() {
        let spec = parse("name: web\n").unwrap();
        assert_eq!(spec.source_dir(), PathBuf::from("/work/project"));
    }
}
