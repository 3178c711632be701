use std::io;
use thiserror::Error;

use crate::manifest::ManifestError;
use crate::session::UpError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Manifest(#[from] ManifestError),
    #[error("{0}")]
    Up(#[from] UpError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}
