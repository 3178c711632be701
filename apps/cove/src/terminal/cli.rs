use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::manifest::DEFAULT_MANIFEST;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "cove",
    about = "Swap a cluster workload for a synchronized development environment",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "COVE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        global = true,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "COVE_LOG_FILE",
        global = true,
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Activate the development environment described by the manifest
    Up(UpArgs),
}

#[derive(Args, Debug)]
pub struct UpArgs {
    #[arg(
        long,
        short = 'f',
        value_name = "PATH",
        default_value = DEFAULT_MANIFEST,
        help = "Path to the manifest file"
    )]
    pub file: PathBuf,

    #[arg(
        long,
        short = 'n',
        value_name = "NAMESPACE",
        help = "Namespace where the up command is executed"
    )]
    pub namespace: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
