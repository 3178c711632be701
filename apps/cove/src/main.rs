use std::sync::Arc;
use tracing::debug;

use cove::cluster::kubectl::KubectlClient;
use cove::forward::KubectlForwarder;
use cove::manifest::DevSpec;
use cove::session::{self, UpError};
use cove::telemetry::logging;
use cove::terminal::cli::{self, Cli, Command};
use cove::terminal::error::CliError;
use cove::terminal::status;

#[tokio::main]
async fn main() {
    let cli = cli::parse();

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            debug!(error = ?err, "up command failed");
            status::failure(&err.to_string());
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Up(args) => {
            debug!("starting up command");
            let mut spec = DevSpec::load(&args.file)?;
            if let Some(namespace) = args.namespace {
                spec.namespace = namespace;
            }

            let client = KubectlClient::from_env().map_err(UpError::from)?;
            let forwarder = Arc::new(KubectlForwarder::new(client.clone()));
            session::run_up(spec, Arc::new(client), forwarder)
                .await
                .map_err(CliError::from)
        }
    }
}
