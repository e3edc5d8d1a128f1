use anyhow::Result;
use clap::Parser;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use relay_frontend::cluster::master::Master;
use relay_frontend::cluster::worker::{self, Worker};
use relay_frontend::cluster::{Role, WORKER_FATAL};
use relay_frontend::config::{Cli, FrontendConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Use JSON logs in production (RELAY_LOG_JSON=1), human-readable otherwise
    let filter = EnvFilter::from_default_env().add_directive("relay_frontend=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let role = Role::detect()?;
    let config = match FrontendConfig::load(&cli.config) {
        Ok(config) => config,
        // Config errors are not retryable in a worker.
        Err(e) if !role.is_master() => {
            tracing::error!("{e}");
            std::process::exit(WORKER_FATAL);
        }
        Err(e) => return Err(e.into()),
    };

    match role {
        Role::Master => {
            tracing::info!(workers = config.process_count, "Starting frontend master");
            Master::new(config).run().await
        }
        Role::Worker { slot, handoff_fd } => {
            let result = Worker::new(config, slot, handoff_fd)
                .run()
                .instrument(tracing::info_span!("worker", slot))
                .await;
            match result {
                Err(e) if worker::is_fatal(&e) => {
                    tracing::error!(slot, "{e:#}");
                    std::process::exit(WORKER_FATAL);
                }
                other => other,
            }
        }
    }
}
