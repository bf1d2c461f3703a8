use anyhow::Result;
use clap::Parser;
use sim_supervisor::{cli, telemetry};
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    telemetry::init_tracing(args.log_json, Level::WARN);
    cli::run(args).await
}
