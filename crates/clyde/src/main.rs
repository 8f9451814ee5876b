//! The clyde daemon and its companion subcommands.

use clap::{Parser, Subcommand};
use clyde_api::ClydeResult;

mod cleanup;
mod configuration;
mod registry_cmd;

#[derive(Debug, Parser)]
#[command(name = "clyde", version, about = "Node-local cluster cache")]
struct Args {
    /// Minimum log level to output (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the registry daemon: router, artifact planes, state tracker.
    Registry(registry_cmd::RegistryArgs),
    /// Write containerd mirror configuration.
    Configuration(configuration::ConfigurationArgs),
    /// Write pip client configuration.
    PipConfiguration(configuration::PipConfigurationArgs),
    /// Prepare the Hugging Face cache directory.
    HfConfiguration(configuration::HfConfigurationArgs),
    /// Remove mirror configuration and serve a readiness probe.
    Cleanup(cleanup::CleanupArgs),
    /// Wait for cleanup jobs to report done.
    CleanupWait(cleanup::CleanupWaitArgs),
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(args.log_level.clone())
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(()) => {
            tracing::info!("gracefully shutdown");
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("run exit with error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> ClydeResult<()> {
    match args.command {
        Command::Registry(args) => registry_cmd::run(args).await,
        Command::Configuration(args) => configuration::run(args).await,
        Command::PipConfiguration(args) => {
            configuration::run_pip(args).await
        }
        Command::HfConfiguration(args) => configuration::run_hf(args).await,
        Command::Cleanup(args) => cleanup::run(args).await,
        Command::CleanupWait(args) => cleanup::wait(args).await,
    }
}
