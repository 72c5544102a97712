//! Conveyor CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use conveyor_config::DEFAULT_PIPELINE_FILE;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor deployment pipeline CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, global = true, env = "CONVEYOR_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// System configuration file
    #[arg(long, global = true, env = "CONVEYOR_SYSTEM_CONFIG")]
    system_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        #[arg(default_value = DEFAULT_PIPELINE_FILE)]
        path: PathBuf,
    },
    /// Print the execution plan and deploy order
    Plan {
        #[arg(default_value = DEFAULT_PIPELINE_FILE)]
        path: PathBuf,
    },
    /// Execute the pipeline once, locally
    Run {
        #[arg(default_value = DEFAULT_PIPELINE_FILE)]
        path: PathBuf,
        /// Revision to build
        #[arg(long)]
        revision: Option<String>,
        /// Branch to build (defaults to the tracked branch)
        #[arg(long)]
        branch: Option<String>,
        /// Build from this directory instead of fetching the repository
        #[arg(long)]
        source_dir: Option<PathBuf>,
        /// Deploy target, overriding the system configuration
        #[arg(long, value_enum)]
        target: Option<TargetArg>,
        /// Extra build environment, KEY=VALUE
        #[arg(long = "env", value_parser = commands::parse_key_value)]
        env: Vec<(String, String)>,
    },
    /// Submit a trigger to the API server
    Trigger {
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Show the active and pending run on the API server
    Status,
    /// Cancel the active run on the API server
    Cancel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TargetArg {
    /// Record deployments in memory
    Memory,
    /// Run the apply command from the system configuration
    Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => commands::validate(&path)?,
        Commands::Plan { path } => commands::plan(&path)?,
        Commands::Run {
            path,
            revision,
            branch,
            source_dir,
            target,
            env,
        } => {
            let options = commands::run::RunOptions {
                revision,
                branch,
                source_dir,
                target,
                env: env.into_iter().collect(),
            };
            commands::run::run_local(&path, cli.system_config.as_deref(), options).await?;
        }
        Commands::Trigger { revision, branch } => {
            commands::remote::trigger(&cli.api_url, revision, branch).await?;
        }
        Commands::Status => commands::remote::status(&cli.api_url).await?,
        Commands::Cancel => commands::remote::cancel(&cli.api_url).await?,
    }

    Ok(())
}
