use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod exec;
mod manifest;
mod pool;
mod report;
mod sandbox;
mod strategy;

#[derive(Parser)]
#[command(name = "poolrun")]
#[command(
    author,
    version,
    about = "Run test executables concurrently in pooled Docker sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in the manifest
    Run {
        /// Configuration file
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        config: PathBuf,

        /// Task manifest
        #[arg(short, long, default_value = manifest::TASKS_FILE)]
        tasks: PathBuf,

        /// Scheduling mode (overrides execution.mode)
        #[arg(short, long, value_enum)]
        mode: Option<config::Mode>,

        /// Run tasks on the host instead of in Docker
        #[arg(long)]
        no_sandbox: bool,

        /// Only run tasks whose name matches this pattern ('*' wildcards)
        #[arg(short, long)]
        filter: Option<String>,

        /// Write a JSON report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Remove containers left behind by an interrupted run
    Clean,

    /// Start an exec attached and print its output
    #[command(name = "attach-exec", hide = true)]
    AttachExec {
        exec_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout of attach-exec carries exec output
    let default_filter = match (&cli.command, cli.verbose) {
        (Commands::AttachExec { .. }, _) => "poolrun=warn",
        (_, true) => "poolrun=debug",
        (_, false) => "poolrun=info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            config,
            tasks,
            mode,
            no_sandbox,
            filter,
            report,
        } => {
            commands::run::run(commands::run::RunOptions {
                config,
                tasks,
                mode,
                no_sandbox,
                filter,
                report,
            })
            .await?;
        }
        Commands::Clean => {
            commands::clean::run().await?;
        }
        Commands::AttachExec { exec_id } => {
            commands::attach::run(exec_id).await?;
        }
    }

    Ok(())
}
