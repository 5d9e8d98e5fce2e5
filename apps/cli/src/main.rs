//! Grabber CLI - Command-line download manager
//!
//! Downloads files with live progress; Ctrl-C pauses instead of aborting.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use grabber_types::ManagerConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grabber - Resumable Download Manager
#[derive(Parser)]
#[command(name = "grabber")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Maximum simultaneous connections to one host
    #[arg(long, env = "GRABBER_MAX_CONNECTIONS_PER_HOST")]
    max_connections_per_host: Option<usize>,

    /// Directory for partial files
    #[arg(long, env = "GRABBER_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Directory to save completed files in
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Print the size of one or more URLs without downloading them
    Size {
        /// URLs to check
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

impl Cli {
    /// Build the manager configuration from defaults and flags
    fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        if let Some(max) = self.max_connections_per_host {
            config.max_connections_per_host = max;
        }
        if let Some(dir) = &self.temp_dir {
            config.temp_dir = dir.clone();
        }
        config
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Execute command
    match &cli.command {
        Commands::Get { urls, output_dir } => {
            let destination = match output_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir()?,
            };
            commands::get(cli.manager_config(), urls, destination, cli.output).await?
        }

        Commands::Size { urls } => commands::size(cli.manager_config(), urls, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(*shell, &mut Cli::command(), "grabber", &mut std::io::stdout());
        }
    }

    Ok(())
}
