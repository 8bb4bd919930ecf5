//! Manifold Node Binary

use clap::{Parser, Subcommand};
use manifold_core::NodeConfig;
use manifold_node::{run_demo, NodeBuilder};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "manifold-node")]
#[command(about = "Manifold Node - snapshot-isolated multi-version key-value substrate")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until Ctrl-C
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of reactor threads (0 = one per CPU core)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Log level, overriding the config file
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Run scripted transactions and a merge on a local cluster
    Demo {
        /// Number of nodes in the cluster
        #[arg(short, long, default_value = "2")]
        nodes: usize,

        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Print the default configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            threads,
            log_level,
        } => {
            let config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            init_logging(log_level.as_deref().unwrap_or(&config.log_level));
            info!("Starting Manifold node...");

            let mut builder = NodeBuilder::new().config(config);
            if let Some(threads) = threads {
                builder = builder.threads(threads);
            }
            builder.build().start().await?;
        }

        Commands::Demo { nodes, log_level } => {
            init_logging(&log_level);
            let report = tokio::task::spawn_blocking(move || run_demo(nodes)).await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Config { output } => {
            let json = NodeConfig::default().to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Configuration saved to: {}", path.display());
                }
                None => println!("{}", json),
            }
        }
    }

    Ok(())
}
