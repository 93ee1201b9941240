mod commands;
mod storage;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tether",
    about = "tether: distributed locks, persistent job queues and schema migrations",
    version
)]
struct Cli {
    /// Storage backend: "memory" or "sqlite:<path>"
    #[arg(long, global = true, default_value = "memory", env = "TETHER_STORAGE")]
    storage: String,

    /// TOML file with coordination options
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the store to the schema version this build requires
    Migrate,

    /// Add a job to a queue
    Enqueue {
        queue: String,
        job_id: String,
    },

    /// Wait for the next job on the given queues and print it as JSON
    Dequeue {
        /// Queue to take from, in priority order (repeatable)
        #[arg(long = "queue", short = 'q', required = true)]
        queues: Vec<String>,

        /// Hand the job back instead of acknowledging it
        #[arg(long)]
        requeue: bool,
    },

    /// Run a command while holding a lock on a resource
    Lock {
        resource: String,

        /// How long to wait for the lock, e.g. "30s" or "2m"
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print held locks, schema version and queue counts as JSON
    Status {
        /// Queue to report on (repeatable)
        #[arg(long = "queue", short = 'q')]
        queues: Vec<String>,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("tether {}", env!("CARGO_PKG_VERSION"));
        println!("Distributed locks, persistent job queues and schema migrations");
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let client = storage::create_client(&cli.storage, cli.config.as_deref())?;

    match cli.command {
        Commands::Migrate => commands::migrate(&client).await,
        Commands::Enqueue { queue, job_id } => commands::enqueue(&client, &queue, &job_id),
        Commands::Dequeue { queues, requeue } => commands::dequeue(&client, &queues, requeue).await,
        Commands::Lock {
            resource,
            timeout,
            command,
        } => commands::lock(&client, &resource, timeout, &command).await,
        Commands::Status { queues } => commands::status(&client, &queues),
        Commands::Version => Ok(ExitCode::SUCCESS),
    }
}
