mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bytespool",
    version,
    about = "Buffer a record stream under a memory budget and emit durable checkpoints"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Buffer a JSON-lines message file into a directory destination
    Run {
        /// Path to the JSON-lines message file
        input: PathBuf,
        /// Directory that receives one file per flushed buffer
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Engine config YAML (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Drain through per-stream queues on a separate flusher thread
        #[arg(long)]
        concurrent: bool,
    },
    /// Validate an engine config file
    Check {
        /// Path to engine config YAML
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            config,
            concurrent,
        } => commands::run::execute(&input, &output_dir, config.as_deref(), concurrent),
        Commands::Check { config } => commands::check::execute(&config),
    }
}
