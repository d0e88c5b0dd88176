use anyhow::Result;
use clap::{Parser, Subcommand};
use rpe_batch::{checkpoint_status, BatchConfig, CheckpointStatus, RunOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rpe-cli")]
#[command(about = "Roster Profile Enricher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process the next batch of roster rows (the default).
    Run,
    /// Print how many rows remain, without calling the search API.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => match rpe_batch::run_batch_once_from_env().await? {
            RunOutcome::Exhausted => println!("All done!"),
            RunOutcome::Completed(summary) => {
                println!(
                    "batch complete: run_id={} processed={} found={} failed={} skipped={} remaining={}",
                    summary.run_id,
                    summary.batch_len,
                    summary.found,
                    summary.failed,
                    summary.skipped,
                    summary.remaining
                );
                if summary.remaining > 0 {
                    println!("Run again to process the next batch.");
                }
            }
        },
        Commands::Status => {
            let config = BatchConfig::from_env();
            match checkpoint_status(&config)? {
                CheckpointStatus::NotStarted => {
                    println!("no checkpoint yet; the next run starts from the full roster")
                }
                CheckpointStatus::Remaining(0) => println!("All done!"),
                CheckpointStatus::Remaining(count) => println!("{count} rows remaining"),
            }
        }
    }

    Ok(())
}
