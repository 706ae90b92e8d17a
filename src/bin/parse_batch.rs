//! Start and follow batch parse jobs on the remote parsing API.
//!
//! The last started task id is remembered so `status` and `wait` work
//! without arguments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::info;

use comet_research::config;
use comet_research::parse_client::{ParseJob, ParserClient, TaskStatus, DEFAULT_SHEET_NAME};

#[derive(Parser)]
#[command(name = "parse-batch", version, about = "Drive the batch parsing API")]
struct Cli {
    /// Parser API base url
    #[arg(long, env = "PARSER_API_URL")]
    api_url: String,

    /// Where the last task id is kept
    #[arg(long, env = "PARSE_BATCH_STATE", default_value = ".parse-batch-last-task")]
    state_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start parsing the SKU column of a spreadsheet
    Start {
        spreadsheet_id: String,
        #[arg(long, default_value = DEFAULT_SHEET_NAME)]
        sheet: String,
        #[arg(long, default_value = "A")]
        column: String,
        #[arg(long, default_value_t = 2)]
        start_row: u32,
    },
    /// Show task progress
    Status { task_id: Option<String> },
    /// Poll until the task finishes
    Wait {
        task_id: Option<String>,
        /// Seconds between polls
        #[arg(long, default_value_t = 10)]
        interval: u64,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 3600)]
        max_wait: u64,
    },
    /// Parse one SKU right away
    Test { sku: String },
    /// Check the API is reachable
    Health,
}

fn remembered_task(state_file: &Path, given: Option<String>) -> Result<String> {
    if let Some(id) = given {
        return Ok(id);
    }
    let id = std::fs::read_to_string(state_file)
        .with_context(|| format!("no task id given and none remembered in {}", state_file.display()))?;
    let id = id.trim().to_string();
    if id.is_empty() {
        bail!("remembered task id in {} is empty", state_file.display());
    }
    Ok(id)
}

fn print_status(status: &TaskStatus) {
    println!("Task:      {}", status.task_id);
    println!("Status:    {}", status.status);
    println!("Progress:  {}", status.progress);
    println!("Processed: {}/{}", status.processed, status.total);
    println!("Errors:    {}", status.errors);
    if let Some(done) = &status.completed_at {
        println!("Completed: {done}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    config::init_tracing();

    let cli = Cli::parse();
    let client = ParserClient::new(&cli.api_url)?;

    match cli.command {
        Command::Start {
            spreadsheet_id,
            sheet,
            column,
            start_row,
        } => {
            let job = ParseJob {
                sheet_name: sheet,
                column_sku: column,
                start_row,
                ..ParseJob::new(spreadsheet_id)
            };
            let started = client.start(&job).await?;
            std::fs::write(&cli.state_file, &started.task_id)
                .with_context(|| format!("remembering task id in {}", cli.state_file.display()))?;
            println!("Task ID: {}", started.task_id);
            println!("{}", started.message);
        }
        Command::Status { task_id } => {
            let task_id = remembered_task(&cli.state_file, task_id)?;
            print_status(&client.status(&task_id).await?);
        }
        Command::Wait {
            task_id,
            interval,
            max_wait,
        } => {
            let task_id = remembered_task(&cli.state_file, task_id)?;
            info!(%task_id, "⏳ waiting for task");
            let status = client
                .wait(
                    &task_id,
                    Duration::from_secs(interval.max(1)),
                    Duration::from_secs(max_wait),
                )
                .await?;
            print_status(&status);
            if !status.is_terminal() {
                bail!("task {task_id} still {} after {max_wait}s", status.status);
            }
        }
        Command::Test { sku } => {
            let result = client.parse_one(&sku).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }
    Ok(())
}
