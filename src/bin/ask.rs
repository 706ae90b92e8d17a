//! One-shot query from the command line. Prints the result JSON on stdout.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::info;

use comet_research::config::{self, Settings};
use comet_research::research::ModelHint;
use comet_research::{QueryMode, QueryRequest, Researcher};

#[derive(Parser)]
#[command(name = "ask", version, about = "Ask the answer engine one question")]
struct Args {
    /// The question
    query: String,

    /// Run in deep research mode
    #[arg(long)]
    deep: bool,

    /// default, variant_a, variant_b, variant_c or variant_d
    #[arg(long, default_value = "default", value_parser = parse_hint)]
    model: ModelHint,

    /// Seconds to wait for the answer (defaults per mode from the environment)
    #[arg(long)]
    budget: Option<u64>,
}

fn parse_hint(raw: &str) -> Result<ModelHint, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown model hint: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    config::init_tracing();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    let mode = if args.deep {
        QueryMode::DeepResearch
    } else {
        QueryMode::Direct
    };
    let budget = match (args.budget, mode) {
        (Some(secs), _) => Duration::from_secs(secs),
        (None, QueryMode::Direct) => settings.ask_budget,
        (None, QueryMode::DeepResearch) => settings.research_budget,
    };
    let request = QueryRequest::new(&args.query, args.model, budget, mode)?;

    let researcher = Researcher::with_chrome(&settings);
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 cancelling, partial results follow");
            on_ctrl_c.cancel();
        }
    });

    let outcome = researcher.run(&request, &cancel).await;
    researcher.shutdown().await;

    let output = outcome?;
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("encoding result")?
    );
    Ok(())
}
