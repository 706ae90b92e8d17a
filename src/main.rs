use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use comet_research::api::{self, AppState};
use comet_research::config::{self, Settings};
use comet_research::mcp;
use comet_research::tools::ToolBox;
use comet_research::Researcher;

#[derive(Parser)]
#[command(name = "comet-research", version, about = "Browser-driven research tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the tools over HTTP
    Serve {
        /// Overrides COMET_BIND
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
    /// Speak JSON-RPC on stdin/stdout for MCP clients
    Stdio,
}

async fn ctrl_c(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        return;
    }
    info!("🛑 shutdown requested, cancelling in-flight requests");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    config::init_tracing();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let researcher = Arc::new(Researcher::with_chrome(&settings));
    let tools = Arc::new(ToolBox::new(
        researcher.clone(),
        settings.ask_budget,
        settings.research_budget,
    ));
    let shutdown = CancellationToken::new();
    tokio::spawn(ctrl_c(shutdown.clone()));

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or(settings.bind);
            let app = api::router(Arc::new(AppState {
                tools,
                shutdown: shutdown.clone(),
            }));

            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            info!("🎯 listening on http://{}", listener.local_addr()?);
            info!("📖 API docs at http://{}/swagger-ui", listener.local_addr()?);

            let stop = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await?;
        }
        Command::Stdio => {
            info!("🎯 serving tools on stdio");
            mcp::serve(tools, tokio::io::stdin(), tokio::io::stdout(), shutdown.clone()).await?;
        }
    }

    researcher.shutdown().await;
    Ok(())
}
