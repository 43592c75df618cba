use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use askbridge_core::{
    config::Config,
    dispatcher::{CallerMode, Dispatched, Dispatcher},
    mcp::McpService,
    projector::{LiveEvent, ToolResult},
    provider::{CompletionProvider, NullProvider},
    providers::completions::CompletionsApi,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod http;
mod stdio;

#[derive(Parser)]
#[command(author, version, about = "askbridge: search-grounded `ask` tool over JSON-RPC", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Named profile; defaults to the config's active profile
    #[arg(long, global = true)]
    profile: Option<String>,
    /// Answer from the built-in null provider instead of the upstream
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve newline-delimited JSON-RPC on stdin/stdout
    Stdio,
    /// Serve JSON-RPC over HTTP at POST /mcp
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        bind: SocketAddr,
    },
    /// Ask one question and print the answer
    Ask {
        #[arg(short, long)]
        query: String,
        #[arg(long)]
        model: Option<String>,
        /// Print text as it arrives
        #[arg(long)]
        live: bool,
    },
}

fn init_tracing() {
    // stdout carries protocol traffic in stdio mode
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
}

fn build_service(cli: &Cli) -> anyhow::Result<McpService> {
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let profile = cfg.profile(cli.profile.as_deref())?;
    let provider: Arc<dyn CompletionProvider> = if cli.offline {
        Arc::new(NullProvider)
    } else {
        Arc::new(CompletionsApi::from_config(&cfg)?)
    };
    info!(
        provider = provider.name(),
        profile = cli.profile.as_deref().unwrap_or(&cfg.active_profile),
        default_model = profile.default_model.as_str(),
        "askbridge ready"
    );
    Ok(McpService::new(Dispatcher::new(provider, profile)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let service = build_service(&cli)?;

    match cli.command {
        Commands::Stdio => stdio::run(service).await?,
        Commands::Serve { bind } => http::serve(service, bind).await?,
        Commands::Ask { query, model, live } => {
            let mut args = serde_json::json!({ "query": query });
            if let Some(m) = model {
                args["model"] = serde_json::Value::String(m);
            }
            let mode = if live { CallerMode::Live } else { CallerMode::Consolidated };
            let ok = match service.dispatcher().handle(&args, mode).await {
                Dispatched::Completed(result) => print_result(&result),
                Dispatched::Streamed(mut events) => {
                    let mut ok = true;
                    while let Some(ev) = events.next().await {
                        match ev {
                            LiveEvent::Delta { text, .. } => {
                                print!("{text}");
                                io::stdout().flush().ok();
                            }
                            LiveEvent::Citations { .. } => {}
                            LiveEvent::Result(result) => {
                                println!();
                                print_citations(&result);
                            }
                            LiveEvent::Error(result) => ok = print_result(&result),
                            LiveEvent::Done => break,
                        }
                    }
                    ok
                }
            };
            if !ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Returns false for error payloads.
fn print_result(result: &ToolResult) -> bool {
    let text = result.text().unwrap_or_default();
    if result.is_error {
        eprintln!("{text}");
        return false;
    }
    println!("{text}");
    print_citations(result);
    true
}

fn print_citations(result: &ToolResult) {
    for (i, c) in result.citations().iter().enumerate() {
        println!("[{}] {} <{}>", i + 1, c.title, c.url);
    }
}
