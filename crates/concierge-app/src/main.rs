//! Concierge application binary - composition root.
//!
//! Ties together all Concierge crates into a single executable:
//! 1. Load configuration from TOML
//! 2. Open storage (SQLite conversation log + persisted chunk index) and
//!    bring the index up to date with the documents directory
//! 3. Build the inference client, classifier and handler registry
//! 4. Run the requested subcommand against the router

mod agents;
mod app;
mod cli;

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use concierge_chat::RoutedAnswer;
use concierge_core::config::ConciergeConfig;
use concierge_core::types::{Document, Turn};

use crate::app::{App, AppResult};
use crate::cli::{CliArgs, Command};

const DEMO_DOCUMENTS: &[(&str, &str)] = &[
    (
        "france-facts",
        "France is a country in Western Europe. The capital of France is Paris. \
         Paris is known for the Eiffel Tower, which was completed in 1889.",
    ),
    (
        "office-handbook",
        "The office opens at 8am and closes at 6pm on weekdays. \
         Visitors must sign in at the front desk. Refunds for the cafeteria are processed within 14 days.",
    ),
];

const DEMO_QUERIES: &[&str] = &[
    "Hi there! My name is Alice.",
    "What's my name?",
    "What is the capital of France?",
    "When was the Eiffel Tower completed?",
    "What's the weather like in Paris?",
    "Are there any concerts in Berlin this weekend?",
    "Draw a picture of a sunset over the sea",
    "How many rows are in the orders table?",
    "Thanks for your help!",
];

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file if present. A missing file means defaults; an
/// invalid one is an error.
fn load_config(path: &Path) -> AppResult<Option<ConciergeConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(ConciergeConfig::load(path)?))
}

fn new_conversation_id() -> String {
    format!("conv-{}", uuid::Uuid::new_v4())
}

fn print_answer(routed: &RoutedAnswer) {
    println!("{}", routed.answer.text);
    if !routed.answer.citations.is_empty() {
        println!("  sources: {}", routed.answer.citations.join(", "));
    }
    let turn = routed
        .turn_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "not recorded".to_string());
    println!(
        "  [task: {} | conversation: {} | turn: {}]",
        routed.answer.task_label, routed.conversation_id, turn
    );
}

fn print_turn(turn: &Turn) {
    let label = turn
        .task_label
        .map(|label| label.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "#{} {} {} ({})",
        turn.turn_id,
        turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
        turn.role,
        label
    );
    if let Some(query) = turn.metadata_value("query") {
        println!("  > {}", query);
    }
    println!("  {}", turn.text);
}

async fn ask(app: &App, query: &str, conversation: Option<String>, json: bool) -> AppResult<()> {
    let conversation = conversation.unwrap_or_else(new_conversation_id);
    let routed = app.router.handle(query, &conversation).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&routed)?);
    } else {
        print_answer(&routed);
    }
    Ok(())
}

async fn chat(app: &App, conversation: Option<String>) -> AppResult<()> {
    let conversation = conversation.unwrap_or_else(new_conversation_id);
    println!("Conversation {}. Type 'exit' to quit.", conversation);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        match app.router.handle(line, &conversation).await {
            Ok(routed) => print_answer(&routed),
            Err(e) => {
                error!(error = %e, "Request failed");
                println!("Error: {}", e);
            }
        }
    }
    Ok(())
}

async fn ingest(app: &App, paths: Vec<PathBuf>) -> AppResult<()> {
    let paths = if paths.is_empty() {
        vec![app.config.documents_dir()]
    } else {
        paths
    };

    let report = app.ingest_paths(&paths).await;
    for (id, chunks) in &report.ingested {
        println!("{}: {} chunks", id, chunks);
    }
    println!(
        "{} documents, {} chunks indexed",
        app.index.document_ids().len(),
        app.index.len()
    );
    if report.failures > 0 {
        return Err(format!("{} paths or documents failed to ingest", report.failures).into());
    }
    Ok(())
}

async fn demo(config: ConciergeConfig) -> AppResult<()> {
    let app = App::in_memory(config)?;
    for (id, text) in DEMO_DOCUMENTS {
        let chunk_ids = app.index.ingest(Document::new(*id, *text)).await?;
        println!("Ingested {} ({} chunks)", id, chunk_ids.len());
    }

    let conversation = "demo";
    for query in DEMO_QUERIES {
        println!();
        println!("User: {}", query);
        let routed = app.router.handle(query, conversation).await?;
        print_answer(&routed);
    }

    println!();
    println!("Conversation history:");
    for turn in app.stores.load(conversation)?.history(None)? {
        print_turn(&turn);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let loaded = load_config(&config_file);
    let config_level = match &loaded {
        Ok(Some(config)) => config.general.log_level.clone(),
        _ => ConciergeConfig::default().general.log_level,
    };
    init_tracing(&args.resolve_log_level(&config_level));

    let mut config = match loaded {
        Ok(Some(config)) => config,
        Ok(None) => {
            info!(path = %config_file.display(), "No configuration file, using defaults");
            ConciergeConfig::default()
        }
        Err(e) => {
            error!(path = %config_file.display(), error = %e, "Invalid configuration");
            return Err(e);
        }
    };
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }

    info!("Starting Concierge v{}", env!("CARGO_PKG_VERSION"));

    if args.command == Command::Demo {
        return demo(config).await;
    }

    let app = App::open(config)?;
    if matches!(args.command, Command::Ask { .. } | Command::Chat { .. }) {
        app.index_documents_dir().await;
    }
    match args.command {
        Command::Ask {
            query,
            conversation,
            json,
        } => ask(&app, &query.join(" "), conversation, json).await?,
        Command::Chat { conversation } => chat(&app, conversation).await?,
        Command::Ingest { paths } => ingest(&app, paths).await?,
        Command::History {
            conversation,
            limit,
        } => {
            let limit = limit.unwrap_or(app.config.memory.max_history);
            for turn in app.stores.load(&conversation)?.history(Some(limit))? {
                print_turn(&turn);
            }
        }
        Command::Conversations => {
            for summary in app.stores.list()? {
                println!(
                    "{}  {} turns  last active {}",
                    summary.id,
                    summary.turn_count,
                    summary.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Search { text, limit } => {
            for hit in app.stores.search(&text, limit)? {
                println!("[{}]", hit.conversation_id);
                print_turn(&hit.turn);
            }
        }
        Command::Forget { conversation } => {
            app.stores.delete(&conversation)?;
            println!("Deleted conversation {}", conversation);
        }
        Command::Demo => {}
    }

    Ok(())
}
