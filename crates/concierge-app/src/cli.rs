//! CLI argument definitions for the Concierge application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use concierge_storage::DEFAULT_SEARCH_LIMIT;

/// Concierge - a personal assistant that routes each request to the right handler.
#[derive(Parser, Debug)]
#[command(name = "concierge", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Route a single query and print the answer.
    Ask {
        /// The query text.
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Conversation to continue. A new one is started when omitted.
        #[arg(long)]
        conversation: Option<String>,
        /// Print the answer as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Interactive conversation on stdin.
    Chat {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Ingest .pdf / .txt / .md files (directories are read one level deep).
    ///
    /// Without paths, the configured documents directory is ingested.
    Ingest { paths: Vec<PathBuf> },
    /// Show the turns of a conversation.
    History {
        conversation: String,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// List conversations, most recently active first.
    Conversations,
    /// Search every conversation for text.
    Search {
        text: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Delete a conversation and all of its turns.
    Forget { conversation: String },
    /// Walk through a scripted session against an in-memory store.
    Demo,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > CONCIERGE_CONFIG env var > ~/.concierge/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("CONCIERGE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Returns `None` if not overridden (use config value).
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".concierge").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".concierge").join("config.toml");
    }
    PathBuf::from("config.toml")
}
