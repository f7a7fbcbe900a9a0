//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod config_cmd;
mod init;
mod run;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions, Settings};
use crate::repository::{AsyncSqlitePool, DieselJobStore, InMemoryJobStore, JobStore};

#[derive(Parser)]
#[command(name = "ocrflow")]
#[command(about = "Document OCR pipeline with sync/async dispatch")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Run the pipeline over local files until they finish
    Run {
        /// Files to upload into the content bucket
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Seconds to wait for every document to reach a terminal status
        #[arg(short, long, default_value = "60")]
        wait_secs: u64,
        /// Keep job state in memory instead of the database
        #[arg(long)]
        memory: bool,
    },

    /// Show document counts per status, or one document
    Status {
        /// Document ID to inspect
        document_id: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective settings
    Show,
}

/// Open the job store the settings point at.
async fn open_store(settings: &Settings, memory: bool) -> anyhow::Result<Arc<dyn JobStore>> {
    if memory {
        return Ok(Arc::new(InMemoryJobStore::new()));
    }
    if settings.database_url.is_none() {
        tokio::fs::create_dir_all(&settings.data_dir).await?;
    }
    let store = DieselJobStore::new(AsyncSqlitePool::new(&settings.database_url()));
    store.init_schema().await?;
    Ok(Arc::new(store))
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
    };
    let (settings, _config) = load_settings_with_options(options).await?;

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Run {
            files,
            wait_secs,
            memory,
        } => run::cmd_run(settings, &files, wait_secs, memory).await,
        Commands::Status { document_id, json } => {
            status::cmd_status(&settings, document_id.as_deref(), json).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => config_cmd::cmd_config_show(&settings),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from(["ocrflow", "-v", "run", "a.pdf", "b.png", "--wait-secs", "5"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                files,
                wait_secs,
                memory,
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(wait_secs, 5);
                assert!(!memory);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_files() {
        assert!(Cli::try_parse_from(["ocrflow", "run"]).is_err());
    }

    #[test]
    fn test_parse_config_show_with_global_config() {
        let cli = Cli::try_parse_from(["ocrflow", "config", "show", "--config", "ocrflow.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("ocrflow.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommands::Show
            }
        ));
    }

    #[tokio::test]
    async fn test_open_store_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path().join("data"));
        let store = open_store(&settings, false).await.unwrap();
        assert!(store.count_by_status().await.unwrap().is_empty());
        assert!(settings.database_exists());
    }
}
