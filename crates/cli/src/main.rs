//! Ledger command-line tool.
//!
//! Inspects and edits the pages of a SQLite-backed ledger: reading and
//! writing entries, listing heads and history, diffing divergent heads and
//! collapsing them with a built-in merge policy. Also generates and
//! validates configuration files.

mod commands;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ledger_core::config::LedgerConfig;
use ledger_core::models::MergePolicy;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Ledger command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "ledger",
    version,
    about = "Inspect and edit the pages of a ledger"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/ledger/config.toml")]
    config: PathBuf,

    /// Log level (overrides the configuration file).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./ledger.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// List stored pages.
    Pages,

    /// Print the value of a key.
    Get {
        /// Page name, or `hex:<id>`.
        page: String,
        key: String,
    },

    /// Set a key.
    Put {
        page: String,
        key: String,
        value: String,

        /// Commit on top of this commit (id or unique prefix) instead of the
        /// current head. Creates a divergent head.
        #[arg(long)]
        parent: Option<String>,
    },

    /// Remove a key.
    Delete {
        page: String,
        key: String,
    },

    /// List the entries of a page.
    Entries {
        page: String,

        /// Read this commit (id or unique prefix) instead of the head.
        #[arg(long)]
        commit: Option<String>,
    },

    /// Show the current heads of a page.
    Heads { page: String },

    /// Show the commit history of a page, newest first.
    Log {
        page: String,

        /// Maximum number of commits to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Three-way diff of two commits against their merge base. Defaults to
    /// the two most recent heads.
    Diff {
        page: String,

        #[arg(long)]
        left: Option<String>,

        #[arg(long)]
        right: Option<String>,

        /// Only keys both sides changed to different values.
        #[arg(long)]
        conflicting: bool,
    },

    /// Merge divergent heads with a built-in policy.
    Resolve {
        page: String,

        /// last_one_wins or automatic.
        #[arg(long, default_value = "last_one_wins")]
        policy: MergePolicy,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            LedgerConfig::load_from_file(&cli.config)
                .ok()
                .map(|c| c.log_level)
        })
        .unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        command => {
            let config = load_config(&cli.config)?;
            commands::run(&config, command).await
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<LedgerConfig> {
    LedgerConfig::load_and_validate(path).context("failed to load configuration file")
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    let config = LedgerConfig::default();
    let rendered = config.to_toml().context("failed to render default config")?;
    let contents = format!("# Ledger configuration\n\n{rendered}");
    std::fs::write(output, contents).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point storage.data_dir at a writable directory");
    println!(
        "  2. Validate with: ledger validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        LedgerConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All values are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    if config.storage.in_memory {
        println!("  Storage          : in memory");
    } else {
        println!("  Database         : {}", config.database_path().display());
    }
    println!("  Log level        : {}", config.log_level);
    println!("  Entries per page : {}", config.pagination.entries_page_size);
    println!("  Diff page size   : {}", config.pagination.diff_page_size);
    println!("  Change page size : {}", config.pagination.change_page_size);
    println!("  Max page bytes   : {}", config.pagination.max_page_bytes);
    println!();
    println!("Configuration is valid.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put_with_parent() {
        let cli = Cli::try_parse_from([
            "ledger", "put", "contacts", "name", "Alice", "--parent", "ab12",
        ])
        .unwrap();
        match cli.command {
            Commands::Put { page, parent, .. } => {
                assert_eq!(page, "contacts");
                assert_eq!(parent.as_deref(), Some("ab12"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_resolve_policy() {
        let cli =
            Cli::try_parse_from(["ledger", "resolve", "contacts", "--policy", "automatic"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Resolve {
                policy: MergePolicy::AutomaticWithFallback,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["ledger", "resolve", "p", "--policy", "coin_flip"]).is_err());
    }

    #[test]
    fn test_init_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        cmd_init(&path).unwrap();
        assert!(LedgerConfig::load_and_validate(&path).is_ok());
        assert!(cmd_init(&path).is_err());
    }
}
