//! Command-line definition and settings resolution

use clap::{Parser, Subcommand};
use lockstep::config::DEFAULT_DATABASE_URL;
use lockstep::migration::{LedgerTable, MigrationError};
use lockstep::{MigrateConfig, MigrationSettings};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "lockstep-migrate")]
#[command(about = "Apply, roll back and inspect versioned SQL migrations")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: config/lockstep.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Directory holding V<version>__<label>.sql scripts
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Ledger table name, optionally schema qualified
    #[arg(long, global = true)]
    pub table: Option<String>,

    /// Seconds to wait for the migration lock (default: fail immediately)
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    /// Write Prometheus metrics to this file when done
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Apply all pending migrations
    Migrate,

    /// Undo the most recently applied migration
    Rollback,

    /// List applied migrations, most recent first
    Status {
        /// Also list migrations not yet applied
        #[arg(long)]
        pending: bool,
    },
}

/// Everything a run needs, after flags, config and environment are merged
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub database_url: String,
    pub migrations_dir: PathBuf,
    pub settings: MigrationSettings,
}

impl Cli {
    /// Log filter implied by `--verbose` / `--quiet`; `RUST_LOG` still wins
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Merge flags over `config`
    ///
    /// `env_database_url` is the value of `DATABASE_URL`, consulted when neither
    /// the flag nor the config names a database.
    ///
    /// # Errors
    ///
    /// `InvalidTableName` for a table that is not a plain identifier.
    pub fn resolve(&self, config: &MigrateConfig, env_database_url: Option<String>) -> Result<RunOptions, MigrationError> {
        let database_url = resolve_database_url(
            self.database_url.clone(),
            config.database.url.clone(),
            env_database_url,
        );

        let mut settings = config.migrations.settings()?;
        if let Some(table) = &self.table {
            settings.table = LedgerTable::new(table.clone())?;
        }
        if let Some(seconds) = self.lock_timeout {
            settings.lock_timeout = Some(Duration::from_secs(seconds));
        }

        Ok(RunOptions {
            database_url,
            migrations_dir: self
                .migrations_dir
                .clone()
                .unwrap_or_else(|| config.migrations.location.clone()),
            settings,
        })
    }
}

/// Flag, then config, then `DATABASE_URL`, then the local default
pub fn resolve_database_url(flag: Option<String>, config: Option<String>, env: Option<String>) -> String {
    [flag, config, env]
        .into_iter()
        .flatten()
        .find(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}
